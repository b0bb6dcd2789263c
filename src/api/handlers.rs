use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use super::commands;
use super::AppState;
use crate::protocol::{Frame, RequestEnvelope};
use crate::session::{self, Outbound};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    connections: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.server.connections.active(),
    })
}

pub(super) async fn ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

fn encode(frame: &Frame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound frame");
            None
        }
    }
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let connection = state.server.connections.connect();
    let (_shutdown_guard, mut shutdown_rx) = state.server.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound, mut frames) = Outbound::channel();

    tracing::info!(%connection_id, "connection opened");

    let session = match session::open(
        connection_id.clone(),
        state.engines.clone(),
        state.server.clone(),
        outbound.clone(),
        connection,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            let frame = Frame::Error {
                message: e.to_string(),
            };
            if let Some(msg) = encode(&frame) {
                let _ = ws_tx.send(msg).await;
            }
            let close = CloseFrame {
                code: axum::extract::ws::close_code::ERROR,
                reason: "engine initialization failed".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(close))).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let Some(msg) = encode(&frame) else { continue };
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RequestEnvelope>(&text) {
                            Ok(req) => {
                                tracing::debug!(%connection_id, request_id = %req.id, command = %req.command, "request");
                                tokio::spawn(commands::handle(session.clone(), req));
                            }
                            Err(e) => {
                                outbound.send(Frame::Error {
                                    message: format!("invalid request: {e}"),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%connection_id, error = %e, "websocket read failed");
                        break;
                    }
                    _ => continue,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(%connection_id, "closing connection for server shutdown");
                    // Flush responses queued before the signal.
                    while let Ok(frame) = frames.try_recv() {
                        if let Some(msg) = encode(&frame) {
                            let _ = ws_tx.send(msg).await;
                        }
                    }
                    let close = CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    session.close().await;
    tracing::info!(%connection_id, "connection closed");
}
