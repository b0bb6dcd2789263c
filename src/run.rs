//! Run Orchestrator: starts test/module/suite runs and relays their progress
//! to the client as events scoped by run id.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::error::TryRecvError;

use crate::api::error::CommandError;
use crate::engine::{EngineError, RunEvent, RunHandle, RunResults};
use crate::protocol::{events, now_millis};
use crate::session::{Outbound, Session};

/// Position of a run in its state sequence
/// `Running, (Current)*, (Paused, Running)*, Failed | Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Created,
    Running,
    Paused,
    Finished,
}

impl RunState {
    /// Advance on `event`. Returns `false` for events that are out of
    /// sequence; those are not relayed.
    pub fn accept(&mut self, event: &RunEvent) -> bool {
        use RunState::*;
        let next = match (*self, event) {
            (Finished, _) => return false,
            (_, RunEvent::Allow(_)) => *self,
            (Created | Paused, RunEvent::Running) => Running,
            (Running, RunEvent::Current(_)) => Running,
            (Running, RunEvent::Paused) => Paused,
            (_, RunEvent::Failed | RunEvent::Stopped) => Finished,
            _ => return false,
        };
        *self = next;
        true
    }

    pub fn is_finished(self) -> bool {
        self == RunState::Finished
    }
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Key of the final `run results` event: the client-supplied `runId`, or the
/// request id when absent.
pub fn results_key(params: &Value, request_id: &Value) -> String {
    params
        .get("runId")
        .and_then(key_of)
        .or_else(|| key_of(request_id))
        .unwrap_or_default()
}

fn results_payload(outcome: Result<Result<RunResults, EngineError>, impl std::fmt::Debug>) -> Value {
    match outcome {
        Ok(Ok(r)) => json!({ "results": r.results, "message": r.message }),
        Ok(Err(e)) => Value::String(e.to_string()),
        Err(_) => Value::String("Error: run ended without reporting results".into()),
    }
}

/// Start a run and spawn its relay. Replies `{started, args, tid}`.
pub async fn run(
    session: &Arc<Session>,
    request_id: &Value,
    params: Value,
) -> Result<Value, CommandError> {
    let handle = session.engine().runner().run(params.clone()).await?;
    let tid = handle.id.clone();
    let key = results_key(&params, request_id);
    tracing::info!(
        connection_id = %session.connection_id(),
        run_id = %tid,
        results_key = %key,
        "run started"
    );

    let session = Arc::clone(session);
    tokio::spawn(async move {
        let out = session.outbound().clone();
        tokio::select! {
            _ = session.closed() => {
                tracing::debug!(connection_id = %session.connection_id(), "session closed, dropping run relay");
            }
            _ = relay(handle, key, out) => {}
        }
    });

    Ok(json!({
        "started": now_millis(),
        "args": params,
        "tid": tid,
    }))
}

/// Relay every progress event of `handle`, then its results.
///
/// Progress stops at the first terminal event. Events still buffered when
/// the results arrive are flushed first so the results come last.
pub async fn relay(mut handle: RunHandle, results_key: String, out: Outbound) {
    let id = handle.id.clone();
    let mut state = RunState::default();
    let mut progress_open = true;

    let emit = |state: &mut RunState, event: RunEvent| {
        if state.accept(&event) {
            tracing::debug!(run_id = %id, event = event.name(), "relaying run event");
            out.emit(format!("{} {}", event.name(), id), event.payload());
        } else {
            tracing::debug!(run_id = %id, event = event.name(), ?state, "dropping out-of-sequence run event");
        }
    };

    let outcome = loop {
        tokio::select! {
            biased;
            event = handle.events.recv(), if progress_open => match event {
                Some(event) => {
                    emit(&mut state, event);
                    if state.is_finished() {
                        progress_open = false;
                    }
                }
                None => progress_open = false,
            },
            outcome = &mut handle.finished => break outcome,
        }
    };

    while progress_open && !state.is_finished() {
        match handle.events.try_recv() {
            Ok(event) => emit(&mut state, event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }

    tracing::debug!(run_id = %id, results_key = %results_key, "run finished, emitting results");
    out.emit(format!("{} {}", events::RUN_RESULTS, results_key), results_payload(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use tokio::sync::{mpsc, oneshot};

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(Frame::Event { event, data }) = rx.try_recv() {
            out.push((event, data));
        }
        out
    }

    #[test]
    fn state_machine_accepts_valid_sequence() {
        let mut s = RunState::default();
        for ev in [
            RunEvent::Running,
            RunEvent::Current(json!(1)),
            RunEvent::Current(json!(2)),
            RunEvent::Paused,
            RunEvent::Running,
            RunEvent::Current(json!(3)),
            RunEvent::Stopped,
        ] {
            assert!(s.accept(&ev), "{ev:?} rejected");
        }
        assert!(s.is_finished());
        assert!(!s.accept(&RunEvent::Running));
        assert!(!s.accept(&RunEvent::Failed));
    }

    #[test]
    fn state_machine_rejects_out_of_order() {
        let mut s = RunState::default();
        assert!(!s.accept(&RunEvent::Current(json!(1))));
        assert!(!s.accept(&RunEvent::Paused));
        assert!(s.accept(&RunEvent::Running));
        assert!(!s.accept(&RunEvent::Running));
        assert!(s.accept(&RunEvent::Paused));
        assert!(!s.accept(&RunEvent::Current(json!(1))));
        assert!(s.accept(&RunEvent::Allow(json!(["resume"]))));
        assert_eq!(s, RunState::Paused);
    }

    #[test]
    fn results_key_prefers_run_id() {
        assert_eq!(results_key(&json!({"runId": "abc"}), &json!(7)), "abc");
        assert_eq!(results_key(&json!({"runId": 12}), &json!(7)), "12");
        assert_eq!(results_key(&json!({}), &json!(7)), "7");
        assert_eq!(results_key(&json!({"runId": null}), &json!("req")), "req");
    }

    #[tokio::test]
    async fn relay_scopes_events_and_stops_after_terminal() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let handle = RunHandle {
            id: "r1".into(),
            events: events_rx,
            finished: done_rx,
        };
        for ev in [
            RunEvent::Running,
            RunEvent::Current(json!({"line": 1})),
            RunEvent::Failed,
            RunEvent::Current(json!({"line": 2})),
            RunEvent::Stopped,
        ] {
            events_tx.send(ev).unwrap();
        }
        done_tx
            .send(Ok(RunResults {
                results: json!(false),
                message: Some("assertion failed".into()),
            }))
            .unwrap();

        let (out, mut rx) = Outbound::channel();
        relay(handle, "req-9".into(), out).await;

        let frames = drain(&mut rx);
        let names: Vec<&str> = frames.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["running r1", "current r1", "failed r1", "run results req-9"]
        );
        assert_eq!(frames[1].1, json!({"line": 1}));
        assert_eq!(
            frames[3].1,
            json!({"results": false, "message": "assertion failed"})
        );
    }

    #[tokio::test]
    async fn relay_reports_error_text() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let handle = RunHandle {
            id: "r2".into(),
            events: events_rx,
            finished: done_rx,
        };
        done_tx.send(Err(EngineError::failed("suite not found"))).unwrap();

        let (out, mut rx) = Outbound::channel();
        relay(handle, "r2".into(), out).await;
        let frames = drain(&mut rx);
        assert_eq!(frames, vec![("run results r2".to_string(), json!("suite not found"))]);
    }
}
