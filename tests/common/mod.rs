#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use veplane::api::{self, commands, AppState};
use veplane::cipher::Cipher;
use veplane::engine::EngineFactory;
use veplane::protocol::{Frame, RequestEnvelope, ResponseEnvelope};
use veplane::session::{self, EngineSource, ServerContext, Session};
use veplane::testing::{MockEngine, MockEngineFactory};

pub const WAIT: Duration = Duration::from_secs(5);

/// Server context whose kill hook only counts invocations.
pub fn test_server() -> (ServerContext, Arc<AtomicUsize>) {
    let kills = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&kills);
    let server = ServerContext::new(
        Cipher::ephemeral(),
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    (server, kills)
}

/// A session opened directly against the session layer.
pub struct TestSession {
    pub session: Arc<Session>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub mock: MockEngine,
}

impl TestSession {
    /// Dispatch one request and return its response, skipping events.
    pub async fn request(&mut self, id: Value, command: &str, data: Value) -> ResponseEnvelope {
        let req = RequestEnvelope {
            id: id.clone(),
            command: command.to_string(),
            data,
        };
        tokio::spawn(commands::handle(Arc::clone(&self.session), req));
        self.response(id).await
    }

    /// Wait for the response to `id`.
    pub async fn response(&mut self, id: Value) -> ResponseEnvelope {
        loop {
            match self.next_frame().await {
                Frame::Response(r) if r.request_id == id => return r,
                _ => continue,
            }
        }
    }

    /// Wait for the next event named `name`.
    pub async fn event(&mut self, name: &str) -> Value {
        loop {
            if let Frame::Event { event, data } = self.next_frame().await {
                if event == name {
                    return data;
                }
            }
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    /// Events received within `window`, in order.
    pub async fn events_within(&mut self, window: Duration) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            if let Frame::Event { event, data } = frame {
                out.push((event, data));
            }
        }
        out
    }
}

/// Open an exclusive session through `factory`.
pub async fn open_exclusive(server: &ServerContext, factory: Arc<MockEngineFactory>) -> TestSession {
    let (outbound, frames) = session::Outbound::channel();
    let source = EngineSource::New(Arc::clone(&factory) as Arc<dyn EngineFactory>);
    let session = session::open(
        uuid_like(),
        source,
        server.clone(),
        outbound,
        server.connections.connect(),
    )
    .await
    .expect("session failed to open");
    let mock = factory.last().expect("factory created no engine");
    TestSession {
        session,
        frames,
        mock,
    }
}

/// Open a session attached to `mock`'s engine.
pub async fn open_shared(server: &ServerContext, mock: &MockEngine) -> TestSession {
    let (outbound, frames) = session::Outbound::channel();
    let session = session::open(
        uuid_like(),
        EngineSource::Shared(mock.engine.clone()),
        server.clone(),
        outbound,
        server.connections.connect(),
    )
    .await
    .expect("session failed to open");
    TestSession {
        session,
        frames,
        mock: mock.clone(),
    }
}

fn uuid_like() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("conn-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Seed with favorites/settings files under `dir`.
pub fn seed_with_prefs(dir: &std::path::Path) -> Map<String, Value> {
    let mut seed = Map::new();
    seed.insert("userHome".into(), json!("/home/tester"));
    seed.insert("temp".into(), json!(dir.to_string_lossy()));
    seed.insert(
        "veUserFavorites".into(),
        json!(dir.join("favorites.json").to_string_lossy()),
    );
    seed.insert(
        "veUserSettings".into(),
        json!(dir.join("settings.json").to_string_lossy()),
    );
    seed
}

/// Start params that pass validation.
pub fn start_params() -> Value {
    json!({
        "framework": "selenium",
        "platform": "web",
        "device": "chrome",
        "app": "https://example.com",
        "testPath": "~/tests",
        "testResultsPath": "~/results",
        "options": {},
    })
}

/// Serve `state` on an ephemeral port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, state));
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}
