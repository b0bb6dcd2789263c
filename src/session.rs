//! Session Manager: binds one connection to one engine instance.
//!
//! A [`Session`] is created by [`open`] once its engine is ready and torn
//! down by [`Session::close`] when the connection goes away. Everything a
//! command handler may touch for this connection hangs off the session.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cipher::Cipher;
use crate::engine::{Engine, EngineError, EngineFactory};
use crate::events::Subscription;
use crate::prefs::UserPrefs;
use crate::protocol::{events, Frame};
use crate::registry::{ProcessEntry, Resource, ResourceRegistry};
use crate::shutdown::ShutdownCoordinator;

/// Whether a session is responsible for its engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The session created the engine and terminates it on close.
    Exclusive,
    /// The engine pre-existed and outlives the session.
    Shared,
}

/// What `close` does to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    StopThenTerminate,
    Terminate,
    Detach,
}

/// Engine teardown policy on disconnect.
///
/// `other_connections` counts the connections that remain open server-wide,
/// excluding the one being closed. The framework is only stopped when this
/// was the last connection, so a framework still in use elsewhere keeps
/// running.
pub fn teardown_plan(
    ownership: Ownership,
    framework_started: bool,
    other_connections: usize,
) -> Teardown {
    match ownership {
        Ownership::Shared => Teardown::Detach,
        Ownership::Exclusive if framework_started && other_connections == 0 => {
            Teardown::StopThenTerminate
        }
        Ownership::Exclusive => Teardown::Terminate,
    }
}

/// Server-wide count of open connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    count: Arc<AtomicUsize>,
}

/// RAII guard that decrements the connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionTracker {
    pub fn connect(&self) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn active(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Invoked by the `kill` command.
pub type KillHook = Arc<dyn Fn() + Send + Sync>;

/// Server-wide services shared by every session.
#[derive(Clone)]
pub struct ServerContext {
    pub cipher: Cipher,
    pub shutdown: ShutdownCoordinator,
    pub connections: ConnectionTracker,
    pub kill: KillHook,
    /// Port the server is bound to, published to engines as config `port`.
    pub port: u16,
}

impl ServerContext {
    pub fn new(cipher: Cipher, kill: KillHook) -> Self {
        Self {
            cipher,
            shutdown: ShutdownCoordinator::new(),
            connections: ConnectionTracker::default(),
            kill,
            port: 0,
        }
    }
}

/// Sending half of a connection's outbound frame queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns `false` once the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn emit(&self, event: impl Into<String>, data: Value) -> bool {
        self.send(Frame::event(event, data))
    }
}

/// Where a connection gets its engine from.
#[derive(Clone)]
pub enum EngineSource {
    New(Arc<dyn EngineFactory>),
    Shared(Engine),
}

/// State of one open connection.
pub struct Session {
    connection_id: String,
    engine: Engine,
    ownership: Ownership,
    registry: ResourceRegistry,
    prefs: UserPrefs,
    outbound: Outbound,
    server: ServerContext,
    alive: CancellationToken,
    closed: AtomicBool,
    listeners: Mutex<Vec<Subscription>>,
    images: AtomicU64,
    trees: AtomicU64,
    /// Held across the status check and launch of `start framework`.
    starting: tokio::sync::Mutex<()>,
    /// Released by `close`, not by the last `Arc` drop: handlers and run
    /// relays may outlive the connection.
    connection: Mutex<Option<ConnectionGuard>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("engine_id", &self.engine.id())
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Open a session for a new connection.
///
/// Resolves once the engine is ready and the session is active. On
/// initialization failure an engine this session created is terminated and
/// the error returned; the caller reports it and closes the connection.
pub async fn open(
    connection_id: impl Into<String>,
    source: EngineSource,
    server: ServerContext,
    outbound: Outbound,
    connection: ConnectionGuard,
) -> Result<Arc<Session>, EngineError> {
    let connection_id = connection_id.into();
    let (engine, ownership) = match source {
        EngineSource::New(factory) => (factory.create().await?, Ownership::Exclusive),
        EngineSource::Shared(engine) => (engine, Ownership::Shared),
    };

    if let Err(e) = engine.wait_ready().await {
        tracing::error!(%connection_id, error = %e, "engine failed to initialize");
        if ownership == Ownership::Exclusive {
            engine.terminate().await;
        }
        return Err(e);
    }

    engine.config().set("port", Value::from(server.port));
    let prefs = UserPrefs::load(
        engine.config().get_str("veUserFavorites").map(Into::into),
        engine.config().get_str("veUserSettings").map(Into::into),
        engine.console(),
    )
    .await;

    let session = Arc::new(Session {
        registry: ResourceRegistry::new(connection_id.clone()),
        connection_id,
        engine,
        ownership,
        prefs,
        outbound,
        server,
        alive: CancellationToken::new(),
        closed: AtomicBool::new(false),
        listeners: Mutex::new(Vec::new()),
        images: AtomicU64::new(0),
        trees: AtomicU64::new(0),
        starting: tokio::sync::Mutex::new(()),
        connection: Mutex::new(Some(connection)),
    });
    session.activate();
    Ok(session)
}

impl Session {
    fn activate(&self) {
        let console = {
            let out = self.outbound.clone();
            Subscription::forward(self.engine.console().subscribe(), move |msg| {
                out.emit(events::STDOUT, serde_json::to_value(msg).unwrap_or(Value::Null));
            })
        };
        let config = {
            let out = self.outbound.clone();
            Subscription::forward(self.engine.config().subscribe(), move |change| {
                out.emit(events::CONFIG_UPDATE, change.config);
            })
        };
        let test_starts = {
            let out = self.outbound.clone();
            Subscription::forward(self.engine.runner().subscribe_test_starts(), move |data| {
                out.emit(events::START_TEST, data);
            })
        };
        self.listeners.lock().extend([console, config, test_starts]);

        if self.ownership == Ownership::Shared {
            if let Some(process) = self.engine.framework().process() {
                self.watch_process(process);
            }
        }
        tracing::info!(
            connection_id = %self.connection_id,
            engine_id = self.engine.id(),
            ownership = ?self.ownership,
            "session active"
        );
    }

    /// Register `process` for this session and report its exit to the client
    /// as "framework died".
    pub fn watch_process(&self, process: crate::engine::ProcessHandle) -> bool {
        let listener = {
            let out = self.outbound.clone();
            let process = process.clone();
            let connection_id = self.connection_id.clone();
            Subscription::spawn(async move {
                let code = process.wait().await;
                tracing::warn!(%connection_id, code, "framework process exited");
                out.emit(events::FRAMEWORK_DIED, Value::Null);
            })
        };
        self.registry.register(Resource::Process(ProcessEntry {
            handle: process,
            listener: Some(listener),
        }))
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn prefs(&self) -> &UserPrefs {
        &self.prefs
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn server(&self) -> &ServerContext {
        &self.server
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Resolves when the session is closed.
    pub async fn closed(&self) {
        self.alive.cancelled().await
    }

    /// Sequence number for the next screen capture, starting at 0.
    pub fn next_image_number(&self) -> u64 {
        self.images.fetch_add(1, Ordering::Relaxed)
    }

    /// Sequence number for the next tree snapshot, starting at 0.
    pub fn next_tree_number(&self) -> u64 {
        self.trees.fetch_add(1, Ordering::Relaxed)
    }

    /// Serializes framework starts on this session.
    pub async fn start_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.starting.lock().await
    }

    /// Tear the session down. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alive.cancel();
        for listener in self.listeners.lock().drain(..) {
            listener.unsubscribe();
        }
        self.registry.clear();

        drop(self.connection.lock().take());
        let others = self.server.connections.active();
        let started = match self.ownership {
            Ownership::Exclusive => self.engine.framework().status().await.started,
            Ownership::Shared => false,
        };
        let plan = teardown_plan(self.ownership, started, others);
        tracing::debug!(
            connection_id = %self.connection_id,
            engine_id = self.engine.id(),
            ?plan,
            other_connections = others,
            "closing session"
        );

        match plan {
            Teardown::StopThenTerminate => {
                if let Err(e) = self.engine.framework().stop().await {
                    tracing::warn!(connection_id = %self.connection_id, error = %e, "framework stop failed during teardown");
                }
                self.engine.terminate().await;
            }
            Teardown::Terminate => self.engine.terminate().await,
            Teardown::Detach => {}
        }
    }
}
