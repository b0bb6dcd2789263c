//! Engine hosted in an external helper process.
//!
//! The helper speaks newline-delimited JSON over stdio:
//!
//! - requests `{"id", "method", "params"}` and notifications `{"method", "params"}`
//!   flow to the helper on stdin;
//! - responses `{"id", "result"}` / `{"id", "error"}` and events
//!   `{"event", "params"}` flow back on stdout.
//!
//! Requests are correlated with responses through a map of pending oneshot
//! senders keyed by request id. Events fan out to the engine's console and
//! config store, to in-flight runs, and to the framework process handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{
    Accept, ActionOutcome, AssetCollection, AssetRef, AssetStore, Capture, CaptureRequest,
    Console, ConsoleMessage, Element, ElementTree, Engine, EngineConfig, EngineError,
    EngineFactory, EngineParts, Framework, FrameworkStatus, Launch, Lookup, ProcessExit,
    ProcessHandle, ResolvedAsset, RunEvent, RunHandle, RunResults, Runner, SelectorSetMatch,
};
use crate::events::Subscription;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn engine host `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine host has no {0} pipe")]
    Pipe(&'static str),
}

impl From<HostError> for EngineError {
    fn from(e: HostError) -> Self {
        EngineError::Init(e.to_string())
    }
}

type Reply = Result<Value, EngineError>;
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>>;

/// Removes the pending entry if the request future is dropped before the
/// helper answers.
struct CancelGuard {
    id: u64,
    pending: Pending,
    completed: bool,
}

impl CancelGuard {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(map) = self.pending.lock().as_mut() {
            if map.remove(&self.id).is_some() {
                tracing::debug!(id = self.id, "dropped orphaned host request");
            }
        }
    }
}

struct RunSink {
    events: mpsc::UnboundedSender<RunEvent>,
    finished: oneshot::Sender<Result<RunResults, EngineError>>,
}

struct FrameworkProcess {
    handle: ProcessHandle,
    exit: ProcessExit,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        params: Value,
    },
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| other.to_string()),
    }
}

/// JSON-lines connection to one engine host.
pub struct HostConnection {
    last_id: AtomicU64,
    last_run: AtomicU64,
    pending: Pending,
    runs: Mutex<Option<HashMap<String, RunSink>>>,
    outbound: mpsc::UnboundedSender<Value>,
    config: EngineConfig,
    console: Console,
    process: Mutex<Option<FrameworkProcess>>,
    test_starts: broadcast::Sender<Value>,
    assets_loaded: broadcast::Sender<()>,
    ready: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
    child: Mutex<Option<Child>>,
}

impl HostConnection {
    /// Start reader and writer tasks over the given pipes. The returned
    /// receiver resolves when the helper reports `ready`, or with an error if
    /// it goes away first.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        config: EngineConfig,
        console: Console,
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), String>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (test_starts, _) = broadcast::channel(32);
        let (assets_loaded, _) = broadcast::channel(8);

        let conn = Arc::new(Self {
            last_id: AtomicU64::new(0),
            last_run: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(Some(HashMap::new()))),
            runs: Mutex::new(Some(HashMap::new())),
            outbound,
            config,
            console,
            process: Mutex::new(None),
            test_starts,
            assets_loaded,
            ready: Mutex::new(Some(ready_tx)),
            child: Mutex::new(None),
        });

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.read_loop(reader).await }
        });

        (conn, ready_rx)
    }

    /// Send a request and wait for the matching response.
    pub async fn call(&self, method: &str, params: Value) -> Reply {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(map) => {
                map.insert(id, tx);
            }
            None => return Err(EngineError::Unavailable),
        }
        let mut guard = CancelGuard {
            id,
            pending: Arc::clone(&self.pending),
            completed: false,
        };

        tracing::trace!(id, method, "host request");
        let request = json!({ "id": id, "method": method, "params": params });
        if self.outbound.send(request).is_err() {
            return Err(EngineError::Unavailable);
        }

        let reply = rx.await;
        guard.complete();
        reply.unwrap_or(Err(EngineError::Unavailable))
    }

    /// Fire-and-forget message to the helper.
    pub fn notify(&self, method: &str, params: Value) {
        let _ = self
            .outbound
            .send(json!({ "method": method, "params": params }));
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Incoming>(&line) {
                        Ok(msg) => self.dispatch(msg),
                        Err(e) => tracing::warn!(error = %e, "malformed message from engine host"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "engine host read failed");
                    break;
                }
            }
        }
        self.disconnected();
    }

    fn dispatch(&self, msg: Incoming) {
        match msg {
            Incoming::Response { id, result, error } => {
                let sender = self.pending.lock().as_mut().and_then(|m| m.remove(&id));
                let Some(sender) = sender else {
                    tracing::debug!(id, "response for unknown host request");
                    return;
                };
                let reply = match error {
                    Some(error) => Err(EngineError::Failed(error_text(&error))),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = sender.send(reply);
            }
            Incoming::Event { event, params } => self.on_event(&event, params),
        }
    }

    fn on_event(&self, event: &str, params: Value) {
        match event {
            "ready" => {
                if let Some(tx) = self.ready.lock().take() {
                    let _ = tx.send(Ok(()));
                }
            }
            "console" => match serde_json::from_value::<ConsoleMessage>(params) {
                Ok(msg) => self.console.log(msg.level, msg.message),
                Err(e) => tracing::debug!(error = %e, "ignoring malformed console event"),
            },
            "config" => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return;
                };
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                if self.config.get(name).as_ref() != Some(&value) {
                    self.config.set(name, value);
                }
            }
            "run" => self.on_run_event(params),
            "run.finished" => self.on_run_finished(params),
            "process.exit" => {
                let code = params
                    .get("code")
                    .and_then(Value::as_i64)
                    .map(|c| c as i32)
                    .unwrap_or(-1);
                if let Some(process) = self.process.lock().take() {
                    tracing::debug!(pid = ?process.handle.pid(), code, "framework process exited");
                    process.exit.exited(code);
                }
            }
            "test.start" => {
                let _ = self.test_starts.send(params);
            }
            "assets.loaded" => {
                let _ = self.assets_loaded.send(());
            }
            other => tracing::debug!(event = other, "unhandled engine host event"),
        }
    }

    fn on_run_event(&self, params: Value) {
        let Some(handle) = params.get("handle").and_then(Value::as_str) else {
            return;
        };
        let mut wire = Map::new();
        if let Some(state) = params.get("state") {
            wire.insert("state".into(), state.clone());
        }
        if let Some(data) = params.get("data").filter(|d| !d.is_null()) {
            wire.insert("data".into(), data.clone());
        }
        let event = match serde_json::from_value::<RunEvent>(Value::Object(wire)) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(run_id = handle, error = %e, "ignoring unknown run event");
                return;
            }
        };
        if let Some(sink) = self.runs.lock().as_ref().and_then(|r| r.get(handle)) {
            let _ = sink.events.send(event);
        }
    }

    fn on_run_finished(&self, params: Value) {
        let Some(handle) = params.get("handle").and_then(Value::as_str) else {
            return;
        };
        let Some(sink) = self.runs.lock().as_mut().and_then(|r| r.remove(handle)) else {
            return;
        };
        let outcome = match params.get("error").filter(|e| !e.is_null()) {
            Some(error) => Err(EngineError::Failed(error_text(error))),
            None => Ok(RunResults {
                results: params.get("results").cloned().unwrap_or(Value::Null),
                message: params
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            }),
        };
        let _ = sink.finished.send(outcome);
    }

    /// The helper is gone: fail everything still waiting on it.
    fn disconnected(&self) {
        tracing::info!("engine host disconnected");
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(Err("engine host exited before becoming ready".into()));
        }
        // Dropping the senders resolves every waiter with Unavailable.
        self.pending.lock().take();
        if let Some(runs) = self.runs.lock().take() {
            for (_, sink) in runs {
                let _ = sink.finished.send(Err(EngineError::Unavailable));
            }
        }
        if let Some(process) = self.process.lock().take() {
            process.exit.exited(-1);
        }
    }

    fn register_run(&self) -> Result<(String, RunHandle), EngineError> {
        let handle = format!("run-{}", self.last_run.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events) = mpsc::unbounded_channel();
        let (finished_tx, finished) = oneshot::channel();
        let mut runs = self.runs.lock();
        let runs = runs.as_mut().ok_or(EngineError::Unavailable)?;
        runs.insert(
            handle.clone(),
            RunSink {
                events: events_tx,
                finished: finished_tx,
            },
        );
        Ok((
            handle.clone(),
            RunHandle {
                id: handle,
                events,
                finished,
            },
        ))
    }

    fn forget_run(&self, handle: &str) {
        if let Some(runs) = self.runs.lock().as_mut() {
            runs.remove(handle);
        }
    }

    fn attach_child(&self, child: Child) {
        *self.child.lock() = Some(child);
    }

    async fn shutdown(&self) {
        self.notify("shutdown", Value::Null);
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "engine host exited"),
                _ => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "failed to kill engine host");
                    }
                }
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = rx.recv().await {
        let mut line = message.to_string();
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "engine host write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!(error = %e, "engine host flush failed");
            break;
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::failed(format!("unexpected engine host reply: {e}")))
}

// ── Framework ─────────────────────────────────────────────────────

struct HostFramework {
    conn: Arc<HostConnection>,
}

#[derive(Deserialize)]
struct LaunchReply {
    #[serde(default)]
    started: bool,
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Deserialize)]
struct TreeReply {
    handle: String,
    #[serde(default)]
    contents: Value,
    #[serde(default)]
    hash: String,
}

#[async_trait]
impl Framework for HostFramework {
    async fn status(&self) -> FrameworkStatus {
        match self.conn.call("framework.status", Value::Null).await {
            Ok(v) => decode(v).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "bad framework status");
                FrameworkStatus::default()
            }),
            Err(e) => {
                tracing::debug!(error = %e, "framework status unavailable");
                FrameworkStatus::default()
            }
        }
    }

    async fn load(&self, name: &str) -> Result<(), EngineError> {
        self.conn
            .call("framework.load", json!({ "name": name }))
            .await
            .map(drop)
    }

    async fn launch(&self, name: &str, args: Vec<Value>) -> Result<Launch, EngineError> {
        let reply: LaunchReply = decode(
            self.conn
                .call("framework.launch", json!({ "name": name, "args": args }))
                .await?,
        )?;
        let process = reply.pid.map(|pid| {
            let (handle, exit) = ProcessHandle::new(Some(pid));
            *self.conn.process.lock() = Some(FrameworkProcess {
                handle: handle.clone(),
                exit,
            });
            handle
        });
        Ok(Launch {
            started: reply.started,
            process,
        })
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.conn.call("framework.stop", Value::Null).await.map(drop)
    }

    async fn build(&self, args: Vec<Value>) -> Result<Value, EngineError> {
        self.conn.call("framework.build", json!({ "args": args })).await
    }

    async fn orientation(&self) -> Result<u8, EngineError> {
        let v = self.conn.call("framework.orientation", Value::Null).await?;
        Ok(v.as_u64().and_then(|n| u8::try_from(n).ok()).unwrap_or(1))
    }

    async fn capture_screen(&self, request: &CaptureRequest) -> Result<Capture, EngineError> {
        let params = serde_json::to_value(request)
            .map_err(|e| EngineError::failed(e.to_string()))?;
        let reply = self.conn.call("framework.captureScreen", params).await?;
        if reply.is_null() {
            return Ok(Capture::default());
        }
        decode(reply)
    }

    async fn tree(&self) -> Result<Arc<dyn ElementTree>, EngineError> {
        let reply: TreeReply = decode(self.conn.call("framework.tree", Value::Null).await?)?;
        Ok(Arc::new(HostTree {
            conn: Arc::clone(&self.conn),
            handle: reply.handle,
            contents: reply.contents,
            hash: reply.hash,
        }))
    }

    async fn available_devices(&self, framework: &str) -> Value {
        self.conn
            .call("framework.devices", json!({ "framework": framework }))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(framework, error = %e, "device listing failed");
                json!([])
            })
    }

    fn process(&self) -> Option<ProcessHandle> {
        self.conn
            .process
            .lock()
            .as_ref()
            .map(|p| p.handle.clone())
    }

    async fn terminate(&self) {
        self.conn.shutdown().await;
    }
}

struct HostTree {
    conn: Arc<HostConnection>,
    handle: String,
    contents: Value,
    hash: String,
}

#[async_trait]
impl ElementTree for HostTree {
    fn contents(&self) -> Value {
        self.contents.clone()
    }

    fn hash(&self) -> String {
        self.hash.clone()
    }

    async fn find(&self, lookup: Lookup, value: &str) -> Result<Vec<Element>, EngineError> {
        let params = json!({ "tree": self.handle, "by": lookup, "value": value });
        decode(self.conn.call("tree.find", params).await?)
    }

    async fn find_by_selector_set(
        &self,
        selectors: &[String],
    ) -> Result<SelectorSetMatch, EngineError> {
        let params = json!({ "tree": self.handle, "selectors": selectors });
        decode(self.conn.call("tree.findBySelectorSet", params).await?)
    }
}

// ── Assets ────────────────────────────────────────────────────────

struct HostAssets {
    conn: Arc<HostConnection>,
}

#[async_trait]
impl AssetStore for HostAssets {
    async fn load(&self, test_path: &str) -> Result<Arc<dyn AssetCollection>, EngineError> {
        self.conn
            .call("assets.load", json!({ "testPath": test_path }))
            .await?;
        Ok(Arc::new(HostCollection {
            conn: Arc::clone(&self.conn),
            test_path: test_path.to_string(),
        }))
    }

    async fn get(&self, test_path: Option<&str>) -> Result<Arc<dyn AssetCollection>, EngineError> {
        let reply = self
            .conn
            .call("assets.get", json!({ "testPath": test_path }))
            .await?;
        let test_path = reply
            .get("testPath")
            .and_then(Value::as_str)
            .or(test_path)
            .ok_or_else(|| EngineError::failed("Error: no asset collection is loaded"))?;
        Ok(Arc::new(HostCollection {
            conn: Arc::clone(&self.conn),
            test_path: test_path.to_string(),
        }))
    }

    async fn destroy(&self) {
        if let Err(e) = self.conn.call("assets.destroy", Value::Null).await {
            tracing::debug!(error = %e, "asset store destroy failed");
        }
    }
}

struct HostCollection {
    conn: Arc<HostConnection>,
    test_path: String,
}

impl HostCollection {
    fn params(&self, extra: Value) -> Value {
        let mut params = Map::new();
        params.insert("testPath".into(), json!(self.test_path));
        if let Value::Object(extra) = extra {
            params.extend(extra);
        }
        Value::Object(params)
    }

    fn asset_params(&self, asset: &AssetRef) -> Value {
        let mut asset = json!(asset);
        if asset.get("accept").is_none() {
            asset["accept"] = json!(Accept::default());
        }
        self.params(json!({ "asset": asset }))
    }

    async fn flag(&self, method: &str, extra: Value) -> bool {
        match self.conn.call(method, self.params(extra)).await {
            Ok(v) => v.as_bool().unwrap_or(false),
            Err(e) => {
                tracing::debug!(method, error = %e, "asset query failed");
                false
            }
        }
    }
}

#[async_trait]
impl AssetCollection for HostCollection {
    fn subscribe_loaded(&self) -> broadcast::Receiver<()> {
        self.conn.assets_loaded.subscribe()
    }

    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, EngineError> {
        decode(self.conn.call("assets.resolve", self.asset_params(asset)).await?)
    }

    async fn read(&self, asset: &AssetRef) -> Result<Option<Value>, EngineError> {
        let v = self.conn.call("assets.read", self.asset_params(asset)).await?;
        Ok((!v.is_null()).then_some(v))
    }

    async fn write(&self, asset: &AssetRef, contents: Value) -> Result<(), EngineError> {
        let mut params = self.asset_params(asset);
        params["contents"] = contents;
        self.conn.call("assets.write", params).await.map(drop)
    }

    async fn delete_asset(&self, asset: &AssetRef) -> Result<(), EngineError> {
        self.conn
            .call("assets.deleteAsset", self.asset_params(asset))
            .await
            .map(drop)
    }

    async fn delete_module(&self, suite: &str, module: &str) -> Result<(), EngineError> {
        let params = self.params(json!({ "suite": suite, "module": module }));
        self.conn.call("assets.deleteModule", params).await.map(drop)
    }

    async fn delete_suite(&self, suite: &str) -> Result<(), EngineError> {
        let params = self.params(json!({ "suite": suite }));
        self.conn.call("assets.deleteSuite", params).await.map(drop)
    }

    async fn suite_exists(&self, suite: &str) -> bool {
        self.flag("assets.suiteExists", json!({ "suite": suite })).await
    }

    async fn module_exists(&self, suite: &str, module: &str) -> bool {
        self.flag(
            "assets.moduleExists",
            json!({ "suite": suite, "module": module }),
        )
        .await
    }

    async fn make_suite(&self, suite: &str) -> Result<(), EngineError> {
        let params = self.params(json!({ "suite": suite }));
        self.conn.call("assets.makeSuite", params).await.map(drop)
    }

    async fn make_module(&self, suite: &str, module: &str) -> Result<(), EngineError> {
        let params = self.params(json!({ "suite": suite, "module": module }));
        self.conn.call("assets.makeModule", params).await.map(drop)
    }

    async fn hierarchy(&self) -> Value {
        self.conn
            .call("assets.hierarchy", self.params(Value::Null))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "project hierarchy unavailable");
                json!({})
            })
    }
}

// ── Runner ────────────────────────────────────────────────────────

struct HostRunner {
    conn: Arc<HostConnection>,
}

#[async_trait]
impl Runner for HostRunner {
    async fn run(&self, params: Value) -> Result<RunHandle, EngineError> {
        // Registered before the request goes out so early events are kept.
        let (handle, run) = self.conn.register_run()?;
        let reply = self
            .conn
            .call("runner.run", json!({ "handle": handle, "params": params }))
            .await;
        if let Err(e) = reply {
            self.conn.forget_run(&handle);
            return Err(e);
        }
        Ok(run)
    }

    async fn execute(&self, action: Value) -> Result<ActionOutcome, EngineError> {
        decode(self.conn.call("runner.execute", action).await?)
    }

    async fn syntax(&self, name: &str, version: &str) -> Result<Value, EngineError> {
        self.conn
            .call("runner.syntax", json!({ "name": name, "version": version }))
            .await
    }

    async fn command_line(&self, line: &str) -> Result<(), EngineError> {
        self.conn
            .call("runner.commandLine", json!({ "line": line }))
            .await
            .map(drop)
    }

    fn keypress(&self, key: &str) {
        self.conn.notify("runner.keypress", json!({ "key": key }));
    }

    fn subscribe_test_starts(&self) -> broadcast::Receiver<Value> {
        self.conn.test_starts.subscribe()
    }
}

// ── Factory ───────────────────────────────────────────────────────

/// Build an engine over an already-started host connection and settle its
/// readiness once the helper reports in (or `startup_timeout` elapses).
pub fn engine_over(
    conn: Arc<HostConnection>,
    ready: oneshot::Receiver<Result<(), String>>,
    startup_timeout: Duration,
) -> Engine {
    let engine = Engine::new(
        conn.config.clone(),
        conn.console.clone(),
        EngineParts {
            framework: Arc::new(HostFramework {
                conn: Arc::clone(&conn),
            }),
            assets: Arc::new(HostAssets {
                conn: Arc::clone(&conn),
            }),
            runner: Arc::new(HostRunner {
                conn: Arc::clone(&conn),
            }),
        },
    );

    // Local config edits are mirrored to the helper for the life of the engine.
    let mirror = Subscription::forward(conn.config.subscribe(), {
        let conn = Arc::clone(&conn);
        move |change: super::ConfigChange| {
            conn.notify(
                "config.set",
                json!({ "name": change.name, "value": change.value }),
            );
        }
    });

    tokio::spawn({
        let engine = engine.clone();
        async move {
            let outcome = match tokio::time::timeout(startup_timeout, ready).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(reason))) => Err(reason),
                Ok(Err(_)) => Err("engine host went away during startup".to_string()),
                Err(_) => Err(format!(
                    "engine host not ready after {}s",
                    startup_timeout.as_secs()
                )),
            };
            match outcome {
                Ok(()) => {
                    tracing::info!(engine = %engine.label(), "engine ready");
                    engine.mark_ready();
                }
                Err(reason) => {
                    tracing::error!(engine = %engine.label(), %reason, "engine failed to start");
                    engine.mark_failed(reason);
                    engine.terminate().await;
                    return;
                }
            }
            let mut state = engine.subscribe_state();
            while state.changed().await.is_ok() {
                if engine.is_terminated() {
                    break;
                }
            }
            drop(mirror);
        }
    });

    engine
}

/// Spawns one helper process per engine.
pub struct HostEngineFactory {
    command: String,
    args: Vec<String>,
    seed: Map<String, Value>,
    startup_timeout: Duration,
}

impl HostEngineFactory {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        seed: Map<String, Value>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            seed,
            startup_timeout,
        }
    }

    fn spawn(&self) -> Result<Engine, HostError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(HostError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(HostError::Pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(?pid, "engine host: {line}");
                }
            });
        }
        tracing::info!(command = %self.command, pid = ?child.id(), "spawned engine host");

        let config = EngineConfig::new(self.seed.clone());
        let (conn, ready) = HostConnection::start(stdout, stdin, config.clone(), Console::new());
        conn.attach_child(child);
        conn.notify("initialize", json!({ "config": config.get_all() }));
        Ok(engine_over(conn, ready, self.startup_timeout))
    }
}

#[async_trait]
impl EngineFactory for HostEngineFactory {
    async fn create(&self) -> Result<Engine, EngineError> {
        Ok(self.spawn()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream, Lines};

    /// The helper's side of the pipes.
    struct FakeHost {
        requests: Lines<BufReader<DuplexStream>>,
        events: DuplexStream,
    }

    impl FakeHost {
        async fn next(&mut self) -> Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, msg: Value) {
            let mut line = msg.to_string();
            line.push('\n');
            self.events.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn connect() -> (Engine, Arc<HostConnection>, FakeHost) {
        let (host_out, ours_in) = duplex(64 * 1024);
        let (ours_out, host_in) = duplex(64 * 1024);
        let (conn, ready) =
            HostConnection::start(ours_in, ours_out, EngineConfig::default(), Console::new());
        let engine = engine_over(Arc::clone(&conn), ready, Duration::from_secs(5));
        let host = FakeHost {
            requests: BufReader::new(host_in).lines(),
            events: host_out,
        };
        (engine, conn, host)
    }

    #[tokio::test]
    async fn ready_event_marks_engine_ready() {
        let (engine, _conn, mut host) = connect();
        host.send(json!({"event": "ready"})).await;
        engine.wait_ready().await.unwrap();
    }

    #[tokio::test]
    async fn host_exit_before_ready_fails_engine() {
        let (engine, _conn, host) = connect();
        drop(host);
        let err = engine.wait_ready().await.unwrap_err();
        assert!(matches!(err, EngineError::Init(_) | EngineError::Unavailable));
    }

    #[tokio::test]
    async fn requests_are_correlated_by_id() {
        let (engine, _conn, mut host) = connect();
        host.send(json!({"event": "ready"})).await;
        engine.wait_ready().await.unwrap();

        let framework = Arc::clone(engine.framework());
        let call = tokio::spawn(async move { framework.orientation().await });
        let req = host.next().await;
        assert_eq!(req["method"], "framework.orientation");
        host.send(json!({"id": req["id"], "result": 3})).await;
        assert_eq!(call.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn error_reply_surfaces_message() {
        let (engine, _conn, mut host) = connect();
        let framework = Arc::clone(engine.framework());
        let call = tokio::spawn(async move { framework.stop().await });
        let req = host.next().await;
        host.send(json!({"id": req["id"], "error": {"message": "Error: not started"}}))
            .await;
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            EngineError::Failed("Error: not started".into())
        );
    }

    #[tokio::test]
    async fn pending_calls_fail_when_host_goes_away() {
        let (engine, _conn, mut host) = connect();
        let framework = Arc::clone(engine.framework());
        let call = tokio::spawn(async move { framework.stop().await });
        let _ = host.next().await;
        drop(host);
        assert_eq!(call.await.unwrap().unwrap_err(), EngineError::Unavailable);
    }

    #[tokio::test]
    async fn console_and_config_events_apply_locally() {
        let (engine, _conn, mut host) = connect();
        let mut console = engine.console().subscribe();
        host.send(json!({"event": "console", "params": {"level": "info", "message": "hi"}}))
            .await;
        assert_eq!(console.recv().await.unwrap().message, "hi");

        let mut changes = engine.config().subscribe();
        host.send(json!({"event": "config", "params": {"name": "platform", "value": "ios"}}))
            .await;
        assert_eq!(changes.recv().await.unwrap().name, "platform");
        assert_eq!(engine.config().get_str("platform").as_deref(), Some("ios"));
    }

    #[tokio::test]
    async fn run_events_route_to_their_handle() {
        let (engine, _conn, mut host) = connect();
        let runner = Arc::clone(engine.runner());
        let started = tokio::spawn(async move { runner.run(json!({"suite": "s"})).await });

        let req = host.next().await;
        assert_eq!(req["method"], "runner.run");
        let handle = req["params"]["handle"].as_str().unwrap().to_string();
        // Progress before the reply must not be lost.
        host.send(json!({"event": "run", "params": {"handle": handle, "state": "running"}}))
            .await;
        host.send(json!({"id": req["id"], "result": null})).await;

        let mut run = started.await.unwrap().unwrap();
        assert_eq!(run.id, handle);
        assert_eq!(run.events.recv().await.unwrap(), RunEvent::Running);

        host.send(json!({
            "event": "run.finished",
            "params": {"handle": handle, "results": [1], "message": "done"}
        }))
        .await;
        let results = run.finished.await.unwrap().unwrap();
        assert_eq!(results.results, json!([1]));
        assert_eq!(results.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn launch_exposes_process_until_exit() {
        let (engine, _conn, mut host) = connect();
        let framework = Arc::clone(engine.framework());
        let launch = tokio::spawn({
            let framework = Arc::clone(&framework);
            async move { framework.launch("selenium", vec![json!("chrome")]).await }
        });
        let req = host.next().await;
        assert_eq!(req["params"]["args"], json!(["chrome"]));
        host.send(json!({"id": req["id"], "result": {"started": true, "pid": 77}}))
            .await;
        let launch = launch.await.unwrap().unwrap();
        assert!(launch.started);
        let process = launch.process.unwrap();
        assert_eq!(framework.process().unwrap().pid(), Some(77));

        host.send(json!({"event": "process.exit", "params": {"code": 0}}))
            .await;
        assert_eq!(process.wait().await, 0);
        assert!(framework.process().is_none());
    }

    #[tokio::test]
    async fn local_config_changes_are_mirrored() {
        let (engine, _conn, mut host) = connect();
        // Let the mirror subscription start.
        tokio::task::yield_now().await;
        engine.config().set("port", json!(1337));
        let msg = host.next().await;
        assert_eq!(msg["method"], "config.set");
        assert_eq!(msg["params"], json!({"name": "port", "value": 1337}));
    }
}
