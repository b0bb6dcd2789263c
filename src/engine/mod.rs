//! The automation engine as seen by the control plane.
//!
//! An [`Engine`] bundles the pieces every session talks to: a configuration
//! store, a console, and three collaborator capabilities ([`Framework`],
//! [`AssetStore`], [`Runner`]) implemented by whatever backend actually drives
//! devices and browsers. The control plane never reaches past these traits.

pub mod config;
pub mod console;
pub mod host;
pub mod process;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use config::{ConfigChange, EngineConfig};
pub use console::{Console, ConsoleMessage, Level};
pub use process::{ProcessExit, ProcessHandle};

/// Failure reported by an engine collaborator. The message is relayed to the
/// client verbatim.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),

    #[error("Error: engine is unavailable")]
    Unavailable,

    #[error("Error: engine failed to initialize: {0}")]
    Init(String),
}

impl EngineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// ── Framework ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntaxRef {
    pub name: String,
    pub version: String,
}

/// Snapshot of the loaded framework.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameworkStatus {
    pub started: bool,
    pub name: String,
    pub version: String,
    pub device: String,
    pub args: Value,
    pub syntax: SyntaxRef,
}

/// Outcome of a framework launch.
#[derive(Debug, Clone)]
pub struct Launch {
    pub started: bool,
    /// Framework process spawned by the launch, when the backend exposes one.
    pub process: Option<ProcessHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureRequest {
    pub filename: String,
    pub destination: PathBuf,
}

/// Result of a device screen capture. The image is always written to the
/// request destination; some backends also hand back the encoded bytes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Capture {
    pub base64: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(default)]
    pub rect: Option<Rect>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSetMatch {
    pub flat: Vec<Element>,
    pub by_set: Vec<Vec<Element>>,
}

/// Element lookup criteria supported by every tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lookup {
    Id,
    Name,
    Label,
    Value,
    Type,
    ClassName,
    Selector,
}

impl Lookup {
    /// Parse a client-supplied lookup kind, case-insensitively.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "id" => Some(Self::Id),
            "name" => Some(Self::Name),
            "label" => Some(Self::Label),
            "value" => Some(Self::Value),
            "type" => Some(Self::Type),
            "classname" | "class" => Some(Self::ClassName),
            "selector" => Some(Self::Selector),
            _ => None,
        }
    }
}

/// A captured representation of the target UI's element structure.
#[async_trait]
pub trait ElementTree: Send + Sync {
    fn contents(&self) -> Value;
    fn hash(&self) -> String;
    async fn find(&self, lookup: Lookup, value: &str) -> Result<Vec<Element>, EngineError>;
    async fn find_by_selector_set(
        &self,
        selectors: &[String],
    ) -> Result<SelectorSetMatch, EngineError>;
}

/// Device/browser framework capability of an engine.
#[async_trait]
pub trait Framework: Send + Sync {
    async fn status(&self) -> FrameworkStatus;
    /// Select the framework backend by name without starting it.
    async fn load(&self, name: &str) -> Result<(), EngineError>;
    /// Load `name` and start it with backend-specific positional arguments.
    async fn launch(&self, name: &str, args: Vec<Value>) -> Result<Launch, EngineError>;
    async fn stop(&self) -> Result<(), EngineError>;
    async fn build(&self, args: Vec<Value>) -> Result<Value, EngineError>;
    /// Device orientation, 1 meaning upright.
    async fn orientation(&self) -> Result<u8, EngineError>;
    async fn capture_screen(&self, request: &CaptureRequest) -> Result<Capture, EngineError>;
    async fn tree(&self) -> Result<Arc<dyn ElementTree>, EngineError>;
    async fn available_devices(&self, framework: &str) -> Value;
    /// The running framework process, if any.
    fn process(&self) -> Option<ProcessHandle>;
    /// Release the backend behind this engine.
    async fn terminate(&self);
}

// ── Assets ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Accept {
    pub global: bool,
    pub common: bool,
    pub generic: bool,
}

/// Address of one asset inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub suite: String,
    pub module: String,
    pub name: String,
    pub platform: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<Accept>,
}

/// Identity of the asset a reference resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAsset {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A loaded project: suites, modules and their assets.
#[async_trait]
pub trait AssetCollection: Send + Sync {
    /// Fires each time the collection (re)loads from storage.
    fn subscribe_loaded(&self) -> broadcast::Receiver<()>;
    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, EngineError>;
    async fn read(&self, asset: &AssetRef) -> Result<Option<Value>, EngineError>;
    async fn write(&self, asset: &AssetRef, contents: Value) -> Result<(), EngineError>;
    async fn delete_asset(&self, asset: &AssetRef) -> Result<(), EngineError>;
    async fn delete_module(&self, suite: &str, module: &str) -> Result<(), EngineError>;
    async fn delete_suite(&self, suite: &str) -> Result<(), EngineError>;
    async fn suite_exists(&self, suite: &str) -> bool;
    async fn module_exists(&self, suite: &str, module: &str) -> bool;
    async fn make_suite(&self, suite: &str) -> Result<(), EngineError>;
    async fn make_module(&self, suite: &str, module: &str) -> Result<(), EngineError>;
    async fn hierarchy(&self) -> Value;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Load (or reload) the collection rooted at `test_path`.
    async fn load(&self, test_path: &str) -> Result<Arc<dyn AssetCollection>, EngineError>;
    /// The collection for `test_path`, or the current one when `None`.
    async fn get(&self, test_path: Option<&str>) -> Result<Arc<dyn AssetCollection>, EngineError>;
    async fn destroy(&self);
}

// ── Runner ────────────────────────────────────────────────────────

/// Progress notifications of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "lowercase")]
pub enum RunEvent {
    Allow(Value),
    Running,
    Current(Value),
    Paused,
    Failed,
    Stopped,
}

impl RunEvent {
    /// Protocol event name, before scoping by run id.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allow(_) => "allow",
            Self::Running => "running",
            Self::Current(_) => "current",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Allow(v) | Self::Current(v) => v.clone(),
            _ => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub results: Value,
    #[serde(default)]
    pub message: Option<String>,
}

/// A started run. Progress is buffered in `events` from the moment the
/// runner creates the handle, so nothing is lost before the caller reads it.
#[derive(Debug)]
pub struct RunHandle {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<RunEvent>,
    pub finished: oneshot::Receiver<Result<RunResults, EngineError>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub result: Value,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, params: Value) -> Result<RunHandle, EngineError>;
    /// Evaluate a single action payload.
    async fn execute(&self, action: Value) -> Result<ActionOutcome, EngineError>;
    /// Action listing of a syntax definition.
    async fn syntax(&self, name: &str, version: &str) -> Result<Value, EngineError>;
    /// Feed one line to the engine's interactive command line.
    async fn command_line(&self, line: &str) -> Result<(), EngineError>;
    fn keypress(&self, key: &str);
    /// Notifications emitted whenever a test begins.
    fn subscribe_test_starts(&self) -> broadcast::Receiver<Value>;
}

// ── Engine handle ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Initializing,
    Ready,
    Failed(String),
    Terminated,
}

pub struct EngineParts {
    pub framework: Arc<dyn Framework>,
    pub assets: Arc<dyn AssetStore>,
    pub runner: Arc<dyn Runner>,
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

struct EngineInner {
    id: u64,
    config: EngineConfig,
    console: Console,
    framework: Arc<dyn Framework>,
    assets: Arc<dyn AssetStore>,
    runner: Arc<dyn Runner>,
    state: watch::Sender<EngineState>,
}

/// Handle to one automation engine instance. Clones refer to the same instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine in the `Initializing` state.
    pub fn new(config: EngineConfig, console: Console, parts: EngineParts) -> Self {
        let (state, _) = watch::channel(EngineState::Initializing);
        Self {
            inner: Arc::new(EngineInner {
                id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
                config,
                console,
                framework: parts.framework,
                assets: parts.assets,
                runner: parts.runner,
                state,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Display label, e.g. `Engine-3`.
    pub fn label(&self) -> String {
        format!("Engine-{}", self.inner.id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn console(&self) -> &Console {
        &self.inner.console
    }

    pub fn framework(&self) -> &Arc<dyn Framework> {
        &self.inner.framework
    }

    pub fn assets(&self) -> &Arc<dyn AssetStore> {
        &self.inner.assets
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.inner.runner
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.state.borrow(), EngineState::Ready)
    }

    pub fn mark_ready(&self) {
        self.transition(EngineState::Ready);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.transition(EngineState::Failed(reason.into()));
    }

    fn transition(&self, next: EngineState) {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, EngineState::Initializing) {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Wait for initialization to settle.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                EngineState::Ready => return Ok(()),
                EngineState::Failed(reason) => return Err(EngineError::Init(reason.clone())),
                EngineState::Terminated => return Err(EngineError::Unavailable),
                EngineState::Initializing => {}
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::Unavailable);
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(*self.inner.state.borrow(), EngineState::Terminated)
    }

    /// Terminate the engine instance. Subsequent calls are no-ops.
    pub async fn terminate(&self) {
        let was_live = self.inner.state.send_if_modified(|state| {
            if matches!(state, EngineState::Terminated) {
                false
            } else {
                *state = EngineState::Terminated;
                true
            }
        });
        if was_live {
            tracing::debug!(engine_id = self.inner.id, "terminating engine");
            self.inner.framework.terminate().await;
        }
    }
}

/// Creates engines for sessions that do not attach to a shared one.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Create a new engine. The engine may still be initializing when returned.
    async fn create(&self) -> Result<Engine, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use serde_json::json;

    #[test]
    fn lookup_parse_is_case_insensitive() {
        assert_eq!(Lookup::parse("ID"), Some(Lookup::Id));
        assert_eq!(Lookup::parse("className"), Some(Lookup::ClassName));
        assert_eq!(Lookup::parse("Selector"), Some(Lookup::Selector));
        assert_eq!(Lookup::parse("xpath"), None);
    }

    #[test]
    fn run_event_names() {
        assert_eq!(RunEvent::Current(json!({"a": 1})).name(), "current");
        assert_eq!(RunEvent::Stopped.name(), "stopped");
        assert_eq!(RunEvent::Allow(json!(["pause"])).payload(), json!(["pause"]));
        assert_eq!(RunEvent::Paused.payload(), Value::Null);
    }

    #[test]
    fn run_event_wire_shape() {
        let ev: RunEvent =
            serde_json::from_value(json!({"state": "current", "data": {"line": 3}})).unwrap();
        assert_eq!(ev, RunEvent::Current(json!({"line": 3})));
        let ev: RunEvent = serde_json::from_value(json!({"state": "failed"})).unwrap();
        assert_eq!(ev, RunEvent::Failed);
    }

    #[tokio::test]
    async fn wait_ready_reports_failure() {
        let mock = MockEngine::initializing();
        let engine = mock.engine.clone();
        let waiter = tokio::spawn(async move { engine.wait_ready().await });
        mock.engine.mark_failed("no device farm");
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::Init("no device farm".into()));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mock = MockEngine::ready();
        mock.engine.terminate().await;
        mock.engine.terminate().await;
        assert!(mock.engine.is_terminated());
        assert_eq!(mock.framework.terminate_calls(), 1);
    }

    #[test]
    fn ready_is_not_overwritten_by_failure() {
        let mock = MockEngine::ready();
        mock.engine.mark_failed("late");
        assert!(mock.engine.is_ready());
    }

    #[test]
    fn engine_ids_are_unique() {
        let a = MockEngine::ready();
        let b = MockEngine::ready();
        assert_ne!(a.engine.id(), b.engine.id());
        assert!(a.engine.label().starts_with("Engine-"));
    }
}
