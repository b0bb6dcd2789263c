//! In-memory engine collaborators for tests.
//!
//! Every collaborator trait has a scriptable mock here, and [`MockEngine`]
//! wires them into a real [`Engine`] handle so sessions, the dispatcher and
//! the transport can be exercised without a device farm:
//!
//! ```ignore
//! use veplane::testing::MockEngine;
//!
//! #[tokio::test]
//! async fn start_is_idempotent() {
//!     let mock = MockEngine::ready();
//!     mock.framework.set_started(true);
//!     // ... drive a session bound to mock.engine
//!     assert_eq!(mock.framework.launch_count(), 0);
//! }
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::engine::{
    ActionOutcome, AssetCollection, AssetRef, AssetStore, Capture, CaptureRequest, Console,
    Element, ElementTree, Engine, EngineConfig, EngineError, EngineFactory, EngineParts,
    Framework, FrameworkStatus, Launch, Lookup, ProcessExit, ProcessHandle, ResolvedAsset,
    RunEvent, RunHandle, RunResults, Runner, SelectorSetMatch,
};

// ── Framework ─────────────────────────────────────────────────────

struct FrameworkState {
    status: FrameworkStatus,
    refuse_start: bool,
    fail_stop: Option<String>,
    launches: Vec<(String, Vec<Value>)>,
    loads: Vec<String>,
    builds: Vec<Vec<Value>>,
    stops: usize,
    orientation: Option<u8>,
    launch_delay: Duration,
    image: (u32, u32),
    tree: Option<Arc<dyn ElementTree>>,
    devices: Value,
    process: Option<(ProcessHandle, ProcessExit)>,
    next_pid: u32,
}

/// Scriptable [`Framework`]. Launches succeed and spawn a fake process
/// unless [`MockFramework::refuse_start`] was called.
pub struct MockFramework {
    state: Mutex<FrameworkState>,
    terminates: AtomicUsize,
}

impl Default for MockFramework {
    fn default() -> Self {
        Self {
            state: Mutex::new(FrameworkState {
                status: FrameworkStatus::default(),
                refuse_start: false,
                fail_stop: None,
                launches: Vec::new(),
                loads: Vec::new(),
                builds: Vec::new(),
                stops: 0,
                orientation: Some(1),
                launch_delay: Duration::ZERO,
                image: (4, 2),
                tree: None,
                devices: json!([]),
                process: None,
                next_pid: 4000,
            }),
            terminates: AtomicUsize::new(0),
        }
    }
}

impl MockFramework {
    /// Launches report `started: false` from now on.
    pub fn refuse_start(&self) {
        self.state.lock().refuse_start = true;
    }

    /// `stop` fails with `message` from now on.
    pub fn fail_stop(&self, message: impl Into<String>) {
        self.state.lock().fail_stop = Some(message.into());
    }

    pub fn set_status(&self, status: FrameworkStatus) {
        self.state.lock().status = status;
    }

    pub fn set_started(&self, started: bool) {
        self.state.lock().status.started = started;
    }

    /// `None` makes the orientation query fail.
    pub fn set_orientation(&self, orientation: Option<u8>) {
        self.state.lock().orientation = orientation;
    }

    /// Launches take `delay` before the framework reports started.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.state.lock().launch_delay = delay;
    }

    /// Dimensions of the PNG written by `capture_screen`.
    pub fn set_image_size(&self, width: u32, height: u32) {
        self.state.lock().image = (width, height);
    }

    pub fn set_tree(&self, tree: Arc<dyn ElementTree>) {
        self.state.lock().tree = Some(tree);
    }

    pub fn set_devices(&self, devices: Value) {
        self.state.lock().devices = devices;
    }

    /// Pretend a framework process is already running, as on a shared
    /// engine some other session started.
    pub fn spawn_process(&self) -> ProcessHandle {
        let mut state = self.state.lock();
        state.next_pid += 1;
        let (handle, exit) = ProcessHandle::new(Some(state.next_pid));
        state.process = Some((handle.clone(), exit));
        state.status.started = true;
        handle
    }

    /// Make the current framework process exit with `code`.
    pub fn kill_process(&self, code: i32) -> bool {
        match self.state.lock().process.take() {
            Some((_, exit)) => {
                exit.exited(code);
                true
            }
            None => false,
        }
    }

    pub fn last_launch(&self) -> Option<(String, Vec<Value>)> {
        self.state.lock().launches.last().cloned()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().launches.len()
    }

    pub fn loads(&self) -> Vec<String> {
        self.state.lock().loads.clone()
    }

    pub fn builds(&self) -> Vec<Vec<Value>> {
        self.state.lock().builds.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stops
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().status.started
    }
}

#[async_trait]
impl Framework for MockFramework {
    async fn status(&self) -> FrameworkStatus {
        self.state.lock().status.clone()
    }

    async fn load(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.loads.push(name.to_string());
        state.status.name = name.to_string();
        Ok(())
    }

    async fn launch(&self, name: &str, args: Vec<Value>) -> Result<Launch, EngineError> {
        let delay = self.state.lock().launch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.launches.push((name.to_string(), args.clone()));
        if state.refuse_start {
            return Ok(Launch {
                started: false,
                process: None,
            });
        }
        state.next_pid += 1;
        let (handle, exit) = ProcessHandle::new(Some(state.next_pid));
        state.process = Some((handle.clone(), exit));
        state.status.started = true;
        state.status.name = name.to_string();
        state.status.args = Value::Array(args.clone());
        state.status.device = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Launch {
            started: true,
            process: Some(handle),
        })
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.stops += 1;
        if let Some(message) = &state.fail_stop {
            return Err(EngineError::failed(message.clone()));
        }
        state.status.started = false;
        if let Some((_, exit)) = state.process.take() {
            exit.exited(0);
        }
        Ok(())
    }

    async fn build(&self, args: Vec<Value>) -> Result<Value, EngineError> {
        self.state.lock().builds.push(args.clone());
        Ok(json!({ "built": args }))
    }

    async fn orientation(&self) -> Result<u8, EngineError> {
        self.state
            .lock()
            .orientation
            .ok_or_else(|| EngineError::failed("orientation unavailable"))
    }

    async fn capture_screen(&self, request: &CaptureRequest) -> Result<Capture, EngineError> {
        let (width, height) = self.state.lock().image;
        let mut img = image::RgbaImage::new(width, height);
        img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        img.save(&request.destination)
            .map_err(|e| EngineError::failed(e.to_string()))?;
        Ok(Capture::default())
    }

    async fn tree(&self) -> Result<Arc<dyn ElementTree>, EngineError> {
        self.state
            .lock()
            .tree
            .clone()
            .ok_or_else(|| EngineError::failed("Error: no tree available"))
    }

    async fn available_devices(&self, _framework: &str) -> Value {
        self.state.lock().devices.clone()
    }

    fn process(&self) -> Option<ProcessHandle> {
        self.state.lock().process.as_ref().map(|(h, _)| h.clone())
    }

    async fn terminate(&self) {
        self.terminates.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Tree ──────────────────────────────────────────────────────────

/// Element tree answering lookups from a fixed table.
pub struct MockTree {
    contents: Value,
    hash: String,
    elements: Mutex<HashMap<(Lookup, String), Vec<Element>>>,
    selectors: Mutex<HashMap<String, Vec<Element>>>,
    finds: AtomicUsize,
}

impl MockTree {
    pub fn new(contents: Value) -> Self {
        let hash = format!("{:016x}", fnv1a(contents.to_string().as_bytes()));
        Self {
            contents,
            hash,
            elements: Mutex::new(HashMap::new()),
            selectors: Mutex::new(HashMap::new()),
            finds: AtomicUsize::new(0),
        }
    }

    /// Make `find(lookup, value)` return `element` (appended).
    pub fn with_element(self, lookup: Lookup, value: &str, element: Element) -> Self {
        self.elements
            .lock()
            .entry((lookup, value.to_string()))
            .or_default()
            .push(element);
        self
    }

    /// Make `selector` match `ids` in selector-set queries.
    pub fn with_selector(self, selector: &str, ids: &[&str]) -> Self {
        let elements = ids
            .iter()
            .map(|id| Element {
                id: id.to_string(),
                rect: None,
            })
            .collect();
        self.selectors.lock().insert(selector.to_string(), elements);
        self
    }

    /// Number of lookups that reached this tree.
    pub fn find_calls(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}

#[async_trait]
impl ElementTree for MockTree {
    fn contents(&self) -> Value {
        self.contents.clone()
    }

    fn hash(&self) -> String {
        self.hash.clone()
    }

    async fn find(&self, lookup: Lookup, value: &str) -> Result<Vec<Element>, EngineError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .elements
            .lock()
            .get(&(lookup, value.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn find_by_selector_set(
        &self,
        selectors: &[String],
    ) -> Result<SelectorSetMatch, EngineError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let table = self.selectors.lock();
        let by_set: Vec<Vec<Element>> = selectors
            .iter()
            .map(|s| table.get(s).cloned().unwrap_or_default())
            .collect();
        let flat = by_set.iter().flatten().cloned().collect();
        Ok(SelectorSetMatch { flat, by_set })
    }
}

// ── Assets ────────────────────────────────────────────────────────

fn asset_key(asset: &AssetRef) -> String {
    format!(
        "{}/{}/{}.{}",
        asset.suite, asset.module, asset.name, asset.kind
    )
}

struct AssetsInner {
    assets: Mutex<HashMap<String, Value>>,
    suites: Mutex<BTreeSet<String>>,
    modules: Mutex<BTreeSet<(String, String)>>,
    loads: Mutex<Vec<String>>,
    loaded: broadcast::Sender<()>,
    destroyed: AtomicBool,
}

/// Asset store holding a single in-memory collection. Serves as both the
/// [`AssetStore`] and the [`AssetCollection`] it hands out.
#[derive(Clone)]
pub struct MockAssets {
    inner: Arc<AssetsInner>,
}

impl Default for MockAssets {
    fn default() -> Self {
        let (loaded, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(AssetsInner {
                assets: Mutex::new(HashMap::new()),
                suites: Mutex::new(BTreeSet::new()),
                modules: Mutex::new(BTreeSet::new()),
                loads: Mutex::new(Vec::new()),
                loaded,
                destroyed: AtomicBool::new(false),
            }),
        }
    }
}

impl MockAssets {
    pub fn insert(&self, asset: &AssetRef, contents: Value) {
        self.inner.suites.lock().insert(asset.suite.clone());
        self.inner
            .modules
            .lock()
            .insert((asset.suite.clone(), asset.module.clone()));
        self.inner.assets.lock().insert(asset_key(asset), contents);
    }

    pub fn get_asset(&self, asset: &AssetRef) -> Option<Value> {
        self.inner.assets.lock().get(&asset_key(asset)).cloned()
    }

    /// Test paths passed to `load`, in order.
    pub fn loads(&self) -> Vec<String> {
        self.inner.loads.lock().clone()
    }

    /// Simulate the collection reloading from disk.
    pub fn reload(&self) {
        let _ = self.inner.loaded.send(());
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetCollection for MockAssets {
    fn subscribe_loaded(&self) -> broadcast::Receiver<()> {
        self.inner.loaded.subscribe()
    }

    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, EngineError> {
        if self.inner.assets.lock().contains_key(&asset_key(asset)) {
            Ok(ResolvedAsset {
                name: asset.name.clone(),
                kind: asset.kind.clone(),
            })
        } else {
            Err(EngineError::failed(format!(
                "Error: unable to resolve {}",
                asset_key(asset)
            )))
        }
    }

    async fn read(&self, asset: &AssetRef) -> Result<Option<Value>, EngineError> {
        Ok(self.get_asset(asset))
    }

    async fn write(&self, asset: &AssetRef, contents: Value) -> Result<(), EngineError> {
        self.insert(asset, contents);
        Ok(())
    }

    async fn delete_asset(&self, asset: &AssetRef) -> Result<(), EngineError> {
        self.inner.assets.lock().remove(&asset_key(asset));
        Ok(())
    }

    async fn delete_module(&self, suite: &str, module: &str) -> Result<(), EngineError> {
        let prefix = format!("{suite}/{module}/");
        self.inner.assets.lock().retain(|k, _| !k.starts_with(&prefix));
        self.inner
            .modules
            .lock()
            .remove(&(suite.to_string(), module.to_string()));
        Ok(())
    }

    async fn delete_suite(&self, suite: &str) -> Result<(), EngineError> {
        let prefix = format!("{suite}/");
        self.inner.assets.lock().retain(|k, _| !k.starts_with(&prefix));
        self.inner.modules.lock().retain(|(s, _)| s != suite);
        self.inner.suites.lock().remove(suite);
        Ok(())
    }

    async fn suite_exists(&self, suite: &str) -> bool {
        self.inner.suites.lock().contains(suite)
    }

    async fn module_exists(&self, suite: &str, module: &str) -> bool {
        self.inner
            .modules
            .lock()
            .contains(&(suite.to_string(), module.to_string()))
    }

    async fn make_suite(&self, suite: &str) -> Result<(), EngineError> {
        self.inner.suites.lock().insert(suite.to_string());
        Ok(())
    }

    async fn make_module(&self, suite: &str, module: &str) -> Result<(), EngineError> {
        if !self.inner.suites.lock().contains(suite) {
            return Err(EngineError::failed(format!("Error: no suite `{suite}`")));
        }
        self.inner
            .modules
            .lock()
            .insert((suite.to_string(), module.to_string()));
        Ok(())
    }

    async fn hierarchy(&self) -> Value {
        let mut suites = Map::new();
        for suite in self.inner.suites.lock().iter() {
            suites.insert(suite.clone(), json!([]));
        }
        for (suite, module) in self.inner.modules.lock().iter() {
            if let Some(Value::Array(modules)) = suites.get_mut(suite) {
                modules.push(json!(module));
            }
        }
        Value::Object(suites)
    }
}

#[async_trait]
impl AssetStore for MockAssets {
    async fn load(&self, test_path: &str) -> Result<Arc<dyn AssetCollection>, EngineError> {
        self.inner.loads.lock().push(test_path.to_string());
        let _ = self.inner.loaded.send(());
        Ok(Arc::new(self.clone()))
    }

    async fn get(&self, _test_path: Option<&str>) -> Result<Arc<dyn AssetCollection>, EngineError> {
        Ok(Arc::new(self.clone()))
    }

    async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
    }
}

// ── Runner ────────────────────────────────────────────────────────

/// One scripted run: progress events delivered up front, then the outcome.
#[derive(Debug, Clone)]
pub struct RunScript {
    pub events: Vec<RunEvent>,
    pub outcome: Result<RunResults, EngineError>,
}

impl Default for RunScript {
    fn default() -> Self {
        Self {
            events: vec![RunEvent::Running, RunEvent::Stopped],
            outcome: Ok(RunResults {
                results: json!(true),
                message: None,
            }),
        }
    }
}

/// A run the test finishes by hand.
pub struct HeldRun {
    pub events: mpsc::UnboundedSender<RunEvent>,
    pub finished: oneshot::Sender<Result<RunResults, EngineError>>,
}

#[derive(Default)]
struct RunnerState {
    scripts: VecDeque<RunScript>,
    hold: bool,
    held: VecDeque<HeldRun>,
    runs: Vec<Value>,
    executed: Vec<(Value, Option<Value>)>,
    lines: Vec<String>,
    keys: Vec<String>,
    next_run: u64,
}

/// Scriptable [`Runner`]. Runs play back queued [`RunScript`]s (or the
/// default `Running, Stopped` script) unless holding is enabled.
pub struct MockRunner {
    state: Mutex<RunnerState>,
    config: EngineConfig,
    test_starts: broadcast::Sender<Value>,
}

impl MockRunner {
    fn new(config: EngineConfig) -> Self {
        let (test_starts, _) = broadcast::channel(8);
        Self {
            state: Mutex::new(RunnerState::default()),
            config,
            test_starts,
        }
    }

    pub fn push_script(&self, script: RunScript) {
        self.state.lock().scripts.push_back(script);
    }

    /// Keep new runs open; collect them with [`MockRunner::take_held`].
    pub fn hold_runs(&self) {
        self.state.lock().hold = true;
    }

    pub fn take_held(&self) -> Option<HeldRun> {
        self.state.lock().held.pop_front()
    }

    pub fn runs(&self) -> Vec<Value> {
        self.state.lock().runs.clone()
    }

    /// Executed actions, each with the `interactiveMode` seen during execution.
    pub fn executed(&self) -> Vec<(Value, Option<Value>)> {
        self.state.lock().executed.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys.clone()
    }

    pub fn start_test(&self, data: Value) {
        let _ = self.test_starts.send(data);
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn run(&self, params: Value) -> Result<RunHandle, EngineError> {
        let mut state = self.state.lock();
        state.runs.push(params);
        state.next_run += 1;
        let id = format!("run-{}", state.next_run);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (finished_tx, finished) = oneshot::channel();

        if state.hold {
            state.held.push_back(HeldRun {
                events: events_tx,
                finished: finished_tx,
            });
        } else {
            let script = state.scripts.pop_front().unwrap_or_default();
            for event in script.events {
                let _ = events_tx.send(event);
            }
            let _ = finished_tx.send(script.outcome);
        }
        Ok(RunHandle {
            id,
            events,
            finished,
        })
    }

    async fn execute(&self, action: Value) -> Result<ActionOutcome, EngineError> {
        let mode = self.config.get("interactiveMode");
        self.state.lock().executed.push((action.clone(), mode));
        Ok(ActionOutcome {
            result: json!(true),
            message: Some(format!("executed {action}")),
        })
    }

    async fn syntax(&self, name: &str, version: &str) -> Result<Value, EngineError> {
        Ok(json!({ "name": name, "version": version, "actions": [] }))
    }

    async fn command_line(&self, line: &str) -> Result<(), EngineError> {
        self.state.lock().lines.push(line.to_string());
        Ok(())
    }

    fn keypress(&self, key: &str) {
        self.state.lock().keys.push(key.to_string());
    }

    fn subscribe_test_starts(&self) -> broadcast::Receiver<Value> {
        self.test_starts.subscribe()
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// An [`Engine`] backed by mocks, with handles to each mock.
#[derive(Clone)]
pub struct MockEngine {
    pub engine: Engine,
    pub framework: Arc<MockFramework>,
    pub assets: MockAssets,
    pub runner: Arc<MockRunner>,
}

impl MockEngine {
    /// A mock engine still initializing.
    pub fn initializing() -> Self {
        Self::with_config(default_seed())
    }

    pub fn ready() -> Self {
        let mock = Self::initializing();
        mock.engine.mark_ready();
        mock
    }

    /// A mock engine seeded with `seed`, still initializing.
    pub fn with_config(seed: Map<String, Value>) -> Self {
        let config = EngineConfig::new(seed);
        let framework = Arc::new(MockFramework::default());
        let assets = MockAssets::default();
        let runner = Arc::new(MockRunner::new(config.clone()));
        let engine = Engine::new(
            config,
            Console::new(),
            EngineParts {
                framework: framework.clone(),
                assets: Arc::new(assets.clone()),
                runner: runner.clone(),
            },
        );
        Self {
            engine,
            framework,
            assets,
            runner,
        }
    }
}

fn default_seed() -> Map<String, Value> {
    let mut seed = Map::new();
    seed.insert("userHome".into(), json!("/home/tester"));
    seed.insert(
        "temp".into(),
        json!(std::env::temp_dir().to_string_lossy()),
    );
    seed
}

/// Factory handing out [`MockEngine`]s and remembering them.
pub struct MockEngineFactory {
    seed: Map<String, Value>,
    failure: Option<String>,
    created: Mutex<Vec<MockEngine>>,
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new(default_seed())
    }
}

impl MockEngineFactory {
    pub fn new(seed: Map<String, Value>) -> Self {
        Self {
            seed,
            failure: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every engine created fails initialization with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<MockEngine> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<MockEngine> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<Engine, EngineError> {
        let mock = MockEngine::with_config(self.seed.clone());
        let engine = mock.engine.clone();
        self.created.lock().push(mock);
        // Settle readiness in the background, like a real engine.
        let failure = self.failure.clone();
        let settling = engine.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            match failure {
                Some(reason) => settling.mark_failed(reason),
                None => settling.mark_ready(),
            }
        });
        Ok(engine)
    }
}
