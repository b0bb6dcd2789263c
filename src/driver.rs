//! Framework drivers: one per automation backend.
//!
//! Every backend takes a different positional argument list at launch. A
//! driver owns that marshaling and turns the launch outcome into a
//! [`StartResult`] so the lifecycle controller deals with a single shape.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::error::CommandError;
use crate::engine::{Engine, ProcessHandle, SyntaxRef};
use crate::protocol::now_millis;

/// `start framework` parameters after `~` expansion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartParams {
    pub framework: String,
    pub platform: String,
    pub env: String,
    pub device: String,
    pub deviceid: String,
    pub app: String,
    pub apppath: String,
    pub bundleid: String,
    pub test_path: String,
    pub test_results_path: String,
    pub target: String,
    pub buildpath: String,
    pub workspace: String,
    pub options: Value,
}

fn string_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl StartParams {
    /// Read parameters from request data. Non-string fields count as empty.
    pub fn from_value(data: &Value) -> Self {
        Self {
            framework: string_field(data, "framework"),
            platform: string_field(data, "platform"),
            env: string_field(data, "env"),
            device: string_field(data, "device"),
            deviceid: string_field(data, "deviceid"),
            app: string_field(data, "app"),
            apppath: string_field(data, "apppath"),
            bundleid: string_field(data, "bundleid"),
            test_path: string_field(data, "testPath"),
            test_results_path: string_field(data, "testResultsPath"),
            target: string_field(data, "target"),
            buildpath: string_field(data, "buildpath"),
            workspace: string_field(data, "workspace"),
            options: data.get("options").cloned().unwrap_or(Value::Null),
        }
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.as_object().and_then(|o| o.get(key))
    }
}

/// Normalized reply of `start framework`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    /// Unix time in milliseconds.
    pub started: u64,
    pub device: String,
    pub name: String,
    pub platform: Value,
    pub version: String,
    pub config: Value,
    pub args: Value,
    pub test_path: Value,
    pub test_results_path: Value,
    pub syntax: SyntaxRef,
    pub workspace: String,
    pub target: String,
    pub bundleid: String,
    pub app: String,
    pub apppath: String,
    pub buildpath: String,
}

impl StartResult {
    /// Describe the framework as it currently runs on `engine`.
    pub async fn describe(engine: &Engine, params: &StartParams) -> Self {
        let status = engine.framework().status().await;
        let config = engine.config();
        Self {
            started: now_millis(),
            device: status.device,
            name: status.name,
            platform: config.get("platform").unwrap_or(Value::Null),
            version: status.version,
            config: config.get_all(),
            args: status.args,
            test_path: config.get("testPath").unwrap_or(Value::Null),
            test_results_path: config.get("testResultsPath").unwrap_or(Value::Null),
            syntax: status.syntax,
            workspace: params.workspace.clone(),
            target: params.target.clone(),
            bundleid: params.bundleid.clone(),
            app: params.app.clone(),
            apppath: params.apppath.clone(),
            buildpath: params.buildpath.clone(),
        }
    }
}

/// A successful launch.
#[derive(Debug)]
pub struct DriverStart {
    pub result: StartResult,
    pub process: Option<ProcessHandle>,
}

#[async_trait]
pub trait FrameworkDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Positional launch arguments for this backend.
    fn launch_args(&self, params: &StartParams) -> Vec<Value>;

    async fn start(
        &self,
        engine: &Engine,
        params: &StartParams,
    ) -> Result<DriverStart, CommandError> {
        let launch = engine
            .framework()
            .launch(&params.framework, self.launch_args(params))
            .await?;
        if !launch.started {
            return Err(CommandError::Process(
                "Unknown Error: Unable to start framework".into(),
            ));
        }
        Ok(DriverStart {
            result: StartResult::describe(engine, params).await,
            process: launch.process,
        })
    }
}

/// iOS instruments: device, app path, bundle id, options.
pub struct InstrumentsDriver;

impl FrameworkDriver for InstrumentsDriver {
    fn name(&self) -> &'static str {
        "instruments"
    }

    fn launch_args(&self, p: &StartParams) -> Vec<Value> {
        vec![
            json!(p.device),
            json!(p.apppath),
            json!(p.bundleid),
            p.options.clone(),
        ]
    }
}

/// Perfecto device cloud: addressed by device id, launched with project
/// coordinates.
pub struct PerfectoDriver;

impl FrameworkDriver for PerfectoDriver {
    fn name(&self) -> &'static str {
        "perfecto"
    }

    fn launch_args(&self, p: &StartParams) -> Vec<Value> {
        vec![
            json!(p.deviceid),
            json!(p.app),
            json!(p.test_path),
            json!(p.target),
            json!(p.buildpath),
            p.options.clone(),
        ]
    }
}

/// Every other backend: device, app, options.
pub struct GenericDriver;

impl FrameworkDriver for GenericDriver {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn launch_args(&self, p: &StartParams) -> Vec<Value> {
        vec![json!(p.device), json!(p.app), p.options.clone()]
    }
}

static INSTRUMENTS: InstrumentsDriver = InstrumentsDriver;
static PERFECTO: PerfectoDriver = PerfectoDriver;
static GENERIC: GenericDriver = GenericDriver;

pub fn driver_for(framework: &str) -> &'static dyn FrameworkDriver {
    match framework {
        "instruments" => &INSTRUMENTS,
        "perfecto" => &PERFECTO,
        _ => &GENERIC,
    }
}
