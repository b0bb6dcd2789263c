//! Engine Lifecycle Controller: `start framework`, `stop framework` and the
//! status snapshot.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::api::error::CommandError;
use crate::driver::{driver_for, StartParams, StartResult};
use crate::engine::{AssetCollection, Engine};
use crate::events::Subscription;
use crate::protocol::events;
use crate::registry::{AssetEntry, Resource};
use crate::session::Session;

/// Replace a leading `~` in every string of `value` with `home`, descending
/// into objects and arrays.
pub fn expand_tilde(value: &mut Value, home: &str) {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix('~') {
                *s = format!("{home}{rest}");
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| expand_tilde(v, home)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_tilde(v, home)),
        _ => {}
    }
}

/// Reject start parameters missing a required field.
pub fn validate(params: &StartParams) -> Result<(), CommandError> {
    let missing = |msg: &str| Err(CommandError::InvalidFrameworkArguments(msg.to_string()));
    if params.platform != "windows" && params.device.is_empty() {
        return missing("No device (emulator) specified");
    }
    if params.test_path.is_empty() {
        return missing("No project path specified");
    }
    if params.test_results_path.is_empty() {
        return missing("No test results path specified");
    }
    if params.app.is_empty() {
        return missing("No application (apk or build path) specified");
    }
    Ok(())
}

/// `get status` reply.
pub async fn status(engine: &Engine) -> Value {
    let status = engine.framework().status().await;
    let config = engine.config();
    json!({
        "started": status.started,
        "name": status.name,
        "platform": config.get("platform"),
        "args": status.args,
        "testPath": config.get("testPath"),
        "testResultsPath": config.get("testResultsPath"),
        "version": status.version,
        "device": status.device,
        "syntax": status.syntax,
        "config": config.get_all(),
        "env": config.get("env"),
    })
}

/// Build the proxy URL for `options`, embedding decrypted credentials when
/// both are present.
fn proxy_setting(session: &Session, params: &StartParams) -> Option<String> {
    let proxy = params.option("proxy").and_then(Value::as_str)?;
    if proxy.is_empty() {
        return None;
    }
    let user = params.option("proxyUser").and_then(Value::as_str).unwrap_or_default();
    let pass = params.option("proxyPass").and_then(Value::as_str).unwrap_or_default();
    if user.is_empty() || pass.is_empty() {
        return Some(proxy.to_string());
    }

    match session.server().cipher.decrypt(pass) {
        Ok(password) => {
            let host = proxy
                .strip_prefix("https://")
                .or_else(|| proxy.strip_prefix("http://"))
                .unwrap_or(proxy);
            Some(format!("http://{user}:{password}@{host}"))
        }
        Err(e) => {
            tracing::warn!(
                connection_id = %session.connection_id(),
                error = %e,
                "unable to decrypt proxy password, continuing without credentials"
            );
            session
                .engine()
                .console()
                .error("Unable to decrypt the proxy password. Continuing without proxy credentials.");
            Some(proxy.to_string())
        }
    }
}

fn apply_overrides(session: &Session, params: &StartParams) {
    let config = session.engine().config();
    if !params.platform.is_empty() {
        config.set("platform", json!(params.platform));
    }
    if !params.framework.is_empty() {
        config.set("framework", json!(params.framework));
    }
    if !params.env.is_empty() {
        config.set("env", json!(params.env));
    }
    if params.option("resetDevice").is_some_and(truthy) {
        config.set("resetDevice", json!(true));
    }
    if let Some(proxy) = proxy_setting(session, params) {
        config.set("proxy", json!(proxy));
    }
    config.set("testPath", json!(params.test_path));
    config.set("testResultsPath", json!(params.test_results_path));
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Register `collection` as the session's asset collection, forwarding its
/// reloads as "asset load" events.
pub fn register_assets(session: &Session, collection: Arc<dyn AssetCollection>) -> bool {
    let listener = {
        let out = session.outbound().clone();
        Subscription::forward(collection.subscribe_loaded(), move |()| {
            out.emit(events::ASSET_LOAD, Value::Null);
        })
    };
    session
        .registry()
        .register(Resource::Assets(AssetEntry { collection, listener }))
}

/// Start the framework on the session's engine.
///
/// Already-started frameworks are described, not restarted; concurrent starts
/// on one session are serialized so only the first launches. Parameters are
/// validated before any configuration is touched; per-session resources
/// are only registered once the framework reports started.
pub async fn start(session: &Session, mut data: Value) -> Result<Value, CommandError> {
    let engine = session.engine();
    let _starting = session.start_guard().await;
    if engine.framework().status().await.started {
        let params = StartParams::from_value(&data);
        return to_value(StartResult::describe(engine, &params).await);
    }
    if !data.is_object() {
        return Err(CommandError::validation("Invalid framework start parameters"));
    }

    expand_tilde(&mut data, &engine.config().user_home());
    let params = StartParams::from_value(&data);
    validate(&params)?;
    apply_overrides(session, &params);

    let collection = engine.assets().load(&params.test_path).await?;
    let driver = driver_for(&params.framework);
    tracing::info!(
        connection_id = %session.connection_id(),
        framework = %params.framework,
        driver = driver.name(),
        "starting framework"
    );
    let started = driver.start(engine, &params).await?;

    if !session.is_alive() {
        tracing::debug!(connection_id = %session.connection_id(), "session closed during start");
        return to_value(started.result);
    }
    register_assets(session, collection);
    if let Some(process) = started.process {
        session.watch_process(process);
    }
    to_value(started.result)
}

/// Stop the framework. Returns whether the framework is stopped.
pub async fn stop(session: &Session) -> bool {
    let framework = session.engine().framework();
    if !framework.status().await.started {
        return true;
    }
    session.registry().detach_process_listener();
    match framework.stop().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(connection_id = %session.connection_id(), error = %e, "framework stop failed");
            false
        }
    }
}

fn to_value(result: StartResult) -> Result<Value, CommandError> {
    serde_json::to_value(result).map_err(CommandError::execution)
}
