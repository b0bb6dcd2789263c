//! Command Dispatcher: routes each request to its handler and sends exactly
//! one response per request id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::error::CommandError;
use crate::archive;
use crate::engine::{Accept, AssetCollection, AssetRef};
use crate::lifecycle::{self, expand_tilde};
use crate::protocol::{Frame, RequestEnvelope, ResponseEnvelope};
use crate::session::{Outbound, Session};
use crate::{capture, run, tree};

/// Sends the response to one request.
///
/// `send` consumes the responder, so a second response cannot be written.
/// A responder dropped without sending (handler panic or abort) reports an
/// error instead, keeping one response per request.
pub struct Responder {
    outbound: Outbound,
    engine_id: u64,
    request_id: Option<Value>,
}

impl Responder {
    pub fn new(outbound: Outbound, engine_id: u64, request_id: Value) -> Self {
        Self {
            outbound,
            engine_id,
            request_id: Some(request_id),
        }
    }

    pub fn send(mut self, result: Result<Value, CommandError>) -> bool {
        let Some(request_id) = self.request_id.take() else {
            return false;
        };
        let envelope = match result {
            Ok(data) => ResponseEnvelope::success(self.engine_id, request_id, data),
            Err(e) => ResponseEnvelope::error(self.engine_id, request_id, e.to_string()),
        };
        self.outbound.send(Frame::Response(envelope))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(request_id) = self.request_id.take() {
            tracing::warn!(request_id = %request_id, "request dropped without a response");
            self.outbound.send(Frame::Response(ResponseEnvelope::error(
                self.engine_id,
                request_id,
                "Error: request was abandoned before completing",
            )));
        }
    }
}

/// Decode `data` as `T`, mapping failure to a validation error with `message`.
fn parse<T: DeserializeOwned>(data: &Value, message: &str) -> Result<T, CommandError> {
    serde_json::from_value(data.clone()).map_err(|_| CommandError::validation(message))
}

fn string_arg<'a>(data: &'a Value, message: &str) -> Result<&'a str, CommandError> {
    data.as_str().ok_or_else(|| CommandError::validation(message))
}

#[derive(Deserialize)]
struct ConfigUpdate {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct SyntaxRequest {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct ModuleRef {
    suite: String,
    module: String,
}

#[derive(Deserialize)]
struct SuiteRef {
    suite: String,
}

#[derive(Deserialize)]
struct WriteAsset {
    #[serde(flatten)]
    asset: AssetRef,
    contents: Value,
}

#[derive(Deserialize)]
struct ZipRequest {
    directory: String,
}

/// The session's asset collection, fetching and registering the engine's
/// current one if none is registered yet.
async fn collection(session: &Session) -> Result<Arc<dyn AssetCollection>, CommandError> {
    if let Some(collection) = session.registry().assets() {
        return Ok(collection);
    }
    let collection = session.engine().assets().get(None).await?;
    if session.is_alive() {
        lifecycle::register_assets(session, Arc::clone(&collection));
    }
    Ok(collection)
}

fn expand_path(session: &Session, path: &str) -> PathBuf {
    let mut value = Value::String(path.to_string());
    expand_tilde(&mut value, &session.engine().config().user_home());
    PathBuf::from(value.as_str().unwrap_or(path))
}

fn dirname(path: &str) -> String {
    match Path::new(path).parent() {
        Some(p) if p.as_os_str().is_empty() => ".".into(),
        Some(p) => p.to_string_lossy().into_owned(),
        None if path.starts_with('/') => "/".into(),
        None => ".".into(),
    }
}

/// Build arguments with leading `~` expanded in every string.
fn build_args(session: &Session, args: Vec<Value>) -> Vec<Value> {
    let home = session.engine().config().user_home();
    args.into_iter()
        .map(|mut arg| {
            expand_tilde(&mut arg, &home);
            arg
        })
        .collect()
}

/// Run one command against `session`.
pub async fn dispatch(session: &Arc<Session>, req: &RequestEnvelope) -> Result<Value, CommandError> {
    let engine = session.engine();
    let config = engine.config();
    let data = &req.data;

    match req.command.as_str() {
        "get status" => Ok(lifecycle::status(engine).await),
        "encrypt" => {
            let plain = string_arg(data, "Unable to encrypt, invalid arguments")?;
            let sealed = session
                .server()
                .cipher
                .encrypt(plain)
                .map_err(CommandError::execution)?;
            Ok(json!(sealed))
        }
        "get favorites" => Ok(session.prefs().favorites()),
        "save favorites" => {
            let favorites: Vec<Value> = parse(data, "Unable to save favorites, invalid arguments")?;
            session.prefs().save_favorites(favorites).await?;
            Ok(json!(true))
        }
        "get settings" => Ok(session.prefs().settings()),
        "save settings" => {
            let settings: Map<String, Value> =
                parse(data, "Unable to save settings, invalid arguments")?;
            session.prefs().save_settings(settings).await?;
            Ok(json!(true))
        }
        "get config" => Ok(config.get_all()),
        "update config" => {
            let update: ConfigUpdate = parse(data, "Unable to update config, invalid arguments")?;
            config.set(update.name, update.value);
            Ok(config.get_all())
        }
        "get syntax" => {
            let syntax: SyntaxRequest = parse(data, "Unable to get syntax, invalid arguments")?;
            Ok(engine.runner().syntax(&syntax.name, &syntax.version).await?)
        }
        "get latest screen" => capture::capture(session).await,
        "get latest tree" => tree::refresh(session).await,
        "query tree" => tree::query(session, data).await,
        "get available devices" => {
            let framework =
                string_arg(data, "Unable to get available devices, invalid arguments")?;
            Ok(engine.framework().available_devices(framework).await)
        }
        "start framework" => lifecycle::start(session, data.clone()).await,
        "stop framework" => Ok(json!(lifecycle::stop(session).await)),
        "run" => {
            if !data.is_object() {
                return Err(CommandError::validation("Unable to run, invalid arguments"));
            }
            run::run(session, &req.id, data.clone()).await
        }
        "execute" => {
            if !data.is_object() {
                return Err(CommandError::validation(
                    "Malformed action object. The action to execute must be an object!",
                ));
            }
            let previous = config.get("interactiveMode").unwrap_or(Value::Null);
            config.set("interactiveMode", json!(false));
            let outcome = engine.runner().execute(data.clone()).await;
            config.set("interactiveMode", previous);
            let outcome = outcome?;
            Ok(json!({ "result": outcome.result, "message": outcome.message }))
        }
        "base path" => Ok(json!(dirname(string_arg(data, "Path must be a string!")?))),
        "any file exists" => {
            let path = expand_path(session, string_arg(data, "Path must be a string!")?);
            Ok(json!(tokio::fs::try_exists(&path).await.unwrap_or(false)))
        }
        "any directory exists" => {
            let path = expand_path(
                session,
                string_arg(data, "Unable to check for directory, invalid arguments")?,
            );
            match tokio::fs::metadata(&path).await {
                Ok(_) => Ok(json!(true)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!(false)),
                Err(e) => Err(CommandError::execution(e)),
            }
        }
        "asset exists" => {
            let mut asset: AssetRef =
                parse(data, "Unable to assert existence, invalid arguments!")?;
            asset.accept.get_or_insert_with(Accept::default);
            let collection = collection(session).await?;
            let exists = match collection.resolve(&asset).await {
                Ok(found) => found.kind == asset.kind && found.name == asset.name,
                Err(_) => false,
            };
            Ok(json!(exists))
        }
        "read asset" => {
            let mut asset: AssetRef =
                parse(data, "Unable to resolve asset file, invalid arguments")?;
            let generic = asset.accept.map(|a| a.generic).unwrap_or_default();
            asset.accept = Some(Accept {
                global: false,
                common: false,
                generic,
            });
            let collection = collection(session).await?;
            collection.resolve(&asset).await?;
            Ok(collection.read(&asset).await?.unwrap_or_else(|| json!({})))
        }
        "write asset" => {
            let write: WriteAsset = parse(data, "Unable to write asset, invalid arguments")?;
            if !(write.contents.is_string() || write.contents.is_object() || write.contents.is_array())
            {
                return Err(CommandError::validation("Unable to write asset, invalid arguments"));
            }
            collection(session).await?.write(&write.asset, write.contents).await?;
            Ok(Value::Null)
        }
        "delete asset" => {
            let invalid = "Unable to delete asset, invalid arguments";
            if !data.is_object() {
                return Err(CommandError::validation(invalid));
            }
            if let Ok(asset) = serde_json::from_value::<AssetRef>(data.clone()) {
                collection(session).await?.delete_asset(&asset).await?;
            } else if let Ok(m) = serde_json::from_value::<ModuleRef>(data.clone()) {
                collection(session).await?.delete_module(&m.suite, &m.module).await?;
            } else {
                let s: SuiteRef = parse(data, invalid)?;
                collection(session).await?.delete_suite(&s.suite).await?;
            }
            Ok(Value::Null)
        }
        "suite exists" => {
            let suite = string_arg(data, "Unable to verify suite existence, invalid arguments")?;
            Ok(json!(collection(session).await?.suite_exists(suite).await))
        }
        "module exists" => {
            let m: ModuleRef = parse(data, "Unable to verify module existence, invalid arguments")?;
            Ok(json!(collection(session).await?.module_exists(&m.suite, &m.module).await))
        }
        "make suite" => {
            let suite = string_arg(data, "Unable to make suite, invalid arguments")?;
            collection(session).await?.make_suite(suite).await?;
            Ok(Value::Null)
        }
        "make module" => {
            let m: ModuleRef = parse(data, "Unable to make module, invalid arguments")?;
            collection(session).await?.make_module(&m.suite, &m.module).await?;
            Ok(Value::Null)
        }
        "get project hierarchy" => Ok(collection(session).await?.hierarchy().await),
        "load all assets" => {
            let test_path = config.get_str("testPath").unwrap_or_default();
            let loaded = engine.assets().load(&test_path).await?;
            if session.is_alive() {
                lifecycle::register_assets(session, loaded);
            }
            Ok(json!({}))
        }
        "execute command" => {
            let line = string_arg(data, "Unable to execute command, invalid arguments")?;
            engine.runner().command_line(line).await?;
            Ok(json!({ "executed": true }))
        }
        "build" => {
            let args: Vec<Value> = parse(data, "Unable to build app, invalid arguments")?;
            let args = build_args(session, args);
            engine
                .framework()
                .build(args)
                .await
                .map_err(|e| CommandError::Process(e.to_string()))
        }
        "prebuild" => {
            let mut args: Vec<Value> = parse(data, "Unable to build app, invalid arguments")?;
            if args.len() < 2 {
                return Err(CommandError::validation("Unable to build app, invalid arguments"));
            }
            let rest = args.split_off(2);
            let (env, framework) = (args[0].clone(), args[1].clone());
            config.set("env", env);
            engine
                .framework()
                .load(framework.as_str().unwrap_or_default())
                .await?;
            engine
                .framework()
                .build(build_args(session, rest))
                .await
                .map_err(|e| CommandError::Process(e.to_string()))
        }
        "keypress" => {
            let key = string_arg(data, "Unable to send keypress, invalid arguments")?;
            tracing::debug!(connection_id = %session.connection_id(), key, "client keypress");
            engine.runner().keypress(key);
            Ok(json!(true))
        }
        "zip scripts" => {
            let request: ZipRequest = parse(data, "Unable to zip scripts, invalid arguments")?;
            let directory = expand_path(session, &request.directory);
            let temp = config
                .get_str("temp")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir);
            let encoded = archive::zip_to_base64(directory, temp.join("scripts.zip")).await?;
            Ok(if encoded.is_empty() { Value::Null } else { json!(encoded) })
        }
        "shutdown" => {
            if let Err(e) = engine.framework().stop().await {
                tracing::debug!(error = %e, "framework stop before shutdown failed");
            }
            Ok(json!(true))
        }
        "kill" => Ok(json!(true)),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

/// Handle one request: dispatch, respond, then run any post-response action.
pub async fn handle(session: Arc<Session>, req: RequestEnvelope) {
    let responder = Responder::new(
        session.outbound().clone(),
        session.engine().id(),
        req.id.clone(),
    );
    let result = dispatch(&session, &req).await;
    match &result {
        Ok(_) => tracing::debug!(
            connection_id = %session.connection_id(),
            request_id = %req.id,
            command = %req.command,
            "command succeeded"
        ),
        Err(e) => tracing::info!(
            connection_id = %session.connection_id(),
            request_id = %req.id,
            command = %req.command,
            code = e.code(),
            error = %e,
            "command failed"
        ),
    }
    let succeeded = result.is_ok();
    responder.send(result);

    if succeeded {
        match req.command.as_str() {
            "shutdown" => {
                tracing::info!(connection_id = %session.connection_id(), "shutdown requested");
                session.engine().assets().destroy().await;
                session.server().shutdown.shutdown();
            }
            "kill" => {
                tracing::warn!(connection_id = %session.connection_id(), "kill requested");
                (session.server().kill)();
            }
            _ => {}
        }
    }
}
