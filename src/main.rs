//! veplane - control plane for automation engines.
//!
//! `veplane serve` accepts WebSocket connections on `/ws` and binds each one
//! to an automation engine hosted in a helper process. `veplane encrypt` and
//! `veplane decrypt` use the same key as the server, for preparing
//! encrypted proxy passwords.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veplane::{
    api,
    cipher::{Cipher, CipherError},
    config::{self, ConfigError, VeplaneConfig},
    engine::{host::HostEngineFactory, EngineError, EngineFactory},
    session::{EngineSource, ServerContext},
};

#[derive(ClapParser, Debug)]
#[command(name = "veplane", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/veplane/config.toml)
    #[arg(long, global = true, env = "VEPLANE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane server
    Serve {
        /// Address to bind (host:port); overrides the config file
        #[arg(long, env = "VEPLANE_BIND")]
        bind: Option<String>,

        /// Bind every connection to one engine created at startup
        #[arg(long)]
        shared_engine: bool,
    },

    /// Encrypt a secret with the server key
    Encrypt { text: String },

    /// Decrypt a secret produced by `encrypt`
    Decrypt { text: String },
}

#[derive(Error, Debug)]
pub enum VeplaneError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), VeplaneError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let config = match &config_path {
        Some(path) => VeplaneConfig::load(path)?.unwrap_or_default(),
        None => VeplaneConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            bind,
            shared_engine,
        } => run_server(config, bind, shared_engine).await,
        Commands::Encrypt { text } => {
            println!("{}", load_cipher(&config)?.encrypt(&text)?);
            Ok(())
        }
        Commands::Decrypt { text } => {
            println!("{}", load_cipher(&config)?.decrypt(&text)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "veplane=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_cipher(config: &VeplaneConfig) -> Result<Cipher, CipherError> {
    match config.key_file() {
        Some(path) => Cipher::load_or_create(&path),
        None => {
            tracing::warn!("no config directory; using an ephemeral cipher key");
            Ok(Cipher::ephemeral())
        }
    }
}

async fn run_server(
    config: VeplaneConfig,
    bind: Option<String>,
    shared_engine: bool,
) -> Result<(), VeplaneError> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let shared_engine = shared_engine || config.server.shared_engine;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let port = listener.local_addr()?.port();

    let mut server = ServerContext::new(
        load_cipher(&config)?,
        Arc::new(|| {
            tracing::warn!("kill requested, exiting");
            std::process::exit(1);
        }),
    );
    server.port = port;

    let factory: Arc<dyn EngineFactory> = Arc::new(HostEngineFactory::new(
        config.engine.command.clone(),
        config.engine.args.clone(),
        config.engine_seed(),
        Duration::from_secs(config.engine.startup_timeout_secs),
    ));
    let engines = if shared_engine {
        let engine = factory.create().await?;
        tracing::info!(engine = %engine.label(), "using one shared engine");
        EngineSource::Shared(engine)
    } else {
        EngineSource::New(factory)
    };

    let shutdown = server.shutdown.clone();
    let state = api::AppState {
        server,
        engines: engines.clone(),
    };
    tracing::info!(addr = %bind, port, shared_engine, "veplane listening");

    let http = tokio::spawn(api::serve(listener, state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
            shutdown.shutdown();
        }
        _ = shutdown.wait() => {
            tracing::info!("shutdown requested by client");
        }
    }

    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "server error during shutdown"),
        Err(e) => tracing::warn!(error = %e, "server task panicked"),
    }

    if let EngineSource::Shared(engine) = engines {
        engine.terminate().await;
    }
    tracing::info!("veplane exiting");
    Ok(())
}
