//! proxyd: entry point for running the engine.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 escrow backend
//! unreachable at startup, 3 persistent-store corruption.

mod cli;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use proxy_attestation::{KeyRing, SubprocessQuoteEngine, TpmAttestor};
use proxy_crypto::{HeartbeatKey, RandomIds};
use proxy_engine::{
    init_logging, Engine, EngineConfig, EngineDeps, LogFormat, ShutdownController,
};
use proxy_escrow::{EscrowBackend, HttpEscrowBackend};
use proxy_rpc::RpcServer;
use proxy_store::JournalStore;
use proxy_store_lmdb::{check_data_dir, check_integrity, LmdbEnvironment, Migrator};
use proxy_types::SystemClock;

use crate::cli::{Cli, Command};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("escrow backend unreachable: {0}")]
    EscrowUnreachable(String),

    #[error("persistent store: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StartupError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Other(_) => 1,
            Self::EscrowUnreachable(_) => 2,
            Self::Store(_) => 3,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("proxyd: {e}");
            return ExitCode::from(1);
        }
    };

    if cli.command == Some(Command::PrintConfig) {
        return match config.to_toml_string() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("proxyd: {e}");
                ExitCode::from(1)
            }
        };
    }

    let logging = config
        .log_format
        .parse::<LogFormat>()
        .and_then(|format| init_logging(format, &config.log_level));
    if let Err(e) = logging {
        eprintln!("proxyd: {e}");
        return ExitCode::from(1);
    }

    match run(config).await {
        Ok(()) => {
            tracing::info!("proxyd exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, code = e.exit_code(), "proxyd failed");
            ExitCode::from(e.exit_code())
        }
    }
}

fn open_store(config: &EngineConfig) -> Result<Arc<LmdbEnvironment>, StartupError> {
    check_data_dir(&config.data_dir).map_err(StartupError::Store)?;
    let env = LmdbEnvironment::open(&config.data_dir, config.map_size)
        .map_err(|e| StartupError::Store(e.to_string()))?;
    let report = check_integrity(&env).map_err(|e| StartupError::Store(e.to_string()))?;
    if !report.is_healthy() {
        for error in &report.errors {
            tracing::error!(%error, "integrity check");
        }
        return Err(StartupError::Store(format!(
            "{} corrupt record(s) in {}",
            report.errors.len(),
            config.data_dir.display()
        )));
    }
    Migrator::run(&env).map_err(|e| StartupError::Store(e.to_string()))?;
    Ok(Arc::new(env))
}

async fn run(config: EngineConfig) -> Result<(), StartupError> {
    tracing::info!(
        data_dir = %config.data_dir.display(),
        escrow = %config.escrow_backend_url,
        rpc_port = config.rpc_port,
        "starting proxyd"
    );

    let store = open_store(&config)?;
    let last_seq = store
        .last_seq()
        .map_err(|e| StartupError::Store(e.to_string()))?;

    let escrow = Arc::new(HttpEscrowBackend::new(
        &config.escrow_backend_url,
        Duration::from_millis(config.escrow_timeout_ms),
    ));
    escrow
        .ping()
        .await
        .map_err(|e| StartupError::EscrowUnreachable(e.to_string()))?;

    let root = config
        .root_hmac_key
        .as_deref()
        .map(HeartbeatKey::from_hex)
        .transpose()
        .map_err(|e| StartupError::Config(format!("root_hmac_key: {e}")))?
        .ok_or_else(|| StartupError::Config("root_hmac_key is not set".into()))?;
    let clock = Arc::new(SystemClock);
    let attestor = Arc::new(TpmAttestor::new(
        KeyRing::new(root),
        Arc::new(SubprocessQuoteEngine::new(&config.attestor_bin_path)),
        clock.clone(),
        &config.params,
    ));
    let ids = Arc::new(RandomIds::new(last_seq).context("seeding id source")?);

    let rpc_addr = SocketAddr::from(([0, 0, 0, 0], config.rpc_port));
    let enable_metrics = config.enable_metrics;
    let engine = Engine::new(
        config,
        EngineDeps {
            store: store.clone(),
            escrow,
            attestor,
            clock,
            ids,
        },
    )
    .map_err(|e| StartupError::Config(e.to_string()))?;
    let restored = engine.start().await.context("restoring engine state")?;
    tracing::info!(?restored, "engine started");

    let shutdown = ShutdownController::new();
    let timers = engine.spawn_timers(&shutdown);

    let mut server = RpcServer::new(rpc_addr, engine.api());
    if enable_metrics {
        server = server.with_metrics(engine.metrics());
    }
    let (listener, _) = server.bind().await.context("binding rpc listener")?;
    let mut stop = shutdown.subscribe();
    let rpc = tokio::spawn(async move {
        let signal = async move {
            let _ = stop.recv().await;
        };
        if let Err(e) = server.serve(listener, signal).await {
            tracing::error!(error = %e, "rpc server failed");
        }
    });

    shutdown
        .wait_for_signal()
        .await
        .context("installing signal handlers")?;

    for handle in timers {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "timer task ended abnormally");
        }
    }
    if let Err(e) = rpc.await {
        tracing::warn!(error = %e, "rpc task ended abnormally");
    }
    engine.flush().context("flushing store")?;
    Ok(())
}
