//! Command line and configuration layering: TOML file, then environment,
//! then explicit flags.

use std::path::PathBuf;

use clap::Parser;

use proxy_engine::{EngineConfig, EngineError};

#[derive(Parser, Debug)]
#[command(name = "proxyd", about = "Node trust and task lifecycle engine")]
pub struct Cli {
    /// Path to a TOML configuration file. Environment variables and flags
    /// override its values.
    #[arg(long, env = "PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory for the LMDB environment.
    #[arg(long, env = "PROXY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the escrow backend.
    #[arg(long, env = "ESCROW_BACKEND_URL")]
    pub escrow_backend_url: Option<String>,

    /// Path of the TPM attestation binary.
    #[arg(long, env = "ATTESTOR_BIN_PATH")]
    pub attestor_bin_path: Option<PathBuf>,

    /// Root HMAC key, hex. Only used to bootstrap node keys.
    #[arg(long, env = "ROOT_HMAC_KEY", hide_env_values = true)]
    pub root_hmac_key: Option<String>,

    /// Period of the deadline tick, milliseconds.
    #[arg(long, env = "DEADLINE_TICK_MS")]
    pub deadline_tick_ms: Option<u64>,

    /// Seconds without a heartbeat before a node is stale.
    #[arg(long, env = "HEARTBEAT_STALE_S")]
    pub heartbeat_stale_s: Option<u64>,

    /// RPC listen port.
    #[arg(long, env = "PROXY_RPC_PORT")]
    pub rpc_port: Option<u16>,

    /// Log format: "human" or "json".
    #[arg(long, env = "PROXY_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Log level filter, e.g. "info" or "debug,proxy_engine=trace".
    #[arg(long, env = "PROXY_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the engine (the default).
    Run,
    /// Print the resolved configuration as TOML and exit.
    PrintConfig,
}

impl Cli {
    /// The effective configuration. The root key must come from somewhere.
    pub fn resolve(&self) -> Result<EngineConfig, EngineError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_toml_file(&path.to_string_lossy())?,
            None => EngineConfig::default(),
        };
        self.apply(&mut config);
        if config.root_hmac_key.is_none() {
            return Err(EngineError::Config(
                "ROOT_HMAC_KEY is not set (flag, environment or config file)".into(),
            ));
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut EngineConfig) {
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.escrow_backend_url {
            config.escrow_backend_url = v.clone();
        }
        if let Some(v) = &self.attestor_bin_path {
            config.attestor_bin_path = v.clone();
        }
        if let Some(v) = &self.root_hmac_key {
            config.root_hmac_key = Some(v.clone());
        }
        if let Some(v) = self.deadline_tick_ms {
            config.deadline_tick_ms = v;
        }
        if let Some(v) = self.heartbeat_stale_s {
            config.params.heartbeat_stale_secs = v;
        }
        if let Some(v) = self.rpc_port {
            config.rpc_port = v;
        }
        if let Some(v) = &self.log_format {
            config.log_format = v.clone();
        }
        if let Some(v) = &self.log_level {
            config.log_level = v.clone();
        }
    }
}
