//! Coordinator configuration.

use std::path::PathBuf;

/// Configuration loaded from environment variables; CLI flags override the
/// corresponding fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the RPC server (0 picks an unused port)
    pub rpc_port: u16,

    /// Seconds a handler may wait on an RPC before being told to checkpoint
    pub rpc_timeout_secs: u64,

    /// Per-invocation handler timeout in seconds
    pub handler_timeout_secs: u64,

    /// Directory holding the handler runtime (required for the local
    /// platform)
    pub runtime_dir: Option<PathBuf>,

    /// Directory handlers store checkpoints in; temporary if unset
    pub checkpoint_dir: Option<PathBuf>,

    /// Root of the filesystem object store
    pub store_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let rpc_port: u16 = std::env::var("BELAY_RPC_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(43731);

        let rpc_timeout_secs: u64 = std::env::var("BELAY_RPC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let handler_timeout_secs: u64 = std::env::var("BELAY_HANDLER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let runtime_dir = std::env::var("BELAY_RUNTIME_DIR").ok().map(PathBuf::from);

        let checkpoint_dir = std::env::var("BELAY_CHECKPOINT_DIR")
            .ok()
            .map(PathBuf::from);

        let store_dir = std::env::var("BELAY_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(crate::store::DEFAULT_STORE_DIR));

        Ok(Config {
            rpc_port,
            rpc_timeout_secs,
            handler_timeout_secs,
            runtime_dir,
            checkpoint_dir,
            store_dir,
        })
    }
}
