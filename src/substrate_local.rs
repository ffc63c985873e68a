//! Local substrate binding: runs each handler invocation as a subprocess.
//!
//! The handler package is deployed once into a temporary directory by the
//! runtime's invoker program; each invocation then executes the invoker
//! against that directory with the event on the command line. The invoker's
//! exit code classifies failures: 42 for a wall-clock timeout, 43 for an
//! uncaught handler error (stderr carries the message).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::substrate::{HandlerSet, Substrate, SubstrateError};

const INVOKER_INTERPRETER: &str = "python3";
/// Invoker program, relative to the runtime directory.
const INVOKER_REL_PATH: &str = "compiler/invoker.py";

// Exit codes the invoker uses to classify handler failures.
const TIMEOUT_EXIT_CODE: i32 = 42;
const UNCAUGHT_EXC_EXIT_CODE: i32 = 43;

/// Shared sink for handler stderr. Writes from concurrent invocations are
/// serialized so lines don't interleave.
#[derive(Clone, Default)]
pub struct HandlerLog(Option<Arc<Mutex<std::fs::File>>>);

impl HandlerLog {
    pub fn discard() -> Self {
        HandlerLog(None)
    }

    pub fn file(file: std::fs::File) -> Self {
        HandlerLog(Some(Arc::new(Mutex::new(file))))
    }

    fn write(&self, bytes: &[u8]) {
        if let Some(file) = &self.0 {
            let mut file = file.lock().expect("handler log lock poisoned");
            if let Err(err) = file.write_all(bytes) {
                warn!(error = %err, "handler log write failed");
            }
        }
    }
}

/// A handler that runs on the local machine.
pub struct LocalSubstrate {
    name: String,
    invoker_path: PathBuf,
    deploy_dir: TempDir,
    env: HashMap<String, String>,
    timeout_secs: u64,
    log: HandlerLog,
    _checkpoint_guard: Option<Arc<TempDir>>,
}

impl LocalSubstrate {
    /// Deploy the handler package and return a substrate that executes it
    /// locally. `timeout_secs` of 0 means no time limit.
    pub async fn create(
        runtime_dir: &Path,
        name: &str,
        deployed_files: &[String],
        env: HashMap<String, String>,
        timeout_secs: u64,
        log: HandlerLog,
        checkpoint_guard: Option<Arc<TempDir>>,
    ) -> Result<Self> {
        let deploy_dir = tempfile::tempdir().context("create deploy directory")?;
        let invoker_path = runtime_dir.join(INVOKER_REL_PATH);
        let files = filter_deployed_files("local", deployed_files);

        let output = Command::new(INVOKER_INTERPRETER)
            .arg(&invoker_path)
            .args(&files)
            .arg("--deploy")
            .arg(deploy_dir.path())
            .output()
            .await
            .context("launch invoker for deploy")?;
        if !output.status.success() {
            bail!(
                "deploy failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        info!(dir = %deploy_dir.path().display(), "handler package deployed locally");

        Ok(LocalSubstrate {
            name: name.to_string(),
            invoker_path,
            deploy_dir,
            env,
            timeout_secs,
            log,
            _checkpoint_guard: checkpoint_guard,
        })
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    async fn invoke(&self, payload: Vec<u8>) -> Result<Vec<u8>, SubstrateError> {
        let event = String::from_utf8(payload)
            .map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))?;

        let mut cmd = Command::new(INVOKER_INTERPRETER);
        cmd.arg(&self.invoker_path)
            .arg(self.deploy_dir.path())
            .arg("--event")
            .arg(&event);
        if self.timeout_secs > 0 {
            cmd.arg("--timeout-secs").arg(self.timeout_secs.to_string());
        }
        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(handler = %self.name, "invoking local handler");
        let output = cmd
            .output()
            .await
            .map_err(|err| SubstrateError::Other(anyhow!("spawn invoker: {err}")))?;

        self.log.write(&output.stderr);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(match output.status.code() {
                Some(TIMEOUT_EXIT_CODE) => SubstrateError::Timeout {
                    name: self.name.clone(),
                    timeout_secs: self.timeout_secs,
                },
                Some(UNCAUGHT_EXC_EXIT_CODE) => SubstrateError::Crashed {
                    name: self.name.clone(),
                    message: stderr,
                },
                code => SubstrateError::Other(anyhow!(
                    "invoker exited with status {code:?}:\n{stderr}"
                )),
            });
        }

        Ok(output.stdout)
    }

    async fn finalize(&self) {}
}

/// Configuration for the local substrate pair.
pub struct LocalPlatformConfig {
    /// Directory holding the runtime (and its invoker program).
    pub runtime_dir: PathBuf,
    /// Where handlers store checkpoints; a temporary directory is created
    /// (and cleaned up) when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub workload_name: String,
    pub deployed_files: Vec<String>,
    /// Wall-clock budget for OnLambda invocations.
    pub timeout_secs: u64,
    /// Extra environment for handlers (user `--env` pairs plus the RPC
    /// coordinates).
    pub env: HashMap<String, String>,
    pub handler_log: HandlerLog,
}

/// Create the handler pair for the local platform: OnLambda invocations get
/// the configured time limit, OnCoordinator invocations run unbounded.
pub async fn create_local_handlers(config: LocalPlatformConfig) -> Result<HandlerSet> {
    let (checkpoint_dir, checkpoint_guard) = match &config.checkpoint_dir {
        Some(dir) => {
            ensure_directory(dir)?;
            (dir.clone(), None)
        }
        None => {
            let tmp = tempfile::tempdir().context("create checkpoint directory")?;
            info!(dir = %tmp.path().display(), "temporary checkpoint directory created");
            (tmp.path().to_path_buf(), Some(Arc::new(tmp)))
        }
    };

    let mut env = HashMap::new();
    env.insert("PLATFORM".to_string(), "local".to_string());
    env.insert(
        "CHECKPOINT_DIR".to_string(),
        checkpoint_dir.display().to_string(),
    );
    env.insert("WHERE".to_string(), "coordinator".to_string());
    merge_env(&mut env, &config.env)?;

    let on_lambda = LocalSubstrate::create(
        &config.runtime_dir,
        &config.workload_name,
        &config.deployed_files,
        env.clone(),
        config.timeout_secs,
        config.handler_log.clone(),
        checkpoint_guard.clone(),
    )
    .await?;
    let on_coordinator = LocalSubstrate::create(
        &config.runtime_dir,
        &config.workload_name,
        &config.deployed_files,
        env,
        0,
        config.handler_log,
        checkpoint_guard,
    )
    .await?;

    Ok(HandlerSet::new(
        Arc::new(on_coordinator),
        Arc::new(on_lambda),
    ))
}

/// Merge `extra` into `env`, rejecting keys the platform already claimed.
fn merge_env(env: &mut HashMap<String, String>, extra: &HashMap<String, String>) -> Result<()> {
    for (key, value) in extra {
        if env.contains_key(key) {
            bail!("duplicate environment variable: {key}");
        }
        env.insert(key.clone(), value.clone());
    }
    Ok(())
}

fn ensure_directory(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_dir() {
        bail!("not a directory: {}", path.display());
    }
    Ok(())
}

/// Keep paths with no platform prefix or a matching one; `"local:x"` is kept
/// as `x` on the local platform, `"aws:x"` is dropped.
fn filter_deployed_files(platform: &str, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|path| match path.split_once(':') {
            None => Some(path.clone()),
            Some((prefix, rest)) if prefix == platform => Some(rest.to_string()),
            Some(_) => None,
        })
        .collect()
}
