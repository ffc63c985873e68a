//! Human-readable rendering of a process return value.
//!
//! Return values are produced by the handler runtime as base64-encoded
//! pickles; decoding them is delegated to the Python interpreter. The
//! conversion fails if the value references objects outside the Python
//! builtins.

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use crate::protocol::ProcessResult;

const DECODE_INTERPRETER: &str = "python3";
const DECODE_PROGRAM: &str = r#"
from base64 import b64decode
import pickle
import sys

obj = pickle.loads(b64decode(sys.argv[1]))
sys.stdout.write(repr(obj))
"#;

/// Decode a process result into its `repr` form.
pub async fn human_readable(result: &ProcessResult) -> Result<String> {
    let output = Command::new(DECODE_INTERPRETER)
        .arg("-c")
        .arg(DECODE_PROGRAM)
        .arg(result)
        .output()
        .await
        .context("launch result decoder")?;

    if !output.status.success() {
        bail!(
            "result decoding failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
