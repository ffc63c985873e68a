//! Filesystem object store backing the `remap_store` coordinator call.
//!
//! Handlers write large values under temporary keys and ask the coordinator
//! to move them to their final name once the enclosing checkpoint commits.
//! Buckets are directories under a store root shared with the handler
//! runtime.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub const DEFAULT_STORE_DIR: &str = ".belay-store";

#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ObjectStore { root: root.into() }
    }

    /// Store rooted at `BELAY_STORE_DIR`, or the default location in the
    /// working directory.
    pub fn from_env() -> Self {
        let root = std::env::var("BELAY_STORE_DIR").unwrap_or_else(|_| DEFAULT_STORE_DIR.into());
        ObjectStore::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    /// Move `tmp_bucket/tmp_key` to `bucket/key`: copy, then delete the
    /// source. The destination bucket is created if absent.
    pub async fn rename(
        &self,
        tmp_bucket: &str,
        tmp_key: &str,
        bucket: &str,
        key: &str,
    ) -> Result<()> {
        let src = self.key_path(tmp_bucket, tmp_key);
        let dst = self.key_path(bucket, key);

        tokio::fs::create_dir_all(self.root.join(bucket))
            .await
            .with_context(|| format!("create bucket {bucket}"))?;
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("copy {tmp_bucket}/{tmp_key} to {bucket}/{key}"))?;
        tokio::fs::remove_file(&src)
            .await
            .with_context(|| format!("delete {tmp_bucket}/{tmp_key}"))?;

        debug!(
            from = %format!("{tmp_bucket}/{tmp_key}"),
            to = %format!("{bucket}/{key}"),
            "store object remapped"
        );
        Ok(())
    }
}
