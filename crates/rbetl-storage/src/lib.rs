//! Durable landing-object storage + bounded-backoff retry controller.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbetl-storage";

/// Path-addressed, write-once object store rooted on the local filesystem.
/// Object names follow the landing conventions:
/// `landing/<vendor>/<yyyy>/<mm>/<dd>/run_<run_id>/<store_id>_<window>.csv`
/// for automated runs and `manual/<vendor>/<yyyy>/<mm>/<dd>/<filename>` for
/// operator backfills.
#[derive(Debug, Clone)]
pub struct LandingStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when the object already existed and the write was skipped.
    pub already_existed: bool,
}

impl LandingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn landing_object_name(
        &self,
        vendor: &str,
        date: NaiveDate,
        run_id: Uuid,
        store_id: &str,
        window_label: &str,
    ) -> PathBuf {
        PathBuf::from("landing")
            .join(vendor)
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join(format!("run_{run_id}"))
            .join(format!("{store_id}_{window_label}.csv"))
    }

    pub fn manual_object_name(&self, vendor: &str, date: NaiveDate, file_name: &str) -> PathBuf {
        PathBuf::from("manual")
            .join(vendor)
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join(file_name)
    }

    /// Store bytes under `object_name` with an atomic temp-file rename.
    /// Write-once: an object that already exists is left untouched. The
    /// optional metadata map is persisted as a JSON sidecar for traceability.
    pub async fn put(
        &self,
        object_name: &Path,
        bytes: &[u8],
        metadata: Option<&HashMap<String, String>>,
    ) -> anyhow::Result<StoredObject> {
        let absolute_path = self.root.join(object_name);
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating landing directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking landing object {}", absolute_path.display()))?
        {
            return Ok(StoredObject {
                relative_path: object_name.to_path_buf(),
                absolute_path,
                byte_size: bytes.len(),
                already_existed: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .unwrap_or(&self.root)
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp landing file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp landing file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp landing file {}", temp_path.display()))?;
        drop(file);

        let renamed = fs::rename(&temp_path, &absolute_path).await;
        if let Err(err) = renamed {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(StoredObject {
                    relative_path: object_name.to_path_buf(),
                    absolute_path,
                    byte_size: bytes.len(),
                    already_existed: true,
                });
            }
            return Err(err).with_context(|| {
                format!(
                    "renaming temp landing file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        if let Some(metadata) = metadata {
            let sidecar = absolute_path.with_extension("meta.json");
            let body = serde_json::to_vec_pretty(metadata).context("serializing object metadata")?;
            fs::write(&sidecar, body)
                .await
                .with_context(|| format!("writing metadata sidecar {}", sidecar.display()))?;
        }

        Ok(StoredObject {
            relative_path: object_name.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
            already_existed: false,
        })
    }

    pub async fn get(&self, object_name: &Path) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(object_name);
        fs::read(&path)
            .await
            .with_context(|| format!("reading landing object {}", path.display()))
    }

    pub async fn exists(&self, object_name: &Path) -> anyhow::Result<bool> {
        let path = self.root.join(object_name);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking landing object {}", path.display()))
    }

    pub async fn delete(&self, object_name: &Path) -> anyhow::Result<()> {
        let path = self.root.join(object_name);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting landing object {}", path.display()))
    }

    /// All objects under `prefix` whose filesystem modification time falls
    /// inside the window.
    pub async fn list(
        &self,
        prefix: &Path,
        modified_from: DateTime<Utc>,
        modified_to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let base = self.root.join(prefix);
        if !fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(out);
        }
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("listing {}", dir.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("listing {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
                if modified >= modified_from && modified <= modified_to {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        out.push(rel.to_path_buf());
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Coarse TTL sweep over a prefix. Retention policy only, not a
    /// correctness mechanism.
    pub async fn cleanup_older_than(
        &self,
        prefix: &Path,
        days_to_keep: i64,
    ) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep);
        let expired = self
            .list(prefix, DateTime::<Utc>::MIN_UTC, cutoff)
            .await?;
        let mut deleted = 0;
        for object in &expired {
            match self.delete(object).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    tracing::warn!(object = %object.display(), error = %err, "failed to delete expired landing object");
                }
            }
        }
        tracing::info!(prefix = %prefix.display(), deleted, days_to_keep, "landing cleanup finished");
        Ok(deleted)
    }
}

/// Whether a failure is worth another attempt. Terminal failures (a portal
/// demanding a second factor, permanently malformed responses) burn no
/// backoff budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Terminal,
}

pub trait RetryClass {
    fn retry_disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 1`: `base_delay * 2^(n-1)` for 1-based `n`.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1) as u32)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("terminal failure on attempt {attempt}: {source}")]
    Terminal { attempt: usize, source: E },
    #[error("all {attempts} attempts failed: {source}")]
    Exhausted { attempts: usize, source: E },
}

impl<E> RetryError<E> {
    pub fn into_source(self) -> E {
        match self {
            RetryError::Terminal { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }
}

/// Run a fallible unit of work up to `policy.max_attempts` times with
/// exponential backoff. Terminal failures are surfaced after a single
/// attempt; transient failures are retried and, on exhaustion, wrapped with
/// the last underlying error. Generic over the unit's success type so it can
/// wrap a whole per-store extraction pipeline.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut work: F,
) -> Result<T, RetryError<E>>
where
    E: RetryClass + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match work().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retry_disposition() == RetryDisposition::Terminal => {
                tracing::warn!(label, attempt, error = %err, "terminal failure, not retrying");
                return Err(RetryError::Terminal {
                    attempt,
                    source: err,
                });
            }
            Err(err) if attempt >= max_attempts => {
                tracing::warn!(label, attempt, error = %err, "final attempt failed");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_after_attempt(attempt);
                tracing::warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
