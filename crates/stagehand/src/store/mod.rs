use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::archive;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub mod http;
pub mod local;

pub use http::HttpStore;
pub use local::DirStore;

/// One published blob set, as reported by the store. `context` is the
/// execution context the entry was published from; the client decides what
/// counts as "current"; the store itself is a dumb key/blob service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub ref_id: String,
    pub name: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlobEntry {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DeleteTarget<'a> {
    Name(&'a str),
    Ref(&'a str),
}

/// The four-operation boundary with the remote blob service. Every method may
/// fail transiently; callers own retries and degradation.
pub trait BlobStore: Send + Sync {
    fn store(
        &self,
        name: &str,
        context: &str,
        payload: &[PathBuf],
        retention: Duration,
    ) -> Result<String>;

    /// Downloads the blob set for `ref_id` into `dest`, returning the file
    /// paths written.
    fn fetch(&self, ref_id: &str, dest: &Path) -> Result<Vec<PathBuf>>;

    /// All entries ever published under `name` that the store still knows
    /// about, across execution contexts.
    fn list(&self, name: &str) -> Result<Vec<BlobEntry>>;

    fn delete(&self, target: DeleteTarget<'_>) -> Result<()>;
}

/// Outcome of checkpoint resolution. `RejectedExplicit` and `NotFound` both
/// mean "start fresh"; the former deserves a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Ref(String),
    RejectedExplicit(String),
    NotFound,
}

/// Retry/resolution wrapper around a [`BlobStore`]. The client, not the
/// store, owns the notion of which entry is current for a name.
pub struct StoreClient {
    store: Box<dyn BlobStore>,
    context: String,
    retry: RetryPolicy,
    max_resume_age: Duration,
}

impl StoreClient {
    pub fn new(
        store: Box<dyn BlobStore>,
        context: impl Into<String>,
        retry: RetryPolicy,
        max_resume_age: Duration,
    ) -> Self {
        Self {
            store,
            context: context.into(),
            retry,
            max_resume_age,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// A well-formed explicit ref (positive integer-like) wins without a
    /// store round-trip. Otherwise resolution prefers the current context and
    /// falls back to the most recent non-expired historical entry no older
    /// than `max_resume_age`. `NotFound` is a signal, not an error.
    pub fn resolve(&self, name: &str, explicit_ref: Option<&str>) -> Result<Resolved> {
        if let Some(raw) = explicit_ref {
            let trimmed = raw.trim();
            return match trimmed.parse::<u64>() {
                Ok(n) if n > 0 => Ok(Resolved::Ref(trimmed.to_string())),
                _ => Ok(Resolved::RejectedExplicit(raw.to_string())),
            };
        }

        let entries = self.store.list(name)?;
        let now = Utc::now();
        let live: Vec<&BlobEntry> = entries.iter().filter(|e| !e.expired(now)).collect();

        if let Some(current) = live
            .iter()
            .filter(|e| e.context == self.context)
            .max_by_key(|e| e.created_at)
        {
            return Ok(Resolved::Ref(current.ref_id.clone()));
        }

        let oldest_usable = now
            - chrono::Duration::from_std(self.max_resume_age)
                .map_err(|e| Error::msg(format!("invalid max_resume_age: {e}")))?;
        if let Some(historical) = live
            .iter()
            .filter(|e| e.created_at >= oldest_usable)
            .max_by_key(|e| e.created_at)
        {
            return Ok(Resolved::Ref(historical.ref_id.clone()));
        }

        Ok(Resolved::NotFound)
    }

    /// Fetches the blob set for `ref_id` and unpacks any archives it contains
    /// into `dest_dir`. Plain blobs are left beside the unpacked trees.
    pub fn fetch_into(&self, ref_id: &str, dest_dir: &Path) -> Result<()> {
        let staging = tempfile::tempdir()
            .map_err(|e| Error::msg(format!("failed to create fetch staging dir: {e}")))?;
        let files = self.store.fetch(ref_id, staging.path())?;
        if files.is_empty() {
            return Err(Error::msg(format!("ref {ref_id} has no payload")));
        }
        std::fs::create_dir_all(dest_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;
        for file in &files {
            if file.extension().and_then(|s| s.to_str()) == Some("tar") {
                archive::unpack(file, dest_dir)?;
            } else {
                let leaf = file.file_name().ok_or_else(|| {
                    Error::msg(format!("fetched blob has no file name: {}", file.display()))
                })?;
                std::fs::copy(file, dest_dir.join(leaf)).map_err(|e| {
                    Error::msg(format!("failed to place {}: {e}", file.display()))
                })?;
            }
        }
        Ok(())
    }

    /// Delete-then-create publish: prior entries under `name` are removed
    /// best-effort (absence is fine), then the upload runs under the retry
    /// policy. Repeated publishes never accumulate history for a name.
    pub fn publish(&self, name: &str, payload: &[PathBuf], retention: Duration) -> Result<String> {
        let _ = self.store.delete(DeleteTarget::Name(name));
        self.retry.run(&format!("publish of '{name}'"), || {
            self.store.store(name, &self.context, payload, retention)
        })
    }
}
