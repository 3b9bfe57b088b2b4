use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{BlobEntry, BlobStore, DeleteTarget};

/// Filesystem-backed blob store. Refs are monotonically increasing integers
/// handed out by the index; payload files live under `blobs/<ref>/`.
pub struct DirStore {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDoc {
    version: u32,
    next_ref: u64,
    entries: Vec<IndexEntry>,
}

impl Default for IndexDoc {
    fn default() -> Self {
        Self {
            version: 1,
            next_ref: 1,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    ref_id: u64,
    name: String,
    context: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    files: Vec<IndexFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    file_name: String,
    sha256: String,
}

struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn blob_dir(&self, ref_id: u64) -> PathBuf {
        self.root.join("blobs").join(ref_id.to_string())
    }

    fn load_index(&self) -> Result<IndexDoc> {
        let p = self.index_path();
        if !p.is_file() {
            return Ok(IndexDoc::default());
        }
        let raw = fs::read_to_string(&p)
            .map_err(|e| Error::msg(format!("failed to read store index {}: {e}", p.display())))?;
        serde_json::from_str::<IndexDoc>(&raw)
            .map_err(|e| Error::msg(format!("failed to parse store index {}: {e}", p.display())))
    }

    fn save_index(&self, idx: &IndexDoc) -> Result<()> {
        let p = self.index_path();
        let body = serde_json::to_string_pretty(idx)
            .map_err(|e| Error::msg(format!("failed to encode store index: {e}")))?;
        atomic_write_text(&p, &body)
    }

    // Writers serialize on a create_new lock file with a short deadline.
    fn acquire_lock(&self) -> Result<StoreLock> {
        let path = self.root.join(".store.lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(StoreLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::msg(format!(
                            "timed out waiting for store lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire store lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn remove_entry_payload(&self, entry: &IndexEntry) {
        let dir = self.blob_dir(entry.ref_id);
        let _ = fs::remove_dir_all(&dir);
    }
}

impl BlobStore for DirStore {
    fn store(
        &self,
        name: &str,
        context: &str,
        payload: &[PathBuf],
        retention: Duration,
    ) -> Result<String> {
        if payload.is_empty() {
            return Err(Error::msg(format!("nothing to store under '{name}'")));
        }
        let _lock = self.acquire_lock()?;
        let mut idx = self.load_index()?;
        let ref_id = idx.next_ref;

        let dir = self.blob_dir(ref_id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;

        let mut files = Vec::with_capacity(payload.len());
        for src in payload {
            let leaf = src
                .file_name()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::msg(format!("payload has no file name: {}", src.display())))?;
            let dst = dir.join(leaf);
            fs::copy(src, &dst).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    src.display(),
                    dst.display()
                ))
            })?;
            files.push(IndexFile {
                file_name: leaf.to_string(),
                sha256: file_digest(&dst)?,
            });
        }

        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(retention)
                .map_err(|e| Error::msg(format!("invalid retention: {e}")))?;
        idx.entries.push(IndexEntry {
            ref_id,
            name: name.to_string(),
            context: context.to_string(),
            created_at,
            expires_at,
            files,
        });
        idx.next_ref += 1;
        self.save_index(&idx)?;
        Ok(ref_id.to_string())
    }

    fn fetch(&self, ref_id: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let wanted: u64 = ref_id
            .trim()
            .parse()
            .map_err(|_| Error::msg(format!("invalid store ref '{ref_id}'")))?;
        let idx = self.load_index()?;
        let entry = idx
            .entries
            .iter()
            .find(|e| e.ref_id == wanted)
            .ok_or_else(|| Error::msg(format!("store ref {wanted} not found")))?;

        fs::create_dir_all(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let dir = self.blob_dir(wanted);
        let mut out = Vec::with_capacity(entry.files.len());
        for f in &entry.files {
            let src = dir.join(&f.file_name);
            let digest = file_digest(&src)?;
            if digest != f.sha256 {
                return Err(Error::msg(format!(
                    "digest mismatch for {} (ref {wanted})",
                    f.file_name
                )));
            }
            let dst = dest.join(&f.file_name);
            fs::copy(&src, &dst).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    src.display(),
                    dst.display()
                ))
            })?;
            out.push(dst);
        }
        Ok(out)
    }

    fn list(&self, name: &str) -> Result<Vec<BlobEntry>> {
        let idx = self.load_index()?;
        Ok(idx
            .entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| BlobEntry {
                ref_id: e.ref_id.to_string(),
                name: e.name.clone(),
                context: e.context.clone(),
                created_at: e.created_at,
                expires_at: e.expires_at,
            })
            .collect())
    }

    fn delete(&self, target: DeleteTarget<'_>) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let mut idx = self.load_index()?;
        let before = idx.entries.len();
        let kept: Vec<IndexEntry> = match target {
            DeleteTarget::Name(name) => {
                let (gone, kept): (Vec<_>, Vec<_>) =
                    idx.entries.into_iter().partition(|e| e.name == name);
                for e in &gone {
                    self.remove_entry_payload(e);
                }
                kept
            }
            DeleteTarget::Ref(raw) => {
                let wanted: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::msg(format!("invalid store ref '{raw}'")))?;
                let (gone, kept): (Vec<_>, Vec<_>) =
                    idx.entries.into_iter().partition(|e| e.ref_id == wanted);
                for e in &gone {
                    self.remove_entry_payload(e);
                }
                kept
            }
        };
        if kept.len() == before {
            // Nothing matched; absence is not an error for delete.
            idx.entries = kept;
            return Ok(());
        }
        idx.entries = kept;
        self.save_index(&idx)
    }
}

fn file_digest(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let body =
        fs::read(path).map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::msg(format!("invalid path for atomic write: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).expect("write payload");
        p
    }

    #[test]
    fn store_assigns_increasing_refs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        let p = payload_file(tmp.path(), "payload.tar", "one");
        let day = Duration::from_secs(86_400);
        let r1 = store.store("build-cache-x64", "run-1", &[p.clone()], day).unwrap();
        let r2 = store.store("build-cache-x64", "run-1", &[p], day).unwrap();
        assert_eq!(r1, "1");
        assert_eq!(r2, "2");
    }

    #[test]
    fn fetch_round_trips_payload_and_verifies_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        let p = payload_file(tmp.path(), "payload.tar", "round trip body");
        let r = store
            .store("build-cache-x86", "run-1", &[p], Duration::from_secs(60))
            .unwrap();

        let dest = tmp.path().join("fetched");
        let files = store.fetch(&r, &dest).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(
            fs::read_to_string(&files[0]).expect("read fetched"),
            "round trip body"
        );
    }

    #[test]
    fn fetch_detects_corrupted_payload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        let p = payload_file(tmp.path(), "payload.tar", "pristine");
        let r = store
            .store("build-cache-x64", "run-1", &[p], Duration::from_secs(60))
            .unwrap();

        // Flip the stored bytes behind the index's back.
        fs::write(store.blob_dir(1).join("payload.tar"), "tampered").expect("tamper");
        let err = store.fetch(&r, &tmp.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "{err}");
    }

    #[test]
    fn delete_by_name_removes_all_entries_for_that_name_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        let p = payload_file(tmp.path(), "payload.tar", "x");
        let day = Duration::from_secs(86_400);
        store.store("build-cache-x64", "run-1", &[p.clone()], day).unwrap();
        store.store("build-cache-x64", "run-2", &[p.clone()], day).unwrap();
        store.store("build-cache-arm", "run-1", &[p], day).unwrap();

        store.delete(DeleteTarget::Name("build-cache-x64")).unwrap();
        assert!(store.list("build-cache-x64").unwrap().is_empty());
        assert_eq!(store.list("build-cache-arm").unwrap().len(), 1);
        assert!(!store.blob_dir(1).exists());
        assert!(!store.blob_dir(2).exists());
    }

    #[test]
    fn delete_of_absent_name_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        store.delete(DeleteTarget::Name("never-published")).unwrap();
    }

    #[test]
    fn list_reports_context_and_expiry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::new(tmp.path().join("store"));
        let p = payload_file(tmp.path(), "payload.tar", "x");
        store
            .store("build-cache-arm", "run-9", &[p], Duration::from_secs(3600))
            .unwrap();

        let entries = store.list("build-cache-arm").unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.context, "run-9");
        assert!(e.expires_at > e.created_at);
        assert!(!e.expired(Utc::now()));
        assert!(e.expired(Utc::now() + chrono::Duration::hours(2)));
    }
}
