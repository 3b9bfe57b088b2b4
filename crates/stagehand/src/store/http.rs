use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{BlobEntry, BlobStore, DeleteTarget};

/// REST blob store. The service owns ref assignment; everything else is the
/// same dumb four-operation surface the local store exposes.
///
/// Wire layout: `POST {base}/blobs` registers an upload and returns the ref,
/// payload bytes go to `PUT {base}/blobs/{ref}/files/{name}`, listing is
/// `GET {base}/blobs?name=`, deletion is `DELETE` on either form.
pub struct HttpStore {
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBlobReq<'a> {
    name: &'a str,
    context: &'a str,
    retention_secs: u64,
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateBlobResp {
    #[serde(rename = "ref")]
    ref_id: String,
}

#[derive(Debug, Deserialize)]
struct BlobMetaResp {
    #[serde(rename = "ref")]
    ref_id: String,
    name: String,
    context: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    files: Vec<String>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn blob_url(&self, ref_id: &str) -> String {
        format!("{}/blobs/{}", self.base_url, ref_id)
    }
}

impl BlobStore for HttpStore {
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
        let client = self.client()?;

        let mut file_names = Vec::with_capacity(payload.len());
        for p in payload {
            let leaf = p
                .file_name()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::msg(format!("payload has no file name: {}", p.display())))?;
            file_names.push(leaf.to_string());
        }

        let create = CreateBlobReq {
            name,
            context,
            retention_secs: retention.as_secs(),
            files: file_names.clone(),
        };
        let res = self
            .authed(client.post(format!("{}/blobs", self.base_url)))
            .json(&create)
            .send()
            .map_err(|e| Error::msg(format!("HTTP store create failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP store create failed with status {}",
                res.status()
            )));
        }
        let created: CreateBlobResp = res
            .json()
            .map_err(|e| Error::msg(format!("HTTP store create response invalid: {e}")))?;

        for (p, leaf) in payload.iter().zip(&file_names) {
            let body = fs::read(p)
                .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))?;
            let res = self
                .authed(client.put(format!("{}/files/{}", self.blob_url(&created.ref_id), leaf)))
                .body(body)
                .send()
                .map_err(|e| Error::msg(format!("HTTP upload failed: {e}")))?;
            if !res.status().is_success() {
                return Err(Error::msg(format!(
                    "HTTP upload of {leaf} failed with status {}",
                    res.status()
                )));
            }
        }

        Ok(created.ref_id)
    }

    fn fetch(&self, ref_id: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let client = self.client()?;
        let res = self
            .authed(client.get(self.blob_url(ref_id)))
            .send()
            .map_err(|e| Error::msg(format!("HTTP fetch failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::msg(format!("store ref {ref_id} not found")));
        }
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP fetch failed with status {}",
                res.status()
            )));
        }
        let meta: BlobMetaResp = res
            .json()
            .map_err(|e| Error::msg(format!("HTTP fetch response invalid: {e}")))?;

        fs::create_dir_all(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let mut out = Vec::with_capacity(meta.files.len());
        for leaf in &meta.files {
            let res = self
                .authed(client.get(format!("{}/files/{}", self.blob_url(ref_id), leaf)))
                .send()
                .map_err(|e| Error::msg(format!("HTTP download failed: {e}")))?;
            if !res.status().is_success() {
                return Err(Error::msg(format!(
                    "HTTP download of {leaf} failed with status {}",
                    res.status()
                )));
            }
            let bytes = res
                .bytes()
                .map_err(|e| Error::msg(format!("HTTP body read failed: {e}")))?;
            let path = dest.join(leaf);
            fs::write(&path, &bytes)
                .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
            out.push(path);
        }
        Ok(out)
    }

    fn list(&self, name: &str) -> Result<Vec<BlobEntry>> {
        let client = self.client()?;
        let res = self
            .authed(client.get(format!("{}/blobs", self.base_url)))
            .query(&[("name", name)])
            .send()
            .map_err(|e| Error::msg(format!("HTTP list failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP list failed with status {}",
                res.status()
            )));
        }
        let entries: Vec<BlobMetaResp> = res
            .json()
            .map_err(|e| Error::msg(format!("HTTP list response invalid: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| BlobEntry {
                ref_id: e.ref_id,
                name: e.name,
                context: e.context,
                created_at: e.created_at,
                expires_at: e.expires_at,
            })
            .collect())
    }

    fn delete(&self, target: DeleteTarget<'_>) -> Result<()> {
        let client = self.client()?;
        let req = match target {
            DeleteTarget::Ref(r) => self.authed(client.delete(self.blob_url(r))),
            DeleteTarget::Name(n) => self
                .authed(client.delete(format!("{}/blobs", self.base_url)))
                .query(&[("name", n)]),
        };
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("HTTP delete failed: {e}")))?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::msg(format!(
            "HTTP delete failed with status {}",
            res.status()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let s = HttpStore::new("https://blobs.example/api/", None);
        assert_eq!(s.blob_url("42"), "https://blobs.example/api/blobs/42");
    }
}
