use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::store::{DirStore, HttpStore, StoreClient};

fn default_working_dir() -> String {
    "build/src".into()
}

fn default_program() -> String {
    "python".into()
}

fn default_script() -> String {
    "build.py".into()
}

fn default_parallelism() -> u32 {
    2
}

fn default_package_dir() -> String {
    "build".into()
}

fn default_package_glob() -> String {
    "chromium-*".into()
}

fn default_store_kind() -> StoreKind {
    StoreKind::Dir
}

fn default_store_root() -> String {
    "build/store".into()
}

fn default_context_env() -> String {
    "STAGEHAND_RUN_ID".into()
}

fn default_settle_delay_secs() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_checkpoint_retention_secs() -> u64 {
    86_400
}

fn default_package_retention_secs() -> u64 {
    7 * 86_400
}

fn default_max_resume_age_secs() -> u64 {
    7 * 86_400
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub program: String,
    pub script: String,
    pub parallelism: u32,
    /// Optional best-effort dependency bootstrap run before the build,
    /// e.g. `["python", "-m", "pip", "install", "httplib2"]`.
    pub bootstrap: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            parallelism: default_parallelism(),
            bootstrap: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Directory scanned for completed build outputs.
    pub dir: String,
    /// File-name glob selecting the outputs. Only files directly in `dir`
    /// are considered, never directory contents below it.
    pub glob: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            dir: default_package_dir(),
            glob: default_package_glob(),
        }
    }
}

impl PackageConfig {
    /// Compiles the file-name glob (`*` and `?` wildcards) to a regex.
    pub fn matcher(&self) -> Result<Regex> {
        let glob = self.glob.trim();
        if glob.is_empty() {
            return Err(Error::msg("package.glob is empty"));
        }
        let mut pattern = String::with_capacity(glob.len() + 8);
        pattern.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');
        Regex::new(&pattern)
            .map_err(|e| Error::msg(format!("invalid package.glob '{}': {e}", self.glob)))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Dir,
    Http,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Root directory for the `dir` store kind.
    pub root: String,
    /// Identifier of the current execution context; entries published under
    /// other contexts are only eligible as historical fallbacks.
    pub context: Option<String>,
    pub context_env: String,
    pub http: HttpStoreConfig,
    pub max_resume_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            root: default_store_root(),
            context: None,
            context_env: default_context_env(),
            http: HttpStoreConfig::default(),
            max_resume_age_secs: default_max_resume_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait before packing a failed build's tree, so in-flight writes from
    /// the just-terminated process settle. A mitigation, not a guarantee.
    pub settle_delay_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_delay_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub checkpoint_secs: u64,
    pub package_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            checkpoint_secs: default_checkpoint_retention_secs(),
            package_secs: default_package_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// The build working tree: the build's cwd, the subject of checkpoint
    /// pack/unpack.
    pub working_dir: String,
    pub build: BuildConfig,
    pub package: PackageConfig,
    pub store: StoreConfig,
    pub timing: TimingConfig,
    pub retention: RetentionConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            build: BuildConfig::default(),
            package: PackageConfig::default(),
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl StageConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.timing.settle_delay_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.timing.retry_attempts,
            Duration::from_secs(self.timing.retry_delay_secs),
        )
    }

    pub fn checkpoint_retention(&self) -> Duration {
        Duration::from_secs(self.retention.checkpoint_secs)
    }

    pub fn package_retention(&self) -> Duration {
        Duration::from_secs(self.retention.package_secs)
    }

    pub fn working_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.working_dir)
    }

    pub fn package_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.package.dir)
    }

    /// Current execution context id: literal config, else the configured env
    /// var, else "local".
    pub fn context_id(&self) -> String {
        resolve_string_field(self.store.context.as_deref(), Some(&self.store.context_env))
            .unwrap_or_else(|| "local".to_string())
    }

    /// Builds the store client the configuration describes.
    pub fn store_client(&self) -> Result<StoreClient> {
        let max_age = Duration::from_secs(self.store.max_resume_age_secs);
        let store: Box<dyn crate::store::BlobStore> = match self.store.kind {
            StoreKind::Dir => Box::new(DirStore::new(&self.store.root)),
            StoreKind::Http => {
                let base_url = resolve_string_field(
                    Some(self.store.http.base_url.as_str()),
                    self.store.http.base_url_env.as_deref(),
                )
                .ok_or_else(|| Error::msg("store.http.base_url is empty"))?;
                let token = resolve_string_field(
                    self.store.http.token.as_deref(),
                    self.store.http.token_env.as_deref(),
                );
                Box::new(HttpStore::new(base_url, token))
            }
        };
        Ok(StoreClient::new(
            store,
            self.context_id(),
            self.retry_policy(),
            max_age,
        ))
    }
}

fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| {
        env_key
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|k| std::env::var(k).ok())
            .map(|v| v.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Loads a stage configuration; a missing file yields the defaults, a
/// malformed one is fatal.
pub fn load(path: &Path) -> Result<StageConfig> {
    if !path.is_file() {
        return Ok(StageConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    toml::from_str::<StageConfig>(&raw)
        .map_err(|e| Error::msg(format!("config parse error in {}: {e}", path.display())))
}
