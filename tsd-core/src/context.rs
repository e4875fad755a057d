//! Per-run context
//!
//! Everything that used to be process-wide lives here and is passed down
//! explicitly: project config, runtime settings, the API quota tracker, the
//! progress channel and the cancellation flag.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::{CoreSettings, TsdConfig, CONFIG_FILE};
use crate::events::{CancelFlag, Reporter};
use crate::git::GithubRepo;
use crate::http::{CacheStore, RateLimiter, Transport};

#[derive(Clone)]
pub struct Context {
    pub config: TsdConfig,
    /// Location `config` was read from and is saved to
    pub config_path: PathBuf,
    pub settings: CoreSettings,
    pub repo: GithubRepo,
    /// Quota of the GitHub API client
    pub rate: RateLimiter,
    pub reporter: Reporter,
    pub cancel: CancelFlag,
}

impl Context {
    pub fn new(config: TsdConfig, config_path: PathBuf, settings: CoreSettings) -> Result<Self> {
        let repo = config
            .github_repo()
            .with_context(|| format!("Invalid repo in {}", config_path.display()))?;

        debug!(
            "Context for {}#{} (cache {}, mode {})",
            repo.slug(),
            repo.reference,
            settings.cache_dir.display(),
            settings.cache_mode
        );

        Ok(Self {
            config,
            config_path,
            settings,
            repo,
            rate: RateLimiter::new(),
            reporter: Reporter::silent(),
            cancel: CancelFlag::new(),
        })
    }

    /// Load `tsd.json` from `config_path` (or the working directory)
    pub fn load(config_path: Option<&Path>, settings: CoreSettings) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        let config = TsdConfig::load_from_path(&config_path)?;
        Self::new(config, config_path, settings)
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_rate(mut self, rate: RateLimiter) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_repo(mut self, repo: GithubRepo) -> Self {
        self.repo = repo;
        self
    }

    /// Directory the config's relative paths are resolved against
    pub fn base_dir(&self) -> PathBuf {
        match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn install_root(&self) -> PathBuf {
        self.config.install_root(&self.base_dir())
    }

    pub fn bundle_path(&self) -> Option<PathBuf> {
        self.config.bundle_path(&self.base_dir())
    }

    /// Cache for rate-limited API responses
    pub fn api_store(&self, transport: Arc<dyn Transport>) -> CacheStore {
        CacheStore::new(self.settings.api_cache_dir(), transport, self.rate.clone())
            .with_timeout(self.settings.timeout)
            .with_reporter(self.reporter.clone())
    }

    /// Cache for raw file content
    ///
    /// The raw host reports no quota, so it gets a tracker of its own that
    /// never blocks on the API's exhausted quota.
    pub fn raw_store(&self, transport: Arc<dyn Transport>) -> CacheStore {
        CacheStore::new(self.settings.raw_cache_dir(), transport, RateLimiter::new())
            .with_timeout(self.settings.timeout)
            .with_reporter(self.reporter.clone())
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save_to_path(&self.config_path)
    }
}
