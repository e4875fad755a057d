//! Project configuration (`tsd.json`) and engine settings
//!
//! `tsd.json` names the upstream repository, where definitions are installed
//! and which revisions are pinned:
//!
//! ```json
//! {
//!   "repo": "borisyankov/DefinitelyTyped",
//!   "ref": "master",
//!   "path": "typings",
//!   "bundle": "typings/tsd.d.ts",
//!   "installed": {
//!     "jquery/jquery.d.ts": { "commit": "a0c0ef5..." }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::git::GithubRepo;
use crate::http::CacheMode;

/// Default config file name
pub const CONFIG_FILE: &str = "tsd.json";

const DEFAULT_REPO: &str = "borisyankov/DefinitelyTyped";
const DEFAULT_REF: &str = "master";
const DEFAULT_PATH: &str = "typings";
const DEFAULT_BUNDLE: &str = "typings/tsd.d.ts";

/// Environment variables consulted for a GitHub token, in order
pub const TOKEN_ENV_VARS: &[&str] = &["TSD_GITHUB_TOKEN", "GITHUB_TOKEN"];

/// Contents of `tsd.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsdConfig {
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(rename = "ref", default = "default_ref")]
    pub reference: String,
    /// Install root, relative to the config file
    #[serde(default = "default_path")]
    pub path: String,
    /// Bundle file, relative to the config file
    #[serde(default)]
    pub bundle: Option<String>,
    /// Pinned manifest: canonical path to installed revision
    #[serde(default)]
    pub installed: BTreeMap<String, InstalledEntry>,
}

/// One pinned manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub commit: String,
}

fn default_repo() -> String {
    DEFAULT_REPO.to_string()
}

fn default_ref() -> String {
    DEFAULT_REF.to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

impl Default for TsdConfig {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            reference: default_ref(),
            path: default_path(),
            bundle: Some(DEFAULT_BUNDLE.to_string()),
            installed: BTreeMap::new(),
        }
    }
}

impl TsdConfig {
    /// Load config or return the default if the file does not exist
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    pub fn github_repo(&self) -> Result<GithubRepo> {
        Ok(GithubRepo::parse(&self.repo, &self.reference)?)
    }

    /// Install root, resolved against the directory holding the config
    pub fn install_root(&self, base: &Path) -> PathBuf {
        base.join(&self.path)
    }

    pub fn bundle_path(&self, base: &Path) -> Option<PathBuf> {
        self.bundle.as_ref().map(|b| base.join(b))
    }

    /// Add or update a pinned entry
    pub fn add_installed(&mut self, path: &str, commit: &str) {
        self.installed.insert(
            path.to_string(),
            InstalledEntry {
                commit: commit.to_string(),
            },
        );
    }

    /// Pins as a plain path to commit map
    pub fn pins(&self) -> BTreeMap<String, String> {
        self.installed
            .iter()
            .map(|(path, entry)| (path.clone(), entry.commit.clone()))
            .collect()
    }
}

/// Runtime settings that are not part of the project file
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub cache_dir: PathBuf,
    pub cache_mode: CacheMode,
    pub timeout: Duration,
    pub token: Option<String>,
    pub user_agent: String,
    /// Upper bound on concurrent content fetches during bulk operations
    pub concurrency: usize,
}

impl CoreSettings {
    /// Settings with the platform cache dir and a token from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cache_dir: default_cache_dir()?,
            token: token_from_env(),
            ..Self::with_cache_dir(PathBuf::new())
        })
    }

    /// Settings rooted at an explicit cache directory, no token
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            cache_mode: CacheMode::Default,
            timeout: Duration::from_secs(30),
            token: None,
            user_agent: format!("tsd/{}", env!("CARGO_PKG_VERSION")),
            concurrency: 8,
        }
    }

    pub fn api_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("api")
    }

    pub fn raw_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("raw")
    }
}

/// Platform cache directory for tsd
pub fn default_cache_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("org", "definitelytyped", "tsd")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .or_else(|| dirs::cache_dir().map(|d| d.join("tsd")))
        .context("Could not determine cache directory")
}

/// First non-empty token from [`TOKEN_ENV_VARS`]
pub fn token_from_env() -> Option<String> {
    TOKEN_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
