//! Writing resolved definitions to disk
//!
//! Each file is written on its own: a failure or conflict on one file never
//! stops the others, and nothing is rolled back.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content::ContentLoader;
use crate::error::{Result, TsdError};
use crate::events::{CancelFlag, ProgressEvent, Reporter};
use crate::http::checksum;
use crate::model::Revision;

/// What to do when the destination file already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallPolicy {
    /// Leave existing files alone
    #[default]
    SkipExisting,
    /// Replace existing files
    Overwrite,
    /// Keep identical files, skip and report differing ones
    FailOnDiffer,
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub policy: InstallPolicy,
    /// Do everything except the final write
    pub dry_run: bool,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum SkipReason {
    /// File exists and the policy is to skip
    Exists,
    /// File exists with the same content
    Unchanged,
    /// File exists with different content
    Conflict { local: String, remote: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Exists => f.write_str("exists"),
            SkipReason::Unchanged => f.write_str("unchanged"),
            SkipReason::Conflict { local, remote } => {
                write!(f, "local content differs ({local} != {remote})")
            }
        }
    }
}

/// Outcome of an install run, keyed by destination path
#[derive(Debug, Clone, Default)]
pub struct InstallResult {
    pub written: BTreeMap<PathBuf, Revision>,
    pub skipped: BTreeMap<PathBuf, (Revision, SkipReason)>,
    /// Files whose content could not be loaded or written
    pub failed: BTreeMap<PathBuf, (Revision, TsdError)>,
    pub dry_run: bool,
}

impl InstallResult {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = (&PathBuf, &Revision)> {
        self.skipped
            .iter()
            .filter(|(_, (_, reason))| matches!(reason, SkipReason::Conflict { .. }))
            .map(|(dest, (revision, _))| (dest, revision))
    }
}

enum FileOutcome {
    Written,
    Skipped(SkipReason),
    Failed(TsdError),
}

/// Installs revisions below an install root
pub struct Installer {
    loader: Arc<ContentLoader>,
    root: PathBuf,
    reporter: Reporter,
    concurrency: usize,
}

impl Installer {
    pub fn new(loader: Arc<ContentLoader>, root: impl Into<PathBuf>, reporter: Reporter) -> Self {
        Self {
            loader,
            root: root.into(),
            reporter,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install every revision
    ///
    /// Returns `Err(Cancelled)` if the run was cancelled; files written before
    /// that stay on disk.
    pub async fn install(&self, revisions: &[Revision], options: &InstallOptions) -> Result<InstallResult> {
        let outcomes: Vec<(PathBuf, Revision, FileOutcome)> = stream::iter(revisions)
            .map(|revision| async move {
                let dest = self.install_path(&revision.path);
                if options.cancel.is_cancelled() {
                    return None;
                }
                let outcome = self.install_one(revision, &dest, options).await;
                Some((dest, revision.clone(), outcome))
            })
            .buffered(self.concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        options.cancel.check()?;

        let mut result = InstallResult {
            dry_run: options.dry_run,
            ..InstallResult::default()
        };
        for (dest, revision, outcome) in outcomes {
            match outcome {
                FileOutcome::Written => {
                    result.written.insert(dest, revision);
                }
                FileOutcome::Skipped(reason) => {
                    result.skipped.insert(dest, (revision, reason));
                }
                FileOutcome::Failed(error) => {
                    warn!("Failed to install {}: {}", revision, error);
                    result.failed.insert(dest, (revision, error));
                }
            }
        }

        info!(
            "{} {} file(s), skipped {}, failed {}",
            if options.dry_run { "Would write" } else { "Wrote" },
            result.written.len(),
            result.skipped.len(),
            result.failed.len()
        );
        Ok(result)
    }

    async fn install_one(&self, revision: &Revision, dest: &Path, options: &InstallOptions) -> FileOutcome {
        let exists = match tokio::fs::try_exists(dest).await {
            Ok(exists) => exists,
            Err(e) => return FileOutcome::Failed(TsdError::io(dest, e)),
        };

        if exists && options.policy == InstallPolicy::SkipExisting {
            return self.skip(revision, dest, SkipReason::Exists);
        }

        let content = match self.loader.load_content(revision).await {
            Ok(content) => content,
            Err(e) => return FileOutcome::Failed(e),
        };

        if exists && options.policy == InstallPolicy::FailOnDiffer {
            let local = match tokio::fs::read(dest).await {
                Ok(bytes) => checksum(&bytes),
                Err(e) => return FileOutcome::Failed(TsdError::io(dest, e)),
            };
            let remote = checksum(&content);
            let reason = if local == remote {
                SkipReason::Unchanged
            } else {
                SkipReason::Conflict { local, remote }
            };
            return self.skip(revision, dest, reason);
        }

        if !options.dry_run {
            if let Err(e) = write_file(dest, &content).await {
                return FileOutcome::Failed(e);
            }
        }

        debug!("{} -> {}", revision, dest.display());
        self.reporter.emit(ProgressEvent::Written {
            dest: dest.to_path_buf(),
            path: revision.path.clone(),
            dry_run: options.dry_run,
        });
        FileOutcome::Written
    }

    fn skip(&self, revision: &Revision, dest: &Path, reason: SkipReason) -> FileOutcome {
        debug!("Skipping {}: {}", dest.display(), reason);
        self.reporter.emit(ProgressEvent::Skipped {
            dest: dest.to_path_buf(),
            path: revision.path.clone(),
            reason: reason.to_string(),
        });
        FileOutcome::Skipped(reason)
    }

    /// Destination of a canonical path
    pub fn install_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .fold(self.root.clone(), |dest, segment| dest.join(segment))
    }

    /// Canonical paths of every declaration file below the install root
    pub fn list_installed(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut installed = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                TsdError::io(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if path.ends_with(".d.ts") {
                installed.push(path);
            }
        }

        installed.sort();
        Ok(installed)
    }
}

async fn write_file(dest: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TsdError::io(parent, e))?;
    }
    tokio::fs::write(dest, content)
        .await
        .map_err(|e| TsdError::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GithubRepo;
    use crate::http::{CacheMode, CacheStore, RateLimiter, StubTransport};
    use crate::model::Registry;
    use tempfile::TempDir;

    struct Fixture {
        _cache: TempDir,
        target: TempDir,
        installer: Installer,
        revisions: Vec<Revision>,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let cache = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let stub = Arc::new(StubTransport::new());
        let repo = GithubRepo::new("o", "r", "master");
        let mut registry = Registry::new();
        let mut revisions = Vec::new();
        for (path, body) in files {
            stub.ok(&repo.raw_url("c1", path), body.as_bytes());
            let def = registry.procure_def(path);
            let id = registry.procure_revision(def, "c1", None, None);
            revisions.push(registry.revision(id).unwrap().clone());
        }
        let loader = Arc::new(ContentLoader::new(
            CacheStore::new(cache.path(), stub, RateLimiter::new()),
            repo,
            CacheMode::Default,
        ));
        let installer = Installer::new(loader, target.path(), Reporter::silent());
        Fixture {
            _cache: cache,
            target,
            installer,
            revisions,
        }
    }

    #[tokio::test]
    async fn test_install_writes_every_file() {
        let fx = fixture(&[("a/a.d.ts", "declare var a;"), ("b/b.d.ts", "declare var b;")]);

        let result = fx
            .installer
            .install(&fx.revisions, &InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(result.written.len(), 2);
        assert!(result.is_ok());
        let written = std::fs::read_to_string(fx.target.path().join("a/a.d.ts")).unwrap();
        assert_eq!(written, "declare var a;");
        assert_eq!(
            fx.installer.list_installed().unwrap(),
            vec!["a/a.d.ts".to_string(), "b/b.d.ts".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let fx = fixture(&[("a/a.d.ts", "declare var a;")]);
        let options = InstallOptions {
            dry_run: true,
            ..InstallOptions::default()
        };

        let result = fx.installer.install(&fx.revisions, &options).await.unwrap();

        assert!(result.dry_run);
        assert_eq!(result.written.len(), 1);
        assert!(!fx.target.path().join("a/a.d.ts").exists());
    }

    #[tokio::test]
    async fn test_policies_on_existing_files() {
        let fx = fixture(&[("a/a.d.ts", "remote a"), ("b/b.d.ts", "same b")]);
        std::fs::create_dir_all(fx.target.path().join("a")).unwrap();
        std::fs::create_dir_all(fx.target.path().join("b")).unwrap();
        std::fs::write(fx.target.path().join("a/a.d.ts"), "local a").unwrap();
        std::fs::write(fx.target.path().join("b/b.d.ts"), "same b").unwrap();

        let skip = fx
            .installer
            .install(&fx.revisions, &InstallOptions::default())
            .await
            .unwrap();
        assert_eq!(skip.skipped.len(), 2);
        assert!(skip
            .skipped
            .values()
            .all(|(_, reason)| *reason == SkipReason::Exists));

        let strict = InstallOptions {
            policy: InstallPolicy::FailOnDiffer,
            ..InstallOptions::default()
        };
        let result = fx.installer.install(&fx.revisions, &strict).await.unwrap();
        assert!(result.written.is_empty());
        let a = &result.skipped[&fx.target.path().join("a/a.d.ts")];
        assert!(matches!(a.1, SkipReason::Conflict { .. }));
        let b = &result.skipped[&fx.target.path().join("b/b.d.ts")];
        assert_eq!(b.1, SkipReason::Unchanged);
        assert_eq!(result.conflicts().count(), 1);
        assert_eq!(
            std::fs::read_to_string(fx.target.path().join("a/a.d.ts")).unwrap(),
            "local a"
        );

        let overwrite = InstallOptions {
            policy: InstallPolicy::Overwrite,
            ..InstallOptions::default()
        };
        let result = fx.installer.install(&fx.revisions, &overwrite).await.unwrap();
        assert_eq!(result.written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(fx.target.path().join("a/a.d.ts")).unwrap(),
            "remote a"
        );
    }

    #[tokio::test]
    async fn test_missing_content_fails_only_that_file() {
        let mut fx = fixture(&[("a/a.d.ts", "declare var a;")]);
        // the loader caches by revision id, so keep ids distinct from the fixture's
        let mut registry = Registry::new();
        let a = registry.procure_def("a/a.d.ts");
        registry.procure_revision(a, "c1", None, None);
        let def = registry.procure_def("gone/gone.d.ts");
        let id = registry.procure_revision(def, "c1", None, None);
        fx.revisions.push(registry.revision(id).unwrap().clone());

        let result = fx
            .installer
            .install(&fx.revisions, &InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(result.written.len(), 1);
        assert_eq!(result.failed.len(), 1);
        assert!(!result.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_destination_fails_that_file() {
        let fx = fixture(&[("a/a.d.ts", "declare var a;")]);
        // a plain file where the directory should be
        std::fs::write(fx.target.path().join("a"), "not a directory").unwrap();
        let options = InstallOptions {
            dry_run: true,
            ..InstallOptions::default()
        };

        let result = fx.installer.install(&fx.revisions, &options).await.unwrap();

        assert!(result.written.is_empty());
        let (_, error) = &result.failed[&fx.target.path().join("a/a.d.ts")];
        assert!(matches!(error, TsdError::Io { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_install() {
        let fx = fixture(&[("a/a.d.ts", "declare var a;")]);
        let options = InstallOptions::default();
        options.cancel.cancel();

        let err = fx.installer.install(&fx.revisions, &options).await.unwrap_err();
        assert!(matches!(err, TsdError::Cancelled));
        assert!(!fx.target.path().join("a/a.d.ts").exists());
    }
}
