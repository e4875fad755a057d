//! Registry of known definitions, fed from the repository tree
//!
//! The index is the recursive git tree of the configured branch head. Every
//! declaration file in it becomes a [`Def`] whose head revision is read at
//! that commit. Commit history per file is fetched on demand.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, TsdError};
use crate::events::{ProgressEvent, Reporter};
use crate::git::{BranchInfo, CommitEntry, GithubRepo, TreeListing};
use crate::http::{CacheMode, CacheStore};
use crate::model::{Def, DefId, Registry, Revision, RevisionId};

/// How a user-supplied target selects definitions
#[derive(Debug, Clone)]
pub enum Selector {
    /// One canonical path
    Exact(String),
    /// Everything below a directory (`jquery/`)
    Prefix(String),
    /// Shell-style pattern over full paths (`jquery/*.d.ts`)
    Glob(glob::Pattern),
    /// Bare word: a project directory or a file stem
    Name(String),
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim().trim_start_matches("./").trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(TsdError::Config("Empty selector".to_string()));
        }

        if trimmed.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(trimmed)
                .map_err(|e| TsdError::Config(format!("Invalid pattern '{input}': {e}")))?;
            return Ok(Selector::Glob(pattern));
        }
        if trimmed.ends_with('/') {
            return Ok(Selector::Prefix(trimmed.to_string()));
        }
        if trimmed.contains('/') {
            let path = if trimmed.ends_with(".d.ts") {
                trimmed.to_string()
            } else {
                format!("{trimmed}.d.ts")
            };
            return Ok(Selector::Exact(path));
        }
        Ok(Selector::Name(
            trimmed.strip_suffix(".d.ts").unwrap_or(trimmed).to_string(),
        ))
    }

    pub fn matches(&self, def: &Def) -> bool {
        match self {
            Selector::Exact(path) => def.path == *path,
            Selector::Prefix(prefix) => def.path.starts_with(prefix.as_str()),
            Selector::Glob(pattern) => pattern.matches(&def.path),
            Selector::Name(name) => def.project() == name || def.name() == name,
        }
    }
}

/// Owns the registry and keeps it in sync with the upstream tree
pub struct IndexManager {
    store: CacheStore,
    repo: GithubRepo,
    mode: CacheMode,
    registry: Arc<RwLock<Registry>>,
    reporter: Reporter,
    head_commit: RwLock<Option<String>>,
}

impl IndexManager {
    pub fn new(store: CacheStore, repo: GithubRepo, mode: CacheMode, reporter: Reporter) -> Self {
        Self {
            store,
            repo,
            mode,
            registry: Arc::new(RwLock::new(Registry::new())),
            reporter,
            head_commit: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    /// Branch head the index was last loaded at
    pub async fn head_commit(&self) -> Option<String> {
        self.head_commit.read().await.clone()
    }

    /// Fetch branch head and tree, then register every declaration file
    ///
    /// Existing Defs and their history are kept; a newer head is pushed to
    /// the front of each history.
    pub async fn load(&self) -> Result<()> {
        let branch: BranchInfo = self
            .store
            .fetch(
                &self.repo.api_request(self.repo.branch_url()),
                moving_mode(self.mode),
            )
            .await?
            .json()?;
        let commit = branch.head_sha().to_string();
        let date = branch.head_date();

        let tree: TreeListing = self
            .store
            .fetch(&self.repo.api_request(self.repo.tree_url(&commit)), self.mode)
            .await?
            .json()?;
        if tree.truncated {
            warn!(
                "Tree listing for {}@{} is truncated, some definitions are missing",
                self.repo.slug(),
                commit
            );
        }

        let count = {
            let mut registry = self.registry.write().await;
            let mut count = 0;
            for item in tree.tree.iter().filter(|i| i.is_declaration()) {
                let def = registry.procure_def(&item.path);
                let rev = registry.procure_revision(def, &commit, date, Some(item.sha.as_str()));
                registry.set_head(rev);
                count += 1;
            }
            count
        };

        info!("Loaded {} definitions from {}@{}", count, self.repo.slug(), commit);
        self.reporter.emit(ProgressEvent::IndexLoaded {
            commit: commit.clone(),
            defs: count,
        });
        *self.head_commit.write().await = Some(commit);
        Ok(())
    }

    /// Registered Def for `path`
    pub async fn resolve_path(&self, path: &str) -> Result<Def> {
        self.find(path).await.ok_or_else(|| TsdError::NotFound {
            path: path.to_string(),
        })
    }

    pub async fn find(&self, path: &str) -> Option<Def> {
        self.registry.read().await.def_by_path(path).cloned()
    }

    /// Every Def matched by any of `selectors`, ordered by path
    pub async fn query(&self, selectors: &[Selector]) -> Vec<Def> {
        let registry = self.registry.read().await;
        registry
            .defs()
            .into_iter()
            .filter(|def| selectors.iter().any(|s| s.matches(def)))
            .cloned()
            .collect()
    }

    /// Fetch the commit history of `path` and merge it into the registry
    pub async fn load_history(&self, path: &str) -> Result<Def> {
        let def = self.resolve_path(path).await?;

        let commits: Vec<CommitEntry> = self
            .store
            .fetch(
                &self.repo.api_request(self.repo.commits_url(path)),
                moving_mode(self.mode),
            )
            .await?
            .json()?;
        debug!("{} commit(s) touch {}", commits.len(), path);

        let mut registry = self.registry.write().await;
        let mut revisions = Vec::with_capacity(commits.len());
        for entry in &commits {
            let rev = registry.procure_revision(def.id, &entry.sha, entry.date(), None);
            registry.set_commit_info(rev, entry.commit_info());
            revisions.push(rev);
        }
        registry.merge_history(def.id, &revisions);

        registry.def(def.id).cloned().ok_or(TsdError::NotFound {
            path: path.to_string(),
        })
    }

    /// Revision of `path` at `commit`
    ///
    /// Full and abbreviated shas are looked up in the history, loading it once
    /// if needed, so either spelling yields the same dated revision. A full
    /// sha the history does not list is still accepted, undated, since raw
    /// content is addressable at any commit.
    pub async fn pinned_revision(&self, path: &str, commit: &str) -> Result<Revision> {
        let def = self.resolve_path(path).await?;

        if let Some(rev) = self.lookup(def.id, commit).await {
            return Ok(rev);
        }
        if !def.history_loaded {
            self.load_history(path).await?;
            if let Some(rev) = self.lookup(def.id, commit).await {
                return Ok(rev);
            }
        }
        if is_full_sha(commit) {
            let mut registry = self.registry.write().await;
            let id = registry.procure_revision(def.id, commit, None, None);
            return registry
                .revision(id)
                .cloned()
                .ok_or_else(|| unknown(path, commit));
        }
        Err(unknown(path, commit))
    }

    /// Make sure `def` can answer [`revision_as_of`](Self::revision_as_of)
    /// for `as_of`
    ///
    /// Dates at or after the head never need the history; older ones load it.
    pub async fn prepare_as_of(
        &self,
        def: &Def,
        as_of: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let Some(as_of) = as_of else {
            return Ok(());
        };
        if def.history_loaded {
            return Ok(());
        }
        let head_date = match def.head {
            Some(head) => self.revision(head).await.and_then(|rev| rev.date),
            None => None,
        };
        if head_date.is_some_and(|head_date| as_of >= head_date) {
            return Ok(());
        }
        self.load_history(&def.path).await.map(|_| ())
    }

    async fn lookup(&self, def: DefId, commit: &str) -> Option<Revision> {
        let registry = self.registry.read().await;
        registry
            .find_revision(def, commit)
            .and_then(|id| registry.revision(id).cloned())
    }

    /// Newest revision of `def` not younger than `as_of`, else its head
    pub async fn revision_as_of(
        &self,
        def: DefId,
        as_of: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Option<Revision> {
        let registry = self.registry.read().await;
        registry
            .revision_as_of(def, as_of)
            .and_then(|id| registry.revision(id).cloned())
    }

    pub async fn revision(&self, id: RevisionId) -> Option<Revision> {
        self.registry.read().await.revision(id).cloned()
    }

    /// History of a Def as revisions, newest first
    pub async fn history(&self, def: DefId) -> Vec<Revision> {
        let registry = self.registry.read().await;
        registry
            .def(def)
            .map(|d| {
                d.history
                    .iter()
                    .filter_map(|id| registry.revision(*id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered Defs per project directory
    pub async fn projects(&self) -> BTreeMap<String, usize> {
        let registry = self.registry.read().await;
        let mut projects = BTreeMap::new();
        for def in registry.defs() {
            *projects.entry(def.project().to_string()).or_insert(0) += 1;
        }
        projects
    }
}

/// Branch heads and history lists move; revalidate them instead of trusting disk
fn moving_mode(mode: CacheMode) -> CacheMode {
    match mode {
        CacheMode::Default => CacheMode::Revalidate,
        other => other,
    }
}

fn is_full_sha(commit: &str) -> bool {
    commit.len() == 40 && commit.chars().all(|c| c.is_ascii_hexdigit())
}

fn unknown(path: &str, commit: &str) -> TsdError {
    TsdError::UnknownRevision {
        path: path.to_string(),
        commit: commit.to_string(),
    }
}
