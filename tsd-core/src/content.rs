//! Raw content of a revision

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::Result;
use crate::git::GithubRepo;
use crate::http::{CacheMode, CacheStore};
use crate::model::{Revision, RevisionId};

/// Loads file bodies through the raw content cache
///
/// Loaded bytes are kept per revision for the lifetime of the loader, so a
/// revision is read from the cache at most once per run.
pub struct ContentLoader {
    store: CacheStore,
    repo: GithubRepo,
    mode: CacheMode,
    loaded: RwLock<HashMap<RevisionId, Bytes>>,
}

impl ContentLoader {
    pub fn new(store: CacheStore, repo: GithubRepo, mode: CacheMode) -> Self {
        Self {
            store,
            repo,
            mode,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load_content(&self, revision: &Revision) -> Result<Bytes> {
        if let Some(bytes) = self.loaded.read().await.get(&revision.id) {
            trace!("Content of {} already loaded", revision);
            return Ok(bytes.clone());
        }

        let request = self.repo.raw_request(&revision.commit, &revision.path);
        let entry = self.store.fetch(&request, self.mode).await?;

        self.loaded
            .write()
            .await
            .insert(revision.id, entry.body.clone());
        Ok(entry.body)
    }

    /// Content already loaded in this run, if any
    pub async fn loaded(&self, id: RevisionId) -> Option<Bytes> {
        self.loaded.read().await.get(&id).cloned()
    }
}
