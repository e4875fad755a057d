//! Header parsing on top of the content loader

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::content::ContentLoader;
use crate::error::Result;
use crate::events::{ProgressEvent, Reporter};
use crate::model::{DefInfo, Revision, RevisionId};

/// Parses and memoizes [`DefInfo`] per revision
pub struct InfoParser {
    loader: Arc<ContentLoader>,
    parsed: RwLock<HashMap<RevisionId, Arc<DefInfo>>>,
    reporter: Reporter,
    concurrency: usize,
}

impl InfoParser {
    pub fn new(loader: Arc<ContentLoader>, reporter: Reporter, concurrency: usize) -> Self {
        Self {
            loader,
            parsed: RwLock::new(HashMap::new()),
            reporter,
            concurrency: concurrency.max(1),
        }
    }

    /// Header info of `revision`, loading its content if needed
    ///
    /// Only loading can fail; a malformed header yields an invalid `DefInfo`.
    pub async fn parse_info(&self, revision: &Revision) -> Result<Arc<DefInfo>> {
        if let Some(info) = self.parsed.read().await.get(&revision.id) {
            return Ok(info.clone());
        }

        let bytes = self.loader.load_content(revision).await?;
        let info = Arc::new(DefInfo::parse(&String::from_utf8_lossy(&bytes)));
        if !info.is_valid() {
            warn!("{} has no valid definition header", revision);
        }
        debug!(
            "Parsed {}: {} reference(s)",
            revision,
            info.references.len()
        );

        self.reporter.emit(ProgressEvent::Parsed {
            path: revision.path.clone(),
            commit: revision.commit.clone(),
            valid: info.is_valid(),
        });

        // first writer wins so every caller sees the same Arc
        let mut parsed = self.parsed.write().await;
        Ok(parsed.entry(revision.id).or_insert(info).clone())
    }

    /// Parse many revisions, each distinct revision at most once
    ///
    /// The result lines up with `revisions`, duplicates included.
    pub async fn parse_info_bulk(&self, revisions: &[Revision]) -> Vec<Result<Arc<DefInfo>>> {
        let mut unique: Vec<&Revision> = Vec::new();
        let mut slots = Vec::with_capacity(revisions.len());
        for revision in revisions {
            match unique.iter().position(|r| r.id == revision.id) {
                Some(slot) => slots.push(slot),
                None => {
                    slots.push(unique.len());
                    unique.push(revision);
                }
            }
        }

        let outcomes: Vec<Result<Arc<DefInfo>>> = stream::iter(unique)
            .map(|revision| self.parse_info(revision))
            .buffered(self.concurrency)
            .collect()
            .await;

        slots.into_iter().map(|slot| outcomes[slot].clone()).collect()
    }

    /// Info parsed earlier in this run
    pub async fn info(&self, id: RevisionId) -> Option<Arc<DefInfo>> {
        self.parsed.read().await.get(&id).cloned()
    }
}
