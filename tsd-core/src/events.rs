//! Progress events and cooperative cancellation
//!
//! Engine components never print. They push [`ProgressEvent`]s into an
//! optional channel and the presentation layer decides what to show.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{Result, TsdError};
use crate::http::RateState;

/// How a fetch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchOutcome {
    /// Served from disk without a network call
    Cached,
    /// Conditional GET said the stored body is current
    NotModified,
    /// Full body downloaded
    Downloaded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProgressEvent {
    IndexLoaded {
        commit: String,
        defs: usize,
    },
    Fetched {
        url: String,
        outcome: FetchOutcome,
    },
    RateLimit(RateState),
    Parsed {
        path: String,
        commit: String,
        valid: bool,
    },
    Resolved {
        path: String,
        commit: String,
    },
    Conflict {
        path: String,
        referrer: Option<String>,
        requested: String,
        winner: String,
    },
    Written {
        dest: PathBuf,
        path: String,
        dry_run: bool,
    },
    Skipped {
        dest: PathBuf,
        path: String,
        reason: String,
    },
}

/// Optional sink for progress events
///
/// A reporter without a channel drops everything.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl Reporter {
    pub fn silent() -> Self {
        Self::default()
    }

    /// Create a reporter and the receiving end for the presentation layer
    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // a closed receiver just means nobody is listening anymore
            let _ = tx.send(event);
        }
    }
}

/// Cancellation checked between individual file operations
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TsdError::Cancelled)
        } else {
            Ok(())
        }
    }
}
