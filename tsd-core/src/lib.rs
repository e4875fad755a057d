//! tsd library exports
//!
//! Fetches, caches and resolves declaration files from a GitHub repository
//! and installs a consistent set of them to disk.

pub mod bundle;
pub mod config;
pub mod content;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod git;
pub mod http;
pub mod index;
pub mod installer;
pub mod model;
pub mod parser;
pub mod resolver;

pub use bundle::{BundleManager, Manifest};
pub use config::{CoreSettings, TsdConfig};
pub use context::Context;
pub use engine::Engine;
pub use error::{Result, TsdError};
pub use events::{CancelFlag, FetchOutcome, ProgressEvent, Reporter};
pub use http::{CacheMode, RateLimiter, RateState};
pub use index::{IndexManager, Selector};
pub use installer::{InstallOptions, InstallPolicy, InstallResult, Installer, SkipReason};
pub use model::{Def, DefInfo, Revision};
pub use resolver::{Conflict, Resolution, ResolveError, ResolveOptions, Resolver};
