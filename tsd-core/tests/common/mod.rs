//! Shared fixtures for integration tests
//!
//! [`FakeRepo`] scripts a GitHub repository on two stub transports (API and
//! raw content) so the whole engine runs without a network.
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};
use tsd_core::config::{CoreSettings, TsdConfig, CONFIG_FILE};
use tsd_core::git::GithubRepo;
use tsd_core::http::{RateLimiter, StubTransport};
use tsd_core::{Context, Engine, Reporter};

pub const HEAD: &str = "a0c0ef5a1c6b6f0d1e2f3a4b5c6d7e8f90a1b2c3";
pub const HEAD_DATE: &str = "2014-03-10T00:00:00Z";

static INIT: Once = Once::new();

/// Initialize logging for tests (only once per test run)
pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Declaration file body with a header referencing `refs`
pub fn declaration(name: &str, refs: &[&str]) -> String {
    let mut body = format!("// Type definitions for {name} 1.0\n// Project: http://example.com/{name}\n");
    for reference in refs {
        body.push_str(&format!("/// <reference path=\"{reference}\" />\n"));
    }
    body.push_str(&format!("\ndeclare module \"{name}\" {{}}\n"));
    body
}

pub struct FakeRepo {
    pub repo: GithubRepo,
    pub api: Arc<StubTransport>,
    pub raw: Arc<StubTransport>,
    files: Vec<String>,
}

impl Default for FakeRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRepo {
    pub fn new() -> Self {
        let defaults = TsdConfig::default();
        Self {
            repo: defaults.github_repo().unwrap(),
            api: Arc::new(StubTransport::new()),
            raw: Arc::new(StubTransport::new()),
            files: Vec::new(),
        }
    }

    /// A file in the tree at the branch head
    pub fn file(&mut self, path: &str, body: &str) -> &mut Self {
        self.files.push(path.to_string());
        self.raw.ok(&self.repo.raw_url(HEAD, path), body.as_bytes());
        self
    }

    /// A file in the tree whose content is never served
    pub fn listed(&mut self, path: &str) -> &mut Self {
        self.files.push(path.to_string());
        self
    }

    /// Content of `path` at an older commit
    pub fn file_at(&mut self, commit: &str, path: &str, body: &str) -> &mut Self {
        self.raw.ok(&self.repo.raw_url(commit, path), body.as_bytes());
        self
    }

    /// Commit history of `path`, newest first, as (sha, RFC 3339 date)
    pub fn history(&mut self, path: &str, commits: &[(&str, &str)]) -> &mut Self {
        let entries: Vec<serde_json::Value> = commits
            .iter()
            .map(|(sha, date)| {
                serde_json::json!({
                    "sha": sha,
                    "commit": {
                        "author": {"name": "Dev", "email": "dev@example.com", "date": date},
                        "message": format!("change {sha}")
                    },
                    "author": {"login": "dev"}
                })
            })
            .collect();
        self.api.ok(
            &self.repo.commits_url(path),
            serde_json::to_vec(&entries).unwrap().as_slice(),
        );
        self
    }

    /// Script branch and tree responses for the files added so far
    pub fn serve(&self) {
        let branch = serde_json::json!({
            "name": self.repo.reference,
            "commit": {"sha": HEAD, "commit": {"message": "head", "committer": {"date": HEAD_DATE}}}
        });
        self.api.respond(
            &self.repo.branch_url(),
            200,
            &[
                ("ETag", "\"branch-etag\""),
                ("X-RateLimit-Limit", "60"),
                ("X-RateLimit-Remaining", "59"),
                ("X-RateLimit-Reset", "4102444800"),
            ],
            serde_json::to_vec(&branch).unwrap().as_slice(),
        );

        let tree: Vec<serde_json::Value> = self
            .files
            .iter()
            .map(|path| serde_json::json!({"path": path, "type": "blob", "sha": format!("blob-{path}")}))
            .collect();
        let listing = serde_json::json!({"sha": HEAD, "truncated": false, "tree": tree});
        self.api.ok(
            &self.repo.tree_url(HEAD),
            serde_json::to_vec(&listing).unwrap().as_slice(),
        );
    }

    pub fn context(&self, dir: &Path) -> Context {
        let settings = CoreSettings::with_cache_dir(dir.join("cache"));
        Context::new(TsdConfig::default(), dir.join(CONFIG_FILE), settings).unwrap()
    }

    pub fn engine(&self, dir: &Path) -> Engine {
        self.engine_with(self.context(dir))
    }

    pub fn engine_with(&self, ctx: Context) -> Engine {
        Engine::with_transports(ctx, self.api.clone(), self.raw.clone())
    }

    pub fn engine_with_reporter(&self, dir: &Path, reporter: Reporter) -> Engine {
        self.engine_with(self.context(dir).with_reporter(reporter))
    }

    pub fn engine_with_rate(&self, dir: &Path, rate: RateLimiter) -> Engine {
        self.engine_with(self.context(dir).with_rate(rate))
    }
}
