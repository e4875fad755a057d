//! GitHub repository addressing and API payloads
//!
//! Two hosts are involved: the REST API (branch, tree, commit history) which
//! is rate limited, and the raw content host which serves file bodies at a
//! commit and is not.

mod model;

pub use model::{
    BranchCommit, BranchInfo, CommitEntry, GitCommit, GitPerson, GithubUser, TreeItem, TreeListing,
};

use crate::error::{Result, TsdError};
use crate::http::CacheRequest;
use url::{form_urlencoded, Url};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";

const API_ACCEPT: &str = "application/vnd.github.v3+json";

/// A repository at a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub name: String,
    /// Branch the index is read from
    pub reference: String,
    api_base: String,
    raw_base: String,
}

impl GithubRepo {
    pub fn new(owner: &str, name: &str, reference: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            reference: reference.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            raw_base: DEFAULT_RAW_BASE.to_string(),
        }
    }

    /// Parse `owner/name`
    pub fn parse(slug: &str, reference: &str) -> Result<Self> {
        match slug.trim().split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name, reference))
            }
            _ => Err(TsdError::Config(format!(
                "Repository must be given as owner/name (got: {slug})"
            ))),
        }
    }

    /// Point at other hosts (GitHub Enterprise, mirrors, test servers)
    pub fn with_hosts(mut self, api_base: &str, raw_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.raw_base = raw_base.trim_end_matches('/').to_string();
        self
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Whether `url` is served by the API host
    pub fn is_api_url(&self, url: &str) -> bool {
        match (Url::parse(url), Url::parse(&self.api_base)) {
            (Ok(url), Ok(api)) => {
                url.origin() == api.origin()
                    && url.path().starts_with(api.path().trim_end_matches('/'))
            }
            _ => false,
        }
    }

    fn repo_api(&self) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.owner, self.name)
    }

    pub fn branch_url(&self) -> String {
        format!("{}/branches/{}", self.repo_api(), self.reference)
    }

    pub fn tree_url(&self, commit: &str) -> String {
        format!("{}/git/trees/{}?recursive=1", self.repo_api(), commit)
    }

    pub fn commits_url(&self, path: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("path", path)
            .append_pair("sha", &self.reference)
            .finish();
        format!("{}/commits?{}", self.repo_api(), query)
    }

    pub fn rate_limit_url(&self) -> String {
        format!("{}/rate_limit", self.api_base)
    }

    pub fn raw_url(&self, commit: &str, path: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_base, self.owner, self.name, commit, path
        )
    }

    pub fn api_request(&self, url: String) -> CacheRequest {
        CacheRequest::get(url).with_header("accept", API_ACCEPT)
    }

    pub fn raw_request(&self, commit: &str, path: &str) -> CacheRequest {
        CacheRequest::get(self.raw_url(commit, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slug() {
        let repo = GithubRepo::parse("borisyankov/DefinitelyTyped", "master").unwrap();
        assert_eq!(repo.owner, "borisyankov");
        assert_eq!(repo.name, "DefinitelyTyped");
        assert_eq!(repo.slug(), "borisyankov/DefinitelyTyped");

        assert!(GithubRepo::parse("nope", "master").is_err());
        assert!(GithubRepo::parse("a/b/c", "master").is_err());
        assert!(GithubRepo::parse("/b", "master").is_err());
    }

    #[test]
    fn test_urls() {
        let repo = GithubRepo::new("o", "r", "master");
        assert_eq!(
            repo.branch_url(),
            "https://api.github.com/repos/o/r/branches/master"
        );
        assert_eq!(
            repo.tree_url("abc"),
            "https://api.github.com/repos/o/r/git/trees/abc?recursive=1"
        );
        assert_eq!(
            repo.commits_url("my lib/a+b.d.ts"),
            "https://api.github.com/repos/o/r/commits?path=my+lib%2Fa%2Bb.d.ts&sha=master"
        );
        assert_eq!(
            repo.raw_url("abc", "jquery/jquery.d.ts"),
            "https://raw.githubusercontent.com/o/r/abc/jquery/jquery.d.ts"
        );
    }

    #[test]
    fn test_custom_hosts() {
        let repo = GithubRepo::new("o", "r", "main").with_hosts("http://api.local/", "http://raw.local");
        assert_eq!(repo.rate_limit_url(), "http://api.local/rate_limit");
        assert_eq!(repo.raw_url("c", "p.d.ts"), "http://raw.local/o/r/c/p.d.ts");
        assert!(repo.is_api_url(&repo.branch_url()));
        assert!(!repo.is_api_url(&repo.raw_url("c", "p.d.ts")));
        assert!(repo.is_api_url("HTTP://API.local:80/rate_limit"));
        assert!(!repo.is_api_url("http://api.local.example/rate_limit"));
    }

    #[test]
    fn test_api_requests_carry_accept_header() {
        let repo = GithubRepo::new("o", "r", "master");
        let req = repo.api_request(repo.branch_url());
        assert_eq!(req.headers.get("accept").map(String::as_str), Some(API_ACCEPT));
        assert!(repo.raw_request("c", "p.d.ts").headers.is_empty());
    }
}
