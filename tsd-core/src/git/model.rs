//! GitHub REST payloads, reduced to the fields the index needs

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::CommitInfo;

/// `GET /repos/{owner}/{repo}/branches/{branch}`
#[derive(Debug, Clone, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub commit: BranchCommit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchCommit {
    pub sha: String,
    #[serde(default)]
    pub commit: Option<GitCommit>,
}

impl BranchInfo {
    pub fn head_sha(&self) -> &str {
        &self.commit.sha
    }

    pub fn head_date(&self) -> Option<DateTime<Utc>> {
        self.commit
            .commit
            .as_ref()
            .and_then(|c| c.committer.as_ref().or(c.author.as_ref()))
            .and_then(|p| p.date)
    }
}

/// `GET /repos/{owner}/{repo}/git/trees/{sha}?recursive=1`
#[derive(Debug, Clone, Deserialize)]
pub struct TreeListing {
    pub sha: String,
    pub tree: Vec<TreeItem>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

impl TreeItem {
    /// Declaration files, excluding `*-tests.d.ts` companions
    pub fn is_declaration(&self) -> bool {
        self.kind == "blob"
            && self.path.ends_with(".d.ts")
            && !self.path.ends_with("-tests.d.ts")
    }
}

/// One entry of `GET /repos/{owner}/{repo}/commits?path=...`
#[derive(Debug, Clone, Deserialize)]
pub struct CommitEntry {
    pub sha: String,
    pub commit: GitCommit,
    /// Matched GitHub account; null when the author email is unknown to GitHub
    #[serde(default)]
    pub author: Option<GithubUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitCommit {
    #[serde(default)]
    pub author: Option<GitPerson>,
    #[serde(default)]
    pub committer: Option<GitPerson>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitPerson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(default)]
    pub id: Option<u64>,
}

impl CommitEntry {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.commit
            .committer
            .as_ref()
            .and_then(|p| p.date)
            .or_else(|| self.commit.author.as_ref().and_then(|p| p.date))
    }

    /// Split the message into subject and body
    pub fn commit_info(&self) -> CommitInfo {
        let message = self.commit.message.trim();
        let (subject, body) = match message.split_once('\n') {
            Some((subject, rest)) => {
                let rest = rest.trim();
                (subject.trim(), (!rest.is_empty()).then(|| rest.to_string()))
            }
            None => (message, None),
        };
        let author = self.commit.author.as_ref();
        CommitInfo {
            subject: subject.to_string(),
            body,
            author_name: author.and_then(|a| a.name.clone()),
            author_email: author.and_then(|a| a.email.clone()),
            login: self.author.as_ref().map(|u| u.login.clone()),
        }
    }
}
