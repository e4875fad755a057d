//! Definition registry
//!
//! Defs and Revisions live in an arena owned by the [`Registry`] and refer to
//! each other by index, so cyclic dependency graphs never become cyclic
//! ownership. A path maps to exactly one [`DefId`] for the lifetime of the
//! registry and a (def, commit) pair to exactly one [`RevisionId`].

mod info;

pub use info::{AuthorInfo, DefInfo};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DefId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RevisionId(usize);

/// A declaration file, independent of revision
#[derive(Debug, Clone, Serialize)]
pub struct Def {
    pub id: DefId,
    /// Canonical path inside the repository, e.g. `jquery/jquery.d.ts`
    pub path: String,
    /// Most recent revision; always `history[0]` when set
    pub head: Option<RevisionId>,
    /// Known revisions, newest first
    pub history: Vec<RevisionId>,
    /// Whether the full commit history was fetched
    pub history_loaded: bool,
}

impl Def {
    /// Directory part of the path (`jquery` for `jquery/jquery.d.ts`)
    pub fn project(&self) -> &str {
        self.path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }

    /// File stem without the `.d.ts` suffix
    pub fn name(&self) -> &str {
        let file = self
            .path
            .rsplit_once('/')
            .map(|(_, file)| file)
            .unwrap_or(&self.path);
        file.strip_suffix(".d.ts").unwrap_or(file)
    }
}

/// Commit metadata attached to a revision when history is loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub subject: String,
    pub body: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    /// GitHub account of the author, when GitHub could match one
    pub login: Option<String>,
}

/// One version of a Def
#[derive(Debug, Clone, Serialize)]
pub struct Revision {
    pub id: RevisionId,
    pub def: DefId,
    /// Copy of the owning Def's path
    pub path: String,
    /// Commit sha the content is read at
    pub commit: String,
    pub blob: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub commit_info: Option<CommitInfo>,
}

impl Revision {
    pub fn commit_short(&self) -> &str {
        let end = self.commit.len().min(8);
        &self.commit[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.commit_short())
    }
}

/// Arena of Defs and Revisions
#[derive(Debug, Default)]
pub struct Registry {
    defs: Vec<Def>,
    revisions: Vec<Revision>,
    by_path: HashMap<String, DefId>,
    by_commit: HashMap<(DefId, String), RevisionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Get or create the Def for a canonical path
    pub fn procure_def(&mut self, path: &str) -> DefId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }
        let id = DefId(self.defs.len());
        self.defs.push(Def {
            id,
            path: path.to_string(),
            head: None,
            history: Vec::new(),
            history_loaded: false,
        });
        self.by_path.insert(path.to_string(), id);
        id
    }

    /// Get or create the Revision of `def` at `commit`
    ///
    /// Missing date and blob are filled in when a later call knows them;
    /// known values are never overwritten.
    pub fn procure_revision(
        &mut self,
        def: DefId,
        commit: &str,
        date: Option<DateTime<Utc>>,
        blob: Option<&str>,
    ) -> RevisionId {
        let key = (def, commit.to_string());
        if let Some(id) = self.by_commit.get(&key) {
            let rev = &mut self.revisions[id.0];
            if rev.date.is_none() {
                rev.date = date;
            }
            if rev.blob.is_none() {
                rev.blob = blob.map(str::to_string);
            }
            return *id;
        }

        let id = RevisionId(self.revisions.len());
        self.revisions.push(Revision {
            id,
            def,
            path: self.defs[def.0].path.clone(),
            commit: commit.to_string(),
            blob: blob.map(str::to_string),
            date,
            commit_info: None,
        });
        self.by_commit.insert(key, id);
        id
    }

    /// Attach commit metadata once
    pub fn set_commit_info(&mut self, rev: RevisionId, info: CommitInfo) {
        if let Some(rev) = self.revisions.get_mut(rev.0) {
            if rev.commit_info.is_none() {
                rev.commit_info = Some(info);
            }
        }
    }

    /// Record `rev` as the newest known revision of its Def
    pub fn set_head(&mut self, rev: RevisionId) {
        let def = self.revisions[rev.0].def;
        let entry = &mut self.defs[def.0];
        entry.history.retain(|r| *r != rev);
        entry.history.insert(0, rev);
        entry.head = Some(rev);
    }

    /// Merge revisions into a Def's history, newest first by date
    ///
    /// Existing entries are kept. Revisions without a date sort after dated ones.
    pub fn merge_history(&mut self, def: DefId, revisions: &[RevisionId]) {
        let mut history = self.defs[def.0].history.clone();
        for rev in revisions {
            if !history.contains(rev) {
                history.push(*rev);
            }
        }
        let revs = &self.revisions;
        // stable: equal dates keep their relative order
        history.sort_by(|a, b| revs[b.0].date.cmp(&revs[a.0].date));

        let entry = &mut self.defs[def.0];
        entry.head = history.first().copied();
        entry.history = history;
        entry.history_loaded = true;
    }

    pub fn def(&self, id: DefId) -> Option<&Def> {
        self.defs.get(id.0)
    }

    pub fn def_by_path(&self, path: &str) -> Option<&Def> {
        self.by_path.get(path).and_then(|id| self.defs.get(id.0))
    }

    pub fn revision(&self, id: RevisionId) -> Option<&Revision> {
        self.revisions.get(id.0)
    }

    pub fn find_revision(&self, def: DefId, commit: &str) -> Option<RevisionId> {
        if let Some(id) = self.by_commit.get(&(def, commit.to_string())) {
            return Some(*id);
        }
        // abbreviated shas from hand-written manifests
        if commit.len() >= 6 {
            return self.defs.get(def.0).and_then(|d| {
                d.history
                    .iter()
                    .copied()
                    .find(|r| self.revisions[r.0].commit.starts_with(commit))
            });
        }
        None
    }

    /// Newest revision of `def` not younger than `date`
    ///
    /// Falls back to the head when no date is given or nothing in the
    /// history qualifies.
    pub fn revision_as_of(&self, def: DefId, date: Option<DateTime<Utc>>) -> Option<RevisionId> {
        let entry = self.defs.get(def.0)?;
        if let Some(date) = date {
            let found = entry.history.iter().copied().find(|r| {
                self.revisions[r.0]
                    .date
                    .is_some_and(|rev_date| rev_date <= date)
            });
            if found.is_some() {
                return found;
            }
        }
        entry.head
    }

    /// All Defs ordered by path
    pub fn defs(&self) -> Vec<&Def> {
        let mut defs: Vec<&Def> = self.defs.iter().collect();
        defs.sort_by(|a, b| a.path.cmp(&b.path));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2014, 3, d, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_def_identity_is_unique_per_path() {
        let mut reg = Registry::new();
        let a = reg.procure_def("jquery/jquery.d.ts");
        let b = reg.procure_def("jquery/jquery.d.ts");
        let c = reg.procure_def("node/node.d.ts");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_revision_identity_and_late_fill() {
        let mut reg = Registry::new();
        let def = reg.procure_def("a/a.d.ts");
        let r1 = reg.procure_revision(def, "c1", None, None);
        let r2 = reg.procure_revision(def, "c1", day(1), Some("blob"));
        assert_eq!(r1, r2);
        let rev = reg.revision(r1).unwrap();
        assert_eq!(rev.date, day(1));
        assert_eq!(rev.blob.as_deref(), Some("blob"));
        assert_eq!(rev.path, "a/a.d.ts");

        // known values stay
        reg.procure_revision(def, "c1", day(9), Some("other"));
        assert_eq!(reg.revision(r1).unwrap().date, day(1));
    }

    #[test]
    fn test_head_is_newest_history_entry() {
        let mut reg = Registry::new();
        let def = reg.procure_def("a/a.d.ts");
        let head = reg.procure_revision(def, "c3", day(3), None);
        reg.set_head(head);

        let old = reg.procure_revision(def, "c1", day(1), None);
        let mid = reg.procure_revision(def, "c2", day(2), None);
        reg.merge_history(def, &[mid, old]);

        let entry = reg.def(def).unwrap();
        assert_eq!(entry.history, vec![head, mid, old]);
        assert_eq!(entry.head, Some(head));
        assert!(entry.history_loaded);
    }

    #[test]
    fn test_revision_as_of() {
        let mut reg = Registry::new();
        let def = reg.procure_def("a/a.d.ts");
        let r1 = reg.procure_revision(def, "c1", day(1), None);
        let r5 = reg.procure_revision(def, "c5", day(5), None);
        reg.merge_history(def, &[r1, r5]);

        assert_eq!(reg.revision_as_of(def, day(3)), Some(r1));
        assert_eq!(reg.revision_as_of(def, day(5)), Some(r5));
        assert_eq!(reg.revision_as_of(def, None), Some(r5));
        // older than anything known falls back to head
        let before = Some(Utc.with_ymd_and_hms(2014, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(reg.revision_as_of(def, before), Some(r5));
    }

    #[test]
    fn test_find_revision_by_prefix() {
        let mut reg = Registry::new();
        let def = reg.procure_def("a/a.d.ts");
        let rev = reg.procure_revision(def, "abcdef0123456789", day(1), None);
        reg.set_head(rev);
        assert_eq!(reg.find_revision(def, "abcdef0123456789"), Some(rev));
        assert_eq!(reg.find_revision(def, "abcdef01"), Some(rev));
        assert_eq!(reg.find_revision(def, "abc"), None);
    }

    #[test]
    fn test_def_name_and_project() {
        let mut reg = Registry::new();
        let id = reg.procure_def("jquery/jquery.cookie.d.ts");
        let def = reg.def(id).unwrap();
        assert_eq!(def.project(), "jquery");
        assert_eq!(def.name(), "jquery.cookie");
    }
}
