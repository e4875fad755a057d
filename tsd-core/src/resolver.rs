//! Dependency closure of a set of definitions
//!
//! Roots are claimed first, in the order given. Each root is then expanded
//! depth first: a reference is followed to the bottom before the next
//! reference of the same file is looked at. The first revision claimed for a
//! path wins for the whole run; any later request for a different revision of
//! that path is recorded as a [`Conflict`]. A claimed path is never expanded
//! again, and paths on the current walk are tracked as back edges, so cycles
//! terminate.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::{Result, TsdError};
use crate::events::{CancelFlag, ProgressEvent, Reporter};
use crate::index::IndexManager;
use crate::model::{DefInfo, Revision, RevisionId};
use crate::parser::InfoParser;

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Path to commit; pinned paths use that revision wherever they appear
    pub pins: BTreeMap<String, String>,
    pub cancel: CancelFlag,
}

impl ResolveOptions {
    pub fn with_pins(pins: BTreeMap<String, String>) -> Self {
        Self {
            pins,
            ..Self::default()
        }
    }
}

/// A request for a revision that lost against an earlier claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub path: String,
    /// File whose reference asked for `requested`; `None` for roots
    pub referrer: Option<String>,
    pub requested: String,
    pub winner: String,
}

/// A file that could not be resolved or read
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub path: String,
    pub referrer: Option<String>,
    pub error: TsdError,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Revisions of the roots, in request order
    pub roots: Vec<RevisionId>,
    /// Chosen revision per path, in claim order
    pub resolved: Vec<Revision>,
    /// Direct dependencies of each expanded revision, as chosen revisions
    pub dependencies: BTreeMap<RevisionId, Vec<RevisionId>>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<ResolveError>,
}

impl Resolution {
    /// No hard errors; conflicts alone do not fail a resolution
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Revision> {
        self.resolved.iter().find(|r| r.path == path)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.resolved.iter().map(|r| r.path.as_str()).collect()
    }

    pub fn dependencies_of(&self, id: RevisionId) -> Vec<&Revision> {
        self.dependencies
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .filter_map(|dep| self.resolved.iter().find(|r| r.id == *dep))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct Resolver {
    index: Arc<IndexManager>,
    parser: Arc<InfoParser>,
    reporter: Reporter,
}

/// A file being expanded and how far through its references the walk is
struct Frame {
    revision: Revision,
    info: Arc<DefInfo>,
    next: usize,
    deps: Vec<RevisionId>,
}

/// Claims made so far in one run
#[derive(Default)]
struct Claims {
    chosen: HashMap<String, Revision>,
    resolution: Resolution,
}

impl Claims {
    /// Claim `revision` for its path, or report what already holds it
    ///
    /// Returns the winning revision and whether this call claimed it.
    fn claim(
        &mut self,
        revision: Revision,
        referrer: Option<&Revision>,
        reporter: &Reporter,
    ) -> (RevisionId, bool) {
        if let Some(winner) = self.chosen.get(&revision.path) {
            if winner.id != revision.id {
                let conflict = Conflict {
                    path: revision.path.clone(),
                    referrer: referrer.map(|r| r.path.clone()),
                    requested: revision.commit.clone(),
                    winner: winner.commit.clone(),
                };
                debug!(
                    "Conflict on {}: {} requested by {:?}, keeping {}",
                    conflict.path, conflict.requested, conflict.referrer, conflict.winner
                );
                reporter.emit(ProgressEvent::Conflict {
                    path: conflict.path.clone(),
                    referrer: conflict.referrer.clone(),
                    requested: conflict.requested.clone(),
                    winner: conflict.winner.clone(),
                });
                self.resolution.conflicts.push(conflict);
            } else {
                trace!("{} already claimed", revision);
            }
            return (winner.id, false);
        }

        reporter.emit(ProgressEvent::Resolved {
            path: revision.path.clone(),
            commit: revision.commit.clone(),
        });
        let id = revision.id;
        self.chosen.insert(revision.path.clone(), revision.clone());
        self.resolution.resolved.push(revision);
        (id, true)
    }
}

impl Resolver {
    pub fn new(index: Arc<IndexManager>, parser: Arc<InfoParser>, reporter: Reporter) -> Self {
        Self {
            index,
            parser,
            reporter,
        }
    }

    /// Resolve the closure of `roots`
    ///
    /// Fails outright only when a root itself cannot be found (or the run is
    /// cancelled); every other problem is collected in the result.
    pub async fn resolve(&self, roots: &[String], options: &ResolveOptions) -> Result<Resolution> {
        let mut claims = Claims::default();
        let mut expand = Vec::new();

        for path in roots {
            options.cancel.check()?;
            let revision = self.root_revision(path, options).await?;
            let (id, claimed) = claims.claim(revision.clone(), None, &self.reporter);
            if !claims.resolution.roots.contains(&id) {
                claims.resolution.roots.push(id);
            }
            if claimed {
                expand.push(revision);
            }
        }

        // every root is a winner, so their headers can load together
        let parsed = self.parser.parse_info_bulk(&expand).await;
        for (root, info) in expand.into_iter().zip(parsed) {
            self.walk(root, info, &mut claims, options).await?;
        }

        let resolution = claims.resolution;
        info!(
            "Resolved {} file(s) from {} root(s): {} conflict(s), {} error(s)",
            resolution.resolved.len(),
            resolution.roots.len(),
            resolution.conflicts.len(),
            resolution.errors.len()
        );
        Ok(resolution)
    }

    /// Depth-first expansion of one claimed root
    async fn walk(
        &self,
        root: Revision,
        info: Result<Arc<DefInfo>>,
        claims: &mut Claims,
        options: &ResolveOptions,
    ) -> Result<()> {
        let mut visiting: HashSet<String> = HashSet::new();
        let mut stack: Vec<Frame> = Vec::new();
        if let Some(frame) = open(root, info, None, claims) {
            visiting.insert(frame.revision.path.clone());
            stack.push(frame);
        }

        loop {
            options.cancel.check()?;
            let next = match stack.last_mut() {
                None => break,
                Some(frame) => match frame.info.references.get(frame.next).cloned() {
                    Some(reference) => {
                        frame.next += 1;
                        Some((reference, frame.revision.clone()))
                    }
                    None => None,
                },
            };
            let Some((reference, referrer)) = next else {
                // every reference followed
                if let Some(done) = stack.pop() {
                    visiting.remove(&done.revision.path);
                    claims.resolution.dependencies.insert(done.revision.id, done.deps);
                }
                continue;
            };

            let Some(path) = normalize_reference(&referrer.path, &reference) else {
                claims.resolution.errors.push(ResolveError {
                    path: reference.clone(),
                    referrer: Some(referrer.path.clone()),
                    error: TsdError::NotFound { path: reference },
                });
                continue;
            };

            let dep = match self.requested_revision(&path, &referrer, options).await {
                Ok(dep) => dep,
                Err(error) => {
                    debug!("Unresolved reference {} from {}: {}", path, referrer, error);
                    claims.resolution.errors.push(ResolveError {
                        path,
                        referrer: Some(referrer.path.clone()),
                        error,
                    });
                    continue;
                }
            };

            let (id, claimed) = claims.claim(dep.clone(), Some(&referrer), &self.reporter);
            if let Some(frame) = stack.last_mut() {
                if !frame.deps.contains(&id) {
                    frame.deps.push(id);
                }
            }
            if !claimed {
                if visiting.contains(&dep.path) {
                    trace!("Back edge {} -> {}", referrer.path, dep.path);
                }
                continue;
            }
            let info = self.parser.parse_info(&dep).await;
            if let Some(frame) = open(dep, info, Some(referrer.path), claims) {
                visiting.insert(frame.revision.path.clone());
                stack.push(frame);
            }
        }
        Ok(())
    }

    async fn root_revision(&self, path: &str, options: &ResolveOptions) -> Result<Revision> {
        if let Some(commit) = options.pins.get(path) {
            return self.index.pinned_revision(path, commit).await;
        }
        let def = self.index.resolve_path(path).await?;
        let head = match def.head {
            Some(head) => self.index.revision(head).await,
            None => None,
        };
        head.ok_or_else(|| TsdError::NotFound {
            path: path.to_string(),
        })
    }

    /// Revision of `path` a reference from `referrer` asks for
    ///
    /// Pins win; otherwise the newest known revision not younger than the
    /// referrer, falling back to the head.
    async fn requested_revision(
        &self,
        path: &str,
        referrer: &Revision,
        options: &ResolveOptions,
    ) -> Result<Revision> {
        if let Some(commit) = options.pins.get(path) {
            return self.index.pinned_revision(path, commit).await;
        }
        let def = self.index.resolve_path(path).await?;
        self.index.prepare_as_of(&def, referrer.date).await?;
        self.index
            .revision_as_of(def.id, referrer.date)
            .await
            .ok_or_else(|| TsdError::NotFound {
                path: path.to_string(),
            })
    }
}

/// Frame for a freshly claimed revision, or its load error collected
fn open(
    revision: Revision,
    info: Result<Arc<DefInfo>>,
    referrer: Option<String>,
    claims: &mut Claims,
) -> Option<Frame> {
    match info {
        Ok(info) => Some(Frame {
            revision,
            info,
            next: 0,
            deps: Vec::new(),
        }),
        Err(error) => {
            claims.resolution.errors.push(ResolveError {
                path: revision.path,
                referrer,
                error,
            });
            None
        }
    }
}

/// Resolve a `reference path` value against the referring file
///
/// `..` segments beyond the repository root are dropped. Returns `None` when
/// nothing is left.
pub fn normalize_reference(referrer: &str, reference: &str) -> Option<String> {
    let reference = reference.trim().replace('\\', "/");
    let mut segments: Vec<&str> = if reference.starts_with('/') {
        Vec::new()
    } else {
        let mut base: Vec<&str> = referrer.split('/').collect();
        base.pop();
        base
    };

    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reference() {
        let cases = [
            ("jquery/jquery.cookie.d.ts", "jquery.d.ts", Some("jquery/jquery.d.ts")),
            ("jquery/jquery.cookie.d.ts", "./jquery.d.ts", Some("jquery/jquery.d.ts")),
            ("jquery/jquery.cookie.d.ts", "../node/node.d.ts", Some("node/node.d.ts")),
            ("a/b/c.d.ts", "../../x/x.d.ts", Some("x/x.d.ts")),
            ("a/a.d.ts", "../../../x/x.d.ts", Some("x/x.d.ts")),
            ("a/a.d.ts", "..\\y\\y.d.ts", Some("y/y.d.ts")),
            ("a/a.d.ts", "/z/z.d.ts", Some("z/z.d.ts")),
            ("a/a.d.ts", "../", None),
        ];
        for (referrer, reference, expected) in cases {
            assert_eq!(
                normalize_reference(referrer, reference).as_deref(),
                expected,
                "{referrer} -> {reference}"
            );
        }
    }

    #[test]
    fn test_resolution_accessors() {
        let mut registry = crate::model::Registry::new();
        let a = registry.procure_def("a/a.d.ts");
        let b = registry.procure_def("b/b.d.ts");
        let ra = registry.procure_revision(a, "c1", None, None);
        let rb = registry.procure_revision(b, "c1", None, None);

        let mut resolution = Resolution {
            roots: vec![ra],
            resolved: vec![
                registry.revision(ra).unwrap().clone(),
                registry.revision(rb).unwrap().clone(),
            ],
            ..Resolution::default()
        };
        resolution.dependencies.insert(ra, vec![rb]);

        assert!(resolution.is_ok());
        assert_eq!(resolution.paths(), vec!["a/a.d.ts", "b/b.d.ts"]);
        assert_eq!(resolution.get("b/b.d.ts").map(|r| r.id), Some(rb));
        assert_eq!(resolution.dependencies_of(ra)[0].path, "b/b.d.ts");
        assert!(resolution.dependencies_of(rb).is_empty());
    }
}
