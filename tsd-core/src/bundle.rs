//! Pinned manifests and the bundle file
//!
//! The manifest is the `installed` map of `tsd.json`: canonical path to the
//! commit that was resolved. Feeding it back as pins reproduces the same set.
//! The bundle is a single declaration file that references every installed
//! definition, so a project needs only one `reference` line.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::config::TsdConfig;
use crate::error::{Result, TsdError};
use crate::installer::InstallResult;
use crate::resolver::Resolution;

static BUNDLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*///\s*<reference\s+path\s*=\s*["']([^"']+)["']\s*/?>"#).unwrap()
});

/// Canonical path to pinned commit, ordered by path
pub type Manifest = BTreeMap<String, String>;

pub struct BundleManager;

impl BundleManager {
    /// Manifest of everything in a resolution
    pub fn manifest_of(resolution: &Resolution) -> Manifest {
        resolution
            .resolved
            .iter()
            .map(|rev| (rev.path.clone(), rev.commit.clone()))
            .collect()
    }

    /// Manifest of what an install wrote (or would write)
    pub fn manifest_of_install(result: &InstallResult) -> Manifest {
        result
            .written
            .values()
            .map(|rev| (rev.path.clone(), rev.commit.clone()))
            .collect()
    }

    /// Manifest to save after installing a resolution
    ///
    /// Covers the whole resolved set, including files left alone because they
    /// already existed. Files whose local content conflicts are not pinned.
    pub fn manifest_to_save(resolution: &Resolution, result: &InstallResult) -> Manifest {
        let conflicted: Vec<&str> = result
            .conflicts()
            .map(|(_, revision)| revision.path.as_str())
            .collect();
        let mut manifest = Self::manifest_of(resolution);
        manifest.retain(|path, _| !conflicted.contains(&path.as_str()));
        manifest
    }

    /// Pins recorded in a config
    pub fn pins_from(config: &TsdConfig) -> Manifest {
        config.pins()
    }

    /// Merge a manifest into the config's `installed` map
    pub fn apply(config: &mut TsdConfig, manifest: &Manifest) {
        for (path, commit) in manifest {
            config.add_installed(path, commit);
        }
    }

    /// Reference paths listed in a bundle file, in file order
    pub fn read_bundle(bundle_path: &Path) -> Result<Vec<String>> {
        if !bundle_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(bundle_path)
            .map_err(|e| TsdError::io(bundle_path, e))?;
        Ok(content
            .lines()
            .filter_map(|line| BUNDLE_REFERENCE.captures(line))
            .map(|caps| caps[1].to_string())
            .collect())
    }

    /// Add a reference line per installed path that the bundle lacks
    ///
    /// Existing lines and their order are preserved. Returns the number of
    /// references added.
    pub fn update_bundle(bundle_path: &Path, install_root: &Path, paths: &[String]) -> Result<usize> {
        let existing = Self::read_bundle(bundle_path)?;
        let mut content = if bundle_path.exists() {
            std::fs::read_to_string(bundle_path).map_err(|e| TsdError::io(bundle_path, e))?
        } else {
            String::new()
        };

        let bundle_dir = bundle_path.parent().unwrap_or(Path::new(""));
        let mut added = 0;
        for path in paths {
            let target = path
                .split('/')
                .fold(install_root.to_path_buf(), |dest, segment| dest.join(segment));
            let reference = relative_reference(bundle_dir, &target);
            if existing.contains(&reference) {
                continue;
            }
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&format!("/// <reference path=\"{reference}\" />\n"));
            added += 1;
        }

        if added > 0 {
            if let Some(parent) = bundle_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| TsdError::io(parent, e))?;
                }
            }
            std::fs::write(bundle_path, content).map_err(|e| TsdError::io(bundle_path, e))?;
            debug!("Added {} reference(s) to {}", added, bundle_path.display());
        }
        Ok(added)
    }
}

/// `/`-separated path from `from_dir` to `to`, computed lexically
fn relative_reference(from_dir: &Path, to: &Path) -> String {
    let from: Vec<Component> = from_dir
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let to: Vec<Component> = to
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();
    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to[common..] {
        relative.push(component.as_os_str());
    }

    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Registry;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_round_trips_through_config() {
        let mut registry = Registry::new();
        let a = registry.procure_def("b/b.d.ts");
        let b = registry.procure_def("a/a.d.ts");
        let ra = registry.procure_revision(a, "c2", None, None);
        let rb = registry.procure_revision(b, "c1", None, None);
        let resolution = Resolution {
            resolved: vec![
                registry.revision(ra).unwrap().clone(),
                registry.revision(rb).unwrap().clone(),
            ],
            ..Resolution::default()
        };

        let manifest = BundleManager::manifest_of(&resolution);
        assert_eq!(
            manifest.keys().collect::<Vec<_>>(),
            vec!["a/a.d.ts", "b/b.d.ts"]
        );

        let mut config = TsdConfig::default();
        BundleManager::apply(&mut config, &manifest);
        assert_eq!(BundleManager::pins_from(&config), manifest);
    }

    #[test]
    fn test_saved_manifest_skips_conflicts_only() {
        let mut registry = Registry::new();
        let ids: Vec<_> = ["a/a.d.ts", "b/b.d.ts", "c/c.d.ts"]
            .iter()
            .map(|path| {
                let def = registry.procure_def(path);
                registry.procure_revision(def, "c1", None, None)
            })
            .collect();
        let revisions: Vec<_> = ids
            .iter()
            .map(|id| registry.revision(*id).unwrap().clone())
            .collect();
        let resolution = Resolution {
            resolved: revisions.clone(),
            ..Resolution::default()
        };

        let mut result = InstallResult::default();
        result
            .written
            .insert(PathBuf::from("t/a/a.d.ts"), revisions[0].clone());
        result.skipped.insert(
            PathBuf::from("t/b/b.d.ts"),
            (revisions[1].clone(), crate::installer::SkipReason::Exists),
        );
        result.skipped.insert(
            PathBuf::from("t/c/c.d.ts"),
            (
                revisions[2].clone(),
                crate::installer::SkipReason::Conflict {
                    local: "sha256:1".to_string(),
                    remote: "sha256:2".to_string(),
                },
            ),
        );

        let manifest = BundleManager::manifest_to_save(&resolution, &result);
        assert_eq!(
            manifest.keys().collect::<Vec<_>>(),
            vec!["a/a.d.ts", "b/b.d.ts"]
        );
    }

    #[test]
    fn test_update_bundle_appends_missing_references() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("typings");
        let bundle = root.join("tsd.d.ts");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            &bundle,
            "// custom header\n/// <reference path=\"jquery/jquery.d.ts\" />",
        )
        .unwrap();

        let added = BundleManager::update_bundle(
            &bundle,
            &root,
            &["jquery/jquery.d.ts".to_string(), "node/node.d.ts".to_string()],
        )
        .unwrap();

        assert_eq!(added, 1);
        assert_eq!(
            std::fs::read_to_string(&bundle).unwrap(),
            "// custom header\n/// <reference path=\"jquery/jquery.d.ts\" />\n/// <reference path=\"node/node.d.ts\" />\n"
        );
        assert_eq!(
            BundleManager::read_bundle(&bundle).unwrap(),
            vec!["jquery/jquery.d.ts", "node/node.d.ts"]
        );

        // nothing new: file untouched
        let added = BundleManager::update_bundle(&bundle, &root, &["node/node.d.ts".to_string()]).unwrap();
        assert_eq!(added, 0);
    }

    #[test]
    fn test_bundle_outside_install_root() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("types").join("all.d.ts");
        let root = dir.path().join("typings");

        BundleManager::update_bundle(&bundle, &root, &["a/a.d.ts".to_string()]).unwrap();

        assert_eq!(
            BundleManager::read_bundle(&bundle).unwrap(),
            vec!["../typings/a/a.d.ts"]
        );
    }

    #[test]
    fn test_relative_reference() {
        assert_eq!(
            relative_reference(Path::new("typings"), Path::new("typings/a/a.d.ts")),
            "a/a.d.ts"
        );
        assert_eq!(
            relative_reference(Path::new("./typings"), Path::new("typings/a/a.d.ts")),
            "a/a.d.ts"
        );
        assert_eq!(relative_reference(Path::new(""), Path::new("x/y.d.ts")), "x/y.d.ts");
    }
}
