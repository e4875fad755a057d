//! Header metadata of a declaration file
//!
//! The header is the run of comment lines at the top of the file:
//!
//! ```text
//! // Type definitions for jQuery 1.10
//! // Project: http://jquery.com/
//! // Definitions by: Boris Yankov <https://github.com/borisyankov/>
//! // Definitions: https://github.com/borisyankov/DefinitelyTyped
//!
//! /// <reference path="../node/node.d.ts" />
//! ```
//!
//! Parsing never fails. A header without a "Type definitions for" line is
//! reported as invalid with whatever else could be recovered.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

static REFERENCE_EXP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^///\s*<reference\s+path\s*=\s*["']([^"']+)["']\s*/?>"#).unwrap()
});
static LABEL_EXP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^//\s*Type definitions for:?\s*(.*)$").unwrap());
static PROJECT_EXP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^//\s*Project:\s*(.+)$").unwrap());
static AUTHORS_EXP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^//\s*Definitions by:\s*(.+)$").unwrap());
static REPO_EXP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^//\s*Definitions:\s*(.+)$").unwrap());
static NAME_VERSION_EXP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+?)(?:\s+v?(\d+(?:\.[\dxX*]+)*(?:[-+][\w.]+)?))?$").unwrap()
});
static AUTHOR_EXP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^,<]+?)\s*(?:<([^>]*)>)?\s*(?:,|$)").unwrap());

/// Author from a "Definitions by" line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorInfo {
    pub name: String,
    pub url: Option<String>,
}

/// Parsed header block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DefInfo {
    /// Library name from the first line
    pub name: String,
    /// Library version, when the first line carries one
    pub version: Option<String>,
    /// Free text after "Type definitions for"
    pub description: String,
    pub projects: Vec<String>,
    pub authors: Vec<AuthorInfo>,
    /// Repository the definitions are maintained in
    pub repo_url: Option<String>,
    /// Raw `reference path` values in declaration order
    pub references: Vec<String>,
    valid: bool,
}

impl DefInfo {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reset(&mut self) {
        *self = DefInfo::default();
    }

    /// Parse the header block of `content`
    pub fn parse(content: &str) -> DefInfo {
        let mut info = DefInfo::default();
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);

        let mut in_block_comment = false;
        for raw in content.lines() {
            let line = raw.trim();

            if in_block_comment {
                if line.contains("*/") {
                    in_block_comment = false;
                }
                continue;
            }
            if line.is_empty() {
                continue;
            }
            if line.starts_with("/*") {
                in_block_comment = !line.contains("*/");
                continue;
            }
            if !line.starts_with("//") {
                // header ends at the first line of code
                break;
            }

            if let Some(caps) = REFERENCE_EXP.captures(line) {
                info.references.push(caps[1].trim().to_string());
            } else if let Some(caps) = LABEL_EXP.captures(line) {
                let value = caps[1].trim();
                if !info.valid {
                    info.apply_label(value);
                }
            } else if let Some(caps) = PROJECT_EXP.captures(line) {
                info.projects.extend(split_urls(&caps[1]));
            } else if let Some(caps) = AUTHORS_EXP.captures(line) {
                info.authors.extend(parse_authors(&caps[1]));
            } else if let Some(caps) = REPO_EXP.captures(line) {
                info.repo_url = Some(caps[1].trim().to_string());
            }
        }

        info
    }

    fn apply_label(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        self.description = value.to_string();
        match NAME_VERSION_EXP.captures(value) {
            Some(caps) => {
                self.name = caps[1].trim().to_string();
                self.version = caps.get(2).map(|m| m.as_str().to_string());
            }
            None => self.name = value.to_string(),
        }
        self.valid = true;
    }
}

impl fmt::Display for DefInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        Ok(())
    }
}

fn split_urls(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_authors(value: &str) -> Vec<AuthorInfo> {
    AUTHOR_EXP
        .captures_iter(value)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().trim();
            if name.is_empty() {
                return None;
            }
            Some(AuthorInfo {
                name: name.to_string(),
                url: caps.get(2).map(|m| m.as_str().trim().to_string()),
            })
        })
        .collect()
}
