//! Cache modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the cache may use the network for a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Never touch the network
    Offline,
    /// Stored entries are used as-is; misses are fetched
    #[default]
    Default,
    /// Stored entries are revalidated with a conditional GET
    Revalidate,
    /// Always fetch unconditionally and replace what is stored
    ForceOnline,
}

impl CacheMode {
    pub const ALL: [CacheMode; 4] = [
        CacheMode::Offline,
        CacheMode::Default,
        CacheMode::Revalidate,
        CacheMode::ForceOnline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Offline => "offline",
            CacheMode::Default => "default",
            CacheMode::Revalidate => "revalidate",
            CacheMode::ForceOnline => "force-online",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "offline" => Ok(CacheMode::Offline),
            "default" => Ok(CacheMode::Default),
            "revalidate" => Ok(CacheMode::Revalidate),
            "force-online" | "forceonline" => Ok(CacheMode::ForceOnline),
            _ => Err(format!(
                "Invalid cache mode: {s} (expected one of: offline, default, revalidate, force-online)"
            )),
        }
    }
}
