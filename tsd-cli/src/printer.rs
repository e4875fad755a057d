//! Terminal rendering of progress events and results

use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use tsd_core::{
    Def, DefInfo, FetchOutcome, InstallResult, ProgressEvent, RateState, Resolution, Revision,
};

/// Remaining requests at or below which the quota is shown as a warning
const RATE_WARNING: u64 = 10;
/// Remaining requests above which the quota is shown as healthy
const RATE_GOOD: u64 = 30;
/// Remaining requests above which the quota is not shown at all
const RATE_STEALTH: u64 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLevel {
    Warning,
    Low,
    Good,
}

/// Prints progress events to stderr
///
/// Rate states are only shown when the quota is getting low, and a state is
/// never shown twice in a row.
pub struct ProgressPrinter {
    verbose: bool,
    last_rate: Option<(u64, u64)>,
}

impl ProgressPrinter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_rate: None,
        }
    }

    /// Drain `events` on a background task until every sender is dropped
    pub fn spawn(mut self, mut events: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(line) = self.render(&event) {
                    eprintln!("{line}");
                }
            }
        })
    }

    fn render(&mut self, event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::IndexLoaded { commit, defs } => Some(format!(
                "-> index: {} definitions at {}",
                defs,
                &commit[..commit.len().min(8)]
            )),
            ProgressEvent::Fetched { url, outcome } if self.verbose => {
                let label = match outcome {
                    FetchOutcome::Cached => "cached",
                    FetchOutcome::NotModified => "not modified",
                    FetchOutcome::Downloaded => "downloaded",
                };
                Some(format!("   {label}: {url}"))
            }
            ProgressEvent::Parsed { path, valid, .. } if !valid => {
                Some(format!("!! {path}: no definition header"))
            }
            ProgressEvent::Resolved { path, commit } if self.verbose => {
                Some(format!("   resolved {} @ {}", path, &commit[..commit.len().min(8)]))
            }
            ProgressEvent::Conflict {
                path,
                referrer,
                requested,
                winner,
            } => Some(format!(
                "!! conflict on {}: {} asked for {}, keeping {}",
                path,
                referrer.as_deref().unwrap_or("<root>"),
                &requested[..requested.len().min(8)],
                &winner[..winner.len().min(8)]
            )),
            ProgressEvent::Written { dest, dry_run, .. } => Some(format!(
                "{} {}",
                if *dry_run { "~~ would write" } else { "-> wrote" },
                dest.display()
            )),
            ProgressEvent::Skipped { dest, reason, .. } => {
                Some(format!("-- skipped {} ({})", dest.display(), reason))
            }
            ProgressEvent::RateLimit(state) => self.render_rate(state),
            _ => None,
        }
    }

    fn render_rate(&mut self, state: &RateState) -> Option<String> {
        let key = (state.remaining, state.limit);
        if self.last_rate == Some(key) {
            return None;
        }
        self.last_rate = Some(key);

        if state.remaining > RATE_STEALTH {
            return None;
        }
        let prefix = match rate_level(state) {
            RateLevel::Warning => "!! rate limit",
            RateLevel::Low => "-- rate limit",
            RateLevel::Good => "   rate limit",
        };
        Some(format!("{prefix}: {state}"))
    }
}

fn rate_level(state: &RateState) -> RateLevel {
    if state.remaining <= RATE_WARNING {
        RateLevel::Warning
    } else if state.remaining <= RATE_GOOD {
        RateLevel::Low
    } else {
        RateLevel::Good
    }
}

fn render(mut table: Table) -> String {
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    table.to_string()
}

fn short(commit: &str) -> String {
    commit[..commit.len().min(8)].to_string()
}

#[derive(Tabled)]
struct DefRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Name")]
    name: String,
}

pub fn defs_table(defs: &[Def]) -> String {
    let rows: Vec<DefRow> = defs
        .iter()
        .map(|def| DefRow {
            path: def.path.clone(),
            project: def.project().to_string(),
            name: def.name().to_string(),
        })
        .collect();
    render(Table::new(&rows))
}

#[derive(Tabled)]
struct InfoRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Commit")]
    commit: String,
    #[tabled(rename = "Library")]
    library: String,
    #[tabled(rename = "Authors")]
    authors: String,
    #[tabled(rename = "References")]
    references: usize,
}

pub fn info_table(infos: &[(Revision, DefInfo)]) -> String {
    let rows: Vec<InfoRow> = infos
        .iter()
        .map(|(revision, info)| InfoRow {
            path: revision.path.clone(),
            commit: short(&revision.commit),
            library: if info.is_valid() {
                match &info.version {
                    Some(version) => format!("{} {}", info.name, version),
                    None => info.name.clone(),
                }
            } else {
                "<no header>".to_string()
            },
            authors: info
                .authors
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            references: info.references.len(),
        })
        .collect();
    render(Table::new(&rows))
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Commit")]
    commit: String,
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Author")]
    author: String,
    #[tabled(rename = "Subject")]
    subject: String,
}

pub fn history_table(revisions: &[Revision]) -> String {
    let rows: Vec<HistoryRow> = revisions
        .iter()
        .map(|rev| {
            let info = rev.commit_info.as_ref();
            HistoryRow {
                commit: short(&rev.commit),
                date: rev
                    .date
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default(),
                author: info
                    .and_then(|i| i.login.clone().or_else(|| i.author_name.clone()))
                    .unwrap_or_default(),
                subject: info.map(|i| i.subject.clone()).unwrap_or_default(),
            }
        })
        .collect();
    render(Table::new(&rows))
}

#[derive(Tabled)]
struct ResolvedRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Commit")]
    commit: String,
    #[tabled(rename = "Dependencies")]
    dependencies: String,
}

pub fn resolution_table(resolution: &Resolution) -> String {
    let rows: Vec<ResolvedRow> = resolution
        .resolved
        .iter()
        .map(|rev| ResolvedRow {
            path: rev.path.clone(),
            commit: short(&rev.commit),
            dependencies: resolution
                .dependencies_of(rev.id)
                .iter()
                .map(|dep| dep.path.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();

    let mut out = render(Table::new(&rows));
    for conflict in &resolution.conflicts {
        out.push_str(&format!(
            "\nconflict: {} requested at {} by {}, using {}",
            conflict.path,
            short(&conflict.requested),
            conflict.referrer.as_deref().unwrap_or("<root>"),
            short(&conflict.winner)
        ));
    }
    for error in &resolution.errors {
        out.push_str(&format!(
            "\nerror: {}{}: {}",
            error.path,
            error
                .referrer
                .as_deref()
                .map(|r| format!(" (from {r})"))
                .unwrap_or_default(),
            error.error
        ));
    }
    out
}

#[derive(Tabled)]
struct InstallRow {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Commit")]
    commit: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub fn install_table(result: &InstallResult) -> String {
    let written = if result.dry_run { "would write" } else { "written" };
    let mut rows: Vec<InstallRow> = Vec::new();
    for (dest, rev) in &result.written {
        rows.push(InstallRow {
            file: dest.display().to_string(),
            commit: short(&rev.commit),
            status: written.to_string(),
        });
    }
    for (dest, (rev, reason)) in &result.skipped {
        rows.push(InstallRow {
            file: dest.display().to_string(),
            commit: short(&rev.commit),
            status: format!("skipped: {reason}"),
        });
    }
    for (dest, (rev, error)) in &result.failed {
        rows.push(InstallRow {
            file: dest.display().to_string(),
            commit: short(&rev.commit),
            status: format!("failed: {error}"),
        });
    }
    render(Table::new(&rows))
}
