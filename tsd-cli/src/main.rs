//! tsd - search, resolve and install declaration files from DefinitelyTyped
//!
//! Thin argument and output layer over `tsd_core::Engine`.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tsd_core::{
    BundleManager, CacheMode, Context, CoreSettings, DefInfo, Engine, InstallPolicy, Reporter,
    Revision, Selector,
};

mod printer;

use printer::ProgressPrinter;

/// Trace modules for detailed logging
#[derive(Debug, Clone, ValueEnum)]
enum TraceModule {
    Http,
    Index,
    Resolve,
    Install,
    All,
}

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "tsd",
    about = "Search, resolve and install TypeScript declaration files from DefinitelyTyped",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Project config file
    #[clap(long, global = true, default_value = tsd_core::config::CONFIG_FILE)]
    config: PathBuf,

    /// How the HTTP cache may use the network
    #[clap(long, global = true, default_value = "default", value_parser = parse_cache_mode)]
    cache_mode: CacheMode,

    /// Override the cache directory
    #[clap(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Request timeout in seconds
    #[clap(long, global = true, default_value_t = 30)]
    timeout: u64,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Enable detailed tracing (comma-separated: http,index,resolve,install,all)
    #[clap(long, value_delimiter = ',', global = true)]
    trace: Vec<TraceModule>,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    log_json: bool,

    /// Show every fetch and resolved file while working
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Find definitions and optionally resolve and install them
    Query {
        /// Paths, directories (`jquery/`), globs (`jquery*`) or names (`jquery`)
        #[clap(required = true)]
        selectors: Vec<String>,

        /// Show parsed header info for each match
        #[clap(long)]
        info: bool,

        /// Show the commit history of each match
        #[clap(long)]
        history: bool,

        /// Resolve the dependency closure of the matches
        #[clap(long)]
        resolve: bool,

        /// Install the resolved files
        #[clap(long)]
        install: bool,

        /// Record installed files in the config and bundle
        #[clap(long, requires = "install")]
        save: bool,

        #[clap(flatten)]
        policy: PolicyArgs,

        /// Do everything except writing files
        #[clap(long)]
        dry_run: bool,

        /// Print results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Install everything pinned in the config
    Reinstall {
        #[clap(flatten)]
        policy: PolicyArgs,

        #[clap(long)]
        dry_run: bool,

        #[clap(long)]
        json: bool,
    },

    /// Show the GitHub API quota
    Rate {
        #[clap(long)]
        json: bool,
    },

    /// Print the cache key and entry directory of a URL
    CacheKey { url: String },
}

#[derive(clap::Args, Debug, Clone)]
#[group(multiple = false)]
struct PolicyArgs {
    /// Replace existing files
    #[clap(long)]
    overwrite: bool,

    /// Leave existing files alone (default)
    #[clap(long)]
    skip_existing: bool,

    /// Keep identical files, report differing ones
    #[clap(long)]
    fail_on_differ: bool,
}

impl PolicyArgs {
    fn policy(&self) -> InstallPolicy {
        if self.overwrite {
            InstallPolicy::Overwrite
        } else if self.fail_on_differ {
            InstallPolicy::FailOnDiffer
        } else {
            InstallPolicy::SkipExisting
        }
    }
}

fn parse_cache_mode(value: &str) -> std::result::Result<CacheMode, String> {
    value.parse()
}

/// Initialize tracing with CLI flags
///
/// Logs always go to stderr so stdout stays parseable.
fn initialize_tracing(log_level: &LogLevel, trace_modules: &[TraceModule], json: bool) {
    let mut filter = EnvFilter::new(log_level.to_filter_directive());

    for module in trace_modules {
        let directive = match module {
            TraceModule::Http => "tsd_core::http=trace",
            TraceModule::Index => "tsd_core::index=trace",
            TraceModule::Resolve => "tsd_core::resolver=trace",
            TraceModule::Install => "tsd_core::installer=trace",
            TraceModule::All => "tsd_core=trace",
        };
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level, &cli.trace, cli.log_json);

    match &cli.command {
        Command::Query {
            selectors,
            info,
            history,
            resolve,
            install,
            save,
            policy,
            dry_run,
            json,
        } => {
            let options = QueryOptions {
                info: *info,
                history: *history,
                resolve: *resolve || *install,
                install: *install,
                save: *save,
                policy: policy.policy(),
                dry_run: *dry_run,
                json: *json,
            };
            query_command(&cli, selectors, options).await
        }
        Command::Reinstall {
            policy,
            dry_run,
            json,
        } => reinstall_command(&cli, policy.policy(), *dry_run, *json).await,
        Command::Rate { json } => rate_command(&cli, *json).await,
        Command::CacheKey { url } => cache_key_command(&cli, url),
    }
}

fn settings(cli: &Cli) -> Result<CoreSettings> {
    let mut settings = match &cli.cache_dir {
        Some(dir) => CoreSettings {
            token: tsd_core::config::token_from_env(),
            ..CoreSettings::with_cache_dir(dir.clone())
        },
        None => CoreSettings::from_env()?,
    };
    settings.cache_mode = cli.cache_mode;
    settings.timeout = Duration::from_secs(cli.timeout.max(1));
    Ok(settings)
}

/// Engine plus the task printing its progress
struct Session {
    engine: Engine,
    printer: tokio::task::JoinHandle<()>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let (reporter, events) = Reporter::channel();
        let ctx = Context::load(Some(&cli.config), settings(cli)?)?.with_reporter(reporter);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing current file operations");
                cancel.cancel();
            }
        });

        let engine = Engine::new(ctx).context("Failed to set up HTTP client")?;
        let printer = ProgressPrinter::new(cli.verbose).spawn(events);
        Ok(Self { engine, printer })
    }

    /// Drop the engine so the progress channel closes, then let the printer drain
    async fn close(self) {
        drop(self.engine);
        let _ = self.printer.await;
    }
}

struct QueryOptions {
    info: bool,
    history: bool,
    resolve: bool,
    install: bool,
    save: bool,
    policy: InstallPolicy,
    dry_run: bool,
    json: bool,
}

async fn query_command(cli: &Cli, selectors: &[String], options: QueryOptions) -> Result<()> {
    let selectors = selectors
        .iter()
        .map(|s| Selector::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    let mut session = Session::open(cli)?;
    let engine = &mut session.engine;

    let defs = engine.select(&selectors).await?;
    if defs.is_empty() {
        session.close().await;
        bail!("No definitions match the given selectors");
    }
    info!("{} definition(s) selected", defs.len());

    let mut output = serde_json::json!({ "definitions": defs });

    if !options.json {
        println!("{}", printer::defs_table(&defs));
    }

    if options.info {
        let mut infos: Vec<(Revision, DefInfo)> = Vec::new();
        for def in &defs {
            let (revision, info) = engine.info(def).await?;
            infos.push((revision, (*info).clone()));
        }
        if options.json {
            output["info"] = serde_json::to_value(
                infos
                    .iter()
                    .map(|(rev, info)| serde_json::json!({ "revision": rev, "info": info }))
                    .collect::<Vec<_>>(),
            )?;
        } else {
            println!("{}", printer::info_table(&infos));
        }
    }

    if options.history {
        let mut histories = BTreeMap::new();
        for def in &defs {
            let history = engine.history(&def.path).await?;
            if !options.json {
                println!("{}", def.path);
                println!("{}", printer::history_table(&history));
            }
            histories.insert(def.path.clone(), history);
        }
        if options.json {
            output["history"] = serde_json::to_value(&histories)?;
        }
    }

    let mut failed = false;
    if options.resolve {
        let roots: Vec<String> = defs.iter().map(|d| d.path.clone()).collect();
        let resolution = engine.resolve(&roots, &BTreeMap::new()).await?;
        failed |= !resolution.is_ok();

        if options.json {
            output["resolved"] = serde_json::to_value(BundleManager::manifest_of(&resolution))?;
            output["conflicts"] = serde_json::to_value(&resolution.conflicts)?;
            output["errors"] = serde_json::to_value(
                resolution
                    .errors
                    .iter()
                    .map(|e| serde_json::json!({
                        "path": e.path,
                        "referrer": e.referrer,
                        "error": e.error.to_string(),
                    }))
                    .collect::<Vec<_>>(),
            )?;
        } else {
            println!("{}", printer::resolution_table(&resolution));
        }

        if options.install {
            let result = engine
                .install(&resolution.resolved, options.policy, options.dry_run)
                .await?;
            failed |= !result.is_ok();

            if options.json {
                output["installed"] =
                    serde_json::to_value(BundleManager::manifest_of_install(&result))?;
            } else {
                println!("{}", printer::install_table(&result));
            }

            if options.save {
                engine.save_installed(&resolution, &result)?;
            }
        }
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    session.close().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn reinstall_command(cli: &Cli, policy: InstallPolicy, dry_run: bool, json: bool) -> Result<()> {
    let session = Session::open(cli)?;
    let engine = &session.engine;

    if engine.pins().is_empty() {
        eprintln!("Nothing installed in {}", cli.config.display());
        session.close().await;
        return Ok(());
    }

    let (resolution, result) = engine.reinstall(policy, dry_run).await?;
    let failed = !resolution.is_ok() || !result.is_ok();
    let untracked = engine.untracked()?;

    if json {
        let output = serde_json::json!({
            "resolved": BundleManager::manifest_of(&resolution),
            "conflicts": resolution.conflicts,
            "installed": BundleManager::manifest_of_install(&result),
            "untracked": untracked,
            "dry_run": result.dry_run,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", printer::resolution_table(&resolution));
        println!("{}", printer::install_table(&result));
        for path in &untracked {
            eprintln!("-- not in {}: {}", cli.config.display(), path);
        }
    }

    session.close().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn rate_command(cli: &Cli, json: bool) -> Result<()> {
    let session = Session::open(cli)?;
    let state = session.engine.refresh_rate().await?;
    debug!("Rate state: {:?}", state);

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("GitHub API: {state}");
        if !state.has_remaining() {
            println!("Quota exhausted, resets in {}", state.reset_string());
        }
    }

    session.close().await;
    Ok(())
}

fn cache_key_command(cli: &Cli, url: &str) -> Result<()> {
    let ctx = Context::load(Some(&cli.config), settings(cli)?)?;
    let engine = Engine::new(ctx).context("Failed to set up HTTP client")?;
    let (key, dir) = engine.cache_location(url);
    println!("{key}");
    println!("{}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_flags() {
        let cli = Cli::try_parse_from([
            "tsd",
            "--cache-mode",
            "offline",
            "query",
            "jquery/",
            "node",
            "--install",
            "--save",
            "--fail-on-differ",
        ])
        .unwrap();

        assert_eq!(cli.cache_mode, CacheMode::Offline);
        match cli.command {
            Command::Query {
                selectors,
                install,
                save,
                policy,
                ..
            } => {
                assert_eq!(selectors, vec!["jquery/", "node"]);
                assert!(install && save);
                assert_eq!(policy.policy(), InstallPolicy::FailOnDiffer);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_conflicting_policies_are_rejected() {
        assert!(Cli::try_parse_from(["tsd", "reinstall", "--overwrite", "--skip-existing"]).is_err());
        assert!(Cli::try_parse_from(["tsd", "query", "x", "--save"]).is_err());
        assert!(Cli::try_parse_from(["tsd", "--cache-mode", "sometimes", "rate"]).is_err());
    }

    #[test]
    fn test_default_policy() {
        let cli = Cli::try_parse_from(["tsd", "reinstall"]).unwrap();
        match cli.command {
            Command::Reinstall { policy, .. } => {
                assert_eq!(policy.policy(), InstallPolicy::SkipExisting)
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
