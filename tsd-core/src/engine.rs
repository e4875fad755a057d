//! The resolution engine
//!
//! Wires the caches, index, parser, resolver and installer together for one
//! [`Context`]. Callers use this instead of assembling the parts by hand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bundle::{BundleManager, Manifest};
use crate::content::ContentLoader;
use crate::context::Context;
use crate::error::{Result, TsdError};
use crate::http::{CacheRequest, CacheStore, RateState, ReqwestTransport, Transport};
use crate::index::{IndexManager, Selector};
use crate::installer::{InstallOptions, InstallPolicy, InstallResult, Installer};
use crate::model::{Def, DefInfo, Revision};
use crate::parser::InfoParser;
use crate::resolver::{Resolution, ResolveOptions, Resolver};

pub struct Engine {
    ctx: Context,
    api_store: CacheStore,
    raw_store: CacheStore,
    index: Arc<IndexManager>,
    loader: Arc<ContentLoader>,
    parser: Arc<InfoParser>,
    resolver: Resolver,
    installer: Installer,
}

impl Engine {
    /// Engine talking to GitHub over HTTPS
    pub fn new(ctx: Context) -> Result<Self> {
        let settings = &ctx.settings;
        let api = ReqwestTransport::new(&settings.user_agent, settings.timeout)?
            .with_token(settings.token.as_deref());
        let raw = ReqwestTransport::new(&settings.user_agent, settings.timeout)?;
        Ok(Self::with_transports(ctx, Arc::new(api), Arc::new(raw)))
    }

    /// Engine over explicit transports for the API and raw content hosts
    pub fn with_transports(ctx: Context, api: Arc<dyn Transport>, raw: Arc<dyn Transport>) -> Self {
        let mode = ctx.settings.cache_mode;
        let api_store = ctx.api_store(api);
        let raw_store = ctx.raw_store(raw);

        let index = Arc::new(IndexManager::new(
            api_store.clone(),
            ctx.repo.clone(),
            mode,
            ctx.reporter.clone(),
        ));
        let loader = Arc::new(ContentLoader::new(raw_store.clone(), ctx.repo.clone(), mode));
        let parser = Arc::new(InfoParser::new(
            loader.clone(),
            ctx.reporter.clone(),
            ctx.settings.concurrency,
        ));
        let resolver = Resolver::new(index.clone(), parser.clone(), ctx.reporter.clone());
        let installer = Installer::new(loader.clone(), ctx.install_root(), ctx.reporter.clone())
            .with_concurrency(ctx.settings.concurrency);

        debug!("Engine ready for {} (mode {})", ctx.repo.slug(), mode);

        Self {
            ctx,
            api_store,
            raw_store,
            index,
            loader,
            parser,
            resolver,
            installer,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    /// Load the index unless it already is
    pub async fn ensure_index(&self) -> Result<()> {
        if self.index.head_commit().await.is_none() {
            self.index.load().await?;
        }
        Ok(())
    }

    /// Definitions matching any selector
    pub async fn select(&self, selectors: &[Selector]) -> Result<Vec<Def>> {
        self.ensure_index().await?;
        Ok(self.index.query(selectors).await)
    }

    /// Head revision of `def` with its parsed header
    pub async fn info(&self, def: &Def) -> Result<(Revision, Arc<DefInfo>)> {
        let head = match def.head {
            Some(id) => self.index.revision(id).await,
            None => None,
        };
        let head = head.ok_or_else(|| TsdError::NotFound {
            path: def.path.clone(),
        })?;
        let info = self.parser.parse_info(&head).await?;
        Ok((head, info))
    }

    /// Commit history of a definition, newest first
    pub async fn history(&self, path: &str) -> Result<Vec<Revision>> {
        self.ensure_index().await?;
        let def = self.index.load_history(path).await?;
        Ok(self.index.history(def.id).await)
    }

    /// Raw content of a revision
    pub async fn content(&self, revision: &Revision) -> Result<bytes::Bytes> {
        self.loader.load_content(revision).await
    }

    pub async fn resolve(&self, paths: &[String], pins: &Manifest) -> Result<Resolution> {
        self.ensure_index().await?;
        let options = ResolveOptions {
            pins: pins.clone(),
            cancel: self.ctx.cancel.clone(),
        };
        self.resolver.resolve(paths, &options).await
    }

    pub async fn install(
        &self,
        revisions: &[Revision],
        policy: InstallPolicy,
        dry_run: bool,
    ) -> Result<InstallResult> {
        let options = InstallOptions {
            policy,
            dry_run,
            cancel: self.ctx.cancel.clone(),
        };
        self.installer.install(revisions, &options).await
    }

    /// Resolve and install everything pinned in the config
    pub async fn reinstall(
        &self,
        policy: InstallPolicy,
        dry_run: bool,
    ) -> Result<(Resolution, InstallResult)> {
        let pins = BundleManager::pins_from(&self.ctx.config);
        if pins.is_empty() {
            info!("Nothing pinned in {}", self.ctx.config_path.display());
            return Ok((Resolution::default(), InstallResult {
                dry_run,
                ..InstallResult::default()
            }));
        }

        let roots: Vec<String> = pins.keys().cloned().collect();
        let resolution = self.resolve(&roots, &pins).await?;
        let result = self.install(&resolution.resolved, policy, dry_run).await?;
        Ok((resolution, result))
    }

    /// Pin the resolved set in the config and the bundle file, then save
    pub fn save_installed(
        &mut self,
        resolution: &Resolution,
        result: &InstallResult,
    ) -> anyhow::Result<()> {
        if result.dry_run {
            return Ok(());
        }

        let manifest = BundleManager::manifest_to_save(resolution, result);
        BundleManager::apply(&mut self.ctx.config, &manifest);

        if let Some(bundle) = self.ctx.bundle_path() {
            let paths: Vec<String> = manifest.keys().cloned().collect();
            BundleManager::update_bundle(&bundle, &self.ctx.install_root(), &paths)?;
        }

        self.ctx.save_config()?;
        info!(
            "Saved {} pinned definition(s) to {}",
            manifest.len(),
            self.ctx.config_path.display()
        );
        Ok(())
    }

    /// Last known API quota
    pub fn rate(&self) -> RateState {
        self.ctx.rate.snapshot()
    }

    /// Ask the API for the current quota
    ///
    /// The `rate_limit` endpoint does not count against the quota, so this
    /// works while other API calls are blocked.
    pub async fn refresh_rate(&self) -> Result<RateState> {
        let request = self.ctx.repo.api_request(self.ctx.repo.rate_limit_url());
        self.api_store.send_uncounted(&request).await?;
        Ok(self.rate())
    }

    /// Cache key and entry directory a URL is stored under
    ///
    /// URLs on the API host carry the API accept header, anything else is
    /// treated as raw content.
    pub fn cache_location(&self, url: &str) -> (String, PathBuf) {
        let repo = &self.ctx.repo;
        if repo.is_api_url(url) {
            let request = repo.api_request(url.to_string());
            (request.key(), self.api_store.entry_dir(&request))
        } else {
            let request = CacheRequest::get(url);
            (request.key(), self.raw_store.entry_dir(&request))
        }
    }

    /// Declaration files below the install root that the config does not pin
    ///
    /// The bundle file is not counted.
    pub fn untracked(&self) -> Result<Vec<String>> {
        let pins = self.pins();
        let bundle = self.ctx.bundle_path();
        Ok(self
            .installer
            .list_installed()?
            .into_iter()
            .filter(|path| !pins.contains_key(path))
            .filter(|path| bundle.as_deref() != Some(self.installer.install_path(path).as_path()))
            .collect())
    }

    /// Current pins of the config
    pub fn pins(&self) -> BTreeMap<String, String> {
        BundleManager::pins_from(&self.ctx.config)
    }
}
