//! Run orchestration
//!
//! Sites are crawled one at a time to keep spreadsheet quota in check; the
//! proxy pool and the progress store are shared across all of them. After
//! the last site the writer appends the `_runs` rows and refreshes the
//! `_state` tab.

use crate::config::{GlobalConfig, SiteConfig};
use crate::crawler::content::ContentFetcher;
use crate::crawler::models::SiteCrawlResult;
use crate::crawler::site::SiteCrawler;
use crate::media::ImageSaver;
use crate::net::{create_engine, HttpEngine, ProxyPool};
use crate::runtime::RunContext;
use crate::sheets::SheetsWriter;
use crate::state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Runner {
    context: RunContext,
    config: Arc<GlobalConfig>,
    sites: Vec<Arc<SiteConfig>>,
    state: Arc<StateStore>,
    writer: Option<Arc<SheetsWriter>>,
    pool: Arc<ProxyPool>,
    image_dir: PathBuf,
}

impl Runner {
    pub fn new(
        context: RunContext,
        config: Arc<GlobalConfig>,
        sites: Vec<Arc<SiteConfig>>,
        state: Arc<StateStore>,
        writer: Option<Arc<SheetsWriter>>,
        image_dir: PathBuf,
    ) -> Self {
        let pool = Arc::new(ProxyPool::new(
            &config.network.proxy_pool,
            config.network.proxy_allow_direct,
            Some(config.network.bad_proxy_log_path.clone()),
        ));
        Self {
            context,
            config,
            sites,
            state,
            writer,
            pool,
            image_dir,
        }
    }

    /// Skipped products land next to the state database
    fn skipped_log_path(&self) -> PathBuf {
        self.config
            .state
            .database
            .parent()
            .map(|dir| dir.join("skipped_products.log"))
            .unwrap_or_else(|| PathBuf::from("skipped_products.log"))
    }

    /// Crawls every configured site sequentially.
    ///
    /// A global stop threshold or cancellation between sites ends the run
    /// early; results collected so far are still finalized.
    pub async fn run(&self) -> crate::Result<Vec<SiteCrawlResult>> {
        if let Some(writer) = &self.writer {
            writer.init().await?;
        }

        let mut results = Vec::new();
        for site in &self.sites {
            if self.context.should_stop() {
                tracing::info!("Run-wide stop reached, remaining sites skipped");
                break;
            }
            if let Some(writer) = &self.writer {
                writer.prepare_tab(site.domain()).await?;
            }

            let engine = create_engine(
                site.engine(),
                self.config.network.clone(),
                self.config.runtime.behavior.clone(),
                self.pool.clone(),
            );
            let product_kind = self.config.runtime.product_fetch_engine;
            let product_engine = if product_kind == site.engine() {
                engine.clone()
            } else {
                create_engine(
                    product_kind,
                    self.config.network.clone(),
                    self.config.runtime.behavior.clone(),
                    self.pool.clone(),
                )
            };
            let content = Arc::new(ContentFetcher::new(product_engine.clone()));
            let images = Arc::new(ImageSaver::new(
                Arc::new(HttpEngine::new(
                    self.config.network.clone(),
                    self.pool.clone(),
                )),
                self.image_dir.clone(),
            )?);

            let crawler = Arc::new(SiteCrawler::new(
                self.context.clone(),
                self.config.clone(),
                site.clone(),
                engine.clone(),
                content,
                images,
                self.writer.clone(),
                self.state.clone(),
                self.skipped_log_path(),
            ));
            let result = crawler.crawl().await;
            tracing::info!(
                site = site.name(),
                products_new = result.products_new(),
                outcome = ?result.outcome,
                "Site done"
            );
            results.push(result);

            // Browser contexts and clients are released per site.
            if !Arc::ptr_eq(&engine, &product_engine) {
                product_engine.shutdown().await;
            }
            engine.shutdown().await;
        }

        if let Some(writer) = &self.writer {
            writer
                .finish_run(
                    &self.context.run_id,
                    self.context.started_at,
                    &results,
                    &self.state,
                )
                .await?;
        } else {
            tracing::info!("Dry run: spreadsheet writes skipped");
        }

        Ok(results)
    }
}
