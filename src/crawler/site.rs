//! Per-site crawl pipeline
//!
//! Drives pagination for every category of a site, extracts product links,
//! and runs the per-product pipeline: delay, content fetch, image save, row
//! append, progress upsert. Categories of one site run concurrently up to
//! the configured limit; products within a category are strictly sequential
//! so the committed count in the progress store stays monotonic.

use crate::config::{GlobalConfig, PaginationMode, SiteConfig, StopCondition};
use crate::crawler::content::ContentFetcher;
use crate::crawler::models::{CategoryMetrics, CategoryOutcome, ProductRecord, SiteCrawlResult};
use crate::media::ImageSaver;
use crate::net::{BehaviorContext, Engine, EngineRequest};
use crate::runtime::{jitter_sleep, RunContext};
use crate::sheets::SheetsWriter;
use crate::state::{CategoryState, StateStore};
use crate::url::{canonicalize_url, fingerprint};
use chrono::Utc;
use scraper::{Html, Selector};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

/// Everything extracted from one listing page, parsed up front so no
/// document state crosses an await point
struct ParsedListing {
    product_hrefs: Vec<String>,
    stop_condition_fired: bool,
    next_url: Option<String>,
}

/// How a page's product batch ended
enum PageControl {
    Continue,
    /// `max_products` for the site was reached
    LimitHit,
    /// A run-wide stop threshold or cancellation fired
    GlobalStop,
}

pub struct SiteCrawler {
    context: RunContext,
    config: Arc<GlobalConfig>,
    site: Arc<SiteConfig>,
    engine: Arc<dyn Engine>,
    content: Arc<ContentFetcher>,
    images: Arc<ImageSaver>,
    writer: Option<Arc<SheetsWriter>>,
    state: Arc<StateStore>,
    skipped_log: PathBuf,
    /// In-run dedupe across every category of the site, keyed by fingerprint
    seen_hashes: Mutex<HashSet<String>>,
}

impl SiteCrawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: RunContext,
        config: Arc<GlobalConfig>,
        site: Arc<SiteConfig>,
        engine: Arc<dyn Engine>,
        content: Arc<ContentFetcher>,
        images: Arc<ImageSaver>,
        writer: Option<Arc<SheetsWriter>>,
        state: Arc<StateStore>,
        skipped_log: PathBuf,
    ) -> Self {
        Self {
            context,
            config,
            site,
            engine,
            content,
            images,
            writer,
            state,
            skipped_log,
            seen_hashes: Mutex::new(HashSet::new()),
        }
    }

    /// Crawls every category of the site.
    ///
    /// Categories run as parallel tasks bounded by
    /// `max_concurrency_per_site`; scheduling stops as soon as the run is
    /// cancelled or a global threshold fires, while in-flight categories
    /// finish their current product cleanly.
    pub async fn crawl(self: Arc<Self>) -> SiteCrawlResult {
        tracing::info!(site = self.site.name(), "Starting site crawl");
        let semaphore = Arc::new(Semaphore::new(
            self.config.runtime.max_concurrency_per_site,
        ));
        let mut handles = Vec::new();

        for category_url in &self.site.category_urls {
            if self.context.should_stop() {
                tracing::info!(
                    site = self.site.name(),
                    "Global stop reached, not scheduling further categories"
                );
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let crawler = self.clone();
            let url = category_url.clone();
            handles.push(tokio::spawn(async move {
                let result = crawler.crawl_category(&url).await;
                drop(permit);
                result
            }));
        }

        let mut metrics = Vec::new();
        let mut outcome = CategoryOutcome::Done;
        for handle in handles {
            match handle.await {
                Ok((category_metrics, category_outcome)) => {
                    if category_outcome == CategoryOutcome::Failed {
                        outcome = CategoryOutcome::Failed;
                    } else if category_outcome == CategoryOutcome::Stopped
                        && outcome == CategoryOutcome::Done
                    {
                        outcome = CategoryOutcome::Stopped;
                    }
                    metrics.push(category_metrics);
                }
                Err(err) => {
                    tracing::error!(site = self.site.name(), error = %err, "Category task panicked");
                    outcome = CategoryOutcome::Failed;
                }
            }
        }

        tracing::info!(
            site = self.site.name(),
            categories = metrics.len(),
            products = metrics.iter().map(|m| m.total_written).sum::<u64>(),
            "Site crawl finished"
        );
        SiteCrawlResult {
            site_name: self.site.name().to_string(),
            sheet_tab: self.site.domain().to_string(),
            metrics,
            outcome,
        }
    }

    async fn crawl_category(&self, category_url: &str) -> (CategoryMetrics, CategoryOutcome) {
        let result = match self.site.pagination.mode {
            PaginationMode::NumberedPages => self.crawl_numbered_pages(category_url).await,
            PaginationMode::NextButton => self.crawl_next_button(category_url).await,
            PaginationMode::InfiniteScroll => self.crawl_infinite_scroll(category_url).await,
        };
        let (metrics, outcome) = &result;
        tracing::info!(
            site = self.site.name(),
            category = category_url,
            written = metrics.total_written,
            duplicates = metrics.total_duplicates,
            failed = metrics.total_failed,
            outcome = ?outcome,
            "Category finished"
        );
        result
    }

    async fn crawl_numbered_pages(
        &self,
        category_url: &str,
    ) -> (CategoryMetrics, CategoryOutcome) {
        let mut metrics = CategoryMetrics::new(self.site.name(), category_url);
        let resumed = self.resume_state(category_url);
        let configured_start = self.site.pagination.start_page.unwrap_or(1).max(1);
        let start_page = resumed
            .as_ref()
            .and_then(|s| s.last_page)
            .map_or(configured_start, |last| configured_start.max(last));
        let mut committed = resumed
            .as_ref()
            .and_then(|s| s.last_product_count)
            .unwrap_or(0);
        if resumed.is_some() {
            tracing::info!(
                category = category_url,
                start_page,
                committed,
                "Resuming category from saved progress"
            );
        }
        let max_page = self
            .site
            .limits
            .max_pages
            .or(self.site.pagination.max_pages)
            .unwrap_or(100);
        let param = self
            .site
            .pagination
            .param_name
            .as_deref()
            .unwrap_or("page");

        let mut page = start_page;
        let mut pages_processed: u32 = 0;
        let mut outcome = CategoryOutcome::Done;

        loop {
            if let Some(end_page) = self.site.pagination.end_page {
                if page > end_page {
                    break;
                }
            }
            if page > max_page {
                outcome = CategoryOutcome::Stopped;
                break;
            }
            if self.context.should_stop() {
                outcome = CategoryOutcome::Stopped;
                break;
            }

            let page_url = build_page_url(category_url, page, param);
            let html = match self.fetch_listing(&page_url, None).await {
                Ok(html) => html,
                Err(err) => {
                    tracing::error!(
                        category = category_url,
                        page,
                        error = %err,
                        "Listing fetch failed, category aborted"
                    );
                    outcome = CategoryOutcome::Failed;
                    break;
                }
            };

            let parsed = parse_listing(&html, &self.site, &page_url);
            if parsed.stop_condition_fired {
                metrics.last_page = Some(page);
                outcome = CategoryOutcome::Stopped;
                break;
            }
            if parsed.product_hrefs.is_empty() {
                break;
            }

            metrics.total_found += parsed.product_hrefs.len() as u64;
            let before = metrics.total_written;
            let control = self
                .process_products(
                    category_url,
                    page,
                    &parsed.product_hrefs,
                    &mut metrics,
                    &mut committed,
                )
                .await;
            metrics.last_page = Some(page);
            pages_processed += 1;

            match control {
                PageControl::Continue => {}
                PageControl::LimitHit | PageControl::GlobalStop => {
                    outcome = CategoryOutcome::Stopped;
                    break;
                }
            }
            if self.stop_after_pages(pages_processed)
                || self.stop_on_no_new_products(metrics.total_written - before)
            {
                outcome = CategoryOutcome::Stopped;
                break;
            }

            page += 1;
            jitter_sleep(&self.config.runtime.page_delay).await;
        }

        // Final durable progress, also covering a stop with zero products.
        if let Some(last_page) = metrics.last_page {
            self.persist_state(category_url, last_page, committed);
        }
        (metrics, outcome)
    }

    async fn crawl_next_button(&self, category_url: &str) -> (CategoryMetrics, CategoryOutcome) {
        let mut metrics = CategoryMetrics::new(self.site.name(), category_url);
        let mut committed = self.resumed_count(category_url).unwrap_or(0);
        let max_page = self
            .site
            .limits
            .max_pages
            .or(self.site.pagination.max_pages)
            .unwrap_or(100);

        let mut next_url = Some(category_url.to_string());
        let mut page: u32 = 1;
        let mut outcome = CategoryOutcome::Done;

        while let Some(url) = next_url.take() {
            if page > max_page || self.context.should_stop() {
                outcome = CategoryOutcome::Stopped;
                break;
            }

            let html = match self.fetch_listing(&url, None).await {
                Ok(html) => html,
                Err(err) => {
                    tracing::error!(category = category_url, page, error = %err, "Listing fetch failed");
                    outcome = CategoryOutcome::Failed;
                    break;
                }
            };

            let parsed = parse_listing(&html, &self.site, &url);
            if parsed.stop_condition_fired {
                metrics.last_page = Some(page);
                outcome = CategoryOutcome::Stopped;
                break;
            }
            if parsed.product_hrefs.is_empty() {
                break;
            }

            metrics.total_found += parsed.product_hrefs.len() as u64;
            let before = metrics.total_written;
            let control = self
                .process_products(category_url, page, &parsed.product_hrefs, &mut metrics, &mut committed)
                .await;
            metrics.last_page = Some(page);

            match control {
                PageControl::Continue => {}
                PageControl::LimitHit | PageControl::GlobalStop => {
                    outcome = CategoryOutcome::Stopped;
                    break;
                }
            }
            if self.stop_on_no_new_products(metrics.total_written - before) {
                outcome = CategoryOutcome::Stopped;
                break;
            }

            // The next page is wherever the next button points; absent
            // button ends the category.
            next_url = parsed.next_url;
            page += 1;
            if next_url.is_some() {
                jitter_sleep(&self.config.runtime.page_delay).await;
            }
        }

        if let Some(last_page) = metrics.last_page {
            self.persist_state(category_url, last_page, committed);
        }
        (metrics, outcome)
    }

    async fn crawl_infinite_scroll(
        &self,
        category_url: &str,
    ) -> (CategoryMetrics, CategoryOutcome) {
        let mut metrics = CategoryMetrics::new(self.site.name(), category_url);
        let mut committed = self.resumed_count(category_url).unwrap_or(0);
        let scroll_limit = self
            .site
            .limits
            .max_scrolls
            .or(self.site.pagination.max_scrolls)
            .unwrap_or(30);

        let html = match self.fetch_listing(category_url, Some(scroll_limit)).await {
            Ok(html) => html,
            Err(err) => {
                tracing::error!(category = category_url, error = %err, "Scroll listing fetch failed");
                return (metrics, CategoryOutcome::Failed);
            }
        };

        let parsed = parse_listing(&html, &self.site, category_url);
        if parsed.stop_condition_fired {
            metrics.last_page = Some(1);
            return (metrics, CategoryOutcome::Stopped);
        }
        if parsed.product_hrefs.is_empty() {
            return (metrics, CategoryOutcome::Done);
        }

        metrics.total_found += parsed.product_hrefs.len() as u64;
        let control = self
            .process_products(category_url, 1, &parsed.product_hrefs, &mut metrics, &mut committed)
            .await;
        metrics.last_page = Some(1);
        self.persist_state(category_url, 1, committed);
        let outcome = match control {
            PageControl::Continue => CategoryOutcome::Done,
            PageControl::LimitHit | PageControl::GlobalStop => CategoryOutcome::Stopped,
        };
        (metrics, outcome)
    }

    /// Fetches one listing page through the engine, waits applied
    async fn fetch_listing(
        &self,
        url: &str,
        scroll_limit: Option<u32>,
    ) -> Result<String, crate::net::FetchError> {
        let mut request = EngineRequest::new(url);
        request.wait_conditions = self.site.wait_conditions.clone();
        request.scroll_limit = scroll_limit;
        request.scroll_depth_clamp = match (
            self.site.pagination.scroll_min_percent,
            self.site.pagination.scroll_max_percent,
        ) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        };
        request.behavior_context = self.behavior_context(url, false);
        let result = self.engine.fetch(&request).await?;
        Ok(result.html)
    }

    /// The sequential per-product pipeline for one page's links
    async fn process_products(
        &self,
        category_url: &str,
        page: u32,
        hrefs: &[String],
        metrics: &mut CategoryMetrics,
        committed: &mut u64,
    ) -> PageControl {
        let tab = self.site.domain().to_string();
        let base = self
            .site
            .base_url()
            .map(str::to_string)
            .or_else(|| Some(category_url.to_string()));

        for href in hrefs {
            let Ok(product_url) = canonicalize_url(
                href,
                base.as_deref(),
                &self.config.dedupe.strip_params_blacklist,
            ) else {
                tracing::debug!(href, "Unparseable product link dropped");
                continue;
            };
            let hash = fingerprint(&product_url);

            {
                let mut seen = self.seen_hashes.lock().expect("seen set lock poisoned");
                if !seen.insert(hash.clone()) {
                    metrics.total_duplicates += 1;
                    continue;
                }
            }

            if !self.domain_allowed(&product_url) {
                continue;
            }

            // Products already on the tab from a previous run are skipped
            // before any fetch, so a resumed category starts right after
            // the last committed product.
            if let Some(writer) = &self.writer {
                match writer.is_known(&tab, &product_url).await {
                    Ok(true) => {
                        metrics.total_duplicates += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "Seen-cache seed failed");
                        self.log_skipped(&product_url, &err.to_string());
                        metrics.total_failed += 1;
                        continue;
                    }
                }
            }

            if self.context.should_stop() {
                return PageControl::GlobalStop;
            }

            jitter_sleep(&self.config.runtime.product_delay).await;

            let content = match self
                .content
                .fetch(
                    &product_url,
                    &self.site.selectors,
                    self.behavior_context(&product_url, true),
                )
                .await
            {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(url = %product_url, error = %err, "Product fetch failed, skipping");
                    self.log_skipped(&product_url, &err.to_string());
                    metrics.total_failed += 1;
                    continue;
                }
            };

            // Image failures are non-fatal: the row is still committed with
            // an empty image_path.
            let image_path = match &content.image_url {
                Some(image_url) => match self
                    .images
                    .save(image_url, content.title.as_deref(), &product_url)
                    .await
                {
                    Ok(path) => Some(path),
                    Err(err) => {
                        tracing::warn!(url = %image_url, error = %err, "Image save failed");
                        None
                    }
                },
                None => None,
            };

            let mut metadata = BTreeMap::new();
            if let Some(image_url) = &content.image_url {
                metadata.insert("image_url".to_string(), image_url.clone());
            }
            let record = ProductRecord {
                source_site: self.site.domain().to_string(),
                category: self.category_label(category_url),
                category_url: category_url.to_string(),
                product_url: product_url.clone(),
                product_content: content.text.clone(),
                discovered_at: Utc::now(),
                run_id: self.context.run_id.clone(),
                product_id_hash: hash,
                page_num: page,
                metadata,
                image_path: image_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                name_en: content.name_en.clone(),
                name_ru: content.name_ru.clone(),
                price_without_discount: content.price_without_discount.clone(),
                price_with_discount: content.price_with_discount.clone(),
                status: "new".to_string(),
                note: None,
                processed_at: None,
                llm_raw: None,
            };

            if let Some(writer) = &self.writer {
                if let Err(err) = writer.append_product(&tab, &record).await {
                    // Append ladder exhausted: roll the image back and skip
                    // the product; the crawler keeps going.
                    if let Some(path) = &image_path {
                        self.images.rollback(path);
                    }
                    self.log_skipped(&product_url, &err.to_string());
                    metrics.total_failed += 1;
                    continue;
                }
            }

            *committed += 1;
            metrics.total_written += 1;
            self.context.register_product();
            self.persist_state(category_url, page, *committed);

            if let Some(max_products) = self.site.limits.max_products {
                if metrics.total_written >= max_products {
                    return PageControl::LimitHit;
                }
            }
            if self.context.should_stop() {
                return PageControl::GlobalStop;
            }
        }

        PageControl::Continue
    }

    fn resume_state(&self, category_url: &str) -> Option<CategoryState> {
        if !self.context.resume {
            return None;
        }
        self.state
            .get(self.site.name(), category_url)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Progress read failed, starting fresh");
                None
            })
    }

    fn resumed_count(&self, category_url: &str) -> Option<u64> {
        self.resume_state(category_url)
            .and_then(|s| s.last_product_count)
    }

    fn persist_state(&self, category_url: &str, last_page: u32, committed: u64) {
        let state = CategoryState {
            site_name: self.site.name().to_string(),
            category_url: category_url.to_string(),
            last_page: Some(last_page),
            last_product_count: Some(committed),
            last_run_ts: Some(Utc::now()),
        };
        if let Err(err) = self.state.upsert(&state) {
            tracing::error!(error = %err, "Progress upsert failed");
        }
    }

    fn domain_allowed(&self, product_url: &str) -> bool {
        let allowed = &self.site.selectors.allowed_domains;
        if allowed.is_empty() {
            return true;
        }
        Url::parse(product_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .map(|host| allowed.iter().any(|domain| domain == &host))
            .unwrap_or(false)
    }

    fn behavior_context(&self, page_url: &str, product_page: bool) -> Option<BehaviorContext> {
        if !self.config.runtime.behavior.enabled {
            return None;
        }
        let root_url = self
            .site
            .base_url()
            .map(str::to_string)
            .or_else(|| {
                Url::parse(page_url)
                    .ok()
                    .map(|url| format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default()))
            })
            .unwrap_or_default();
        let hover_targets = if product_page {
            self.site
                .selectors
                .product_hover_targets
                .clone()
                .unwrap_or_else(|| self.site.selectors.hover_targets.clone())
        } else {
            self.site.selectors.hover_targets.clone()
        };
        Some(BehaviorContext {
            product_link_selector: Some(self.site.selectors.product_link_selector.clone()),
            category_url: page_url.to_string(),
            base_url: self.site.base_url().map(str::to_string),
            root_url,
            hover_targets,
        })
    }

    /// Category label: the slug after `/items/` (or the whole path), mapped
    /// through the configured labels
    fn category_label(&self, category_url: &str) -> Option<String> {
        let parsed = Url::parse(category_url).ok()?;
        let path = parsed.path();
        let slug = path
            .split_once("/items/")
            .map(|(_, rest)| rest)
            .unwrap_or(path)
            .trim_matches('/');
        if slug.is_empty() {
            return None;
        }
        Some(
            self.site
                .selectors
                .category_labels
                .get(slug)
                .cloned()
                .unwrap_or_else(|| slug.to_string()),
        )
    }

    fn stop_after_pages(&self, pages_processed: u32) -> bool {
        self.site.stop_conditions.iter().any(|condition| {
            matches!(condition, StopCondition::MaxPages { value } if pages_processed >= *value)
        })
    }

    fn stop_on_no_new_products(&self, written_this_page: u64) -> bool {
        written_this_page == 0
            && self
                .site
                .stop_conditions
                .iter()
                .any(|condition| matches!(condition, StopCondition::NoNewProducts))
    }

    /// Appends `<rfc3339>\t<product_url>\t<error>\n` to the skipped log
    fn log_skipped(&self, product_url: &str, error: &str) {
        if let Some(parent) = self.skipped_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!(
            "{}\t{}\t{}\n",
            Utc::now().to_rfc3339(),
            product_url,
            error.replace(['\t', '\n'], " ")
        );
        let result = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.skipped_log)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            tracing::warn!(path = %self.skipped_log.display(), error = %err, "Skipped-products log write failed");
        }
    }
}

/// Builds the URL of a numbered page: page 1 is the bare category URL,
/// later pages set `?<param>=N`
fn build_page_url(category_url: &str, page: u32, param: &str) -> String {
    if page <= 1 {
        return category_url.to_string();
    }
    match Url::parse(category_url) {
        Ok(mut url) => {
            let existing: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| name != param)
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            {
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                for (name, value) in &existing {
                    pairs.append_pair(name, value);
                }
                pairs.append_pair(param, &page.to_string());
            }
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => format!("{}?{}={}", category_url, param, page),
    }
}

/// Parses one listing page: product hrefs, the missing-selector stop
/// condition, and the next-button target
fn parse_listing(html: &str, site: &SiteConfig, current_url: &str) -> ParsedListing {
    let document = Html::parse_document(html);

    let stop_condition_fired = site.stop_conditions.iter().any(|condition| {
        if let StopCondition::MissingSelector { value } = condition {
            match Selector::parse(value) {
                Ok(selector) => document.select(&selector).next().is_none(),
                Err(_) => false,
            }
        } else {
            false
        }
    });

    let product_hrefs = Selector::parse(&site.selectors.product_link_selector)
        .map(|selector| {
            document
                .select(&selector)
                .filter_map(|element| element.value().attr("href"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let next_url = site
        .pagination
        .next_button_selector
        .as_deref()
        .and_then(|raw| Selector::parse(raw).ok())
        .and_then(|selector| document.select(&selector).next())
        .and_then(|element| element.value().attr("href"))
        .and_then(|href| {
            let base = site.base_url().unwrap_or(current_url);
            Url::parse(base)
                .and_then(|base| base.join(href))
                .map(|url| url.to_string())
                .ok()
        });

    ParsedListing {
        product_hrefs,
        stop_condition_fired,
        next_url,
    }
}
