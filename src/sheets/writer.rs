//! Sheet writer: header contract, dedupe cache, buffering, retry ladder
//!
//! One tab per site domain. On first access to a tab the writer makes sure
//! it exists with the 19-column header and seeds an in-memory set of the
//! product URLs already present (column D), so re-runs never append the same
//! product twice. Appends buffer up to the flush interval (default 1) and go
//! out through a coarse three-attempt ladder with 10- and 20-minute waits;
//! a ladder failure surfaces to the crawler, which rolls the product back.

use crate::crawler::ProductRecord;
use crate::sheets::{SheetError, SheetResult, SpreadsheetApi};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-domain tab columns A through S
pub const PRODUCT_HEADER: [&str; 19] = [
    "source_site",
    "category",
    "category_url",
    "product_url",
    "product_content",
    "discovered_at",
    "run_id",
    "product_id_hash",
    "page_num",
    "metadata",
    "image_path",
    "name (en)",
    "name (ru)",
    "price (without discount)",
    "price (with discount)",
    "status",
    "note",
    "processed_at",
    "llm_raw",
];

pub const STATE_HEADER: [&str; 5] = [
    "site_name",
    "category_url",
    "last_page",
    "last_product_count",
    "last_run_ts",
];

pub const RUNS_HEADER: [&str; 6] = [
    "run_id",
    "site",
    "started_at",
    "finished_at",
    "products_total",
    "products_new",
];

/// Column holding `product_url` under the header contract
const PRODUCT_URL_COLUMN: &str = "D";

/// Coarse ladder: waits between append attempts 1→2 and 2→3
const APPEND_RETRY_WAITS: [Duration; 2] =
    [Duration::from_secs(600), Duration::from_secs(1200)];

#[derive(Default)]
struct TabState {
    prepared: bool,
    seen: HashSet<String>,
    buffer: Vec<Vec<String>>,
    buffered_urls: Vec<String>,
}

pub struct SheetsWriter {
    api: Arc<dyn SpreadsheetApi>,
    state_tab: String,
    runs_tab: String,
    flush_interval: usize,
    retry_waits: [Duration; 2],
    tabs: std::sync::Mutex<HashMap<String, Arc<Mutex<TabState>>>>,
}

impl SheetsWriter {
    pub fn new(
        api: Arc<dyn SpreadsheetApi>,
        state_tab: String,
        runs_tab: String,
        flush_interval: usize,
    ) -> Self {
        Self {
            api,
            state_tab,
            runs_tab,
            flush_interval: flush_interval.max(1),
            retry_waits: APPEND_RETRY_WAITS,
            tabs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the ladder waits; tests use near-zero durations
    pub fn with_retry_waits(mut self, waits: [Duration; 2]) -> Self {
        self.retry_waits = waits;
        self
    }

    /// Creates the hidden `_state`/`_runs` tabs; idempotent, run at startup
    pub async fn init(&self) -> SheetResult<()> {
        self.api
            .ensure_hidden_tab(&self.state_tab, &STATE_HEADER)
            .await?;
        self.api
            .ensure_hidden_tab(&self.runs_tab, &RUNS_HEADER)
            .await
    }

    fn tab_handle(&self, tab: &str) -> Arc<Mutex<TabState>> {
        let mut tabs = self.tabs.lock().expect("writer tab map lock poisoned");
        tabs.entry(tab.to_string()).or_default().clone()
    }

    /// Ensures the tab exists with the header contract and seeds the
    /// seen-URL cache from its product-url column
    pub async fn prepare_tab(&self, tab: &str) -> SheetResult<()> {
        let handle = self.tab_handle(tab);
        let mut state = handle.lock().await;
        if state.prepared {
            return Ok(());
        }
        self.api.ensure_tab(tab, &PRODUCT_HEADER).await?;
        let column = self.api.read_column(tab, PRODUCT_URL_COLUMN).await?;
        state.seen = column
            .into_iter()
            .skip(1) // header cell
            .filter(|url| !url.is_empty())
            .collect();
        state.prepared = true;
        tracing::info!(tab, known_products = state.seen.len(), "Prepared sheet tab");
        Ok(())
    }

    /// True when the product URL is already on the tab (any run)
    pub async fn is_known(&self, tab: &str, product_url: &str) -> SheetResult<bool> {
        self.prepare_tab(tab).await?;
        let handle = self.tab_handle(tab);
        let state = handle.lock().await;
        Ok(state.seen.contains(product_url))
    }

    /// Buffers one product row, flushing when the interval is reached.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The row (and any buffered ones) are on the sheet
    /// * `Ok(false)` - Buffered, or dropped as a duplicate
    /// * `Err(SheetError)` - The flush ladder was exhausted; the product
    ///   must be rolled back by the caller
    pub async fn append_product(
        &self,
        tab: &str,
        record: &ProductRecord,
    ) -> SheetResult<bool> {
        self.prepare_tab(tab).await?;
        let handle = self.tab_handle(tab);
        let mut state = handle.lock().await;
        if state.seen.contains(&record.product_url) {
            return Ok(false);
        }
        state.seen.insert(record.product_url.clone());
        state.buffer.push(record.to_row());
        state.buffered_urls.push(record.product_url.clone());
        if state.buffer.len() < self.flush_interval {
            return Ok(false);
        }
        self.flush_locked(tab, &mut state).await.map(|_| true)
    }

    /// Flushes every buffered row on every tab (cancellation, end of run)
    pub async fn flush_all(&self) -> SheetResult<()> {
        let handles: Vec<(String, Arc<Mutex<TabState>>)> = {
            let tabs = self.tabs.lock().expect("writer tab map lock poisoned");
            tabs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (tab, handle) in handles {
            let mut state = handle.lock().await;
            if !state.buffer.is_empty() {
                self.flush_locked(&tab, &mut state).await?;
            }
        }
        Ok(())
    }

    /// Appends the buffered rows through the coarse retry ladder.
    ///
    /// On exhaustion the buffered rows are dropped and their URLs removed
    /// from the seen cache, so a later run can commit them.
    async fn flush_locked(&self, tab: &str, state: &mut TabState) -> SheetResult<()> {
        let rows = std::mem::take(&mut state.buffer);
        let urls = std::mem::take(&mut state.buffered_urls);
        let attempts = self.retry_waits.len() as u32 + 1;

        let mut last_error = None;
        for attempt in 0..attempts {
            match self.api.append_rows(tab, &rows).await {
                Ok(()) => {
                    tracing::info!(tab, rows = rows.len(), "Appended product rows");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        tab,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Sheet append failed"
                    );
                    last_error = Some(err);
                    if (attempt as usize) < self.retry_waits.len() {
                        tokio::time::sleep(self.retry_waits[attempt as usize]).await;
                    }
                }
            }
        }

        for url in urls {
            state.seen.remove(&url);
        }
        tracing::error!(
            tab,
            error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "Sheet append ladder exhausted, dropping buffered rows"
        );
        Err(SheetError::AppendExhausted {
            tab: tab.to_string(),
            attempts,
        })
    }

    /// End-of-run bookkeeping: one `_runs` row per site and a full rewrite
    /// of the `_state` tab from the progress store
    pub async fn finish_run(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        results: &[crate::crawler::SiteCrawlResult],
        state_store: &StateStore,
    ) -> SheetResult<()> {
        self.flush_all().await?;

        let finished_at = Utc::now().to_rfc3339();
        let rows: Vec<Vec<String>> = results
            .iter()
            .map(|result| {
                vec![
                    run_id.to_string(),
                    result.site_name.clone(),
                    started_at.to_rfc3339(),
                    finished_at.clone(),
                    result.products_total().to_string(),
                    result.products_new().to_string(),
                ]
            })
            .collect();
        self.api.append_rows(&self.runs_tab, &rows).await?;

        let mut state_rows: Vec<Vec<String>> =
            vec![STATE_HEADER.iter().map(|s| s.to_string()).collect()];
        if let Ok(states) = state_store.iter_all() {
            for state in states {
                state_rows.push(vec![
                    state.site_name,
                    state.category_url,
                    state.last_page.map(|v| v.to_string()).unwrap_or_default(),
                    state
                        .last_product_count
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    state
                        .last_run_ts
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_default(),
                ]);
            }
        }
        self.api.rewrite_tab(&self.state_tab, &state_rows).await
    }
}
