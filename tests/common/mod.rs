//! Shared helpers for integration tests: an in-memory spreadsheet fake and
//! a zero-delay global configuration.
#![allow(dead_code)]

use async_trait::async_trait;
use linkharvest::config::{
    BehaviorConfig, BrowserOptions, DedupeConfig, DelayRange, EngineKind, GlobalConfig,
    GlobalStopConfig, NetworkConfig, RetryPolicy, RuntimeConfig, SheetConfig, StateConfig,
};
use linkharvest::sheets::{SheetError, SheetResult, SpreadsheetApi};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory spreadsheet: tab name -> rows (header row included)
#[derive(Default)]
pub struct FakeSheets {
    pub tabs: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
    /// Remaining `append_rows` calls that fail before succeeding
    pub fail_appends: AtomicU32,
    pub append_calls: AtomicU32,
}

impl FakeSheets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_appends(&self, count: u32) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Values of one 0-based column on a tab, header row skipped
    pub fn column(&self, tab: &str, index: usize) -> Vec<String> {
        let tabs = self.tabs.lock().unwrap();
        tabs.get(tab)
            .map(|rows| {
                rows.iter()
                    .skip(1)
                    .filter_map(|row| row.get(index).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, tab: &str) -> usize {
        let tabs = self.tabs.lock().unwrap();
        tabs.get(tab).map(|rows| rows.len().saturating_sub(1)).unwrap_or(0)
    }

    /// Pre-seeds a data row, creating the tab with the header when missing
    pub fn seed_row(&self, tab: &str, header: &[&str], row: Vec<String>) {
        let mut tabs = self.tabs.lock().unwrap();
        let rows = tabs
            .entry(tab.to_string())
            .or_insert_with(|| vec![header.iter().map(|s| s.to_string()).collect()]);
        rows.push(row);
    }
}

#[async_trait]
impl SpreadsheetApi for FakeSheets {
    async fn ensure_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()> {
        let mut tabs = self.tabs.lock().unwrap();
        tabs.entry(tab.to_string())
            .or_insert_with(|| vec![header.iter().map(|s| s.to_string()).collect()]);
        Ok(())
    }

    async fn ensure_hidden_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()> {
        self.ensure_tab(tab, header).await
    }

    async fn append_rows(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(SheetError::Api {
                status: 503,
                message: "injected append failure".to_string(),
            });
        }
        let mut tabs = self.tabs.lock().unwrap();
        let entry = tabs.entry(tab.to_string()).or_default();
        entry.extend(rows.iter().cloned());
        Ok(())
    }

    async fn read_column(&self, tab: &str, letter: &str) -> SheetResult<Vec<String>> {
        let index = (letter.chars().next().unwrap_or('A') as u8).saturating_sub(b'A') as usize;
        let tabs = self.tabs.lock().unwrap();
        Ok(tabs
            .get(tab)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get(index).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rewrite_tab(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()> {
        let mut tabs = self.tabs.lock().unwrap();
        tabs.insert(tab.to_string(), rows.to_vec());
        Ok(())
    }
}

/// Global config with all delays zeroed and direct egress only
pub fn test_global_config(state_db: PathBuf, bad_log: PathBuf) -> GlobalConfig {
    GlobalConfig {
        sheet: SheetConfig {
            spreadsheet_id: "test-sheet".to_string(),
            write_batch_size: 200,
            state_tab: "_state".to_string(),
            runs_tab: "_runs".to_string(),
            flush_product_interval: 1,
        },
        runtime: RuntimeConfig {
            max_concurrency_per_site: 1,
            global_stop: GlobalStopConfig::default(),
            page_delay: DelayRange::new(0.0, 0.0),
            product_delay: DelayRange::new(0.0, 0.0),
            behavior: BehaviorConfig::default(),
            product_fetch_engine: EngineKind::Http,
        },
        network: NetworkConfig {
            user_agents: vec!["TestAgent/1.0".to_string()],
            proxy_pool: Vec::new(),
            proxy_allow_direct: true,
            request_timeout_sec: 5.0,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_sec: vec![0.0],
            },
            accept_language: None,
            browser: BrowserOptions::default(),
            bad_proxy_log_path: bad_log,
        },
        dedupe: DedupeConfig {
            strip_params_blacklist: vec!["utm_*".to_string()],
        },
        state: StateConfig { database: state_db },
    }
}

/// Minimal numbered-pages site config pointing at a mock server
pub fn test_site_yaml(base_url: &str, extra: &str) -> String {
    format!(
        r#"
site:
  name: shop
  domain: shop.test
  base_url: "{base}"
  engine: http
selectors:
  product_link_selector: "a.product"
pagination:
  mode: numbered_pages
  param_name: page
  max_pages: 10
category_urls:
  - "{base}/items/tea"
{extra}
"#,
        base = base_url,
        extra = extra
    )
}
