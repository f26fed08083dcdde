//! Crawl result types

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One product row, in sheet column order
#[derive(Debug, Clone)]
pub struct ProductRecord {
    pub source_site: String,
    pub category: Option<String>,
    pub category_url: String,
    pub product_url: String,
    pub product_content: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub run_id: String,
    /// MD5 of the canonical product URL
    pub product_id_hash: String,
    pub page_num: u32,
    /// Extra key/values, serialized as a JSON string in the sheet;
    /// the chosen image URL lives here under `image_url`
    pub metadata: BTreeMap<String, String>,
    pub image_path: Option<String>,
    pub name_en: Option<String>,
    pub name_ru: Option<String>,
    pub price_without_discount: Option<String>,
    pub price_with_discount: Option<String>,
    pub status: String,
    pub note: Option<String>,
    pub processed_at: Option<String>,
    pub llm_raw: Option<String>,
}

impl ProductRecord {
    /// Renders the record as the 19-cell sheet row (columns A through S)
    pub fn to_row(&self) -> Vec<String> {
        let metadata = if self.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.metadata).unwrap_or_default()
        };
        vec![
            self.source_site.clone(),
            self.category.clone().unwrap_or_default(),
            self.category_url.clone(),
            self.product_url.clone(),
            self.product_content.clone().unwrap_or_default(),
            self.discovered_at.to_rfc3339(),
            self.run_id.clone(),
            self.product_id_hash.clone(),
            self.page_num.to_string(),
            metadata,
            self.image_path.clone().unwrap_or_default(),
            self.name_en.clone().unwrap_or_default(),
            self.name_ru.clone().unwrap_or_default(),
            self.price_without_discount.clone().unwrap_or_default(),
            self.price_with_discount.clone().unwrap_or_default(),
            self.status.clone(),
            self.note.clone().unwrap_or_default(),
            self.processed_at.clone().unwrap_or_default(),
            self.llm_raw.clone().unwrap_or_default(),
        ]
    }
}

/// Per-category counters, aggregated into the `_runs` row
#[derive(Debug, Clone, Default)]
pub struct CategoryMetrics {
    pub site_name: String,
    pub category_url: String,
    pub total_found: u64,
    pub total_written: u64,
    pub total_duplicates: u64,
    pub total_failed: u64,
    pub last_page: Option<u32>,
}

impl CategoryMetrics {
    pub fn new(site_name: &str, category_url: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            category_url: category_url.to_string(),
            ..Default::default()
        }
    }
}

/// How a category traversal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryOutcome {
    /// Pagination ran out naturally
    Done,
    /// A stop condition, limit, or global threshold fired
    Stopped,
    /// Unrecoverable engine error (pool exhausted, ladder exhausted)
    Failed,
}

/// Everything one site crawl produced
#[derive(Debug, Clone)]
pub struct SiteCrawlResult {
    pub site_name: String,
    /// Spreadsheet tab the site's rows went to (the domain)
    pub sheet_tab: String,
    pub metrics: Vec<CategoryMetrics>,
    pub outcome: CategoryOutcome,
}

impl SiteCrawlResult {
    pub fn products_total(&self) -> u64 {
        self.metrics.iter().map(|m| m.total_found).sum()
    }

    pub fn products_new(&self) -> u64 {
        self.metrics.iter().map(|m| m.total_written).sum()
    }
}
