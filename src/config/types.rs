use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Which fetch engine drives a site or the product fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Http,
    Browser,
}

/// Inclusive random delay range in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DelayRange {
    #[serde(default)]
    pub min_sec: f64,
    #[serde(default)]
    pub max_sec: f64,
}

impl DelayRange {
    pub fn new(min_sec: f64, max_sec: f64) -> Self {
        Self { min_sec, max_sec }
    }

    /// True when the range is effectively disabled
    pub fn is_zero(&self) -> bool {
        self.max_sec <= 0.0
    }
}

/// Retry schedule shared by the HTTP and browser engines
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt i is `backoff_sec[min(i, len - 1)]`
    pub backoff_sec: Vec<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_sec: vec![2.0, 5.0, 10.0],
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed attempt with the given 0-based index
    pub fn delay_for_attempt(&self, attempt: usize) -> f64 {
        if self.backoff_sec.is_empty() {
            return 0.0;
        }
        self.backoff_sec[attempt.min(self.backoff_sec.len() - 1)]
    }
}

/// Headless browser options
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserOptions {
    pub headless: bool,
    pub slow_mo_ms: u64,
    /// Hold the page open before the behavior layer runs (observability)
    pub preview_before_behavior_sec: f64,
    /// Hold the page open before closing it (observability)
    pub preview_delay_sec: f64,
    /// Hold extra behavior tabs open before closing them
    pub extra_page_preview_sec: f64,
    /// Exported cookies blob, loaded verbatim into new contexts
    pub storage_state_path: Option<PathBuf>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            slow_mo_ms: 0,
            preview_before_behavior_sec: 0.0,
            preview_delay_sec: 0.0,
            extra_page_preview_sec: 0.0,
            storage_state_path: None,
        }
    }
}

/// Global network settings shared by every engine
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub proxy_pool: Vec<String>,
    #[serde(default)]
    pub proxy_allow_direct: bool,
    pub request_timeout_sec: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub accept_language: Option<String>,
    #[serde(default)]
    pub browser: BrowserOptions,
    pub bad_proxy_log_path: PathBuf,
}

/// Spreadsheet settings
#[derive(Debug, Clone, Deserialize)]
pub struct SheetConfig {
    pub spreadsheet_id: String,
    pub write_batch_size: usize,
    pub state_tab: String,
    pub runs_tab: String,
    /// Number of committed products that triggers a row-append batch
    pub flush_product_interval: usize,
}

/// Soft run-wide stop thresholds, checked at product/category boundaries
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GlobalStopConfig {
    pub stop_after_products: Option<u64>,
    pub stop_after_minutes: Option<u64>,
}

/// Scroll action tuning for the behavior layer
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorScrollConfig {
    pub probability: f64,
    pub skip_probability: f64,
    pub min_depth_percent: u32,
    pub max_depth_percent: u32,
    pub min_steps: u32,
    pub max_steps: u32,
    pub step_delay: DelayRange,
}

impl Default for BehaviorScrollConfig {
    fn default() -> Self {
        Self {
            probability: 0.7,
            skip_probability: 0.2,
            min_depth_percent: 25,
            max_depth_percent: 85,
            min_steps: 2,
            max_steps: 5,
            step_delay: DelayRange::new(0.2, 0.8),
        }
    }
}

/// Mouse movement and hover tuning for the behavior layer
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorMouseConfig {
    pub move_count_min: u32,
    pub move_count_max: u32,
    pub hover_probability: f64,
}

impl Default for BehaviorMouseConfig {
    fn default() -> Self {
        Self {
            move_count_min: 1,
            move_count_max: 3,
            hover_probability: 0.35,
        }
    }
}

/// Navigation side-trip tuning for the behavior layer
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorNavigationConfig {
    pub back_probability: f64,
    pub extra_products_probability: f64,
    pub extra_products_limit: u32,
    pub visit_root_probability: f64,
    pub max_additional_chain: u32,
}

impl Default for BehaviorNavigationConfig {
    fn default() -> Self {
        Self {
            back_probability: 0.25,
            extra_products_probability: 0.3,
            extra_products_limit: 2,
            visit_root_probability: 0.15,
            max_additional_chain: 2,
        }
    }
}

/// Human-behavior controller configuration (browser mode only)
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorConfig {
    pub enabled: bool,
    pub debug: bool,
    pub action_delay: DelayRange,
    #[serde(default)]
    pub scroll: BehaviorScrollConfig,
    #[serde(default)]
    pub mouse: BehaviorMouseConfig,
    #[serde(default)]
    pub navigation: BehaviorNavigationConfig,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debug: false,
            action_delay: DelayRange::new(0.3, 0.9),
            scroll: BehaviorScrollConfig::default(),
            mouse: BehaviorMouseConfig::default(),
            navigation: BehaviorNavigationConfig::default(),
        }
    }
}

/// Run-wide limits and pacing
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub max_concurrency_per_site: usize,
    #[serde(default)]
    pub global_stop: GlobalStopConfig,
    pub page_delay: DelayRange,
    pub product_delay: DelayRange,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    pub product_fetch_engine: EngineKind,
}

/// Link dedupe rules
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DedupeConfig {
    /// Query parameter names dropped during canonicalization;
    /// supports literal names and `*`-suffix globs like `utm_*`
    #[serde(default)]
    pub strip_params_blacklist: Vec<String>,
}

/// Local progress-store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub database: PathBuf,
}

/// Top-level run configuration, assembled from the environment
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub sheet: SheetConfig,
    pub runtime: RuntimeConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    pub state: StateConfig,
}

/// A selector that may be written as a single pattern or an ordered
/// fallback list in site configs; always a list at runtime
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "SelectorOrList")]
pub struct SelectorList(pub Vec<String>);

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SelectorOrList {
    One(String),
    Many(Vec<String>),
}

impl From<SelectorOrList> for SelectorList {
    fn from(value: SelectorOrList) -> Self {
        match value {
            SelectorOrList::One(selector) => SelectorList(vec![selector]),
            SelectorOrList::Many(list) => SelectorList(list),
        }
    }
}

impl SelectorList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Site identity block
#[derive(Debug, Clone, Deserialize)]
pub struct SiteIdentity {
    pub name: String,
    pub domain: String,
    pub base_url: Option<String>,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
}

fn default_engine() -> EngineKind {
    EngineKind::Http
}

/// CSS selectors for a site's pages
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    pub product_link_selector: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub main_image_selector: Option<String>,
    /// Product text is truncated at the first match of any of these,
    /// inclusive (the matched element and everything after it is dropped)
    #[serde(default)]
    pub content_drop_after: Vec<String>,
    /// Nodes removed from product text before rendering
    #[serde(default)]
    pub exclude_selectors: Vec<String>,
    #[serde(default)]
    pub name_en_selector: SelectorList,
    #[serde(default)]
    pub name_ru_selector: SelectorList,
    #[serde(default)]
    pub price_without_discount_selector: SelectorList,
    #[serde(default)]
    pub price_with_discount_selector: SelectorList,
    /// Category slug -> human label for the sheet's category column
    #[serde(default)]
    pub category_labels: HashMap<String, String>,
    /// Hover targets on category pages (behavior layer)
    #[serde(default)]
    pub hover_targets: Vec<String>,
    /// Hover targets on product pages, when they differ from categories
    pub product_hover_targets: Option<Vec<String>>,
}

/// How a site paginates its category listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    NumberedPages,
    NextButton,
    InfiniteScroll,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub mode: PaginationMode,
    pub param_name: Option<String>,
    pub next_button_selector: Option<String>,
    pub max_pages: Option<u32>,
    pub start_page: Option<u32>,
    pub end_page: Option<u32>,
    pub max_scrolls: Option<u32>,
    /// Per-page clamp for behavior-layer scroll depth
    pub scroll_min_percent: Option<u32>,
    pub scroll_max_percent: Option<u32>,
}

/// Per-site crawl limits
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SiteLimits {
    pub max_products: Option<u64>,
    pub max_pages: Option<u32>,
    pub max_scrolls: Option<u32>,
}

/// A predicate that must hold before product extraction
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitCondition {
    /// Wait until the selector is present or the bounded timeout expires
    Selector {
        value: String,
        #[serde(default = "default_wait_timeout")]
        timeout_sec: f64,
    },
    /// Sleep for a fixed number of seconds
    #[serde(alias = "delay")]
    Timeout { value: f64 },
}

fn default_wait_timeout() -> f64 {
    15.0
}

/// A predicate whose satisfaction ends category traversal
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    /// Stop when the selector is absent from the page
    MissingSelector { value: String },
    /// Stop when a page yields no previously unseen products
    NoNewProducts,
    /// Stop after this many pages
    MaxPages { value: u32 },
}

/// Per-site crawl configuration, one YAML/JSON file per site
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site: SiteIdentity,
    pub selectors: SelectorConfig,
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub limits: SiteLimits,
    #[serde(default)]
    pub wait_conditions: Vec<WaitCondition>,
    #[serde(default)]
    pub stop_conditions: Vec<StopCondition>,
    pub category_urls: Vec<String>,
}

impl SiteConfig {
    pub fn name(&self) -> &str {
        &self.site.name
    }

    pub fn domain(&self) -> &str {
        &self.site.domain
    }

    pub fn engine(&self) -> EngineKind {
        self.site.engine
    }

    /// Base URL for resolving relative product links
    pub fn base_url(&self) -> Option<&str> {
        self.site.base_url.as_deref()
    }
}
