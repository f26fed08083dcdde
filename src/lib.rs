//! Linkharvest: a resumable multi-site product-link crawler
//!
//! This crate crawls configured e-commerce sites category by category,
//! extracts product links, fetches each product page, and appends one row
//! per product to a spreadsheet (one tab per domain). Progress is persisted
//! per (site, category) so interrupted runs can resume where they stopped.

pub mod config;
pub mod crawler;
pub mod media;
pub mod monitoring;
pub mod net;
pub mod runtime;
pub mod sheets;
pub mod state;
pub mod url;

use thiserror::Error;

/// Main error type for linkharvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] net::FetchError),

    #[error("State store error: {0}")]
    State(#[from] state::StateError),

    #[error("Spreadsheet error: {0}")]
    Sheet(#[from] sheets::SheetError),

    #[error("Image error: {0}")]
    Image(#[from] media::ImageError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse site config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value in {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for linkharvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::{GlobalConfig, SiteConfig};
pub use crawler::{ProductRecord, SiteCrawlResult};
pub use net::{EngineRequest, FetchError, FetchResult};
pub use runtime::RunContext;
pub use url::{canonicalize_url, fingerprint};
