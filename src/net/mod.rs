//! Fetch layer: engines, proxy rotation, and the human-behavior hook
//!
//! Two engines implement the same `EngineRequest -> FetchResult` contract:
//! a plain HTTP engine for static pages and a headless-browser engine for
//! dynamic ones. Callers hold an `Arc<dyn Engine>` and never care which is
//! behind it. The proxy pool is shared across engines.

mod behavior;
mod browser;
mod client;
mod http;
mod proxy;

pub use behavior::{BehaviorContext, BehaviorTrace, HumanBehaviorController};
pub use browser::BrowserEngine;
pub use client::HttpClientFactory;
pub use http::HttpEngine;
pub use proxy::{Egress, Outcome, PoolSnapshot, ProxyPool};

use crate::config::{BehaviorConfig, EngineKind, NetworkConfig, WaitCondition};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the fetch layer
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP status {code} for {url}")]
    HttpStatus { code: u16, url: String },

    #[error("page was still navigating while reading content: {url}")]
    NavigationBusy { url: String },

    #[error("no content extracted from {url}")]
    ExtractionEmpty { url: String },

    #[error("behavior layer failed: {0}")]
    Behavior(String),

    #[error("browser error for {url}: {message}")]
    Browser { url: String, message: String },

    #[error("every egress in the pool is quarantined")]
    PoolExhausted,

    #[error("retries exhausted for {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
}

/// A single page-fetch request
#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    pub url: String,
    /// Predicates that must hold before the HTML is captured
    pub wait_conditions: Vec<WaitCondition>,
    /// Scroll steps for infinite-scroll categories (browser engine only)
    pub scroll_limit: Option<u32>,
    /// Per-page clamp for behavior-layer scroll depth
    pub scroll_depth_clamp: Option<(u32, u32)>,
    /// Page context for the human-behavior layer (browser engine only)
    pub behavior_context: Option<BehaviorContext>,
}

impl EngineRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// The outcome of a successful page fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_url: String,
    pub html: String,
    pub status: u16,
    /// Identifier of the egress the page was fetched through
    pub egress_used: String,
    /// Present in browser mode when the behavior layer ran
    pub behavior_trace: Option<BehaviorTrace>,
}

/// Downloaded binary resource (images)
#[derive(Debug, Clone)]
pub struct BinaryResult {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Common contract of the HTTP and browser engines
#[async_trait]
pub trait Engine: Send + Sync {
    /// Fetches a page, retrying per the engine's ladder
    async fn fetch(&self, request: &EngineRequest) -> Result<FetchResult, FetchError>;

    /// Releases held network resources (clients, browser contexts)
    async fn shutdown(&self);
}

/// Builds the engine for a site, sharing the given proxy pool
pub fn create_engine(
    kind: EngineKind,
    network: NetworkConfig,
    behavior: BehaviorConfig,
    pool: Arc<ProxyPool>,
) -> Arc<dyn Engine> {
    match kind {
        EngineKind::Http => Arc::new(HttpEngine::new(network, pool)),
        EngineKind::Browser => Arc::new(BrowserEngine::new(network, behavior, pool)),
    }
}
