//! Structured error events
//!
//! Every logged network/storage failure carries a machine-readable event so
//! downstream tooling can decide what to do (rotate a proxy, raise a
//! timeout, refresh the pool) without parsing log prose.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Which subsystem produced an error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Http,
    Browser,
    Image,
    Sheet,
    State,
    Proxy,
}

/// A structured description of one failure occurrence
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub error_source: ErrorSource,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_index: Option<u32>,
    /// Free-text hints such as `rotate_proxy` or `increase_timeout`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_required: Vec<String>,
    /// Timeouts seen, per-URL counters, pool snapshots
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

impl ErrorEvent {
    pub fn new(error_type: impl Into<String>, error_source: ErrorSource) -> Self {
        Self {
            error_type: error_type.into(),
            error_source,
            timestamp: Utc::now().to_rfc3339(),
            url: None,
            proxy: None,
            retry_index: None,
            action_required: Vec::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn retry_index(mut self, index: u32) -> Self {
        self.retry_index = Some(index);
        self
    }

    pub fn action(mut self, hint: &str) -> Self {
        self.action_required.push(hint.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Renders the event as a single-line JSON string for log payloads
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
