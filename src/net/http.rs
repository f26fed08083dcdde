//! Plain HTTP fetch engine
//!
//! Fetches HTML through pooled per-egress clients. Transport errors and 5xx
//! responses retry with the configured backoff schedule; a 403 is reported
//! to the proxy pool and the next attempt simply picks a fresh egress.

use crate::config::{NetworkConfig, WaitCondition};
use crate::monitoring::{ErrorEvent, ErrorSource};
use crate::net::client::HttpClientFactory;
use crate::net::proxy::{Outcome, ProxyPool};
use crate::net::{BinaryResult, Engine, EngineRequest, FetchError, FetchResult};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;

pub struct HttpEngine {
    network: NetworkConfig,
    pool: Arc<ProxyPool>,
    clients: HttpClientFactory,
}

impl HttpEngine {
    pub fn new(network: NetworkConfig, pool: Arc<ProxyPool>) -> Self {
        let clients = HttpClientFactory::new(&network);
        Self {
            network,
            pool,
            clients,
        }
    }

    fn pick_user_agent(&self) -> String {
        self.network
            .user_agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    /// Downloads a binary resource (image) through the shared rotation.
    ///
    /// Single pass through the retry schedule, same egress accounting as
    /// page fetches.
    pub async fn fetch_binary(&self, url: &str) -> Result<BinaryResult, FetchError> {
        let attempts = self.network.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            let egress = self.pool.acquire()?;
            let client = self.clients.get(&egress)?;
            match client
                .get(url)
                .header(USER_AGENT, self.pick_user_agent())
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 403 {
                        self.pool.report(&egress, Outcome::Http403);
                        continue;
                    }
                    if !status.is_success() {
                        self.pool.report(&egress, Outcome::Ok);
                        return Err(FetchError::HttpStatus {
                            code: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let bytes = response.bytes().await.map_err(|err| FetchError::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    })?;
                    self.pool.report(&egress, Outcome::Ok);
                    return Ok(BinaryResult {
                        bytes: bytes.to_vec(),
                        content_type,
                    });
                }
                Err(err) => {
                    let outcome = if err.is_timeout() {
                        Outcome::Timeout
                    } else {
                        Outcome::Transport
                    };
                    self.pool.report(&egress, outcome);
                    tracing::debug!(url, attempt, error = %err, "Binary fetch failed, retrying");
                    let wait = self.network.retry.delay_for_attempt(attempt as usize);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn fetch(&self, request: &EngineRequest) -> Result<FetchResult, FetchError> {
        // Selector waits are meaningless without a DOM; only timed waits apply.
        for condition in &request.wait_conditions {
            if let WaitCondition::Timeout { value } = condition {
                tokio::time::sleep(Duration::from_secs_f64(*value)).await;
            }
        }

        let attempts = self.network.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            let egress = self.pool.acquire()?;
            let client = self.clients.get(&egress)?;
            let mut builder = client
                .get(&request.url)
                .header(USER_AGENT, self.pick_user_agent());
            if let Some(lang) = &self.network.accept_language {
                builder = builder.header(ACCEPT_LANGUAGE, lang);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let final_url = response.url().to_string();

                    if status.as_u16() == 403 {
                        // Not retried on this egress; the next attempt
                        // rotates to a new one without sleeping.
                        self.pool.report(&egress, Outcome::Http403);
                        tracing::warn!(
                            url = %request.url,
                            egress = %egress,
                            "HTTP 403, rotating egress"
                        );
                        continue;
                    }

                    if status.is_server_error() {
                        self.pool.report(&egress, Outcome::Transport);
                        let wait = self.network.retry.delay_for_attempt(attempt as usize);
                        let event = ErrorEvent::new(
                            format!("HTTP {}", status.as_u16()),
                            ErrorSource::Http,
                        )
                        .url(&request.url)
                        .proxy(egress.id())
                        .retry_index(attempt + 1)
                        .action("retry")
                        .detail("wait_before_retry_sec", wait);
                        tracing::warn!(
                            error_event = %event.to_json(),
                            "Server error, retrying with backoff"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        continue;
                    }

                    if !status.is_success() {
                        self.pool.report(&egress, Outcome::Ok);
                        return Err(FetchError::HttpStatus {
                            code: status.as_u16(),
                            url: request.url.clone(),
                        });
                    }

                    let html = response.text().await.map_err(|err| FetchError::Transport {
                        url: request.url.clone(),
                        message: err.to_string(),
                    })?;
                    self.pool.report(&egress, Outcome::Ok);
                    return Ok(FetchResult {
                        final_url,
                        html,
                        status: status.as_u16(),
                        egress_used: egress.id().to_string(),
                        behavior_trace: None,
                    });
                }
                Err(err) => {
                    let outcome = if err.is_timeout() {
                        Outcome::Timeout
                    } else {
                        Outcome::Transport
                    };
                    self.pool.report(&egress, outcome);
                    let wait = self.network.retry.delay_for_attempt(attempt as usize);
                    let event = ErrorEvent::new(
                        if err.is_timeout() {
                            "ConnectTimeout"
                        } else if err.is_connect() {
                            "ConnectionRefused"
                        } else {
                            "TransportError"
                        },
                        ErrorSource::Http,
                    )
                    .url(&request.url)
                    .proxy(egress.id())
                    .retry_index(attempt + 1)
                    .action("rotate_proxy")
                    .action("retry")
                    .detail("timeout_sec", self.network.request_timeout_sec)
                    .detail("wait_before_retry_sec", wait);
                    tracing::warn!(
                        error_event = %event.to_json(),
                        "HTTP transport error, retrying with a new egress"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            url: request.url.clone(),
            attempts,
        })
    }

    async fn shutdown(&self) {
        // reqwest clients release their pools on drop; nothing to do eagerly
    }
}
