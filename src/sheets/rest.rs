//! Sheets v4 REST implementation of the logical spreadsheet API
//!
//! Credential negotiation is out of scope: the client takes a ready bearer
//! token (`GOOGLE_OAUTH_ACCESS_TOKEN`, or the `access_token` field of the
//! file at `GOOGLE_OAUTH_TOKEN_PATH`). Transient HTTP failures retry with a
//! short exponential backoff inside each call; the coarse 10/20-minute
//! ladder for sustained outages lives in the writer.

use crate::sheets::{SheetError, SheetResult, SpreadsheetApi};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com";
/// In-call backoff for transient errors (seconds)
const SHORT_BACKOFF: [f64; 3] = [2.0, 4.0, 8.0];

pub struct RestSheetsApi {
    client: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    token: String,
}

impl RestSheetsApi {
    pub fn new(spreadsheet_id: String, token: String) -> Self {
        Self::with_base_url(spreadsheet_id, token, DEFAULT_BASE_URL.to_string())
    }

    /// Base URL override for tests against a mock server
    pub fn with_base_url(spreadsheet_id: String, token: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            spreadsheet_id,
            token,
        }
    }

    /// Builds the client from `GOOGLE_OAUTH_*` environment variables
    pub fn from_env(spreadsheet_id: String) -> SheetResult<Self> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(Self::new(spreadsheet_id, token.trim().to_string()));
            }
        }
        if let Ok(path) = std::env::var("GOOGLE_OAUTH_TOKEN_PATH") {
            let content = std::fs::read_to_string(&path).map_err(|err| {
                SheetError::MissingCredentials(format!("{}: {}", path, err))
            })?;
            let token = match serde_json::from_str::<Value>(&content) {
                Ok(value) => value
                    .get("access_token")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        SheetError::MissingCredentials(format!(
                            "{}: no access_token field",
                            path
                        ))
                    })?,
                Err(_) => content.trim().to_string(),
            };
            return Ok(Self::new(spreadsheet_id, token));
        }
        Err(SheetError::MissingCredentials(
            "set GOOGLE_OAUTH_ACCESS_TOKEN or GOOGLE_OAUTH_TOKEN_PATH".to_string(),
        ))
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}{}",
            self.base_url, self.spreadsheet_id, suffix
        )
    }

    /// Sends a request, retrying 429/5xx and transport errors with short
    /// backoff; other error statuses surface as `SheetError::Api`
    async fn send(&self, builder: reqwest::RequestBuilder) -> SheetResult<Value> {
        let mut last_error: Option<SheetError> = None;
        for attempt in 0..SHORT_BACKOFF.len() {
            let Some(request) = builder.try_clone() else {
                break;
            };
            match request.bearer_auth(&self.token).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<Value>().await.unwrap_or(Value::Null));
                    }
                    let message = response.text().await.unwrap_or_default();
                    let error = SheetError::Api {
                        status: status.as_u16(),
                        message,
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            "Spreadsheet API transient error, backing off"
                        );
                        last_error = Some(error);
                    } else {
                        return Err(error);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "Spreadsheet transport error, backing off"
                    );
                    last_error = Some(SheetError::Http(err));
                }
            }
            if attempt + 1 < SHORT_BACKOFF.len() {
                tokio::time::sleep(Duration::from_secs_f64(SHORT_BACKOFF[attempt])).await;
            }
        }
        Err(last_error.unwrap_or(SheetError::Api {
            status: 0,
            message: "request not retryable".to_string(),
        }))
    }

    async fn existing_tabs(&self) -> SheetResult<Vec<String>> {
        let value = self
            .send(
                self.client
                    .get(self.url(""))
                    .query(&[("fields", "sheets.properties.title")]),
            )
            .await?;
        Ok(value["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|sheet| sheet["properties"]["title"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_tab(&self, tab: &str, hidden: bool) -> SheetResult<()> {
        let body = json!({
            "requests": [{
                "addSheet": {"properties": {"title": tab, "hidden": hidden}}
            }]
        });
        self.send(self.client.post(self.url(":batchUpdate")).json(&body))
            .await?;
        Ok(())
    }

    /// Makes row 1 of the tab equal to the header, writing it when the tab
    /// is empty or stale
    async fn ensure_header(&self, tab: &str, header: &[&str]) -> SheetResult<()> {
        let range = format!("'{}'!1:1", tab);
        let value = self
            .send(self.client.get(self.url(&format!("/values/{}", range))))
            .await?;
        let current: Vec<String> = value["values"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Value::as_array)
            .map(|cells| {
                cells
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if current.iter().map(String::as_str).eq(header.iter().copied()) {
            return Ok(());
        }
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [header],
        });
        self.send(
            self.client
                .put(self.url(&format!("/values/{}", range)))
                .query(&[("valueInputOption", "RAW")])
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn ensure_tab_inner(&self, tab: &str, header: &[&str], hidden: bool) -> SheetResult<()> {
        let existing = self.existing_tabs().await?;
        if !existing.iter().any(|title| title == tab) {
            self.add_tab(tab, hidden).await?;
        }
        self.ensure_header(tab, header).await
    }
}

#[async_trait]
impl SpreadsheetApi for RestSheetsApi {
    async fn ensure_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()> {
        self.ensure_tab_inner(tab, header, false).await
    }

    async fn ensure_hidden_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()> {
        self.ensure_tab_inner(tab, header, true).await
    }

    async fn append_rows(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = format!("'{}'!A:A", tab);
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": rows,
        });
        self.send(
            self.client
                .post(self.url(&format!("/values/{}:append", range)))
                .query(&[("valueInputOption", "RAW")])
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn read_column(&self, tab: &str, letter: &str) -> SheetResult<Vec<String>> {
        let range = format!("'{}'!{}:{}", tab, letter, letter);
        let value = self
            .send(self.client.get(self.url(&format!("/values/{}", range))))
            .await?;
        Ok(value["values"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_array().and_then(|cells| cells.first()))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rewrite_tab(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()> {
        let clear_range = format!("'{}'!A:Z", tab);
        self.send(
            self.client
                .post(self.url(&format!("/values/{}:clear", clear_range)))
                .json(&json!({})),
        )
        .await?;
        self.append_rows(tab, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> RestSheetsApi {
        RestSheetsApi::with_base_url(
            "sheet-1".to_string(),
            "token".to_string(),
            server.uri(),
        )
    }

    #[tokio::test]
    async fn test_read_column_extracts_first_cells() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/v4/spreadsheets/sheet-1/values/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [["product_url"], ["https://x.ru/a"], ["https://x.ru/b"]]
            })))
            .mount(&server)
            .await;

        let column = api(&server).read_column("shop.ru", "D").await.unwrap();
        assert_eq!(
            column,
            vec!["product_url", "https://x.ru/a", "https://x.ru/b"]
        );
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r".*:append$"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let err = api(&server)
            .append_rows("shop.ru", &[vec!["a".to_string()]])
            .await
            .unwrap_err();
        assert!(matches!(err, SheetError::Api { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_empty_append_is_a_noop() {
        let server = MockServer::start().await;
        // No mock mounted: any request would fail the test
        api(&server).append_rows("shop.ru", &[]).await.unwrap();
    }
}
