//! Spreadsheet output
//!
//! The crawler only ever talks to the logical [`SpreadsheetApi`] (ensure a
//! tab, append rows, read a column, rewrite a tab); the REST client is one
//! implementation of it and tests supply an in-memory fake. The
//! [`SheetsWriter`] layers the per-tab header contract, the seen-URL dedupe
//! cache, buffering, and the coarse append-retry ladder on top.

mod rest;
mod writer;

pub use rest::RestSheetsApi;
pub use writer::{SheetsWriter, PRODUCT_HEADER, RUNS_HEADER, STATE_HEADER};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("spreadsheet transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("spreadsheet API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("append to tab '{tab}' failed after {attempts} attempts")]
    AppendExhausted { tab: String, attempts: u32 },

    #[error("missing spreadsheet credentials: {0}")]
    MissingCredentials(String),
}

pub type SheetResult<T> = Result<T, SheetError>;

/// Logical spreadsheet operations used by the writer
#[async_trait]
pub trait SpreadsheetApi: Send + Sync {
    /// Creates the tab if missing and makes its first row match `header`
    async fn ensure_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()>;

    /// Same as [`ensure_tab`](Self::ensure_tab) but the tab is hidden
    async fn ensure_hidden_tab(&self, tab: &str, header: &[&str]) -> SheetResult<()>;

    /// Appends rows after the last non-empty row of the tab
    async fn append_rows(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()>;

    /// Reads one column top to bottom, header cell included
    async fn read_column(&self, tab: &str, letter: &str) -> SheetResult<Vec<String>>;

    /// Clears the tab and writes `rows` from A1
    async fn rewrite_tab(&self, tab: &str, rows: &[Vec<String>]) -> SheetResult<()>;
}
