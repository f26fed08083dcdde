//! SQLite-backed progress store
//!
//! One row per (site, category URL) with the last fully committed page and
//! product count. Every upsert is a single transaction with synchronous
//! writes, so the row a restarted process reads is the last one that was
//! durably committed before the crash.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Progress of one category crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryState {
    pub site_name: String,
    pub category_url: String,
    /// Page of the most recently committed product
    pub last_page: Option<u32>,
    /// Count of products durably committed for this category
    pub last_product_count: Option<u64>,
    pub last_run_ts: Option<DateTime<Utc>>,
}

/// Thread-safe store; writes are serialized, reads see a snapshot
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Opens (or creates) the store at the given path.
    ///
    /// Parent directories are created as needed. The connection runs in WAL
    /// mode with `synchronous = FULL` so each upsert survives a crash.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
        ",
        )?;
        Self::initialize_schema(&conn)?;
        tracing::info!(db = %path.display(), "State store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests
    #[cfg(test)]
    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> StateResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS category_state (
                site_name TEXT NOT NULL,
                category_url TEXT NOT NULL,
                last_page INTEGER,
                last_product_count INTEGER,
                last_run_ts TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (site_name, category_url)
            );
        ",
        )?;
        Ok(())
    }

    /// Atomic replace-or-insert of one category row
    pub fn upsert(&self, state: &CategoryState) -> StateResult<()> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        conn.execute(
            "INSERT INTO category_state
                 (site_name, category_url, last_page, last_product_count, last_run_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(site_name, category_url) DO UPDATE SET
                 last_page = excluded.last_page,
                 last_product_count = excluded.last_product_count,
                 last_run_ts = excluded.last_run_ts,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                state.site_name,
                state.category_url,
                state.last_page,
                state.last_product_count.map(|v| v as i64),
                state.last_run_ts.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, site_name: &str, category_url: &str) -> StateResult<Option<CategoryState>> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        let row = conn
            .query_row(
                "SELECT site_name, category_url, last_page, last_product_count, last_run_ts
                   FROM category_state
                  WHERE site_name = ?1 AND category_url = ?2",
                params![site_name, category_url],
                row_to_state,
            )
            .optional()?;
        Ok(row)
    }

    /// Every category row for one site
    pub fn iter_site_state(&self, site_name: &str) -> StateResult<Vec<CategoryState>> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT site_name, category_url, last_page, last_product_count, last_run_ts
               FROM category_state
              WHERE site_name = ?1
              ORDER BY category_url",
        )?;
        let rows = stmt
            .query_map(params![site_name], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every category row, for the `_state` sheet sync
    pub fn iter_all(&self) -> StateResult<Vec<CategoryState>> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT site_name, category_url, last_page, last_product_count, last_run_ts
               FROM category_state
              ORDER BY site_name, category_url",
        )?;
        let rows = stmt
            .query_map([], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn reset_site(&self, site_name: &str) -> StateResult<()> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        conn.execute(
            "DELETE FROM category_state WHERE site_name = ?1",
            params![site_name],
        )?;
        Ok(())
    }

    pub fn reset_category(&self, site_name: &str, category_url: &str) -> StateResult<()> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        conn.execute(
            "DELETE FROM category_state WHERE site_name = ?1 AND category_url = ?2",
            params![site_name, category_url],
        )?;
        Ok(())
    }

    pub fn reset_all(&self) -> StateResult<()> {
        let conn = self.conn.lock().expect("state store lock poisoned");
        conn.execute("DELETE FROM category_state", [])?;
        Ok(())
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<CategoryState> {
    let last_run_ts: Option<String> = row.get(4)?;
    Ok(CategoryState {
        site_name: row.get(0)?,
        category_url: row.get(1)?,
        last_page: row.get(2)?,
        last_product_count: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        last_run_ts: last_run_ts
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(site: &str, category: &str, page: u32, count: u64) -> CategoryState {
        CategoryState {
            site_name: site.to_string(),
            category_url: category.to_string(),
            last_page: Some(page),
            last_product_count: Some(count),
            last_run_ts: Some(Utc::now()),
        }
    }

    #[test]
    fn test_upsert_then_get_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let state = sample("shop", "https://shop.ru/items/tea", 3, 7);
        store.upsert(&state).unwrap();

        let loaded = store.get("shop", "https://shop.ru/items/tea").unwrap().unwrap();
        assert_eq!(loaded.last_page, Some(3));
        assert_eq!(loaded.last_product_count, Some(7));
        assert!(loaded.last_run_ts.is_some());
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get("shop", "https://none").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let store = StateStore::open_in_memory().unwrap();
        let url = "https://shop.ru/items/tea";
        store.upsert(&sample("shop", url, 1, 2)).unwrap();
        store.upsert(&sample("shop", url, 2, 5)).unwrap();

        let loaded = store.get("shop", url).unwrap().unwrap();
        assert_eq!(loaded.last_page, Some(2));
        assert_eq!(loaded.last_product_count, Some(5));
        assert_eq!(store.iter_site_state("shop").unwrap().len(), 1);
    }

    #[test]
    fn test_reset_scopes() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert(&sample("a", "https://a/1", 1, 1)).unwrap();
        store.upsert(&sample("a", "https://a/2", 1, 1)).unwrap();
        store.upsert(&sample("b", "https://b/1", 1, 1)).unwrap();

        store.reset_category("a", "https://a/1").unwrap();
        assert_eq!(store.iter_site_state("a").unwrap().len(), 1);

        store.reset_site("a").unwrap();
        assert!(store.iter_site_state("a").unwrap().is_empty());
        assert_eq!(store.iter_all().unwrap().len(), 1);

        store.reset_all().unwrap();
        assert!(store.iter_all().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.upsert(&sample("shop", "https://shop.ru/items/tea", 3, 7)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let loaded = store.get("shop", "https://shop.ru/items/tea").unwrap().unwrap();
        assert_eq!(loaded.last_product_count, Some(7));
    }
}
