//! Persistent per-category crawl progress

mod store;

pub use store::{CategoryState, StateError, StateStore};
