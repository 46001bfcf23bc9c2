//! pagegrep: a concurrent grep-the-web crawler
//!
//! Starting from a seed URL and a search pattern, pagegrep downloads the
//! page, greps it for the pattern and for outbound links, then follows
//! every discovered link on a pool of worker threads, repeating the
//! process until a global link budget runs out. The result is a tree of
//! per-page nodes, each carrying the fetched body and the byte offsets
//! of every URL and every pattern match found in it.

pub mod config;
pub mod crawler;
pub mod graph;
pub mod pool;
pub mod url;

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

pub use crate::crawler::Crawler;
pub use crate::graph::{GrepVars, LinkBudget, RootHandle, TaskNode};

/// Main error type for crawl-side operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no connection established, call connect() first")]
    NotConnected,

    #[error("unsupported request method: {0}")]
    Method(String),

    #[error("task error: {0}")]
    Task(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid grep pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid seed URL: {0}")]
    Seed(#[from] UrlError),

    #[error("validation error: {0}")]
    Validation(String),
}

/// URL handling errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("failed to parse URL: {0}")]
    Parse(String),

    #[error("only http and https URLs are supported, got: {0}")]
    InvalidScheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Worker panics are caught at the pool boundary and must not wedge every
/// structure the panicking job was touching.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
