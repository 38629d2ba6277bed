//! Rota Fetch - Proxy-Rotating Page Fetcher
//!
//! Fetches pages from sources that throttle by address, rotating through
//! proxies leased from a remote allocator.
//!
//! ## Features
//!
//! - Per-session HTTP client with URL merging, form/raw/multipart payloads
//! - HTTP, SOCKS4 and SOCKS5 upstream proxies
//! - File-backed lease store shared between processes, with blacklist
//! - Ban page detection on plain and gzip bodies
//! - Retry coordinator with bounded same-proxy retries and rotation

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;

pub use client::HttpSession;
pub use config::Config;
pub use error::{FetchError, Result};
pub use proxy::{FetchOutcome, RetryCoordinator};
