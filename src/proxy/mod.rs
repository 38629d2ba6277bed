//! Proxy rotation
//!
//! This module provides the pieces a fetch rotates proxies with:
//! - Allocator client that hands proxies out and takes them back
//! - User agent pool for allocated proxies
//! - Ban page detection
//! - Retry coordinator tying them to the lease store

pub mod allocator;
pub mod ban;
pub mod coordinator;
pub mod user_agents;

pub use allocator::{credential_hash, AllocatorClient, RemoteAllocator, RemoteAllocatorConfig};
pub use ban::{BanDetector, DEFAULT_BAN_PATTERN};
pub use coordinator::{
    AttemptOutcome, CoordinatorConfig, FetchOutcome, FetchedPage, RetryCoordinator,
};
pub use user_agents::UserAgentPool;
