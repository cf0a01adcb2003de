//! # WebShield Core
//!
//! Platform-independent request filtering for the WebShield proxy.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Domain matching** - exact, wildcard, parent and CIDR matching behind a bloom pre-filter
//! - **List management** - versioned blocklist/whitelist snapshots refreshed from sources
//! - **Rate limiting** - sliding-window counters with a cooldown block
//! - **Threat intelligence** - exact malicious URL lookups
//! - **Decision pipeline** - the ordered allow/block chain with a verdict cache
//! - **Configuration** - typed TOML config with profile presets
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wshield_core::{Config, FilterEngine, FilterRequest, ListStore, RateLimiter, VerdictCache};
//! use wshield_core::lists::{MemoryPersistence, SourceFetcher};
//! use wshield_core::threat::NoThreatFeed;
//!
//! # fn main() -> wshield_core::Result<()> {
//! let config = Config::load("webshield.toml")?;
//! let lists = Arc::new(ListStore::new(
//!     config.lists.clone(),
//!     Arc::new(SourceFetcher::new()?),
//!     Arc::new(MemoryPersistence::new()),
//! ));
//! lists.init()?;
//!
//! let engine = Arc::new(FilterEngine::new(
//!     &config,
//!     lists,
//!     Arc::new(RateLimiter::from_config(&config.rate_limit)),
//!     Arc::new(NoThreatFeed),
//!     Arc::new(VerdictCache::from_config(&config.cache)),
//! ));
//! engine.attach();
//!
//! let verdict = engine.evaluate(&FilterRequest::from_url("http://example.com/")?);
//! println!("blocked: {}", verdict.blocked);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lists;
pub mod ratelimit;
pub mod telemetry;
pub mod threat;
pub mod verdict;

// Re-exports for convenience
pub use cache::VerdictCache;
pub use config::{Config, Profile};
pub use engine::{EngineStats, FilterEngine, FilterRequest, Protocol};
pub use error::{Error, Result};
pub use filter::{BloomFilter, DomainEntry, DomainSet, EntryKind, GuardedSet};
pub use lists::{ListChangeListener, ListKind, ListSnapshot, ListStore, RefreshReport};
pub use ratelimit::{RateDecision, RateLimiter};
pub use telemetry::{EventKind, ProxyEvent, TelemetrySink};
pub use threat::{FeedChangeListener, MemoryThreatFeed, ThreatFeed, ThreatMatch};
pub use verdict::{BlockReason, Verdict};
