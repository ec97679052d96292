//! Two-tier cache.
//!
//! ## Architecture
//!
//! - **Local tier (DashMap)**: in-process, microsecond latency, per instance
//! - **Distributed tier (Redis cluster)**: networked, shared across instances
//! - **Pub/Sub**: cross-instance invalidation of local copies
//!
//! ```text
//! get → local tier → distributed tier → absent (caller loads from the system of record)
//!          <1µs           ~1-5ms
//! ```
//!
//! ## Graceful degradation
//!
//! If the distributed tier is disabled, unreachable or slow, reads fall back
//! to local-only caching and writes report a partial success.

pub mod codec;
pub mod coordinator;
pub mod invalidation;
pub mod local;
pub mod pattern;
pub mod policy;
pub mod pubsub;

pub use codec::{CacheCodec, Json, MsgPack};
pub use coordinator::{
    BatchWriteOutcome, CacheStatistics, DistributedStats, MultiTierCache, SetOptions, TierWrite,
    WriteOutcome,
};
pub use invalidation::{
    InvalidationMessage, InvalidationReport, InvalidationRuleSource, InvalidationTarget,
};
pub use local::{LocalEntry, LocalTierSettings, LocalTierStats, LocalTierStore};
pub use pattern::GlobPattern;
pub use policy::{DEFAULT_OCCUPANCY_CEILING, TierPolicy};
pub use pubsub::InvalidationListener;
