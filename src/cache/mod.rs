pub mod tiered;
pub mod tiers;

pub use tiered::{CacheLookup, CacheSource, CacheStats, TieredCache};
pub use tiers::{CacheConfig, Tier, TierTable};
