//! Rate-limited view of upstream live status.

mod cache;

pub use cache::{CachedStatus, StatusCache, StatusCacheConfig};
