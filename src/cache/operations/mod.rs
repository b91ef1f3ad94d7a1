/// 缓存操作
/// 提供限流与响应缓存的功能实现

// 令牌桶限流
pub mod rate_limit;

// 响应缓存与防击穿锁
pub mod response;

pub use rate_limit::{Decision, TokenBucketLimiter};
pub use response::{
    CacheLookup, CacheStats, LockOutcome, ResponseCache, StampedeLock, StampedeSettings,
};
