// 缓存模块
// 包含键生成、存储记录结构和限流/响应缓存操作

pub mod keys;
pub mod models;
pub mod operations;

pub use operations::{CacheLookup, Decision, ResponseCache, TokenBucketLimiter};
