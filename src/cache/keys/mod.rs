/// 缓存键模块
/// 提供限流桶、响应缓存、防击穿锁的键生成函数

// 限流键
pub mod rate_limit_keys;

// 响应缓存键
pub mod response_keys;

pub use rate_limit_keys::BucketKey;
pub use response_keys::{
    CacheKey, RequestFingerprint, class_pattern, normalize_path, resource_class, stats_key,
};
