/// 缓存数据模型
/// 定义存放在共享存储中的记录结构

// 令牌桶状态
pub mod rate_limit;

// 响应缓存条目
pub mod response;

pub use rate_limit::BucketState;
pub use response::CacheEntry;
