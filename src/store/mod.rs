//! 共享键值存储客户端
//!
//! 桶状态和缓存条目都只存放在外部存储中，进程内不保留权威副本。
//! 所有跨请求、跨实例的协调都通过这里暴露的原子原语完成。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, StoreBackend};
use crate::error::{ConfigError, StoreError};
use crate::utils::SystemClock;

pub mod memory;
pub mod redis_store;
pub mod scripts;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use scripts::{NativeScript, ScriptOps, StoreScript};

pub type DynStore = Arc<dyn SharedStore>;

/// 脚本执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Nil,
    Int(i64),
    Text(String),
}

impl ScriptReply {
    /// 脚本约定以 1/0 表示成功/失败
    pub fn as_flag(&self, script: &str) -> Result<bool, StoreError> {
        match self {
            ScriptReply::Int(n) => Ok(*n != 0),
            ScriptReply::Nil => Ok(false),
            ScriptReply::Text(other) => Err(StoreError::inconsistent(
                script,
                format!("expected integer reply, got {other:?}"),
            )),
        }
    }
}

/// 外部存储的原子原语。每次调用都是一次有界延迟的网络往返，失败以 `StoreError` 报告。
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// 原子地执行一段脚本
    async fn eval(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// 按 glob 模式（`*`、`?`）删除，返回删除数量
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// `expected` 为 `None` 表示要求键不存在
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let args = scripts::compare_and_set_args(expected, new, ttl);
        self.eval(&scripts::COMPARE_AND_SET, &[key.to_string()], &args)
            .await?
            .as_flag(scripts::COMPARE_AND_SET.name)
    }

    /// 仅当当前值等于 `expected` 时删除
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.eval(
            &scripts::COMPARE_AND_DELETE,
            &[key.to_string()],
            &[expected.to_string()],
        )
        .await?
        .as_flag(scripts::COMPARE_AND_DELETE.name)
    }
}

/// 根据配置构建存储客户端
pub fn connect(config: &Config) -> Result<DynStore, ConfigError> {
    match config.store_backend {
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or(ConfigError::Missing { name: "REDIS_URL" })?;
            let store = RedisStore::open(url, config.store_timeout())
                .map_err(|e| ConfigError::invalid("REDIS_URL", e))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-process memory store; state is not shared between instances");
            Ok(Arc::new(MemoryStore::new(Arc::new(SystemClock))))
        }
    }
}
