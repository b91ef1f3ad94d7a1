use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::cache::keys::{CacheKey, class_pattern, stats_key};
use crate::cache::models::CacheEntry;
use crate::config::Config;
use crate::error::StoreError;
use crate::store::DynStore;
use crate::utils::Clock;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

/// 防击穿锁的持有凭证，释放时按令牌比对删除
#[derive(Debug)]
pub struct StampedeLock {
    key: String,
    token: String,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(StampedeLock),
    /// 其他请求正在回源
    HeldElsewhere,
    /// 存储不可用，不等待直接回源
    Unavailable,
}

/// 防击穿参数
#[derive(Debug, Clone, Copy)]
pub struct StampedeSettings {
    pub lock_ttl: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl StampedeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_ttl: config.stampede_lock_ttl(),
            max_wait: config.max_stampede_wait(),
            poll_interval: config.stampede_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: i64,
    pub misses: i64,
}

/// 基于共享存储的响应缓存
///
/// 缓存是尽力而为的：存储故障一律按未命中/空操作处理，从不变成请求失败。
#[derive(Clone)]
pub struct ResponseCache {
    store: DynStore,
    clock: Arc<dyn Clock>,
    stampede: StampedeSettings,
}

impl ResponseCache {
    pub fn new(store: DynStore, clock: Arc<dyn Clock>, stampede: StampedeSettings) -> Self {
        Self {
            store,
            clock,
            stampede,
        }
    }

    pub fn from_config(store: DynStore, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self::new(store, clock, StampedeSettings::from_config(config))
    }

    /// 新条目的创建时间，与新鲜度校验使用同一个时钟
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let store_key = key.store_key();
        let raw = match self.store.get(&store_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                tracing::warn!(
                    key = %store_key,
                    error = %e,
                    "Cache lookup failed, treating as miss"
                );
                return CacheLookup::Miss;
            }
        };

        match CacheEntry::decode(&store_key, &raw) {
            Ok(entry) if entry.is_fresh(self.clock.now_millis()) => CacheLookup::Hit(entry),
            Ok(_) => CacheLookup::Miss,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupted cache entry");
                if let Err(e) = self.store.delete(&store_key).await {
                    tracing::debug!(
                        key = %store_key,
                        error = %e,
                        "Failed to delete corrupted entry"
                    );
                }
                CacheLookup::Miss
            }
        }
    }

    /// 覆盖写入，条目年龄从本次写入重新计算
    pub async fn store(&self, key: &CacheKey, entry: &CacheEntry, ttl_secs: u64) {
        if ttl_secs == 0 {
            return;
        }
        let store_key = key.store_key();
        let entry = CacheEntry {
            ttl_secs,
            ..entry.clone()
        };
        let result = match entry.encode() {
            Ok(json) => {
                self.store
                    .set(&store_key, &json, Some(Duration::from_secs(ttl_secs)))
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(key = %store_key, ttl_secs, "Cached response"),
            Err(e) => tracing::warn!(key = %store_key, error = %e, "Failed to cache response"),
        }
    }

    /// 删除某资源类别下的全部条目，返回删除数量
    pub async fn invalidate(&self, class: &str) -> u64 {
        let pattern = class_pattern(class);
        match self.store.delete_by_pattern(&pattern).await {
            Ok(count) => {
                tracing::debug!(class, count, "Invalidated cache class");
                count
            }
            Err(e) => {
                tracing::warn!(class, error = %e, "Cache invalidation failed");
                0
            }
        }
    }

    pub async fn try_lock(&self, key: &CacheKey) -> LockOutcome {
        let lock = StampedeLock {
            key: key.lock_key(),
            token: uuid::Uuid::new_v4().to_string(),
        };
        match self
            .store
            .compare_and_set(&lock.key, None, &lock.token, Some(self.stampede.lock_ttl))
            .await
        {
            Ok(true) => LockOutcome::Acquired(lock),
            Ok(false) => LockOutcome::HeldElsewhere,
            Err(e) => {
                tracing::debug!(key = %lock.key, error = %e, "Stampede lock unavailable");
                LockOutcome::Unavailable
            }
        }
    }

    pub async fn release(&self, lock: StampedeLock) {
        if let Err(e) = self.store.compare_and_delete(&lock.key, &lock.token).await {
            tracing::debug!(key = %lock.key, error = %e, "Failed to release stampede lock");
        }
    }

    /// 等待持锁请求回填缓存；超过最长等待时间返回 `None`，由调用方自行回源
    pub async fn wait_for_fill(&self, key: &CacheKey) -> Option<CacheEntry> {
        let deadline = Instant::now() + self.stampede.max_wait;
        let lock_key = key.lock_key();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.stampede.poll_interval.min(deadline - now)).await;

            if let CacheLookup::Hit(entry) = self.lookup(key).await {
                return Some(entry);
            }
            // 持锁方已结束（释放或过期），最后再查一次就不再等待
            match self.store.get(&lock_key).await {
                Ok(None) => {
                    return match self.lookup(key).await {
                        CacheLookup::Hit(entry) => Some(entry),
                        CacheLookup::Miss => None,
                    };
                }
                Err(_) => return None,
                Ok(Some(_)) => {}
            }
        }
    }

    /// 记录命中/未命中计数，不阻塞请求
    pub fn record(&self, class: &str, hit: bool) {
        let key = stats_key(class, if hit { "hits" } else { "misses" });
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.increment(&key, 1).await {
                tracing::debug!(key = %key, error = %e, "Failed to record cache stats");
            }
        });
    }

    pub async fn stats(&self, class: &str) -> Result<CacheStats, StoreError> {
        let read = |outcome: &'static str| {
            let key = stats_key(class, outcome);
            async move {
                match self.store.get(&key).await? {
                    Some(raw) => raw.parse::<i64>().map_err(|e| StoreError::inconsistent(key, e)),
                    None => Ok(0),
                }
            }
        };
        Ok(CacheStats {
            hits: read("hits").await?,
            misses: read("misses").await?,
        })
    }
}
