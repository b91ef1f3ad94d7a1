use std::sync::Arc;

use crate::cache::keys::BucketKey;
use crate::cache::models::BucketState;
use crate::config::{Config, RatePolicy};
use crate::error::StoreError;
use crate::store::DynStore;
use crate::utils::Clock;

/// 失败关闭时建议的重试间隔（秒）
const FAIL_CLOSED_RETRY_SECS: f64 = 1.0;

/// 一次准入判定
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: f64,
    pub remaining_tokens: f64,
    pub limit: f64,
    /// 存储不可用，判定由失败策略给出
    pub degraded: bool,
}

/// 基于共享存储的连续令牌桶限流器
///
/// 桶状态的读-改-写通过有界的 compare-and-set 循环提交，
/// 同一个键上的并发调用等价于某个串行顺序。
#[derive(Clone)]
pub struct TokenBucketLimiter {
    store: DynStore,
    clock: Arc<dyn Clock>,
    fail_open: bool,
    max_cas_retries: u32,
}

impl TokenBucketLimiter {
    pub fn new(
        store: DynStore,
        clock: Arc<dyn Clock>,
        fail_open: bool,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            fail_open,
            max_cas_retries: max_cas_retries.max(1),
        }
    }

    pub fn from_config(store: DynStore, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self::new(
            store,
            clock,
            config.fail_open_on_store_error,
            config.limiter_max_cas_retries,
        )
    }

    pub async fn admit(&self, key: &BucketKey, cost: u32, policy: &RatePolicy) -> Decision {
        match self.try_admit(key, cost as f64, policy).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    key = %key.store_key(),
                    error = %e,
                    fail_open = self.fail_open,
                    "Rate limiter degraded"
                );
                self.degraded(policy)
            }
        }
    }

    fn degraded(&self, policy: &RatePolicy) -> Decision {
        if self.fail_open {
            Decision {
                allowed: true,
                retry_after_secs: 0.0,
                remaining_tokens: policy.capacity,
                limit: policy.capacity,
                degraded: true,
            }
        } else {
            Decision {
                allowed: false,
                retry_after_secs: FAIL_CLOSED_RETRY_SECS,
                remaining_tokens: 0.0,
                limit: policy.capacity,
                degraded: true,
            }
        }
    }

    async fn try_admit(
        &self,
        key: &BucketKey,
        cost: f64,
        policy: &RatePolicy,
    ) -> Result<Decision, StoreError> {
        let store_key = key.store_key();
        let idle_ttl = policy.idle_ttl();

        for attempt in 0..self.max_cas_retries {
            let raw = self.store.get(&store_key).await?;
            let now = self.clock.now_secs();

            let current = match raw.as_deref() {
                None => BucketState::full(policy, now),
                Some(raw) => BucketState::decode(&store_key, raw, policy).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Discarding corrupted bucket state");
                    BucketState::full(policy, now)
                }),
            };
            let refilled = current.refilled(now);

            if cost > refilled.tokens {
                // 拒绝时不改写状态，只续期空闲 TTL
                if raw.is_some() {
                    if let Err(e) = self.store.expire(&store_key, idle_ttl).await {
                        tracing::debug!(
                            key = %store_key,
                            error = %e,
                            "Failed to refresh bucket ttl"
                        );
                    }
                }
                return Ok(Decision {
                    allowed: false,
                    retry_after_secs: refilled.wait_for(cost),
                    remaining_tokens: refilled.tokens,
                    limit: policy.capacity,
                    degraded: false,
                });
            }

            let next = BucketState {
                tokens: refilled.tokens - cost,
                ..refilled
            };
            let committed = self
                .store
                .compare_and_set(&store_key, raw.as_deref(), &next.encode()?, Some(idle_ttl))
                .await?;
            if committed {
                return Ok(Decision {
                    allowed: true,
                    retry_after_secs: 0.0,
                    remaining_tokens: next.tokens,
                    limit: policy.capacity,
                    degraded: false,
                });
            }
            tracing::debug!(key = %store_key, attempt, "Bucket changed concurrently, retrying");
        }

        tracing::warn!(
            key = %store_key,
            retries = self.max_cas_retries,
            "Bucket contention exceeded retry bound, rejecting"
        );
        Ok(Decision {
            allowed: false,
            retry_after_secs: cost / policy.refill_rate_per_sec,
            remaining_tokens: 0.0,
            limit: policy.capacity,
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use crate::utils::ManualClock;
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    fn policy(capacity: f64, rate: f64) -> RatePolicy {
        RatePolicy {
            capacity,
            refill_rate_per_sec: rate,
            idle_ttl_secs: None,
        }
    }

    fn limiter(fail_open: bool) -> (Arc<ManualClock>, Arc<MemoryStore>, TokenBucketLimiter) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = TokenBucketLimiter::new(store.clone(), clock.clone(), fail_open, 8);
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn capacity_ten_then_reject_with_retry_after() {
        let (_clock, _store, limiter) = limiter(true);
        let key = BucketKey::new("ip:1.1.1.1", Some("products"));
        let p = policy(10.0, 1.0);

        for i in 0..10 {
            let d = limiter.admit(&key, 1, &p).await;
            assert!(d.allowed, "call {i} should be admitted");
            assert_eq!(d.remaining_tokens, 9.0 - i as f64);
        }

        let eleventh = limiter.admit(&key, 1, &p).await;
        assert!(!eleventh.allowed);
        assert!(!eleventh.degraded);
        assert!((eleventh.retry_after_secs - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let (clock, _store, limiter) = limiter(true);
        let key = BucketKey::new("ip:1.1.1.1", None);
        let p = policy(2.0, 4.0);

        assert!(limiter.admit(&key, 2, &p).await.allowed);
        assert!(!limiter.admit(&key, 1, &p).await.allowed);

        clock.advance_millis(250);
        let d = limiter.admit(&key, 1, &p).await;
        assert!(d.allowed);
        assert!(d.remaining_tokens.abs() < 1e-9);
    }

    #[tokio::test]
    async fn never_admits_more_than_capacity_plus_refill() {
        let (clock, _store, limiter) = limiter(true);
        let key = BucketKey::new("ip:2.2.2.2", Some("orders"));
        let p = policy(5.0, 2.0);

        let mut admitted = 0.0;
        let mut elapsed = 0.0;
        for step in 0..400 {
            let cost = (step % 3 + 1) as u32;
            if limiter.admit(&key, cost, &p).await.allowed {
                admitted += cost as f64;
            }
            assert!(admitted <= p.capacity + elapsed * p.refill_rate_per_sec + 1e-3);

            let advance = [0, 37, 120, 5, 480][step % 5];
            clock.advance_millis(advance);
            elapsed += advance as f64 / 1000.0;
        }
        assert!(admitted > 0.0);
    }

    #[tokio::test]
    async fn distinct_classes_have_distinct_buckets() {
        let (_clock, _store, limiter) = limiter(true);
        let p = policy(1.0, 0.1);
        let products = BucketKey::new("ip:3.3.3.3", Some("products"));
        let orders = BucketKey::new("ip:3.3.3.3", Some("orders"));

        assert!(limiter.admit(&products, 1, &p).await.allowed);
        assert!(!limiter.admit(&products, 1, &p).await.allowed);
        assert!(limiter.admit(&orders, 1, &p).await.allowed);
    }

    #[tokio::test]
    async fn cost_above_capacity_is_always_rejected() {
        let (clock, _store, limiter) = limiter(true);
        let key = BucketKey::new("ip:4.4.4.4", None);
        let p = policy(3.0, 1.0);
        clock.advance_millis(60_000);
        assert!(!limiter.admit(&key, 4, &p).await.allowed);
        assert!(limiter.admit(&key, 3, &p).await.allowed);
    }

    #[tokio::test]
    async fn missing_bucket_behaves_like_full_bucket() {
        let (_clock, store, limiter) = limiter(true);
        let key = BucketKey::new("ip:5.5.5.5", None);
        let p = policy(2.0, 1.0);

        assert!(limiter.admit(&key, 2, &p).await.allowed);
        store.delete(&key.store_key()).await.unwrap();
        assert_eq!(limiter.admit(&key, 1, &p).await.remaining_tokens, 1.0);
    }

    #[tokio::test]
    async fn idle_bucket_expires_from_store() {
        let (clock, store, limiter) = limiter(true);
        let key = BucketKey::new("ip:6.6.6.6", None);
        let p = RatePolicy {
            idle_ttl_secs: Some(120),
            ..policy(10.0, 1.0)
        };

        limiter.admit(&key, 1, &p).await;
        assert!(store.get(&key.store_key()).await.unwrap().is_some());
        clock.advance_millis(120_000);
        assert!(store.get(&key.store_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_state_reinitializes_to_full() {
        let (_clock, store, limiter) = limiter(true);
        let key = BucketKey::new("ip:7.7.7.7", None);
        let p = policy(4.0, 1.0);
        store
            .set(&key.store_key(), "{\"tokens\":-3}", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let d = limiter.admit(&key, 1, &p).await;
        assert!(d.allowed);
        assert_eq!(d.remaining_tokens, 3.0);

        let raw = store.get(&key.store_key()).await.unwrap().unwrap();
        assert!(BucketState::decode("k", &raw, &p).is_ok());
    }

    #[tokio::test]
    async fn store_outage_fails_open_until_recovery() {
        let (_clock, store, limiter) = limiter(true);
        let key = BucketKey::new("ip:8.8.8.8", None);
        let p = policy(1.0, 0.01);

        assert!(limiter.admit(&key, 1, &p).await.allowed);
        store.set_available(false);
        for _ in 0..5 {
            let d = limiter.admit(&key, 1, &p).await;
            assert!(d.allowed);
            assert!(d.degraded);
        }

        store.set_available(true);
        let d = limiter.admit(&key, 1, &p).await;
        assert!(!d.allowed);
        assert!(!d.degraded);
    }

    #[tokio::test]
    async fn store_outage_fails_closed_when_configured() {
        let (_clock, store, limiter) = limiter(false);
        store.set_available(false);
        let d = limiter
            .admit(&BucketKey::new("ip:9.9.9.9", None), 1, &policy(10.0, 1.0))
            .await;
        assert!(!d.allowed);
        assert!(d.degraded);
        assert_eq!(d.retry_after_secs, FAIL_CLOSED_RETRY_SECS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admits_never_oversell() {
        let (_clock, _store, limiter) = limiter(true);
        let limiter = TokenBucketLimiter {
            max_cas_retries: 1_000,
            ..limiter
        };
        let key = BucketKey::new("ip:10.10.10.10", Some("products"));
        let p = policy(10.0, 0.001);

        let tasks = (0..64).map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            let p = p.clone();
            tokio::spawn(async move { limiter.admit(&key, 1, &p).await.allowed })
        });
        let admitted = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_pair_admits_only_one_when_one_token_short() {
        let (_clock, _store, limiter) = limiter(true);
        let key = BucketKey::new("ip:11.11.11.11", None);
        let p = policy(3.0, 0.001);

        let (a, b) = tokio::join!(limiter.admit(&key, 2, &p), limiter.admit(&key, 2, &p));
        assert_eq!(a.allowed as u8 + b.allowed as u8, 1);
    }
}
