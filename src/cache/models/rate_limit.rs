use serde::{Deserialize, Serialize};

use crate::config::RatePolicy;
use crate::error::StoreError;

/// 令牌桶在共享存储中的记录
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
    pub last_refill: f64, // Unix timestamp, seconds
}

impl BucketState {
    /// 首次请求或记录缺失时的满桶
    pub fn full(policy: &RatePolicy, now: f64) -> Self {
        Self {
            tokens: policy.capacity,
            capacity: policy.capacity,
            refill_rate_per_sec: policy.refill_rate_per_sec,
            last_refill: now,
        }
    }

    /// 解析并校验存储中的记录，再套用当前策略（容量缩小时截断令牌数）
    pub fn decode(key: &str, raw: &str, policy: &RatePolicy) -> Result<Self, StoreError> {
        let stored: BucketState =
            serde_json::from_str(raw).map_err(|e| StoreError::inconsistent(key, e))?;

        if !(stored.tokens.is_finite()
            && stored.capacity.is_finite()
            && stored.last_refill.is_finite())
        {
            return Err(StoreError::inconsistent(key, "non-finite bucket field"));
        }
        if stored.tokens < 0.0 || stored.tokens > stored.capacity {
            return Err(StoreError::inconsistent(
                key,
                format!(
                    "tokens {} outside [0, {}]",
                    stored.tokens, stored.capacity
                ),
            ));
        }

        Ok(Self {
            tokens: stored.tokens.min(policy.capacity),
            capacity: policy.capacity,
            refill_rate_per_sec: policy.refill_rate_per_sec,
            last_refill: stored.last_refill,
        })
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::inconsistent("bucket", e))
    }

    /// 按经过时间连续补充令牌；时间戳只会前进
    pub fn refilled(&self, now: f64) -> Self {
        let now = now.max(self.last_refill);
        let elapsed = now - self.last_refill;
        Self {
            tokens: (self.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity),
            last_refill: now,
            ..self.clone()
        }
    }

    /// 距离攒够 `cost` 个令牌还需等待的秒数
    pub fn wait_for(&self, cost: f64) -> f64 {
        ((cost - self.tokens) / self.refill_rate_per_sec).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: f64, rate: f64) -> RatePolicy {
        RatePolicy {
            capacity,
            refill_rate_per_sec: rate,
            idle_ttl_secs: None,
        }
    }

    #[test]
    fn refill_is_continuous_and_capped() {
        let mut state = BucketState::full(&policy(10.0, 2.0), 100.0);
        state.tokens = 0.0;

        let later = state.refilled(100.25);
        assert!((later.tokens - 0.5).abs() < 1e-9);
        assert_eq!(later.last_refill, 100.25);

        assert_eq!(state.refilled(1_000.0).tokens, 10.0);
    }

    #[test]
    fn refill_never_moves_time_backwards() {
        let state = BucketState::full(&policy(10.0, 1.0), 100.0);
        let skewed = state.refilled(90.0);
        assert_eq!(skewed.last_refill, 100.0);
        assert_eq!(skewed.tokens, 10.0);
    }

    #[test]
    fn decode_rejects_out_of_range_tokens() {
        let p = policy(10.0, 1.0);
        let raw = r#"{"tokens":11.0,"capacity":10.0,"refill_rate_per_sec":1.0,"last_refill":1.0}"#;
        assert!(BucketState::decode("k", raw, &p).is_err());
        assert!(BucketState::decode("k", "garbage", &p).is_err());
    }

    #[test]
    fn decode_clamps_to_shrunken_capacity() {
        let raw = r#"{"tokens":8.0,"capacity":10.0,"refill_rate_per_sec":1.0,"last_refill":1.0}"#;
        let state = BucketState::decode("k", raw, &policy(5.0, 3.0)).unwrap();
        assert_eq!(state.tokens, 5.0);
        assert_eq!(state.capacity, 5.0);
        assert_eq!(state.refill_rate_per_sec, 3.0);
    }
}
