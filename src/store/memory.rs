use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ScriptOps, ScriptReply, SharedStore, StoreScript};
use crate::error::StoreError;
use crate::utils::Clock;

#[derive(Debug, Clone)]
struct MemoryRecord {
    value: String,
    expires_at: Option<i64>,
}

impl MemoryRecord {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// 进程内存储：单实例开发环境和测试使用。
///
/// 所有操作在同一把互斥锁内完成，因此每个调用（包括脚本）都是原子的；
/// 过期时间按注入的 `Clock` 计算。
pub struct MemoryStore {
    records: Mutex<HashMap<String, MemoryRecord>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// 模拟存储故障：关闭后所有调用返回 `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 当前未过期的键数量
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn txn(&self) -> Result<MemoryTxn<'_>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(MemoryTxn {
            records: self.lock(),
            now: self.clock.now_millis(),
        })
    }
}

struct MemoryTxn<'a> {
    records: MutexGuard<'a, HashMap<String, MemoryRecord>>,
    now: i64,
}

impl MemoryTxn<'_> {
    fn live(&mut self, key: &str) -> Option<&mut MemoryRecord> {
        let now = self.now;
        if self.records.get(key).is_some_and(|r| !r.is_live(now)) {
            self.records.remove(key);
        }
        self.records.get_mut(key)
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|t| self.now + t.as_millis() as i64)
    }
}

impl ScriptOps for MemoryTxn<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.records
            .get(key)
            .filter(|r| r.is_live(self.now))
            .map(|r| r.value.clone())
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = self.deadline(ttl);
        self.records
            .insert(key.to_string(), MemoryRecord { value, expires_at });
    }

    fn delete(&mut self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        self.records.remove(key);
        existed
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut txn = self.txn()?;
        Ok(txn.live(key).map(|r| r.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut txn = self.txn()?;
        ScriptOps::set(&mut txn, key, value.to_string(), ttl);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut txn = self.txn()?;
        match txn.live(key) {
            Some(record) => {
                let current: i64 = record
                    .value
                    .parse()
                    .map_err(|e| StoreError::inconsistent(key, e))?;
                let next = current + delta;
                record.value = next.to_string();
                Ok(next)
            }
            None => {
                ScriptOps::set(&mut txn, key, delta.to_string(), None);
                Ok(delta)
            }
        }
    }

    async fn eval(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, StoreError> {
        let mut txn = self.txn()?;
        (script.native)(&mut txn, keys, args)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut txn = self.txn()?;
        Ok(ScriptOps::delete(&mut txn, key))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut txn = self.txn()?;
        let now = txn.now;
        let before = txn.records.len();
        let mut removed = 0;
        txn.records.retain(|key, record| {
            let matched = glob_match(pattern.as_bytes(), key.as_bytes());
            if matched && record.is_live(now) {
                removed += 1;
            }
            !matched
        });
        tracing::trace!(pattern, removed, swept = before - txn.records.len(), "pattern delete");
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut txn = self.txn()?;
        let expires_at = txn.deadline(Some(ttl));
        match txn.live(key) {
            Some(record) => {
                record.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.txn().map(|_| ())
    }
}

/// Redis 风格的 glob 匹配，支持 `*` 和 `?`
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
