use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, RedisResult, aio::MultiplexedConnection};
use tokio::sync::Mutex;

use super::{ScriptReply, SharedStore, StoreScript};
use crate::error::StoreError;

/// SCAN 每批返回的键数量提示
const SCAN_BATCH: usize = 500;

/// Redis 存储客户端
///
/// 复用一条多路复用连接；连接出错或超时后丢弃，下次调用时重建。
/// 每次往返都受 `op_timeout` 约束。
pub struct RedisStore {
    client: RedisClient,
    conn: Mutex<Option<MultiplexedConnection>>,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn open(redis_url: &str, op_timeout: Duration) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: RedisClient::open(redis_url)?,
            conn: Mutex::new(None),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| self.timed_out("connect"))??;
        tracing::info!("Connected to redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    fn timed_out(&self, op: &str) -> StoreError {
        StoreError::Unavailable(format!("{op} timed out after {:?}", self.op_timeout))
    }

    async fn run<T, F, Fut>(&self, op: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, f(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.reset().await;
                }
                tracing::debug!(op, error = %e, "redis command failed");
                Err(e.into())
            }
            Err(_) => {
                self.reset().await;
                Err(self.timed_out(op))
            }
        }
    }
}

impl ScriptReply {
    fn from_redis(script: &str, value: redis::Value) -> Result<Self, StoreError> {
        match value {
            redis::Value::Nil => Ok(ScriptReply::Nil),
            redis::Value::Int(n) => Ok(ScriptReply::Int(n)),
            redis::Value::BulkString(bytes) => Ok(ScriptReply::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            redis::Value::SimpleString(s) => Ok(ScriptReply::Text(s)),
            redis::Value::Okay => Ok(ScriptReply::Text("OK".to_string())),
            other => Err(StoreError::inconsistent(
                script,
                format!("unsupported script reply {other:?}"),
            )),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("get", |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.run("set", |mut conn| async move {
            match ttl {
                Some(ttl) => {
                    conn.pset_ex(key, value, ttl.as_millis().max(1) as u64)
                        .await
                }
                None => conn.set(key, value).await,
            }
        })
        .await
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.run("incr", |mut conn| async move { conn.incr(key, delta).await })
            .await
    }

    async fn eval(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, StoreError> {
        let lua = redis::Script::new(script.lua);
        let value: redis::Value = self
            .run(script.name, |mut conn| async move {
                let mut invocation = lua.prepare_invoke();
                for key in keys {
                    invocation.key(key);
                }
                for arg in args {
                    invocation.arg(arg);
                }
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        ScriptReply::from_redis(script.name, value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u64 = self
            .run("del", |mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run("scan", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = self
                    .run("del", |mut conn| async move { conn.del(&keys).await })
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.run("pexpire", |mut conn| async move {
            conn.pexpire(key, ttl.as_millis().max(1) as i64).await
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self
            .run("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}
