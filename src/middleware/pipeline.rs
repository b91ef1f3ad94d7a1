use std::sync::Arc;

use axum::{
    body::{Body, HttpBody, to_bytes},
    extract::State,
    http::{
        HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::cache::keys::{BucketKey, CacheKey, RequestFingerprint, resource_class};
use crate::cache::models::CacheEntry;
use crate::cache::operations::{
    CacheLookup, Decision, LockOutcome, ResponseCache, StampedeLock, TokenBucketLimiter,
};
use crate::config::{CachePolicy, Config};
use crate::metrics::{record_cache_lookup, record_rate_limit_rejection};
use crate::store::DynStore;
use crate::utils::{Clock, error_codes, error_to_api_response};

use super::client::client_identity;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

/// 单个请求在流水线中的阶段，只能前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    RateChecked,
    CacheChecked,
    Handling,
    Responding,
    Done,
}

struct StageTracker {
    stage: Stage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {:?} -> {:?}", self.stage, next);
        tracing::debug!(from = ?self.stage, to = ?next, "Pipeline stage");
        self.stage = next;
    }
}

/// 限流 -> 缓存 -> 处理器 -> 回写 的请求流水线
pub struct Pipeline {
    config: Arc<Config>,
    limiter: TokenBucketLimiter,
    cache: ResponseCache,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, store: DynStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: TokenBucketLimiter::from_config(store.clone(), clock.clone(), &config),
            cache: ResponseCache::from_config(store, clock, &config),
            config,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

pub async fn pipeline(
    State(pipeline): State<Arc<Pipeline>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let config = pipeline.config();
    let mut stage = StageTracker::new();

    let class = resource_class(req.uri().path(), &config.api_base_uri);
    let policy = config.policy_for(&class).clone();
    let method = req.method().clone();

    let bucket = BucketKey::new(client_identity(&req), Some(&class));
    let decision = pipeline.limiter.admit(&bucket, 1, &policy.rate).await;
    stage.advance(Stage::RateChecked);
    if decision.degraded {
        tracing::warn!(
            class = %class,
            allowed = decision.allowed,
            "Admission decided without shared store"
        );
    }
    if !decision.allowed {
        record_rate_limit_rejection(&class, decision.degraded);
        stage.advance(Stage::Done);
        return too_many_requests(&decision);
    }

    let use_cache = policy.cache.cacheable && config.is_cacheable_method(&method);
    let (req, cache_key) = if use_cache {
        let max_body_bytes = config.max_cacheable_body_bytes;
        match derive_cache_key(req, &class, &policy.cache, max_body_bytes).await {
            Ok((req, key)) => (req, Some(key)),
            Err(response) => {
                stage.advance(Stage::Done);
                return with_rate_headers(response, &decision);
            }
        }
    } else {
        (req, None)
    };

    let mut lock = None;
    if let Some(key) = &cache_key {
        if let Some(entry) = coalesced_lookup(pipeline.cache(), key, &mut lock).await {
            pipeline.cache().record(&class, true);
            record_cache_lookup(&class, true);
            stage.advance(Stage::Done);
            return with_rate_headers(replay(entry), &decision);
        }
        pipeline.cache().record(&class, false);
        record_cache_lookup(&class, false);
        stage.advance(Stage::CacheChecked);
    }

    stage.advance(Stage::Handling);
    let response = next.run(req).await;
    stage.advance(Stage::Responding);

    if response.status().is_success() && is_mutating(&method) {
        let classes: Vec<String> = std::iter::once(class.clone())
            .chain(policy.cache.also_invalidates.iter().cloned())
            .collect();
        let cache = pipeline.cache().clone();
        // 在独立任务中完成，客户端断开也不会中途放弃
        let invalidation = tokio::spawn(async move {
            for class in classes {
                cache.invalidate(&class).await;
            }
        });
        if let Err(e) = invalidation.await {
            tracing::error!("Cache invalidation task failed: {}", e);
        }
    }

    let mut response = match cache_key {
        Some(key) => write_back(&pipeline, key, lock, response, &policy.cache).await,
        None => response,
    };
    if use_cache {
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
    }

    stage.advance(Stage::Done);
    with_rate_headers(response, &decision)
}

/// 查缓存；未命中时抢防击穿锁，抢不到就等待持锁方回填
async fn coalesced_lookup(
    cache: &ResponseCache,
    key: &CacheKey,
    lock: &mut Option<StampedeLock>,
) -> Option<CacheEntry> {
    if let CacheLookup::Hit(entry) = cache.lookup(key).await {
        return Some(entry);
    }
    match cache.try_lock(key).await {
        LockOutcome::Acquired(acquired) => {
            // 上一个持锁方可能刚回填完并释放了锁
            if let CacheLookup::Hit(entry) = cache.lookup(key).await {
                cache.release(acquired).await;
                return Some(entry);
            }
            *lock = Some(acquired);
            None
        }
        LockOutcome::HeldElsewhere => cache.wait_for_fill(key).await,
        LockOutcome::Unavailable => None,
    }
}

async fn derive_cache_key(
    req: Request<Body>,
    class: &str,
    policy: &CachePolicy,
    max_body_bytes: usize,
) -> Result<(Request<Body>, CacheKey), Response> {
    if !policy.vary_on_body {
        let key = CacheKey::derive(
            class,
            &RequestFingerprint {
                method: req.method(),
                path: req.uri().path(),
                query: req.uri().query(),
                headers: req.headers(),
                header_allow_list: &policy.header_allow_list,
                body: None,
            },
        );
        return Ok((req, key));
    }

    // 请求体参与键计算时先读出，再原样放回请求
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, max_body_bytes).await.map_err(|e| {
        tracing::warn!("Failed to read request body for cache key: {}", e);
        (
            StatusCode::BAD_REQUEST,
            error_to_api_response::<()>(
                error_codes::VALIDATION_ERROR,
                "请求体无法读取".to_string(),
            ),
        )
            .into_response()
    })?;
    let key = CacheKey::derive(
        class,
        &RequestFingerprint {
            method: &parts.method,
            path: parts.uri.path(),
            query: parts.uri.query(),
            headers: &parts.headers,
            header_allow_list: &policy.header_allow_list,
            body: Some(&bytes[..]),
        },
    );
    Ok((Request::from_parts(parts, Body::from(bytes)), key))
}

/// 缓存成功响应，并释放防击穿锁
async fn write_back(
    pipeline: &Pipeline,
    key: CacheKey,
    lock: Option<StampedeLock>,
    response: Response,
    policy: &CachePolicy,
) -> Response {
    let config = pipeline.config();
    let max_body_bytes = config.max_cacheable_body_bytes;
    let (response, entry) = match cacheable_ttl(&response, policy, max_body_bytes) {
        Some(ttl) => capture(response, ttl, max_body_bytes, pipeline).await,
        None => (response, None),
    };

    if entry.is_none() && lock.is_none() {
        return response;
    }
    let cache = pipeline.cache().clone();
    let side_effect = tokio::spawn(async move {
        if let Some(entry) = entry {
            cache.store(&key, &entry, entry.ttl_secs).await;
        }
        if let Some(lock) = lock {
            cache.release(lock).await;
        }
    });
    if let Err(e) = side_effect.await {
        tracing::error!("Cache write-back task failed: {}", e);
    }
    response
}

/// 读出响应体生成缓存条目，再用同一份字节重建响应
async fn capture(
    response: Response,
    ttl_secs: u64,
    max_body_bytes: usize,
    pipeline: &Pipeline,
) -> (Response, Option<CacheEntry>) {
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to read response body for caching: {}", e);
            return (Response::from_parts(parts, Body::empty()), None);
        }
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let entry = CacheEntry::new(
        bytes.to_vec(),
        content_type,
        parts.status.as_u16(),
        pipeline.cache().now_millis(),
        ttl_secs,
    );
    (Response::from_parts(parts, Body::from(bytes)), Some(entry))
}

/// 响应可缓存时返回实际 TTL
fn cacheable_ttl(
    response: &Response,
    policy: &CachePolicy,
    max_body_bytes: usize,
) -> Option<u64> {
    if !response.status().is_success() || response.headers().contains_key(SET_COOKIE) {
        return None;
    }

    let mut ttl = policy.ttl_secs;
    let directives = response
        .headers()
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase());
    for directive in directives {
        match directive.split_once('=') {
            Some(("max-age", secs)) => {
                ttl = ttl.min(secs.trim().trim_matches('"').parse().ok()?);
            }
            None if matches!(directive.as_str(), "no-store" | "private" | "no-cache") => {
                return None;
            }
            _ => {}
        }
    }

    let size = response.body().size_hint().upper()?;
    if size > max_body_bytes as u64 || ttl == 0 {
        return None;
    }
    Some(ttl)
}

fn replay(entry: CacheEntry) -> Response {
    let status = StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);
    let content_type = HeaderValue::from_str(&entry.content_type).ok();

    let mut response = Response::new(Body::from(entry.payload));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    if let Some(content_type) = content_type.filter(|v| !v.is_empty()) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    response
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = (decision.retry_after_secs.ceil() as u64).max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        error_to_api_response::<()>(
            error_codes::RATE_LIMIT,
            format!("请求过于频繁，请在{}秒后重试", retry_after),
        ),
    )
        .into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    with_rate_headers(response, decision)
}

fn with_rate_headers(mut response: Response, decision: &Decision) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        X_RATELIMIT_LIMIT,
        HeaderValue::from(decision.limit.floor() as u64),
    );
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining_tokens.max(0.0).floor() as u64),
    );
    if decision.degraded {
        headers.insert(X_RATELIMIT_DEGRADED, HeaderValue::from_static("true"));
    }
    response
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;

    fn policy(ttl_secs: u64) -> CachePolicy {
        CachePolicy {
            ttl_secs,
            cacheable: true,
            header_allow_list: Vec::new(),
            vary_on_body: false,
            also_invalidates: Vec::new(),
        }
    }

    fn response(
        status: StatusCode,
        headers: &[(HeaderName, &'static str)],
        body: &'static str,
    ) -> Response {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in headers {
            response
                .headers_mut()
                .append(name.clone(), HeaderValue::from_static(*value));
        }
        response
    }

    #[test]
    fn only_successful_responses_are_cacheable() {
        let ok = response(StatusCode::OK, &[], "ok");
        assert_eq!(cacheable_ttl(&ok, &policy(30), 1024), Some(30));
        let missing = response(StatusCode::NOT_FOUND, &[], "no");
        assert_eq!(cacheable_ttl(&missing, &policy(30), 1024), None);
        let failed = response(StatusCode::INTERNAL_SERVER_ERROR, &[], "err");
        assert_eq!(cacheable_ttl(&failed, &policy(30), 1024), None);
    }

    #[test]
    fn cache_control_directives() {
        for directive in ["no-store", "private", "No-Cache", "public, no-store"] {
            let r = response(StatusCode::OK, &[(CACHE_CONTROL, directive)], "x");
            assert_eq!(cacheable_ttl(&r, &policy(30), 1024), None, "{directive}");
        }

        let r = response(StatusCode::OK, &[(CACHE_CONTROL, "public, max-age=10")], "x");
        assert_eq!(cacheable_ttl(&r, &policy(30), 1024), Some(10));
        let r = response(StatusCode::OK, &[(CACHE_CONTROL, "max-age=600")], "x");
        assert_eq!(cacheable_ttl(&r, &policy(30), 1024), Some(30));
        let r = response(StatusCode::OK, &[(CACHE_CONTROL, "max-age=0")], "x");
        assert_eq!(cacheable_ttl(&r, &policy(30), 1024), None);
    }

    #[test]
    fn set_cookie_and_oversized_bodies_are_not_cached() {
        let r = response(StatusCode::OK, &[(SET_COOKIE, "sid=1")], "x");
        assert_eq!(cacheable_ttl(&r, &policy(30), 1024), None);

        let r = response(StatusCode::OK, &[], "0123456789");
        assert_eq!(cacheable_ttl(&r, &policy(30), 9), None);
        assert_eq!(cacheable_ttl(&r, &policy(30), 10), Some(30));
    }

    #[test]
    fn rejection_carries_retry_after_and_rate_headers() {
        let response = too_many_requests(&Decision {
            allowed: false,
            retry_after_secs: 0.2,
            remaining_tokens: 0.8,
            limit: 10.0,
            degraded: false,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "10");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert!(!response.headers().contains_key(X_RATELIMIT_DEGRADED));
    }

    #[test]
    fn replay_restores_status_and_content_type() {
        let entry = CacheEntry::new(b"{}".to_vec(), "application/json", 203, 0, 30);
        let response = replay(entry);
        assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[X_CACHE], "HIT");
    }

    #[test]
    fn stages_only_move_forward() {
        assert!(Stage::Received < Stage::RateChecked);
        assert!(Stage::CacheChecked < Stage::Handling);
        assert!(Stage::Responding < Stage::Done);
    }
}
