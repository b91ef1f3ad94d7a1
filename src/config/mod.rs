use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::http::Method;
use serde::Deserialize;

use crate::error::ConfigError;

/// API 前缀之后没有路径段的请求归入该类别
pub const ROOT_CLASS: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::invalid(
                "STORE_BACKEND",
                format!("unknown backend `{other}`"),
            )),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => f.write_str("redis"),
            StoreBackend::Memory => f.write_str("memory"),
        }
    }
}

/// 空闲 TTL 上限（30 天）
pub const MAX_IDLE_TTL_SECS: u64 = 30 * 24 * 3600;

/// 令牌桶参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RatePolicy {
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
    /// 空闲多久后桶从存储中过期；缺省为从空桶补满时间的 4 倍（至少 60 秒）
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

impl RatePolicy {
    pub fn idle_ttl(&self) -> Duration {
        match self.idle_ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let refill_from_empty = self.capacity / self.refill_rate_per_sec;
                let secs = (refill_from_empty * 4.0).clamp(60.0, MAX_IDLE_TTL_SECS as f64);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(Duration::from_secs(MAX_IDLE_TTL_SECS))
            }
        }
    }
}

/// 响应缓存参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CachePolicy {
    pub ttl_secs: u64,
    #[serde(default = "default_true")]
    pub cacheable: bool,
    /// 参与缓存键计算的请求头（不区分大小写）
    #[serde(default)]
    pub header_allow_list: Vec<String>,
    /// 是否将请求体摘要纳入缓存键
    #[serde(default)]
    pub vary_on_body: bool,
    /// 该类别上的写操作成功后额外失效的类别
    #[serde(default)]
    pub also_invalidates: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// 单个路由类别的限流与缓存策略
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutePolicy {
    pub rate: RatePolicy,
    pub cache: CachePolicy,
}

/// 策略文件中的条目，缺省字段回落到全局默认值
#[derive(Debug, Deserialize)]
struct RoutePolicyOverride {
    rate: Option<RatePolicy>,
    cache: Option<CachePolicy>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: Option<String>,
    pub store_backend: StoreBackend,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub store_timeout_ms: u64,
    pub fail_open_on_store_error: bool,
    pub stampede_lock_ttl_ms: u64,
    pub max_stampede_wait_ms: u64,
    pub stampede_poll_interval_ms: u64,
    pub limiter_max_cas_retries: u32,
    pub cacheable_methods: Vec<Method>,
    pub max_cacheable_body_bytes: usize,
    pub default_policy: RoutePolicy,
    pub routes: HashMap<String, RoutePolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            store_backend: StoreBackend::Redis,
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            api_base_uri: "/api".to_string(),
            store_timeout_ms: 50,
            fail_open_on_store_error: true,
            stampede_lock_ttl_ms: 2_000,
            max_stampede_wait_ms: 1_500,
            stampede_poll_interval_ms: 25,
            limiter_max_cas_retries: 8,
            cacheable_methods: vec![Method::GET, Method::HEAD],
            max_cacheable_body_bytes: 1024 * 1024,
            default_policy: RoutePolicy {
                rate: RatePolicy {
                    capacity: 100.0,
                    refill_rate_per_sec: 10.0,
                    idle_ttl_secs: None,
                },
                cache: CachePolicy {
                    ttl_secs: 300,
                    cacheable: true,
                    header_allow_list: vec!["accept-language".into(), "x-tenant-id".into()],
                    vary_on_body: false,
                    also_invalidates: Vec::new(),
                },
            },
            routes: HashMap::new(),
        }
    }
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        None => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Config::default();
        let store_backend = match var("STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.store_backend,
        };

        let cacheable_methods = match var("CACHEABLE_METHODS") {
            Some(raw) => parse_list(&raw)
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|e| ConfigError::invalid("CACHEABLE_METHODS", e))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.cacheable_methods,
        };

        let mut default_policy = defaults.default_policy;
        default_policy.rate.capacity =
            parse_var("RATE_LIMIT_CAPACITY", default_policy.rate.capacity)?;
        default_policy.rate.refill_rate_per_sec = parse_var(
            "RATE_LIMIT_REFILL_PER_SEC",
            default_policy.rate.refill_rate_per_sec,
        )?;
        default_policy.cache.ttl_secs = parse_var("CACHE_TTL", default_policy.cache.ttl_secs)?;
        default_policy.cache.cacheable = parse_var("CACHE_ENABLED", true)?;
        if let Some(raw) = var("CACHE_HEADER_ALLOW_LIST") {
            default_policy.cache.header_allow_list = parse_list(&raw);
        }

        let routes = match var("ROUTE_POLICY_FILE") {
            Some(path) => load_route_policies(&path, &default_policy)?,
            None => HashMap::new(),
        };

        let config = Config {
            redis_url: var("REDIS_URL"),
            store_backend,
            server_host: var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_var("SERVER_PORT", defaults.server_port)?,
            api_base_uri: var("API_BASE_URI").unwrap_or(defaults.api_base_uri),
            store_timeout_ms: parse_var("STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            fail_open_on_store_error: parse_var(
                "FAIL_OPEN_ON_STORE_ERROR",
                defaults.fail_open_on_store_error,
            )?,
            stampede_lock_ttl_ms: parse_var("STAMPEDE_LOCK_TTL_MS", defaults.stampede_lock_ttl_ms)?,
            max_stampede_wait_ms: parse_var("MAX_STAMPEDE_WAIT_MS", defaults.max_stampede_wait_ms)?,
            stampede_poll_interval_ms: parse_var(
                "STAMPEDE_POLL_INTERVAL_MS",
                defaults.stampede_poll_interval_ms,
            )?,
            limiter_max_cas_retries: parse_var(
                "LIMITER_MAX_CAS_RETRIES",
                defaults.limiter_max_cas_retries,
            )?,
            cacheable_methods,
            max_cacheable_body_bytes: parse_var(
                "MAX_CACHEABLE_BODY_BYTES",
                defaults.max_cacheable_body_bytes,
            )?,
            default_policy,
            routes,
        };

        config.validate()?;
        Ok(config)
    }

    /// 启动前校验，任何未定义的限流/缓存行为都视为致命错误
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_backend == StoreBackend::Redis && self.redis_url.is_none() {
            return Err(ConfigError::Missing { name: "REDIS_URL" });
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("STORE_TIMEOUT_MS", "must be positive"));
        }
        if self.stampede_lock_ttl_ms == 0 {
            return Err(ConfigError::invalid("STAMPEDE_LOCK_TTL_MS", "must be positive"));
        }
        if self.stampede_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "STAMPEDE_POLL_INTERVAL_MS",
                "must be positive",
            ));
        }
        if self.limiter_max_cas_retries == 0 {
            return Err(ConfigError::invalid(
                "LIMITER_MAX_CAS_RETRIES",
                "must be at least 1",
            ));
        }
        if !self.api_base_uri.starts_with('/') {
            return Err(ConfigError::invalid("API_BASE_URI", "must start with `/`"));
        }

        validate_policy("default", &self.default_policy)?;
        for (class, policy) in &self.routes {
            validate_class_name(class)?;
            validate_policy(class, policy)?;
        }
        Ok(())
    }

    pub fn policy_for(&self, class: &str) -> &RoutePolicy {
        self.routes.get(class).unwrap_or(&self.default_policy)
    }

    /// 配置中显式列出的路由类别
    pub fn route_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.routes.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn is_cacheable_method(&self, method: &Method) -> bool {
        self.cacheable_methods.contains(method)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn stampede_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.stampede_lock_ttl_ms)
    }

    pub fn max_stampede_wait(&self) -> Duration {
        Duration::from_millis(self.max_stampede_wait_ms)
    }

    pub fn stampede_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stampede_poll_interval_ms)
    }
}

fn load_route_policies(
    path: &str,
    defaults: &RoutePolicy,
) -> Result<HashMap<String, RoutePolicy>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::PolicyFile {
        path: path.to_string(),
        source,
    })?;
    parse_route_policies(path, &raw, defaults)
}

fn parse_route_policies(
    path: &str,
    raw: &str,
    defaults: &RoutePolicy,
) -> Result<HashMap<String, RoutePolicy>, ConfigError> {
    let overrides: HashMap<String, RoutePolicyOverride> =
        serde_json::from_str(raw).map_err(|source| ConfigError::PolicyParse {
            path: path.to_string(),
            source,
        })?;

    Ok(overrides
        .into_iter()
        .map(|(class, o)| {
            let policy = RoutePolicy {
                rate: o.rate.unwrap_or_else(|| defaults.rate.clone()),
                cache: o.cache.unwrap_or_else(|| defaults.cache.clone()),
            };
            (class, policy)
        })
        .collect())
}

fn validate_class_name(class: &str) -> Result<(), ConfigError> {
    if class.is_empty()
        || class
            .chars()
            .any(|c| c == '*' || c == '?' || c == ':' || c.is_whitespace())
    {
        return Err(ConfigError::invalid(
            format!("route class `{class}`"),
            "must be non-empty without `*`, `?`, `:` or whitespace",
        ));
    }
    Ok(())
}

fn validate_policy(class: &str, policy: &RoutePolicy) -> Result<(), ConfigError> {
    let rate = &policy.rate;
    if !rate.capacity.is_finite() || rate.capacity <= 0.0 {
        return Err(ConfigError::invalid(
            format!("{class}.rate.capacity"),
            "must be a positive number",
        ));
    }
    if !rate.refill_rate_per_sec.is_finite() || rate.refill_rate_per_sec <= 0.0 {
        return Err(ConfigError::invalid(
            format!("{class}.rate.refill_rate_per_sec"),
            "must be a positive number",
        ));
    }
    if rate.capacity / rate.refill_rate_per_sec > MAX_IDLE_TTL_SECS as f64 {
        return Err(ConfigError::invalid(
            format!("{class}.rate"),
            "time to refill an empty bucket exceeds 30 days",
        ));
    }
    // 过期的桶等同于满桶，空闲 TTL 短于补满时间会放过额外请求
    if let Some(idle) = rate.idle_ttl_secs {
        if idle > MAX_IDLE_TTL_SECS {
            return Err(ConfigError::invalid(
                format!("{class}.rate.idle_ttl_secs"),
                "must not exceed 30 days",
            ));
        }
        if (idle as f64) < rate.capacity / rate.refill_rate_per_sec {
            return Err(ConfigError::invalid(
                format!("{class}.rate.idle_ttl_secs"),
                "must be at least the time to refill an empty bucket",
            ));
        }
    }

    let cache = &policy.cache;
    if cache.cacheable && cache.ttl_secs == 0 {
        return Err(ConfigError::invalid(
            format!("{class}.cache.ttl_secs"),
            "cacheable classes need a positive ttl",
        ));
    }
    for other in &cache.also_invalidates {
        validate_class_name(other)?;
    }
    Ok(())
}
