use axum::http::{HeaderMap, Method};

use crate::config::ROOT_CLASS;
use crate::utils::sha256_hex;

/// 响应缓存键前缀
const CACHE_PREFIX: &str = "cache:";

/// 防击穿锁键前缀，刻意放在失效模式 `cache:{class}:*` 之外
const LOCK_PREFIX: &str = "lock:";

/// 命中统计键前缀
const STATS_PREFIX: &str = "stats:cache:";

/// 参与缓存键计算的请求要素
#[derive(Debug, Clone, Copy)]
pub struct RequestFingerprint<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub header_allow_list: &'a [String],
    pub body: Option<&'a [u8]>,
}

/// 由请求派生的确定性缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    class: String,
    digest: String,
}

impl CacheKey {
    pub fn derive(class: &str, request: &RequestFingerprint<'_>) -> Self {
        Self {
            class: class.to_string(),
            digest: sha256_hex(canonical_request(request)),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn store_key(&self) -> String {
        format!("{}{}:{}", CACHE_PREFIX, self.class, self.digest)
    }

    pub fn lock_key(&self) -> String {
        format!("{}{}", LOCK_PREFIX, self.store_key())
    }
}

/// 匹配某个资源类别下全部缓存条目的模式
pub fn class_pattern(class: &str) -> String {
    format!("{}{}:*", CACHE_PREFIX, class)
}

pub fn stats_key(class: &str, outcome: &str) -> String {
    format!("{}{}:{}", STATS_PREFIX, class, outcome)
}

/// 合并重复的 `/` 并去掉末尾的 `/`（根路径除外）
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// 资源类别：去掉 API 前缀后的第一个路径段
pub fn resource_class(path: &str, base_uri: &str) -> String {
    let path = normalize_path(path);
    let base = normalize_path(base_uri);
    let rest = if base == "/" {
        path.as_str()
    } else {
        match path.strip_prefix(&base) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path.as_str(),
        }
    };

    rest.split('/')
        .find(|s| !s.is_empty())
        .unwrap_or(ROOT_CLASS)
        .to_string()
}

fn canonical_query(query: Option<&str>) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_headers(headers: &HeaderMap, allow_list: &[String]) -> String {
    let mut names: Vec<String> = allow_list.iter().map(|h| h.to_ascii_lowercase()).collect();
    names.sort_unstable();
    names.dedup();

    names
        .iter()
        .map(|name| {
            let values: Vec<&str> = headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::trim)
                .collect();
            // 缺失的请求头与空值区分开
            if values.is_empty() {
                name.clone()
            } else {
                format!("{}={}", name, values.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_request(request: &RequestFingerprint<'_>) -> String {
    let body = request.body.map(sha256_hex).unwrap_or_else(|| "-".to_string());
    format!(
        "{}\n{}\n{}\n{}\n{}",
        request.method,
        normalize_path(request.path),
        canonical_query(request.query),
        canonical_headers(request.headers, request.header_allow_list),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn key(path: &str, query: Option<&str>, headers: &HeaderMap) -> CacheKey {
        let allow = vec!["X-Tenant-Id".to_string(), "accept-language".to_string()];
        CacheKey::derive(
            "products",
            &RequestFingerprint {
                method: &Method::GET,
                path,
                query,
                headers,
                header_allow_list: &allow,
                body: None,
            },
        )
    }

    #[test]
    fn query_order_does_not_matter() {
        let headers = HeaderMap::new();
        assert_eq!(
            key("/api/products", Some("limit=10&skip=0"), &headers),
            key("/api/products", Some("skip=0&limit=10"), &headers)
        );
        assert_ne!(
            key("/api/products", Some("skip=0"), &headers),
            key("/api/products", Some("skip=10"), &headers)
        );
    }

    #[test]
    fn path_is_normalized() {
        let headers = HeaderMap::new();
        assert_eq!(
            key("/api//products/", None, &headers),
            key("/api/products", None, &headers)
        );
    }

    #[test]
    fn allow_listed_headers_split_keys() {
        let mut tenant_a = HeaderMap::new();
        tenant_a.insert("x-tenant-id", HeaderValue::from_static("a"));
        let mut tenant_b = HeaderMap::new();
        tenant_b.insert("x-tenant-id", HeaderValue::from_static("b"));
        let none = HeaderMap::new();

        let a = key("/api/products", None, &tenant_a);
        assert_ne!(a, key("/api/products", None, &tenant_b));
        assert_ne!(a, key("/api/products", None, &none));

        // 白名单之外的请求头不影响键
        let mut noisy = tenant_a.clone();
        noisy.insert("user-agent", HeaderValue::from_static("curl"));
        assert_eq!(a, key("/api/products", None, &noisy));
    }

    #[test]
    fn method_and_body_are_part_of_the_key() {
        let headers = HeaderMap::new();
        let base = RequestFingerprint {
            method: &Method::GET,
            path: "/api/search",
            query: None,
            headers: &headers,
            header_allow_list: &[],
            body: Some(b"{\"q\":1}"),
        };
        let other_body = RequestFingerprint {
            body: Some(b"{\"q\":2}"),
            ..base
        };
        let head = RequestFingerprint {
            method: &Method::HEAD,
            ..base
        };
        let a = CacheKey::derive("search", &base);
        assert_ne!(a, CacheKey::derive("search", &other_body));
        assert_ne!(a, CacheKey::derive("search", &head));
    }

    #[test]
    fn store_lock_and_pattern_keys() {
        let key = key("/api/products", None, &HeaderMap::new());
        assert!(key.store_key().starts_with("cache:products:"));
        assert!(key.lock_key().starts_with("lock:cache:products:"));
        assert_eq!(class_pattern("products"), "cache:products:*");
        assert_eq!(stats_key("products", "hits"), "stats:cache:products:hits");
    }

    #[test]
    fn resource_class_strips_base_uri() {
        assert_eq!(resource_class("/api/products/12", "/api"), "products");
        assert_eq!(resource_class("/api/orders", "/api/"), "orders");
        assert_eq!(resource_class("/api", "/api"), ROOT_CLASS);
        assert_eq!(resource_class("/health", "/api"), "health");
        assert_eq!(resource_class("/apix/things", "/api"), "apix");
        assert_eq!(resource_class("/products", "/"), "products");
    }
}
