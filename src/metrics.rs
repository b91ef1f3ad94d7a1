//! Prometheus 指标：请求计数与耗时、错误、限流拒绝、缓存命中

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const API_ERRORS_TOTAL: &str = "api_errors_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
}

/// 安装全局 Prometheus 记录器，重复调用返回 `false`
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle was already set");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Prometheus 文本格式；未初始化时为 `None`
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let endpoint = endpoint_label(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.clone(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.clone()
    )
    .record(duration.as_secs_f64());

    if (500..600).contains(&status) {
        counter!(
            names::API_ERRORS_TOTAL,
            "endpoint" => endpoint,
            "error_type" => "server_error"
        )
        .increment(1);
    }
}

pub fn record_rate_limit_rejection(class: &str, degraded: bool) {
    counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "class" => class.to_string(),
        "degraded" => degraded.to_string()
    )
    .increment(1);
}

pub fn record_cache_lookup(class: &str, hit: bool) {
    let name = if hit {
        names::CACHE_HITS_TOTAL
    } else {
        names::CACHE_MISSES_TOTAL
    };
    counter!(name, "class" => class.to_string()).increment(1);
}

/// 数字路径段替换为 `{id}`，控制标签基数
fn endpoint_label(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_become_placeholders() {
        assert_eq!(endpoint_label("/api/products/42"), "/api/products/{id}");
        assert_eq!(endpoint_label("/api/orders"), "/api/orders");
        assert_eq!(endpoint_label("/"), "/");
        assert_eq!(endpoint_label("/api/v2/items"), "/api/v2/items");
    }
}
