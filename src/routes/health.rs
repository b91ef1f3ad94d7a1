use std::collections::BTreeMap;

use axum::{Json, extract::State, response::IntoResponse};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;

use crate::AppState;
use crate::cache::operations::CacheStats;
use crate::utils::success_to_api_response;

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub backend: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthDetail {
    pub status: &'static str,
    pub store: StoreHealth,
    /// 各路由类别的缓存命中统计，读取失败的类别为 `null`
    pub cache: BTreeMap<String, Option<CacheStats>>,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let ping = state.store.ping().await;
    if let Err(e) = &ping {
        tracing::warn!("Store health check failed: {}", e);
    }

    let classes = state.config.route_classes();
    let cache = state.pipeline.cache();
    let stats = join_all(classes.iter().map(|class| cache.stats(class))).await;
    let cache = classes
        .into_iter()
        .zip(stats)
        .map(|(class, stats)| (class, stats.ok()))
        .collect();

    success_to_api_response(HealthDetail {
        status: if ping.is_ok() { "healthy" } else { "degraded" },
        store: StoreHealth {
            backend: state.config.store_backend.to_string(),
            reachable: ping.is_ok(),
            error: ping.err().map(|e| e.to_string()),
        },
        cache,
    })
}
