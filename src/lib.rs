use std::sync::Arc;

use axum::{Router, routing::get};
use tower::ServiceBuilder;

use cache::keys::normalize_path;
use config::Config;
use middleware::{Pipeline, log_errors, track_requests};
use routes::{Repository, orders::Order, products::Product};
use store::DynStore;
use utils::Clock;

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod store;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: DynStore,
    pub pipeline: Arc<Pipeline>,
    pub products: Arc<Repository<Product>>,
    pub orders: Arc<Repository<Order>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: DynStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(config.clone(), store.clone(), clock)),
            config,
            store,
            products: Arc::new(Repository::default()),
            orders: Arc::new(Repository::default()),
        }
    }
}

fn resource_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/products",
            get(routes::products::list_products).post(routes::products::create_product),
        )
        .route(
            "/products/{id}",
            get(routes::products::get_product)
                .put(routes::products::update_product)
                .delete(routes::products::delete_product),
        )
        .route(
            "/orders",
            get(routes::orders::list_orders).post(routes::orders::create_order),
        )
        .route(
            "/orders/{id}",
            get(routes::orders::get_order)
                .put(routes::orders::update_order)
                .delete(routes::orders::delete_order),
        )
}

/// 组装完整路由：资源接口经过流水线，健康检查与指标接口直接处理
pub fn app(state: AppState) -> Router {
    let base = normalize_path(&state.config.api_base_uri);
    let api = if base == "/" {
        resource_routes()
    } else {
        Router::new().nest(&base, resource_routes())
    };

    // 流水线在外，处理器错误日志在其内侧
    let api = api.layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                state.pipeline.clone(),
                middleware::pipeline,
            ))
            .layer(axum::middleware::from_fn(log_errors)),
    );

    // 指标接口本身不计入请求统计
    api.route("/health", get(routes::health::health))
        .route("/health/detailed", get(routes::health::health_detailed))
        .layer(axum::middleware::from_fn(track_requests))
        .route("/metrics", get(routes::metrics::metrics))
        .with_state(state)
}
