use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use api_gate::{AppState, app, config::Config, store, utils::SystemClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置，配置错误直接终止启动
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        backend = %config.store_backend,
        classes = ?config.route_classes(),
        fail_open = config.fail_open_on_store_error,
        "Configuration loaded"
    );

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 共享存储
    let store = match store::connect(&config) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to set up shared store: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ping().await {
        // 存储暂时不可用时仍然启动，按失败策略降级
        tracing::warn!("Shared store is not reachable at startup: {}", e);
    }

    api_gate::metrics::init_metrics();

    let state = AppState::new(config.clone(), store, Arc::new(SystemClock));
    let router = app(state);

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(tower_http::cors::CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
