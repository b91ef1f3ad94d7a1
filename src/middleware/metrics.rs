use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};

use crate::metrics::record_http_request;

/// 记录每个请求的方法、路径、状态码和耗时
pub async fn track_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;
    record_http_request(&method, &path, response.status().as_u16(), started.elapsed());
    response
}
