use axum::{
    body::{Body, HttpBody, to_bytes},
    http::{Request, header::CONTENT_LENGTH},
    middleware::Next,
    response::Response,
};
use tracing::error;

/// 记录到日志的错误响应体上限
const LOGGED_BODY_LIMIT: usize = 1024;

/// 处理器返回 5xx 时记录请求与响应体，响应本身原样返回
pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if !response.status().is_server_error() {
        return response;
    }

    // 大小未知或超出上限的响应体不读取，只记录长度
    let size = response.body().size_hint().upper();
    if size.is_none_or(|size| size > LOGGED_BODY_LIMIT as u64) {
        error!(
            %method,
            %path,
            status = %response.status(),
            body_len = ?size,
            "Handler returned server error"
        );
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, LOGGED_BODY_LIMIT).await {
        Ok(b) => b,
        Err(e) => {
            error!(
                %method,
                %path,
                status = %parts.status,
                "Failed to read error response body: {}",
                e
            );
            parts.headers.remove(CONTENT_LENGTH);
            return Response::from_parts(parts, Body::empty());
        }
    };

    error!(
        %method,
        %path,
        status = %parts.status,
        body = %String::from_utf8_lossy(&bytes),
        "Handler returned server error"
    );

    Response::from_parts(parts, Body::from(bytes))
}
