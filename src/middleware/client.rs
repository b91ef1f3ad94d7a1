use std::net::SocketAddr;

use axum::{body::Body, extract::ConnectInfo, http::Request};

use crate::utils::sha256_hex;

/// API 密钥摘要保留的十六进制位数
const API_KEY_DIGEST_LEN: usize = 16;

/// 限流使用的调用方身份
///
/// 优先使用 `x-api-key`（只保存摘要），否则按 `x-real-ip`、`x-forwarded-for`
/// 第一个非空地址、连接地址的顺序取 IP。
pub fn client_identity(req: &Request<Body>) -> String {
    if let Some(api_key) = header_str(req, "x-api-key").filter(|k| !k.is_empty()) {
        let digest = sha256_hex(api_key);
        return format!("key:{}", &digest[..API_KEY_DIGEST_LEN]);
    }

    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    let ip = header_str(req, "x-real-ip")
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            header_str(req, "x-forwarded-for")
                .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        })
        .or(remote_ip.as_deref())
        .unwrap_or("unknown");

    format!("ip:{}", ip)
}

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
}
