use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::utils::{error_codes, error_to_api_response};

/// 共享存储访问错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// 网络错误、超时或连接不可用
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// 读回的数据形状不符合预期（例如桶状态损坏）
    #[error("store record `{key}` is inconsistent: {reason}")]
    Inconsistent { key: String, reason: String },
}

impl StoreError {
    pub fn inconsistent(key: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Inconsistent {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// 启动阶段的配置错误，出现即终止启动
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {name}")]
    Missing { name: &'static str },
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to read route policy file {path}: {source}")]
    PolicyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse route policy file {path}: {source}")]
    PolicyParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// 路由处理器自身的错误约定，流水线原样透传
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Validation(String),
    InternalServerError,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                error_codes::NOT_FOUND,
                format!("{what}不存在"),
            ),
            AppError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR, reason)
            }
            AppError::Validation(reason) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                error_codes::VALIDATION_ERROR,
                reason,
            ),
            AppError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "内部服务器错误".to_string(),
            ),
        };

        (status, error_to_api_response::<()>(code, msg)).into_response()
    }
}
