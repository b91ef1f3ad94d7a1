mod client;
mod error_handler;
mod metrics;
mod pipeline;

pub use client::client_identity;
pub use error_handler::log_errors;
pub use metrics::track_requests;
pub use pipeline::{
    Pipeline, Stage, X_CACHE, X_RATELIMIT_DEGRADED, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    pipeline,
};
