use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::AppState;
use crate::error::AppError;
use crate::routes::Pagination;
use crate::utils::success_to_api_response;

use super::model::{CreateOrderRequest, OrderFilter, OrderStatus, UpdateOrderRequest};

pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let now = Utc::now();
    let order = state.orders.insert(|id| req.into_order(id, now)).await;
    tracing::info!(id = order.id, customer_id = %order.customer_id, "Order created");
    Ok((StatusCode::CREATED, success_to_api_response(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .orders
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("订单 {id} ")))?;
    Ok(success_to_api_response(order))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
    Query(filter): Query<OrderFilter>,
) -> Result<impl IntoResponse, AppError> {
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<OrderStatus>)
        .transpose()?;
    let orders = state
        .orders
        .list(page.skip(), page.limit(), |order| {
            status.is_none_or(|s| order.status == s)
        })
        .await;
    Ok(success_to_api_response(orders))
}

pub async fn update_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let order = state
        .orders
        .update(id, |order| {
            order.status = req.status;
            order.updated_at = now;
        })
        .await
        .ok_or_else(|| AppError::NotFound(format!("订单 {id} ")))?;
    tracing::info!(id, status = %order.status, "Order status updated");
    Ok(success_to_api_response(order))
}

pub async fn delete_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !state.orders.remove(id).await {
        return Err(AppError::NotFound(format!("订单 {id} ")));
    }
    tracing::info!(id, "Order deleted");
    Ok(StatusCode::NO_CONTENT)
}
