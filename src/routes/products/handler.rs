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

use super::model::ProductRequest;

pub async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<ProductRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let now = Utc::now();
    let product = state.products.insert(|id| req.into_product(id, now)).await;
    tracing::info!(id = product.id, "Product created");
    Ok((StatusCode::CREATED, success_to_api_response(product)))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let product = state
        .products
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("商品 {id} ")))?;
    Ok(success_to_api_response(product))
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    let products = state
        .products
        .list(page.skip(), page.limit(), |_| true)
        .await;
    success_to_api_response(products)
}

pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ProductRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let now = Utc::now();
    let product = state
        .products
        .update(id, |product| req.apply_to(product, now))
        .await
        .ok_or_else(|| AppError::NotFound(format!("商品 {id} ")))?;
    Ok(success_to_api_response(product))
}

pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !state.products.remove(id).await {
        return Err(AppError::NotFound(format!("商品 {id} ")));
    }
    tracing::info!(id, "Product deleted");
    Ok(StatusCode::NO_CONTENT)
}
