use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Account;
use crate::schema::accounts;
use shared::outbox::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account))
        .route("/accounts/topup", post(top_up))
        .route("/accounts/:user_id", get(get_balance))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<Json<Account>, ApiError> {
    let mut conn = state.pool.get().await.map_err(storage_error)?;

    let account = Account {
        user_id: request.user_id,
        balance: BigDecimal::zero(),
    };
    let inserted = diesel::insert_into(accounts::table)
        .values(&account)
        .on_conflict_do_nothing()
        .execute(&mut conn)
        .await
        .map_err(storage_error)?;

    if inserted == 0 {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("account {} already exists", request.user_id),
            }),
        ));
    }

    tracing::info!(user_id = %request.user_id, "account created");
    Ok(Json(account))
}

pub async fn top_up(
    State(state): State<AppState>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let mut conn = state.pool.get().await.map_err(storage_error)?;

    let updated = diesel::update(accounts::table.find(request.user_id))
        .set(accounts::balance.eq(accounts::balance + request.amount))
        .execute(&mut conn)
        .await
        .map_err(storage_error)?;

    if updated == 0 {
        return Err(account_not_found(request.user_id));
    }

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Account>, ApiError> {
    let mut conn = state.pool.get().await.map_err(storage_error)?;

    let account = accounts::table
        .find(user_id)
        .first::<Account>(&mut conn)
        .await
        .optional()
        .map_err(storage_error)?;

    // A missing account is distinct from a zero balance.
    account.map(Json).ok_or_else(|| account_not_found(user_id))
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn account_not_found(user_id: Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("account {} not found", user_id),
        }),
    )
}

fn storage_error<E: std::fmt::Display>(e: E) -> ApiError {
    tracing::error!("storage error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}
