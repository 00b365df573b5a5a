use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::hub::NotificationHub;
use crate::models::{NewOrder, Order};
use crate::schema::orders;
use shared::events::{OrderCreated, OrderStatus, ORDER_CREATED};
use shared::outbox::{self, DbPool};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub hub: Arc<NotificationHub>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub description: String,
    pub amount: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub id: Uuid,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/ws/:user_id", get(ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Inserts the order and its `order.created` outbox row in one transaction,
/// then returns NEW immediately; settlement arrives asynchronously.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    if request.amount <= BigDecimal::zero() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: "amount must be positive".to_string(),
            }),
        ));
    }

    let order = NewOrder {
        id: Uuid::new_v4(),
        user_id: request.user_id,
        description: request.description,
        amount: request.amount,
        status: OrderStatus::New.to_string(),
    };
    let event = OrderCreated {
        order_id: order.id,
        user_id: order.user_id,
        amount: order.amount.clone(),
    };
    let order_id = order.id;

    let mut conn = state.pool.get().await.map_err(storage_error)?;
    conn.transaction::<_, anyhow::Error, _>(|conn| {
        async move {
            diesel::insert_into(orders::table)
                .values(&order)
                .execute(conn)
                .await?;
            outbox::stage(conn, ORDER_CREATED, &event).await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await
    .map_err(storage_error)?;

    info!(order_id = %order_id, "order accepted");
    Ok(Json(CreateOrderResponse {
        id: order_id,
        status: OrderStatus::New,
    }))
}

pub async fn list_orders(State(state): State<AppState>) -> Result<Json<Vec<Order>>, ApiError> {
    let mut conn = state.pool.get().await.map_err(storage_error)?;

    let orders = orders::table
        .order(orders::created_at.desc())
        .load::<Order>(&mut conn)
        .await
        .map_err(storage_error)?;

    Ok(Json(orders))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, state.hub))
}

async fn serve_socket(mut socket: WebSocket, user_id: Uuid, hub: Arc<NotificationHub>) {
    let (sender, mut updates) = mpsc::unbounded_channel();
    let connection_id = hub.connect(user_id, sender);
    debug!(user_id = %user_id, "push client connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                // Clients only send keep-alives; anything inbound is ignored.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    hub.disconnect(user_id, connection_id);
    debug!(user_id = %user_id, "push client disconnected");
}

pub async fn health_check() -> &'static str {
    "OK"
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
