use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};

use crate::engine::DecisionEngine;
use crate::middleware::idempotency::idempotent;
use crate::models::RouteDescriptor;

pub mod handlers;

use handlers::DemoState;

/// Build the demo router: a todo list and a money transfer endpoint, each
/// route guarded by the idempotency adapter.
pub fn router(engine: Arc<DecisionEngine>) -> Router {
    router_with_state(engine, Arc::new(DemoState::default()))
}

pub fn router_with_state(engine: Arc<DecisionEngine>, state: Arc<DemoState>) -> Router {
    Router::new()
        .route(
            "/todos",
            idempotent(
                get(handlers::list_todos).post(handlers::create_todo),
                &engine,
                RouteDescriptor::new("create_todo"),
            ),
        )
        .route(
            "/todos/form",
            idempotent(
                post(handlers::create_todo_form),
                &engine,
                RouteDescriptor::new("create_todo_form"),
            ),
        )
        .route(
            "/todos/:id",
            idempotent(
                get(handlers::get_todo).patch(handlers::update_todo),
                &engine,
                RouteDescriptor::new("update_todo"),
            ),
        )
        .route(
            "/transfers",
            idempotent(
                post(handlers::create_transfer),
                &engine,
                RouteDescriptor::new("transfer_money").exclude(["timestamp"]),
            ),
        )
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
