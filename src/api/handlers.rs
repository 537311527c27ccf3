use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Form, Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory data behind the demo routes.
pub struct DemoState {
    pub todos: RwLock<Vec<Todo>>,
    pub transfers: RwLock<Vec<TransferReceipt>>,
}

impl Default for DemoState {
    fn default() -> Self {
        let today = Utc::now().date_naive();
        Self {
            todos: RwLock::new(vec![
                Todo::new(1, "Walk the dog", None),
                Todo::new(2, "Do the dishes", Some(today)),
                Todo::new(3, "Do the laundry", today.succ_opt()),
                Todo::new(4, "Clean the bathroom", None),
                Todo::new(5, "Clean the car", today.succ_opt().and_then(|d| d.succ_opt())),
            ]),
            transfers: RwLock::new(Vec::new()),
        }
    }
}

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Todo {
    pub id: i64,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_by: Option<NaiveDate>,
    #[serde(default)]
    pub is_complete: bool,
}

impl Todo {
    fn new(id: i64, title: &str, due_by: Option<NaiveDate>) -> Self {
        Self {
            id,
            title: Some(title.to_string()),
            due_by,
            is_complete: false,
        }
    }
}

#[derive(Deserialize)]
pub struct TodoForm {
    pub id: i64,
    pub title: String,
    pub due_by: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub due_by: Option<NaiveDate>,
    pub is_complete: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transfer {
    pub issuer_name: Option<String>,
    pub acquirer_name: Option<String>,
    pub money: f64,
    /// Client-side send time; left out of the fingerprint.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub id: Uuid,
    pub issuer_name: Option<String>,
    pub acquirer_name: Option<String>,
    pub money: f64,
    pub created_at: DateTime<Utc>,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /todos
pub async fn list_todos(State(state): State<Arc<DemoState>>) -> Json<Vec<Todo>> {
    Json(state.todos.read().await.clone())
}

/// GET /todos/:id
pub async fn get_todo(
    State(state): State<Arc<DemoState>>,
    Path(id): Path<i64>,
) -> Result<Json<Todo>, StatusCode> {
    state
        .todos
        .read()
        .await
        .iter()
        .find(|t| t.id == id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /todos
pub async fn create_todo(
    State(state): State<Arc<DemoState>>,
    Json(todo): Json<Todo>,
) -> Result<impl IntoResponse, StatusCode> {
    insert_todo(&state, todo).await
}

/// POST /todos/form
pub async fn create_todo_form(
    State(state): State<Arc<DemoState>>,
    Form(form): Form<TodoForm>,
) -> Result<impl IntoResponse, StatusCode> {
    let todo = Todo {
        id: form.id,
        title: Some(form.title),
        due_by: form.due_by,
        is_complete: false,
    };
    insert_todo(&state, todo).await
}

async fn insert_todo(
    state: &DemoState,
    todo: Todo,
) -> Result<(StatusCode, [(header::HeaderName, String); 1], Json<Todo>), StatusCode> {
    let mut todos = state.todos.write().await;
    if todos.iter().any(|t| t.id == todo.id) {
        tracing::info!(id = todo.id, "todo already exists");
        return Err(StatusCode::CONFLICT);
    }
    todos.push(todo.clone());
    tracing::info!(id = todo.id, "todo created");

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/todos/{}", todo.id))],
        Json(todo),
    ))
}

/// PATCH /todos/:id
pub async fn update_todo(
    State(state): State<Arc<DemoState>>,
    Path(id): Path<i64>,
    Json(patch): Json<TodoPatch>,
) -> Result<Json<Todo>, StatusCode> {
    let mut todos = state.todos.write().await;
    let todo = todos.iter_mut().find(|t| t.id == id).ok_or(StatusCode::NOT_FOUND)?;

    if let Some(title) = patch.title {
        todo.title = Some(title);
    }
    if patch.due_by.is_some() {
        todo.due_by = patch.due_by;
    }
    if let Some(done) = patch.is_complete {
        todo.is_complete = done;
    }
    Ok(Json(todo.clone()))
}

/// POST /transfers
pub async fn create_transfer(
    State(state): State<Arc<DemoState>>,
    Json(transfer): Json<Transfer>,
) -> Result<(StatusCode, Json<TransferReceipt>), StatusCode> {
    if !transfer.money.is_finite() || transfer.money <= 0.0 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let receipt = TransferReceipt {
        id: Uuid::new_v4(),
        issuer_name: transfer.issuer_name,
        acquirer_name: transfer.acquirer_name,
        money: transfer.money,
        created_at: Utc::now(),
    };
    state.transfers.write().await.push(receipt.clone());
    tracing::info!(id = %receipt.id, money = receipt.money, "transfer accepted");

    Ok((StatusCode::CREATED, Json(receipt)))
}
