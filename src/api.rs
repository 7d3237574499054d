// HTTP control surface over the task store and the session cache.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::models::{
    Account, AccountId, LogLevel, NewAccount, NewTask, ProviderKind, Route, Task, TaskId, TaskLog,
    TaskStatus, TrainCandidate, TrainSelection,
};
use crate::provider::{ProviderError, SearchQuery};
use crate::session::SessionCache;
use crate::store::{CancelOutcome, TaskStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub sessions: Arc<SessionCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/search", post(search_trains))
        .route("/reserve", post(create_reservation_task))
        .route("/tasks/{id}", get(get_task_status))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---- errors ----

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { entity, .. } => ApiError::not_found(format!("{entity} not found.")),
            Error::Validation(msg) => ApiError::bad_request(msg),
            Error::Authentication(msg) => ApiError::unauthorized(msg),
            Error::InvalidTransition { from, to } => {
                ApiError::conflict(format!("Cannot transition from {from} to {to}"))
            }
            other => {
                error!(error = %other, "Request failed");
                ApiError::internal()
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ---- accounts ----

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: AccountId,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub username: String,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            kind: account.kind,
            username: account.username,
        }
    }
}

async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<AccountView>)> {
    let required = |value: Option<String>, field: &str| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("Missing field '{field}'")))
    };
    let kind: ProviderKind = required(request.kind, "type")?.parse()?;
    let username = required(request.username, "username")?;
    let secret = required(request.password, "password")?;

    let account = state
        .store
        .create_account(NewAccount {
            kind,
            username,
            secret,
        })
        .await?;
    info!(account_id = account.id, provider = %account.kind, "Account registered");
    Ok((StatusCode::CREATED, Json(account.into())))
}

async fn list_accounts(State(state): State<AppState>) -> ApiResult<Json<Vec<AccountView>>> {
    let accounts = state.store.list_accounts().await?;
    Ok(Json(accounts.into_iter().map(AccountView::from).collect()))
}

// ---- search ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub account_id: AccountId,
    pub train_mode: String,
    pub dep_station_name: String,
    pub arr_station_name: String,
    pub date: String,
    pub time_from: String,
}

async fn load_account(store: &dyn TaskStore, id: AccountId, train_mode: &str) -> ApiResult<Account> {
    let account = store
        .get_account(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Account not found."))?;

    let kind: ProviderKind = train_mode.parse()?;
    if kind != account.kind {
        return Err(ApiError::bad_request(format!(
            "Account {} is registered for {}, not {}",
            account.id, account.kind, kind
        )));
    }
    Ok(account)
}

async fn search_trains(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<Vec<TrainCandidate>>> {
    let account = load_account(&*state.store, request.account_id, &request.train_mode).await?;
    info!(
        account_id = account.id,
        provider = %account.kind,
        dep = %request.dep_station_name,
        arr = %request.arr_station_name,
        date = %request.date,
        "Searching trains"
    );

    let session = state.sessions.acquire(&account).await?;
    let query = SearchQuery::from(&Route {
        dep_station: request.dep_station_name,
        arr_station: request.arr_station_name,
        date: request.date,
        time_from: request.time_from,
    });

    match session.search(&query).await {
        Ok(trains) => {
            info!(count = trains.len(), "Search finished");
            Ok(Json(trains))
        }
        Err(ProviderError::Authentication(msg)) => {
            state.sessions.invalidate(&session).await;
            Err(ApiError::unauthorized(msg))
        }
        Err(e) => {
            warn!(error = %e, "Search failed");
            Err(ApiError::internal())
        }
    }
}

// ---- tasks ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub account_id: AccountId,
    pub train_mode: String,
    pub dep_station: String,
    pub arr_station: String,
    pub date: String,
    pub time_from: String,
    pub selected_train_no: String,
    pub selected_train_type: String,
    pub selected_dep_time: String,
    pub selected_arr_time: String,
    #[serde(default)]
    pub selected_train_class: Option<String>,
    pub selected_train_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub message: String,
    pub task_id: TaskId,
}

async fn create_reservation_task(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> ApiResult<Json<ReserveResponse>> {
    let account = load_account(&*state.store, request.account_id, &request.train_mode).await?;

    let route = Route {
        dep_station: request.dep_station,
        arr_station: request.arr_station,
        date: request.date,
        time_from: request.time_from,
    };
    let selection = TrainSelection {
        train_no: request.selected_train_no,
        train_type: request.selected_train_type,
        dep_time: request.selected_dep_time,
        arr_time: request.selected_arr_time,
        train_class: request.selected_train_class,
        train_id: request.selected_train_id,
    };

    let task = state
        .store
        .create_task(NewTask::new(account.id, route, Some(selection)))
        .await?;
    info!(task_id = task.id, account_id = account.id, "Reservation task created");

    Ok(Json(ReserveResponse {
        message: "Reservation task created successfully".to_string(),
        task_id: task.id,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogView {
    pub level: LogLevel,
    pub message: String,
    pub created_at: String,
}

impl From<TaskLog> for LogView {
    fn from(log: TaskLog) -> Self {
        Self {
            level: log.level,
            message: log.message,
            created_at: log.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub is_active: bool,
    pub dep_station: String,
    pub arr_station: String,
    pub date: String,
    pub selected_train_no: String,
    pub selected_train_type: String,
    pub selected_dep_time: String,
    pub booked_detail: Option<String>,
    pub logs: Vec<LogView>,
}

impl TaskStatusView {
    fn new(task: Task, logs: Vec<TaskLog>) -> Self {
        let selection = task.selection.unwrap_or_else(|| TrainSelection {
            train_no: String::new(),
            train_type: String::new(),
            dep_time: String::new(),
            arr_time: String::new(),
            train_class: None,
            train_id: String::new(),
        });

        Self {
            id: task.id,
            status: task.status,
            is_active: task.active,
            dep_station: task.route.dep_station,
            arr_station: task.route.arr_station,
            date: task.route.date,
            selected_train_no: selection.train_no,
            selected_train_type: selection.train_type,
            selected_dep_time: selection.dep_time,
            booked_detail: task.booked_detail,
            logs: logs.into_iter().map(LogView::from).collect(),
        }
    }
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TaskStatusView>> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Task not found"))?;
    let logs = state.store.logs(id).await?;
    Ok(Json(TaskStatusView::new(task, logs)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<MessageResponse>> {
    let message = match state.store.cancel(id).await? {
        CancelOutcome::Stopped => {
            state
                .store
                .append_log(id, LogLevel::Info, "Task cancelled by user.")
                .await?;
            info!(task_id = id, "Task cancelled");
            format!("Task {id} cancelled successfully.")
        }
        CancelOutcome::NotActive => format!("Task {id} is not active and cannot be cancelled."),
    };
    Ok(Json(MessageResponse { message }))
}
