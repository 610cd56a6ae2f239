//! HTTP surface.
//!
//! Exposes the two check-in entry points the dashboard calls (the
//! `toggle_client_checkin_status` RPC and the `checkin-checkout` edge
//! function) plus the POS endpoints. Every failure body has the shape
//! `{success: false, error}` so the frontend can show it as a toast.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::auth::{AuthState, Session};
use crate::checkin::{self, ScanAction, ScanRequest, ToggleOutcome};
use crate::clients::{self, NewClient};
use crate::config::CheckinBackend;
use crate::db::DbState;
use crate::error::{DeskError, DeskResult};
use crate::inventory;
use crate::models::LineItemStatus;
use crate::orders;
use crate::payments::{self, PaymentRequest};
use crate::refunds;
use crate::remote::{RpcToggleResponse, SupabaseClient};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub auth: Arc<AuthState>,
    pub remote: Option<Arc<SupabaseClient>>,
    pub backend: CheckinBackend,
}

impl AppState {
    pub fn local(db: Arc<DbState>) -> Self {
        Self {
            db,
            auth: Arc::new(AuthState::new()),
            remote: None,
            backend: CheckinBackend::Local,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// `DeskError` rendered as an HTTP response.
pub struct ApiError(DeskError);

impl From<DeskError> for ApiError {
    fn from(e: DeskError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            DeskError::NotFound(_) => StatusCode::NOT_FOUND,
            DeskError::Validation(_) => StatusCode::BAD_REQUEST,
            DeskError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DeskError::Remote(_) => StatusCode::BAD_GATEWAY,
            DeskError::Storage(_)
            | DeskError::LockPoisoned
            | DeskError::Internal(_)
            | DeskError::Workflow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Message safe to show to the operator. Storage details stay in the log.
fn user_message(err: &DeskError) -> String {
    match err {
        DeskError::Workflow { .. } => "Payment failed. Please try again.".to_string(),
        DeskError::Storage(_) | DeskError::LockPoisoned | DeskError::Internal(_) => {
            "Internal error".to_string()
        }
        other => other.to_string(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            warn!(kind = self.0.kind(), error = %self.0, "request rejected");
        }
        let body = Json(serde_json::json!({
            "success": false,
            "error": user_message(&self.0),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

/// Unwrap a JSON body. Rejections become `Validation` so they get the
/// usual `{success: false, error}` body instead of axum's plain text.
fn json_body<T>(body: JsonBody<T>) -> DeskResult<T> {
    body.map(|Json(value)| value).map_err(|rejection| {
        DeskError::validation(format!("Invalid request body: {}", rejection.body_text()))
    })
}

/// Run a synchronous database operation off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> DeskResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeskError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

fn bearer_session(state: &AppState, headers: &HeaderMap) -> DeskResult<Session> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DeskError::Unauthorized("Missing bearer token".into()))?;
    state.auth.validate(token)
}

// ---------------------------------------------------------------------------
// Check-in
// ---------------------------------------------------------------------------

/// Result body shared by the RPC and the edge function.
#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ToggleOutcome> for ScanResponse {
    fn from(outcome: ToggleOutcome) -> Self {
        Self {
            success: true,
            action: Some(outcome.action.as_str().to_string()),
            client: serde_json::to_value(&outcome.client).ok(),
            cancelled_items: Some(outcome.cancelled_items),
            error: None,
        }
    }
}

impl From<RpcToggleResponse> for ScanResponse {
    fn from(r: RpcToggleResponse) -> Self {
        Self {
            success: r.success,
            action: r.action,
            client: r.client,
            cancelled_items: None,
            error: r.error,
        }
    }
}

async fn run_scan(state: &AppState, request: ScanRequest) -> DeskResult<ScanResponse> {
    match (state.backend, &state.remote) {
        (CheckinBackend::Supabase, Some(remote)) => {
            if request.action != ScanAction::Toggle || request.client_id.is_some() {
                return Err(DeskError::validation(
                    "Only barcode toggles are supported by the Supabase backend",
                ));
            }
            let barcode = request.barcode.as_deref().unwrap_or_default();
            if barcode.trim().is_empty() {
                return Err(DeskError::validation("Barcode is required"));
            }
            let result = remote
                .toggle_checkin(barcode, request.scanned_by.as_deref())
                .await?;
            Ok(result.into())
        }
        (CheckinBackend::Supabase, None) => {
            Err(DeskError::Internal("Supabase backend is not configured".into()))
        }
        (CheckinBackend::Local, _) => {
            let db = state.db.clone();
            let outcome = tokio::task::spawn_blocking(move || checkin::process_scan(&db, &request))
                .await
                .map_err(|e| DeskError::Internal(format!("worker task failed: {e}")))??;
            Ok(outcome.into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToggleRpcArgs {
    p_barcode: String,
    #[serde(default)]
    p_scanned_by_user_id: Option<String>,
}

/// `POST /rest/v1/rpc/toggle_client_checkin_status`. Like the Postgres
/// function it stands in for, it always answers 200 and reports failure in
/// the body.
async fn toggle_rpc(State(state): State<AppState>, body: JsonBody<ToggleRpcArgs>) -> Json<ScanResponse> {
    let result = match json_body(body) {
        Ok(args) => {
            let request = ScanRequest {
                barcode: Some(args.p_barcode),
                scanned_by: args.p_scanned_by_user_id,
                ..Default::default()
            };
            run_scan(&state, request).await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(resp) => Json(resp),
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "toggle rpc failed");
            Json(ScanResponse {
                success: false,
                action: None,
                client: None,
                cancelled_items: None,
                error: Some(user_message(&e)),
            })
        }
    }
}

/// `POST /functions/v1/checkin-checkout`.
async fn checkin_checkout(
    State(state): State<AppState>,
    body: JsonBody<ScanRequest>,
) -> ApiResult<Json<ScanResponse>> {
    let request = json_body(body)?;
    Ok(Json(run_scan(&state, request).await?))
}

// ---------------------------------------------------------------------------
// Clients / line items
// ---------------------------------------------------------------------------

async fn create_client(
    State(state): State<AppState>,
    body: JsonBody<NewClient>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let new = json_body(body)?;
    let db = state.db.clone();
    let client = blocking(move || clients::register_client(&db, &new)).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "client": client })),
    ))
}

async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let db = state.db.clone();
    let client = blocking(move || clients::get_client(&db, &id)).await?;
    Ok(Json(serde_json::json!({ "success": true, "client": client })))
}

#[derive(Debug, Deserialize)]
struct LineItemQuery {
    #[serde(default)]
    status: Option<String>,
}

async fn list_line_items(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(query): Query<LineItemQuery>,
) -> ApiResult<Json<Value>> {
    let status = query
        .status
        .as_deref()
        .map(LineItemStatus::parse)
        .transpose()?;
    let db = state.db.clone();
    let items = blocking(move || orders::list_line_items(&db, &client_id, status)).await?;
    Ok(Json(serde_json::json!({ "success": true, "items": items })))
}

#[derive(Debug, Deserialize)]
struct NewLineItem {
    #[serde(alias = "user_id")]
    client_id: String,
    item_name: String,
    #[serde(default = "one")]
    quantity: i64,
    price: f64,
}

fn one() -> i64 {
    1
}

async fn add_line_item(
    State(state): State<AppState>,
    body: JsonBody<NewLineItem>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body = json_body(body)?;
    let db = state.db.clone();
    let item = blocking(move || {
        orders::add_line_item(&db, &body.client_id, &body.item_name, body.quantity, body.price)
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "item": item })),
    ))
}

// ---------------------------------------------------------------------------
// Payments / receipts
// ---------------------------------------------------------------------------

async fn create_payment(
    State(state): State<AppState>,
    body: JsonBody<PaymentRequest>,
) -> ApiResult<Json<Value>> {
    let request = json_body(body)?;
    let db = state.db.clone();
    let outcome = blocking(move || payments::process_payment(&db, &request)).await?;
    Ok(Json(serde_json::json!({ "success": true, "payment": outcome })))
}

async fn get_receipt(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let db = state.db.clone();
    let receipt = blocking(move || payments::get_receipt(&db, &id)).await?;
    Ok(Json(serde_json::json!({ "success": true, "receipt": receipt })))
}

#[derive(Debug, Deserialize)]
struct CancelReceiptBody {
    reason: String,
}

async fn cancel_receipt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: JsonBody<CancelReceiptBody>,
) -> ApiResult<Json<Value>> {
    let session = bearer_session(&state, &headers)?;
    let body = json_body(body)?;
    let db = state.db.clone();
    let outcome = blocking(move || refunds::cancel_receipt(&db, &id, &session, &body.reason)).await?;
    Ok(Json(serde_json::json!({ "success": true, "refund": outcome })))
}

async fn low_stock(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let db = state.db.clone();
    let items = blocking(move || inventory::low_stock_items(&db)).await?;
    Ok(Json(serde_json::json!({ "success": true, "items": items })))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SignInBody {
    pin: String,
}

async fn sign_in(State(state): State<AppState>, body: JsonBody<SignInBody>) -> ApiResult<Json<Value>> {
    let body = json_body(body)?;
    let db = state.db.clone();
    let auth = state.auth.clone();
    let session = blocking(move || auth.sign_in(&db, &body.pin)).await?;
    Ok(Json(serde_json::json!({ "success": true, "session": session })))
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let session = bearer_session(&state, &headers)?;
    state.auth.sign_out(&session.token)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let backend = match state.backend {
        CheckinBackend::Local => "local",
        CheckinBackend::Supabase => "supabase",
    };
    let remote = match &state.remote {
        Some(client) => serde_json::to_value(client.test_connectivity().await).ok(),
        None => None,
    };
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "checkinBackend": backend,
        "supabase": remote,
    }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// CORS for browser calls. An empty origin list allows any origin, as the
/// hosted edge function does.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("apikey"),
            HeaderName::from_static("x-client-info"),
        ])
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rest/v1/rpc/toggle_client_checkin_status", post(toggle_rpc))
        .route("/functions/v1/checkin-checkout", post(checkin_checkout))
        .route("/api/auth/sign-in", post(sign_in))
        .route("/api/auth/sign-out", post(sign_out))
        .route("/api/clients", post(create_client))
        .route("/api/clients/:id", get(get_client))
        .route("/api/clients/:id/line-items", get(list_line_items))
        .route("/api/line-items", post(add_line_item))
        .route("/api/payments", post(create_payment))
        .route("/api/receipts/:id", get(get_receipt))
        .route("/api/receipts/:id/cancel", post(cancel_receipt))
        .route("/api/stock/low", get(low_stock))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===========================================================================
// Tests
// ===========================================================================
