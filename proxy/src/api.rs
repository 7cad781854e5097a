//! # REST API
//!
//! Builds the axum router for the proxy. All handlers share [`AppState`]
//! through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                           | Description                          |
//! |--------|--------------------------------|--------------------------------------|
//! | GET    | `/health`                      | Liveness probe                       |
//! | GET    | `/session`                     | Session status (no secrets)          |
//! | POST   | `/session/credentials`         | Set credentials for this session     |
//! | DELETE | `/session/credentials`         | Clear them                           |
//! | POST   | `/nvp/get-balance`             | `GetBalance`                         |
//! | POST   | `/nvp/transaction-search`      | `TransactionSearch`, body passthrough|
//! | POST   | `/nvp/get-transaction-details` | `GetTransactionDetails`              |
//! | POST   | `/nvp/refund-transaction`      | `RefundTransaction`                  |
//! | GET    | `/logs`                        | Buffered log records                 |
//! | GET    | `/logs/stats`                  | Buffer statistics                    |
//! | GET    | `/logs/stream`                 | SSE live log                         |
//! | GET    | `/ws`                          | WebSocket live log                   |
//! | GET    | `/api-keys`                    | Saved keys                           |
//! | POST   | `/api-keys`                    | Save a key                           |
//! | GET    | `/api-keys/:id`                | One saved key                        |
//! | PUT    | `/api-keys/:id`                | Update a saved key                   |
//! | DELETE | `/api-keys/:id`                | Delete a saved key                   |
//! | POST   | `/api-keys/:id/use`            | Unlock a saved key into the session  |
//!
//! `/nvp/*` sits behind the per-client rate limiter. Every error response
//! is `{"error": "..."}` and is also recorded in the event hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use nvp_core::credentials::{activate, ApiKeyUpdate, NewApiKey, RepositoryError};
use nvp_core::events::{source, NewRecord, Order};
use nvp_core::{
    resolve_active, verify_saved_key, CredentialError, CredentialRepository, CredentialSet,
    Environment, EventHub, NvpClient, NvpError, NvpParams, NvpResponse, RateLimited, RateLimiter,
};

use crate::live;
use crate::metrics::ProxyMetrics;
use crate::session::SessionStore;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone; everything is behind
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<EventHub>,
    pub nvp: Arc<NvpClient>,
    pub keys: Arc<dyn CredentialRepository>,
    pub sessions: Arc<SessionStore>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<ProxyMetrics>,
    /// Browser origin allowed by CORS.
    pub client_origin: String,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let origin = match HeaderValue::from_str(&state.client_origin) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            tracing::warn!(origin = %state.client_origin, "invalid client origin, CORS disabled");
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE]);

    let nvp = Router::new()
        .route("/get-balance", post(get_balance_handler))
        .route("/transaction-search", post(transaction_search_handler))
        .route("/get-transaction-details", post(transaction_details_handler))
        .route("/refund-transaction", post(refund_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health_handler))
        .route("/session", get(session_handler))
        .route(
            "/session/credentials",
            post(set_credentials_handler).delete(clear_credentials_handler),
        )
        .nest("/nvp", nvp)
        .route("/logs", get(logs_handler))
        .route("/logs/stats", get(log_stats_handler))
        .route("/logs/stream", get(live::stream_handler))
        .route("/ws", get(live::ws_handler))
        .route("/api-keys", get(list_keys_handler).post(create_key_handler))
        .route(
            "/api-keys/:id",
            get(get_key_handler)
                .put(update_key_handler)
                .delete(delete_key_handler),
        )
        .route("/api-keys/:id/use", post(use_key_handler))
        .layer(middleware::from_fn_with_state(state.clone(), record_errors))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Generic error body returned on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    Upstream(#[from] NvpError),

    #[error("{0}")]
    Internal(String),
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Credentials(CredentialError::Missing) => StatusCode::BAD_REQUEST,
            ApiError::Credentials(CredentialError::InvalidPassword)
            | ApiError::Credentials(CredentialError::NotFound) => StatusCode::UNAUTHORIZED,
            ApiError::Credentials(CredentialError::Repository(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// What the client gets to see. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Credentials(e) => e.public_message().to_string(),
            ApiError::RateLimited(_) => "Too many requests, please try again later".to_string(),
            ApiError::Upstream(e) => format!("Upstream request failed: {e}"),
            ApiError::Internal(_) => "Internal server error".to_string(),
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
        }
    }
}

/// Attached to error responses so [`record_errors`] can log them.
#[derive(Debug, Clone)]
struct ErrorReport {
    message: String,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();
        let mut response = (
            status,
            Json(ErrorResponse {
                error: message.clone(),
            }),
        )
            .into_response();

        if let ApiError::RateLimited(limited) = &self {
            let headers = response.headers_mut();
            set_rate_headers(headers, limited.limit, 0, limited.retry_after);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(limited.retry_after_secs()));
        }

        response.extensions_mut().insert(ErrorReport {
            message,
            detail: self.to_string(),
        });
        response
    }
}

/// JSON body extractor whose rejections are [`ApiError::BadRequest`], so
/// malformed bodies get the same `{error}` shape as everything else.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Record every error response in the event hub as a `server`/`error`
/// record.
async fn record_errors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if let Some(report) = response.extensions().get::<ErrorReport>() {
        let status = response.status();
        if status.is_server_error() {
            tracing::error!(%method, %path, status = status.as_u16(), detail = %report.detail, "request failed");
        } else {
            tracing::warn!(%method, %path, status = status.as_u16(), detail = %report.detail, "request rejected");
        }
        state.hub.insert(
            NewRecord::new(source::SERVER, "error")
                .field("status", status.as_u16())
                .field("message", &report.message)
                .field("method", method.as_str())
                .field("path", &path),
        );
    }
    response
}

const RATELIMIT_LIMIT: &str = "ratelimit-limit";
const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const RATELIMIT_RESET: &str = "ratelimit-reset";

fn set_rate_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_after: Duration) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(
        RATELIMIT_RESET,
        HeaderValue::from(reset_after.as_secs_f64().ceil() as u64),
    );
}

/// First `X-Forwarded-For` hop, else the peer address.
fn client_key(req: &Request) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client = client_key(&req);
    match state.limiter.check(&client) {
        Ok(decision) => {
            let mut response = next.run(req).await;
            set_rate_headers(
                response.headers_mut(),
                decision.limit,
                decision.remaining,
                decision.reset_after,
            );
            response
        }
        Err(limited) => {
            state.metrics.rate_limited_total.inc();
            tracing::warn!(%client, retry_after = limited.retry_after_secs(), "rate limit hit");
            ApiError::RateLimited(limited).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Health & Session
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true, "ts": chrono::Utc::now().timestamp_millis() }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub environment: Environment,
}

/// `GET /session`
async fn session_handler(State(state): State<AppState>, headers: HeaderMap) -> Json<SessionStatus> {
    let session = state.sessions.snapshot(&headers);
    Json(SessionStatus {
        authenticated: session.is_authenticated(),
        username: session.credentials().map(|c| c.username.clone()),
        environment: Environment::resolve(
            session.environment(),
            state.nvp.default_environment(),
        ),
    })
}

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub env: Option<String>,
}

/// `POST /session/credentials`
async fn set_credentials_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<CredentialsBody>,
) -> Result<Response, ApiError> {
    let credentials = CredentialSet::new(body.username, body.password, body.signature);
    if !credentials.is_complete() {
        return Err(ApiError::BadRequest(
            "username, password and signature are required".into(),
        ));
    }

    let env = Environment::resolve(body.env.as_deref(), state.nvp.default_environment());
    let bound = state.sessions.attach(&headers);
    state
        .sessions
        .with(&bound, |session| session.set_credentials(credentials, body.env));

    state
        .hub
        .insert(NewRecord::new(source::SESSION, "credentials_set").field("env", env));
    tracing::info!(%env, "session credentials set");

    Ok(bound.respond(Json(json!({ "ok": true, "environment": env }))))
}

/// `DELETE /session/credentials`
async fn clear_credentials_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let bound = state.sessions.attach(&headers);
    state.sessions.with(&bound, |session| session.clear());
    state
        .hub
        .insert(NewRecord::new(source::SESSION, "credentials_cleared"));
    bound.respond(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// NVP
// ---------------------------------------------------------------------------

/// Sign `params` with the session's credentials and forward them.
async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
    params: NvpParams,
) -> Result<Json<NvpResponse>, ApiError> {
    let session = state.sessions.snapshot(headers);
    let credentials = resolve_active(&session)?;
    let response = state
        .nvp
        .call(method, params, &credentials, session.environment())
        .await?;
    Ok(Json(response))
}

fn required<'a>(fields: &'a NvpParams, name: &str) -> Result<&'a str, ApiError> {
    fields
        .get(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))
}

/// `POST /nvp/get-balance`
async fn get_balance_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<NvpResponse>, ApiError> {
    let params = NvpParams::new().with("RETURNALLCURRENCIES", 1);
    dispatch(&state, &headers, "GetBalance", params).await
}

/// `POST /nvp/transaction-search`: the body object is forwarded as-is.
async fn transaction_search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<Map<String, Value>>,
) -> Result<Json<NvpResponse>, ApiError> {
    let params = NvpParams::from_json_object(&body);
    dispatch(&state, &headers, "TransactionSearch", params).await
}

/// `POST /nvp/get-transaction-details`
async fn transaction_details_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<Map<String, Value>>,
) -> Result<Json<NvpResponse>, ApiError> {
    let fields = NvpParams::from_json_object(&body);
    let params = NvpParams::new().with("TRANSACTIONID", required(&fields, "TRANSACTIONID")?);
    dispatch(&state, &headers, "GetTransactionDetails", params).await
}

/// `POST /nvp/refund-transaction`: `REFUNDTYPE` defaults to `Full`; a
/// `Partial` refund needs `AMT` and `CURRENCYCODE`.
async fn refund_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<Map<String, Value>>,
) -> Result<Json<NvpResponse>, ApiError> {
    let fields = NvpParams::from_json_object(&body);
    let transaction_id = required(&fields, "TRANSACTIONID")?;
    let refund_type = fields
        .get("REFUNDTYPE")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("Full");

    if refund_type.eq_ignore_ascii_case("Partial") {
        required(&fields, "AMT")?;
        required(&fields, "CURRENCYCODE")?;
    }

    let mut params = NvpParams::new()
        .with("TRANSACTIONID", transaction_id)
        .with("REFUNDTYPE", refund_type);
    for name in ["AMT", "CURRENCYCODE", "NOTE"] {
        if let Some(value) = fields.get(name).filter(|v| !v.trim().is_empty()) {
            params.set(name, value);
        }
    }
    dispatch(&state, &headers, "RefundTransaction", params).await
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    /// `newest` for newest-first; anything else is chronological.
    pub order: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `GET /logs`
async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let order = match query.order.as_deref() {
        Some("newest") | Some("newest_first") => Order::NewestFirst,
        _ => Order::Chronological,
    };
    let limit = query.limit.unwrap_or_else(|| state.hub.capacity());
    let logs = state
        .hub
        .recent_of_type(limit, query.kind.as_deref().filter(|k| !k.is_empty()), order);
    Json(json!({ "logs": logs }))
}

/// `GET /logs/stats`
async fn log_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

// ---------------------------------------------------------------------------
// Saved API Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateKeyBody {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub signature: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UseKeyBody {
    #[serde(default)]
    pub password: String,
}

/// `GET /api-keys`
async fn list_keys_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let keys = state.keys.list()?;
    Ok(Json(json!({ "apiKeys": keys })))
}

/// `POST /api-keys`
async fn create_key_handler(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<CreateKeyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let missing = [
        ("name", &body.name),
        ("username", &body.username),
        ("password", &body.password),
        ("signature", &body.signature),
    ]
    .into_iter()
    .find(|(_, v)| v.trim().is_empty());
    if let Some((field, _)) = missing {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }

    let summary = state.keys.create(NewApiKey {
        name: body.name,
        username: body.username,
        password: body.password,
        signature: body.signature,
        environment: body
            .environment
            .as_deref()
            .map(Environment::from_str_lossy)
            .unwrap_or_default(),
    })?;

    state.hub.insert(
        NewRecord::new(source::API_KEYS, "key_created")
            .field("id", &summary.id)
            .field("name", &summary.name)
            .field("environment", summary.environment),
    );
    Ok((StatusCode::CREATED, Json(summary)))
}

/// `GET /api-keys/:id`
async fn get_key_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .keys
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("API key not found".into()))
}

/// `PUT /api-keys/:id`: omitted fields, and an empty password, keep their
/// stored values.
async fn update_key_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<UpdateKeyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let update = ApiKeyUpdate {
        name: body.name,
        username: body.username,
        password: body.password.filter(|p| !p.is_empty()),
        signature: body.signature,
        environment: body.environment.as_deref().map(Environment::from_str_lossy),
    };
    let summary = state
        .keys
        .update(&id, update)?
        .ok_or_else(|| ApiError::NotFound("API key not found".into()))?;

    state.hub.insert(
        NewRecord::new(source::API_KEYS, "key_updated")
            .field("id", &summary.id)
            .field("name", &summary.name),
    );
    Ok(Json(summary))
}

/// `DELETE /api-keys/:id`
async fn delete_key_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.keys.delete(&id)?;
    if deleted {
        state
            .hub
            .insert(NewRecord::new(source::API_KEYS, "key_deleted").field("id", &id));
    }
    Ok(Json(json!({ "deleted": deleted })))
}

/// `POST /api-keys/:id/use`: unlock a saved key into this session.
///
/// Verification runs on the blocking pool, before any session is touched.
/// A failure is recorded without saying why: the hub is readable by anyone
/// who can reach `/logs`, and a wrong password must look like an unknown id.
async fn use_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<UseKeyBody>,
) -> Result<Response, ApiError> {
    let keys = Arc::clone(&state.keys);
    let key_id = id.clone();
    let verified = tokio::task::spawn_blocking(move || {
        verify_saved_key(keys.as_ref(), &key_id, &body.password)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("key verification task failed: {e}")))?;

    match verified {
        Ok(credentials) => {
            let env = credentials.environment.unwrap_or_default();
            let bound = state.sessions.attach(&headers);
            state
                .sessions
                .with(&bound, |session| activate(session, credentials));
            state.hub.insert(
                NewRecord::new(source::API_KEYS, "key_used")
                    .field("id", &id)
                    .field("env", env),
            );
            Ok(bound.respond(Json(json!({ "ok": true, "environment": env }))))
        }
        Err(err) => {
            state
                .hub
                .insert(NewRecord::new(source::API_KEYS, "key_use_failed"));
            Err(err.into())
        }
    }
}
