//! HTTP route handlers for the Huddle server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /api/register` - Create an account (JSON or multipart with an avatar file)
//! - `POST /api/login` - Exchange credentials for a session token
//! - `GET /ws` - WebSocket chat endpoint
//! - `GET /api/rooms` - List rooms with their online counts
//! - `GET /api/rooms/{name}/users` - List the users online in a room
//! - `GET /uploads/*` - Uploaded avatar files
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The [`Hub`] owning every live connection and room
//! - The token and account services
//! - Server start time for uptime reporting
//!
//! Failures are returned as [`ServerError`] and rendered as a JSON
//! [`ErrorResponse`] with the matching status code.
//!
//! # Example
//!
//! ```rust,no_run
//! use huddle_server::config::Config;
//! use huddle_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::accounts::AccountStore;
use crate::auth::TokenService;
use crate::config::Config;
use crate::connection::Session;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::pump::{serve_session, PumpSettings};
use crate::transport::split_socket;

/// Name of the session cookie.
pub const AUTH_COOKIE: &str = "auth";

/// URL prefix uploaded avatars are served under.
pub const UPLOADS_PATH: &str = "/uploads";

/// Maximum registration body size (10 MB), avatar included.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Longest stored avatar file name, before the unique prefix.
const MAX_FILE_NAME_CHARS: usize = 64;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Connection registry and router.
    pub hub: Arc<Hub>,

    /// Session token issuer and validator.
    pub tokens: Arc<TokenService>,

    /// Registered accounts.
    pub accounts: Arc<AccountStore>,

    /// Deadlines and limits for connection pumps.
    pub pump_settings: PumpSettings,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(Hub::new(config.hub_config()));
        let tokens = Arc::new(TokenService::from_config(&config));
        Self::with_components(
            config,
            hub,
            tokens,
            Arc::new(AccountStore::new()),
            PumpSettings::default(),
        )
    }

    /// Creates application state with explicit components.
    ///
    /// Useful for tests that need short deadlines or a fixed signing key.
    #[must_use]
    pub fn with_components(
        config: Config,
        hub: Arc<Hub>,
        tokens: Arc<TokenService>,
        accounts: Arc<AccountStore>,
        pump_settings: PumpSettings,
    ) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            tokens,
            accounts,
            pump_settings,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("hub", &self.hub)
            .field("pump_settings", &self.pump_settings)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let uploads = ServeDir::new(&state.config.upload_dir);

    Router::new()
        .route("/api/register", post(post_register))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .route("/api/login", post(post_login))
        .route("/api/rooms", get(get_rooms))
        .route("/api/rooms/{name}/users", get(get_room_users))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .nest_service(UPLOADS_PATH, uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    fn into_response(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, "Request rejected");
        }

        ErrorResponse::new(self.public_message())
            .with_code(self.code())
            .into_response(self.status())
    }
}

fn invalid_body(err: impl fmt::Display) -> ServerError {
    ServerError::validation("invalid_format", format!("invalid request body: {err}"))
}

// ============================================================================
// POST /api/register
// ============================================================================

/// Registration fields, read from a JSON or a multipart body.
#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    /// Avatar reference given as plain text.
    #[serde(default)]
    avatar: Option<String>,
    /// Avatar file from a multipart `avatar` field.
    #[serde(skip)]
    upload: Option<AvatarUpload>,
}

#[derive(Debug)]
struct AvatarUpload {
    file_name: String,
    bytes: Bytes,
}

/// POST /api/register - Create an account.
///
/// Accepts `application/json` with `username`, `password` and an optional
/// `avatar` reference, or `multipart/form-data` where `avatar` may be a file.
/// An uploaded file is stored in the upload directory and its
/// `/uploads/...` URL becomes the avatar reference.
///
/// # Responses
///
/// - `200 OK` - `{"status":"registered"}`
/// - `400 Bad Request` - Invalid body or rejected registration
async fn post_register(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<serde_json::Value>, ServerError> {
    let form = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(invalid_body)?;
        read_register_form(multipart).await?
    } else {
        let body = Bytes::from_request(request, &state)
            .await
            .map_err(invalid_body)?;
        serde_json::from_slice(&body).map_err(invalid_body)?
    };

    let RegisterRequest {
        username,
        password,
        mut avatar,
        upload,
    } = form;

    let stored = match &upload {
        Some(upload) => Some(store_avatar(&state.config.upload_dir, upload).await?),
        None => None,
    };
    if let Some(file) = &stored {
        avatar = Some(format!("{UPLOADS_PATH}/{file}"));
    }

    let accounts = state.accounts.clone();
    let name = username.clone();
    let result = tokio::task::spawn_blocking(move || accounts.register(&name, &password, avatar))
        .await
        .map_err(|err| ServerError::internal(format!("registration task failed: {err}")))
        .and_then(|registered| registered.map_err(ServerError::from));

    if let Err(err) = result {
        if let Some(file) = stored {
            discard_upload(&state.config.upload_dir.join(file)).await;
        }
        return Err(err);
    }

    info!(username = %username.trim(), "Account registered");
    Ok(Json(serde_json::json!({ "status": "registered" })))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
}

async fn read_register_form(mut multipart: Multipart) -> Result<RegisterRequest, ServerError> {
    let mut form = RegisterRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(invalid_body)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);

        match (name.as_str(), file_name) {
            ("username", _) => form.username = field.text().await.map_err(invalid_body)?,
            ("password", _) => form.password = field.text().await.map_err(invalid_body)?,
            ("avatar", Some(file_name)) => {
                let bytes = field.bytes().await.map_err(invalid_body)?;
                if !bytes.is_empty() {
                    form.upload = Some(AvatarUpload { file_name, bytes });
                }
            }
            ("avatar", None) => form.avatar = Some(field.text().await.map_err(invalid_body)?),
            (other, _) => trace!(field = %other, "Ignoring unknown registration field"),
        }
    }

    Ok(form)
}

/// Writes an uploaded avatar under a unique name and returns that name.
async fn store_avatar(
    dir: &std::path::Path,
    upload: &AvatarUpload,
) -> Result<String, ServerError> {
    let file = format!(
        "{}_{}",
        Uuid::new_v4().simple(),
        sanitize_file_name(&upload.file_name)
    );

    tokio::fs::create_dir_all(dir).await.map_err(|err| {
        ServerError::internal(format!("failed to create {}: {err}", dir.display()))
    })?;
    tokio::fs::write(dir.join(&file), &upload.bytes)
        .await
        .map_err(|err| ServerError::internal(format!("failed to write avatar {file}: {err}")))?;

    debug!(file = %file, bytes = upload.bytes.len(), "Avatar stored");
    Ok(file)
}

async fn discard_upload(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "Failed to remove unused avatar upload");
    }
}

/// Reduces a client-supplied file name to a safe final path component.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    match cleaned.trim_start_matches('.') {
        "" => "avatar".to_string(),
        cleaned => cleaned.to_string(),
    }
}

// ============================================================================
// POST /api/login
// ============================================================================

/// Request body for login.
#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// Successful login response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub token: String,
    pub avatar: Option<String>,
}

/// POST /api/login - Exchange credentials for a session token.
///
/// On success the token is returned in the body and set as the `auth`
/// cookie.
///
/// # Responses
///
/// - `200 OK` - Token issued
/// - `400 Bad Request` - Invalid body
/// - `401 Unauthorized` - Wrong username or password
async fn post_login(State(state): State<AppState>, body: Bytes) -> Result<Response, ServerError> {
    let request: LoginRequest = serde_json::from_slice(&body).map_err(invalid_body)?;
    let username = request.username.trim().to_string();

    let accounts = state.accounts.clone();
    let name = username.clone();
    let authenticated =
        tokio::task::spawn_blocking(move || accounts.authenticate(&name, &request.password))
            .await
            .map_err(|err| ServerError::internal(format!("login task failed: {err}")))?;

    if !authenticated {
        info!(username = %username, "Login failed");
        return Err(ServerError::auth(
            "invalid_credentials",
            "invalid username or password",
        ));
    }

    let token = state
        .tokens
        .issue(&username)
        .map_err(|err| ServerError::internal(format!("failed to issue token: {err}")))?;

    let cookie = format!(
        "{AUTH_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        state.tokens.ttl().as_secs()
    );
    info!(username = %username, "Login succeeded");

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse {
            status: "ok".to_string(),
            avatar: state.accounts.avatar(&username),
            token,
        }),
    )
        .into_response())
}

// ============================================================================
// GET /ws - WebSocket Chat
// ============================================================================

/// Query parameters for the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    /// Room to join. Defaults to the configured default room.
    pub room: Option<String>,

    /// Session token, tried after the `auth` cookie.
    pub token: Option<String>,

    /// Self-chosen identity (unsafe mode only).
    pub user: Option<String>,
}

/// GET /ws - WebSocket chat endpoint.
///
/// # Authentication
///
/// The identity comes from the first valid token among the `auth` cookie and
/// the `token` query parameter, in that order. With `unsafe_no_auth` enabled
/// it is taken from the `user` parameter.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `400 Bad Request` - Missing `user` in unsafe mode
/// - `401 Unauthorized` - Missing or invalid token
/// - `503 Service Unavailable` - Server is shutting down
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    if state.hub.is_shutting_down() {
        return Err(ServerError::ShuttingDown);
    }

    let identity = resolve_identity(&state, &headers, &params)?;

    let room = params
        .room
        .as_deref()
        .map(str::trim)
        .filter(|room| !room.is_empty())
        .unwrap_or(&state.config.default_room)
        .to_string();

    info!(identity = %identity, room = %room, "WebSocket client connecting");

    let settings = state.pump_settings;
    let session = Arc::new(Session::new(
        identity,
        room,
        state.hub.config().mailbox_capacity,
    ));

    Ok(ws
        .max_message_size(settings.max_frame_bytes)
        .max_frame_size(settings.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = split_socket(socket);
            serve_session(&state.hub, session, sink, stream, settings).await;
        }))
}

fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
    params: &WsQueryParams,
) -> Result<String, ServerError> {
    if state.config.unsafe_no_auth {
        return match params.user.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => Ok(user.to_string()),
            _ => Err(ServerError::validation(
                "missing_user",
                "missing user parameter",
            )),
        };
    }

    let query_token = params
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    let candidates: Vec<(&str, String)> = [
        ("cookie", cookie_value(headers, AUTH_COOKIE)),
        ("query", query_token),
    ]
    .into_iter()
    .filter_map(|(source, token)| token.map(|token| (source, token)))
    .collect();

    if candidates.is_empty() {
        return Err(ServerError::auth("missing_token", "missing token"));
    }

    for (source, token) in &candidates {
        match state.tokens.validate(token) {
            Ok(identity) => return Ok(identity),
            Err(err) => debug!(source, error = %err, "Rejected token"),
        }
    }

    warn!(tried = candidates.len(), "No valid token in WebSocket request");
    Err(ServerError::auth("invalid_token", "invalid token"))
}

/// Extracts a cookie value from the `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

// ============================================================================
// GET /api/rooms
// ============================================================================

/// One entry of the room list.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomEntry {
    pub name: String,
    pub online: usize,
}

/// GET /api/rooms - List every room created so far, sorted by name.
async fn get_rooms(State(state): State<AppState>) -> Json<Vec<RoomEntry>> {
    let rooms = state
        .hub
        .room_summaries()
        .await
        .into_iter()
        .map(|summary| RoomEntry {
            name: summary.name,
            online: summary.online,
        })
        .collect();
    Json(rooms)
}

// ============================================================================
// GET /api/rooms/{name}/users
// ============================================================================

/// Response body for the room user list.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomUsersResponse {
    pub room: String,
    pub users: Vec<String>,
}

/// GET /api/rooms/{name}/users - Users currently in a room.
///
/// Returns `404 Not Found` for a room that has never been joined. Looking a
/// room up never creates it.
async fn get_room_users(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomUsersResponse>, ServerError> {
    let users = state.hub.online_users(&name).await.ok_or_else(|| {
        ServerError::not_found("room_not_found", format!("room '{name}' not found"))
    })?;
    Ok(Json(RoomUsersResponse { room: name, users }))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live WebSocket connections.
    pub connections: usize,

    /// Number of rooms created so far.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "connections": 42,
///   "rooms": 3,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.hub.connection_count().await,
        rooms: state.hub.room_count().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
