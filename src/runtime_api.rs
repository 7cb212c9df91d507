//! HTTP runtime API for the bridge.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::core::confirm::ConfirmError;
use crate::core::engine::{ChatMessage, EngineFactory};
use crate::core::reflection::EventSink;
use crate::core::session::{
    ChatRequest, DEFAULT_SESSION_ID, RegistryError, SessionHandle, SessionOptions, SessionRegistry,
    SettingError,
};
use crate::logging;
use crate::providers::ProviderSetting;
use crate::stream::encode_events;

const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct RuntimeApiState {
    sessions: Arc<SessionRegistry>,
}

impl RuntimeApiState {
    pub fn new(factory: Arc<dyn EngineFactory>, options: SessionOptions) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new(factory, options)),
        }
    }

    fn session(&self, headers: &HeaderMap) -> Result<(String, SessionHandle), ApiError> {
        let id = session_id(headers);
        let handle = self.sessions.get_or_create(&id).map_err(|err| match err {
            RegistryError::Full { .. } => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: format!("Cannot open session '{id}': {err}"),
            },
            RegistryError::Engine(_) => {
                ApiError::internal(format!("Failed to create session '{id}': {err}"))
            }
        })?;
        Ok((id, handle))
    }

    /// Session that already exists; lookups here never allocate one.
    fn existing_session(&self, headers: &HeaderMap) -> Option<SessionHandle> {
        self.sessions.get(&session_id(headers))
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeApiOptions {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    sessions: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

const SUCCESS: StatusResponse = StatusResponse { status: "success" };

/// Start the runtime API server.
pub async fn run_http_server(
    config: &Config,
    factory: Arc<dyn EngineFactory>,
    options: RuntimeApiOptions,
) -> Result<()> {
    if options.port == 0 {
        bail!("Port must be > 0");
    }

    let state = RuntimeApiState::new(factory, SessionOptions::from_config(config));
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", options.host, options.port)
        .parse()
        .with_context(|| format!("Invalid bind address '{}:{}'", options.host, options.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    logging::info(format!("coder-bridge listening on http://{addr}"));
    logging::info("Security: this server is local-first. Do not expose it to untrusted networks.");
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Runtime API server error: {e}"))
}

pub fn build_router(state: RuntimeApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/chat",
            post(chat_stream).delete(clear_history).options(preflight),
        )
        .route("/api/chat/session", put(replace_history))
        .route("/api/chat/setting", post(update_setting))
        .route("/api/chat/confirm/ask", post(confirm_ask))
        .route("/api/chat/confirm/reply", post(confirm_reply))
        .layer(cors_layer())
        .with_state(state)
}

async fn health(State(state): State<RuntimeApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "coder-bridge",
        sessions: state.sessions.len(),
    })
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn chat_stream(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Json(request) = payload.map_err(invalid_json)?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(format!("Invalid request format: {e}")))?;

    let (id, handle) = state.session(&headers)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let span = tracing::info_span!("chat", session = %id, request_id = %Uuid::new_v4());

    let task_cancel = cancel.clone();
    tokio::spawn(
        async move {
            let mut session = handle.session.lock().await;
            logging::debug(format!(
                "Session '{}' handling {:?} request (previous mode {:?}, format {:?}, {} messages of history)",
                session.id(),
                request.chat_type,
                session.chat_mode(),
                session.diff_format(),
                session.history().len()
            ));
            session
                .chat(request, EventSink::new(tx), task_cancel)
                .await;
        }
        .instrument(span),
    );

    let stream = encode_events(rx, cancel.drop_guard());
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn clear_history(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = state
        .existing_session(&headers)
        .ok_or_else(|| ApiError::not_found("Unknown session"))?;
    handle.session.lock().await.clear_history();
    Ok(Json(SUCCESS))
}

async fn replace_history(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    payload: Result<Json<Vec<ChatMessage>>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(history) = payload.map_err(invalid_json)?;
    let (_, handle) = state.session(&headers)?;
    handle.session.lock().await.replace_history(history);
    Ok(Json(SUCCESS))
}

async fn update_setting(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    payload: Result<Json<ProviderSetting>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(setting) = payload.map_err(invalid_json)?;
    let (_, handle) = state.session(&headers)?;
    let mut session = handle.session.lock().await;
    match session.apply_setting(setting) {
        Ok(_) => Ok(Json(SUCCESS)),
        Err(SettingError::Configuration(err)) => Err(ApiError::bad_request(err.to_string())),
        Err(err @ SettingError::Engine(_)) => Err(ApiError::internal(err.to_string())),
    }
}

async fn confirm_ask(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let handle = state
        .existing_session(&headers)
        .ok_or_else(|| ApiError::not_found("Unknown session"))?;
    let result = handle.gate.wait_resolution().await.map_err(map_confirm_err)?;
    Ok(Json(json!({ "result": result })))
}

async fn confirm_reply(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(answer) = payload.map_err(invalid_json)?;
    if answer.is_null() {
        return Err(ApiError::bad_request("Missing reply data"));
    }
    let handle = state
        .existing_session(&headers)
        .ok_or_else(|| map_confirm_err(ConfirmError::NothingPending))?;
    handle.gate.reply(answer).map_err(map_confirm_err)?;
    Ok(Json(SUCCESS))
}

fn session_id(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_SESSION_ID)
        .to_string()
}

fn invalid_json(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(format!("Invalid request format: {}", rejection.body_text()))
}

fn map_confirm_err(err: ConfirmError) -> ApiError {
    match err {
        ConfirmError::NothingPending | ConfirmError::AlreadyPending => ApiError {
            status: StatusCode::CONFLICT,
            message: err.to_string(),
        },
        ConfirmError::TimedOut => ApiError {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: err.to_string(),
        },
        ConfirmError::Cancelled | ConfirmError::Disconnected => ApiError::internal(err.to_string()),
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(SESSION_HEADER)])
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.message,
                    "status": self.status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}
