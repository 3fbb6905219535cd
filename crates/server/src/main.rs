use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{bearer_token, verify_token, AccessError, ApiContext, AuthConfig, AuthenticatedUser};
use shared::{
    domain::AttachmentId,
    error::{ApiError, ErrorCode},
    protocol::{Credentials, TokenResponse, DEFAULT_CONTENT_TYPE},
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod relay;

use crate::app_state::AppState;
use crate::config::{load_settings, prepare_database_url};
use crate::relay::{session::serve_socket, HttpRelay, Relay, RelayForwarder};

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            error = %format!("{error:#}"),
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let forwarder = match settings.relay_endpoint()? {
        Some(endpoint) => {
            info!(%endpoint, channel = %settings.relay_channel, "relay forwarding enabled");
            let forwarder = RelayForwarder::new(settings.relay_queue_capacity);
            forwarder.spawn(
                Arc::new(HttpRelay::new(endpoint)),
                settings.relay_channel.clone(),
            );
            Some(forwarder)
        }
        None => None,
    };

    let relay = Relay::new(
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        settings.write_timeout(),
        forwarder,
    );
    let api = ApiContext {
        storage,
        auth: AuthConfig {
            jwt_secret: settings.jwt_secret.clone(),
            token_ttl_seconds: settings.token_ttl_seconds,
            bcrypt_cost: settings.bcrypt_cost,
        },
    };
    let state = AppState {
        api,
        relay,
        max_frame_bytes: settings.max_frame_bytes,
    };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/ws", get(ws_handler))
        .route("/files/:file_id", get(download_file))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(error: ApiError) -> HttpError {
    (status_for(error.code), Json(error))
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Access gate for HTTP routes and the WebSocket upgrade. Rejects with 401
/// before any handler state is touched.
struct Authenticated(AuthenticatedUser);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();

        bearer_token(authorization, query.token.as_deref())
            .ok_or(AccessError::Missing)
            .and_then(|token| verify_token(&state.api.auth, token))
            .map(Self)
            .map_err(|error| {
                warn!(path = %parts.uri.path(), %error, "access denied");
                http_error(ApiError::new(ErrorCode::Unauthorized, error.to_string()))
            })
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|error| {
        error!(error = %format!("{error:#}"), "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, "store unavailable")),
        )
    })?;
    Ok("ok")
}

async fn signup(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Result<StatusCode, HttpError> {
    server_api::signup(&state.api, credentials)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::CREATED)
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<TokenResponse>, HttpError> {
    server_api::login(&state.api, credentials)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn ws_handler(
    Authenticated(user): Authenticated,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.relay.clone();
    ws.max_message_size(state.max_frame_bytes)
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| serve_socket(relay, user, socket))
}

async fn download_file(
    Authenticated(user): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let attachment = server_api::load_attachment(&state.api, &AttachmentId(file_id))
        .await
        .map_err(http_error)?;
    info!(
        user_id = %user.user_id,
        attachment_id = %attachment.attachment_id,
        size = attachment.size_bytes,
        "serving attachment"
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&attachment.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    let file_name = attachment.file_name.replace(['"', '\\'], "_");
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, attachment.bytes))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
