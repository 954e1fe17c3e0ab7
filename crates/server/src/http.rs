//! REST surface for the dashboard and the payment webhook.
//!
//! Contribution intake returns as soon as the record is durable; message
//! delivery always happens behind the dispatch queue. Everything under
//! `/api` goes through the optional bearer-token middleware.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use donatrack_bridge::BridgeError;
use donatrack_protocol::{ApiResponse, LoginResponse};

use crate::contributions::{self, NewContribution};
use crate::state::AppState;
use crate::{auth, login, persistence, sweep};

pub fn router(state: AppState, public_dir: PathBuf) -> Router {
    let api = Router::new()
        .route("/new", post(new_contribution))
        .route("/bank-transfer", post(bank_transfer))
        .route("/failed-messages", get(failed_messages))
        .route("/retry-message/{id}", post(retry_message))
        .route("/retry-failed-messages", post(retry_failed_messages))
        .route("/status", get(session_status))
        .route("/login", get(login_handler))
        .route("/logout", post(logout_handler))
        .route("/reload", post(reload_handler))
        .route("/screenshot", get(screenshot_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_handler))
        .nest_service("/whatsapp", ServeDir::new(public_dir.join("whatsapp")))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn new_contribution(
    State(state): State<AppState>,
    Json(input): Json<NewContribution>,
) -> Response {
    if input.phone.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "phone is required");
    }

    match contributions::record_contribution(&state.db_path, &state.queue, &input).await {
        Ok((contact, record)) => ok_json(
            "contribution recorded",
            json!({ "contact": contact, "notification": record }),
        ),
        Err(e) => internal(e),
    }
}

async fn bank_transfer(
    State(state): State<AppState>,
    Json(input): Json<NewContribution>,
) -> Response {
    if input.phone.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "phone is required");
    }

    match contributions::record_bank_transfer(&state.db_path, &state.queue, &input).await {
        Ok((contact, record)) => ok_json(
            "bank transfer recorded",
            json!({ "contact": contact, "notification": record }),
        ),
        Err(e) => internal(e),
    }
}

async fn failed_messages(State(state): State<AppState>) -> Response {
    match persistence::load_failed_notifications(&state.db_path).await {
        Ok(records) => ok_json("failed messages", records),
        Err(e) => internal(e),
    }
}

async fn retry_message(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match sweep::retry_notification(&state.queue, &state.db_path, &id).await {
        Ok(Some(record)) => ok_json("retry queued", record),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no such message"),
        Err(e) => internal(e),
    }
}

async fn retry_failed_messages(State(state): State<AppState>) -> Response {
    match sweep::retry_all_failed(&state.queue, &state.db_path).await {
        Ok(outcome) => ok_json("retry sweep complete", outcome),
        Err(e) => internal(e),
    }
}

async fn session_status(State(state): State<AppState>) -> Response {
    ok_json("session status", state.session.status())
}

async fn login_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client = addr.ip().to_string();

    match login::produce_credential(&state.session, &state.qr_path, &client).await {
        Ok(resp @ LoginResponse::AlreadyAuthenticated { .. }) => {
            ok_json("already authenticated", resp)
        }
        Ok(resp) => {
            // Keep the served QR fresh while the operator scans it. One
            // watch at a time; repeat polls reuse the running one.
            if state.login_watch.try_claim() {
                let session = state.session.clone();
                let qr_path = state.qr_path.clone();
                let slot = state.login_watch.clone();
                tokio::spawn(async move {
                    if let Err(e) = login::await_authentication(session, qr_path, client).await {
                        error!(
                            component = "http",
                            event = "login.watch_failed",
                            error = %e,
                        );
                    }
                    slot.release();
                });
            }
            ok_json("scan the QR code to log in", resp)
        }
        Err(e) => bridge_error(e),
    }
}

async fn logout_handler(State(state): State<AppState>) -> Response {
    match login::logout(&state.session).await {
        Ok(()) => {
            let resp: ApiResponse<()> = ApiResponse::ok_empty("logged out");
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => bridge_error(e),
    }
}

async fn reload_handler(State(state): State<AppState>) -> Response {
    match state.session.reload().await {
        Ok(()) => {
            let resp: ApiResponse<()> = ApiResponse::ok_empty("session reloaded");
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => bridge_error(e),
    }
}

async fn screenshot_handler(State(state): State<AppState>) -> Response {
    match state.session.capture_screenshot().await {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => bridge_error(e),
    }
}

fn ok_json<T: Serialize>(message: &str, data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(message, data))).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let resp: ApiResponse<()> = ApiResponse::error(message);
    (status, Json(resp)).into_response()
}

fn internal(e: anyhow::Error) -> Response {
    error!(component = "http", event = "http.internal_error", error = %e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

fn bridge_error(e: BridgeError) -> Response {
    let status = match e {
        BridgeError::SessionInit(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::NotAuthenticated | BridgeError::NoCredential => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}
