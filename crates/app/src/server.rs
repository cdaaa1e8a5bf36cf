use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use sandbox::FailureReason;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;

use crate::error::BrokerError;
use crate::orchestrator::Orchestrator;
use crate::protocol::{
    CreateSessionPayload, ErrorBody, ErrorEnvelope, Health, RunPayload, SessionCreated,
    SessionEnded, SessionListQuery,
};

const MAX_RUN_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;
const RUN_TIMEOUT_GRACE: Duration = Duration::from_secs(30);
const RETRY_AFTER_SECONDS: &str = "1";

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

pub fn router(orchestrator: Orchestrator, max_inflight: usize) -> Router {
    let run_timeout = orchestrator.limits().max_timeout + RUN_TIMEOUT_GRACE;
    Router::new()
        .route("/healthz", get(healthcheck))
        .route(
            "/v1/code_interpreter/run",
            post(run_handler).layer(
                ServiceBuilder::new()
                    .layer(DefaultBodyLimit::max(MAX_RUN_BODY_LIMIT_BYTES))
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        run_timeout,
                    )),
            ),
        )
        .route(
            "/v1/code_interpreter/sessions",
            post(create_session_handler).get(list_sessions_handler),
        )
        .route(
            "/v1/code_interpreter/sessions/{session_id}",
            get(get_session_handler).delete(end_session_handler),
        )
        .route("/v1/pool", get(pool_stats_handler))
        .layer(CompressionLayer::new())
        .layer(ConcurrencyLimitLayer::new(max_inflight))
        .layer(middleware::from_fn(log_request_response))
        .with_state(AppState { orchestrator })
}

async fn healthcheck() -> Response {
    let mut response = Json(Health {
        status: "healthy".to_owned(),
    })
    .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    tracing::debug!(%method, %uri, "request");
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

async fn run_handler(
    State(state): State<AppState>,
    payload: Result<Json<RunPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.status(), rejection.body_text()),
    };
    match state.orchestrator.run(payload.into()).await {
        Ok(outcome) => {
            let status = if outcome.outcome.failure == Some(FailureReason::Infrastructure) {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            (status, Json(outcome)).into_response()
        }
        Err(err) => broker_error_response(err),
    }
}

async fn create_session_handler(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection.status(), rejection.body_text()),
    };
    match state
        .orchestrator
        .sessions()
        .create(&payload.language, &payload.user_id)
        .await
    {
        Ok(info) => Json(SessionCreated {
            session_id: info.session_id,
            language: info.language,
            message: "Session created successfully".to_owned(),
        })
        .into_response(),
        Err(err) => broker_error_response(err),
    }
}

async fn list_sessions_handler(
    State(state): State<AppState>,
    query: Result<Query<SessionListQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => Json(state.orchestrator.sessions().list(&query.user_id)).into_response(),
        Err(rejection) => rejection_response(rejection.status(), rejection.body_text()),
    }
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.orchestrator.sessions().info(&session_id) {
        Ok(info) => Json(info).into_response(),
        Err(err) => broker_error_response(err),
    }
}

async fn end_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.orchestrator.sessions().end(&session_id).await {
        Ok(()) => Json(SessionEnded {
            success: true,
            message: format!("Session {session_id} ended"),
        })
        .into_response(),
        Err(err) => broker_error_response(err),
    }
}

async fn pool_stats_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.pool().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => broker_error_response(err.into()),
    }
}

fn broker_error_response(err: BrokerError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        tracing::warn!(error = %err, status = status.as_u16(), "request failed");
    }
    let mut response = error_response(status, &err.to_string(), err.error_type());
    if err.is_retryable() {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_static(RETRY_AFTER_SECONDS),
        );
    }
    response
}

fn rejection_response(status: StatusCode, message: String) -> Response {
    error_response(status, &message, "invalid_request_error")
}

fn error_response(status: StatusCode, message: &str, error_type: &str) -> Response {
    let mut response = Json(ErrorEnvelope {
        error: ErrorBody {
            message: message.to_owned(),
            error_type: error_type.to_owned(),
        },
    })
    .into_response();
    *response.status_mut() = status;
    response
}
