//! HTTP ingress.
//!
//! A thin adapter over [`TaskRegistry::submit`]: the same canonical request
//! JSON the broker subscription accepts, posted to `/v1/schedule`. Optional
//! basic auth guards the schedule endpoint; `/health` stays open for probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use courier_core::ScheduleRequest;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::flag::StopFlag;
use crate::registry::{SubmitError, TaskRegistry};
use crate::stats::Stats;

pub struct ApiState {
    pub registry: Arc<TaskRegistry>,
    pub stats: Arc<Stats>,
    /// `(username, password)` for basic auth; `None` disables auth.
    pub auth: Option<(String, String)>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/schedule", post(schedule))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves until the stop flag is raised.
pub async fn serve(state: Arc<ApiState>, port: u16, shutdown: StopFlag) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("api listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    Ok(())
}

async fn schedule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = check_auth(&state, &headers) {
        return rejection;
    }

    let now = Utc::now();
    let request = match ScheduleRequest::parse(&body, now) {
        Ok(request) => request,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response();
        }
    };

    match state.registry.submit(&request, now).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({
                "taskName": id.name,
                "taskInstance": id.instance,
                "executionTime": request.first_execution_time(now).timestamp_millis(),
            })),
        )
            .into_response(),
        Err(SubmitError::Duplicate(id)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("task {id} is already scheduled") })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!("failed to persist schedule request: {error}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to persist task" })),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let stats = state.stats.snapshot();
    Json(json!({
        "status": "ok",
        "received": stats.received,
        "processed": stats.processed,
        "failed": stats.failed,
    }))
    .into_response()
}

fn check_auth(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let Some((username, password)) = &state.auth else {
        return Ok(());
    };

    let expected = format!("Basic {}", STANDARD.encode(format!("{username}:{password}")));
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"courier\"")],
            Json(json!({ "error": "authentication required" })),
        )
            .into_response())
    }
}

/// The API schema emitted by `courier openapi`.
pub fn openapi_document() -> serde_json::Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "courier",
            "description": "Durable database-backed message scheduler",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/v1/schedule": {
                "post": {
                    "summary": "Schedule a payload for later publication",
                    "security": [{ "basicAuth": [] }],
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/ScheduleRequest" }
                            }
                        }
                    },
                    "responses": {
                        "201": { "description": "Task scheduled" },
                        "400": { "description": "Validation failure" },
                        "401": { "description": "Missing or invalid credentials" },
                        "409": { "description": "Task instance already scheduled" },
                        "500": { "description": "Store failure" }
                    }
                }
            },
            "/health": {
                "get": {
                    "summary": "Liveness and execution counters",
                    "responses": {
                        "200": { "description": "Service is up" }
                    }
                }
            }
        },
        "components": {
            "securitySchemes": {
                "basicAuth": { "type": "http", "scheme": "basic" }
            },
            "schemas": {
                "ScheduleRequest": {
                    "type": "object",
                    "required": ["schedule", "targetTopic", "payload"],
                    "properties": {
                        "schedule": {
                            "type": "object",
                            "required": ["type"],
                            "properties": {
                                "type": {
                                    "type": "string",
                                    "enum": ["one-time", "cron", "fixed-delay", "daily"]
                                },
                                "executionTime": { "type": "integer", "format": "int64" },
                                "expression": { "type": "string" },
                                "delaySeconds": { "type": "integer", "minimum": 1 },
                                "hour": { "type": "integer", "minimum": 0, "maximum": 23 },
                                "minute": { "type": "integer", "minimum": 0, "maximum": 59 },
                                "zone": { "type": "string" },
                                "initialExecutionTime": { "type": "integer", "format": "int64" }
                            }
                        },
                        "targetTopic": { "type": "string" },
                        "payload": {
                            "type": "object",
                            "required": ["data"],
                            "properties": {
                                "data": { "type": "string", "format": "byte" },
                                "attributes": {
                                    "type": "object",
                                    "additionalProperties": { "type": "string" }
                                }
                            }
                        },
                        "taskName": { "type": "string" }
                    }
                }
            }
        }
    })
}
