//! HTTP routes around the failover client

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{debug, error};
use warden_client::{Error, FailoverClient};

pub fn router(client: Arc<FailoverClient>) -> Router {
    Router::new()
        .route("/liveness", get(probe))
        .route("/readiness", get(probe))
        .route("/employee", post(add_employee))
        .route("/employee/:id", get(get_employee).delete(delete_employee))
        .fallback(unknown_route)
        .with_state(client)
}

async fn probe() -> StatusCode {
    StatusCode::OK
}

/// Stores the raw body under its `id` field.
async fn add_employee(State(client): State<Arc<FailoverClient>>, body: Bytes) -> Response {
    let Ok(text) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(id) = employee_id(text) else {
        debug!("request body carries no id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    match client.set(&id, text).await {
        Ok(()) => Json("OK").into_response(),
        Err(e) => failure("add", e),
    }
}

async fn get_employee(
    State(client): State<Arc<FailoverClient>>,
    Path(id): Path<String>,
) -> Response {
    match client.get(&id).await {
        Ok(Some(document)) => Json(document).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => failure("get", e),
    }
}

async fn delete_employee(
    State(client): State<Arc<FailoverClient>>,
    Path(id): Path<String>,
) -> Response {
    match client.delete(&id).await {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => failure("delete", e),
    }
}

async fn unknown_route(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "fail",
            "message": format!("Route '{}' does not exist", uri),
        })),
    )
}

/// `id` as a string, or the literal text of a scalar id.
fn employee_id(body: &str) -> Option<String> {
    let document: Value = serde_json::from_str(body).ok()?;
    match document.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn failure(op: &str, e: Error) -> Response {
    match e {
        Error::Timeout { .. } => StatusCode::REQUEST_TIMEOUT.into_response(),
        other => {
            error!(op, error = %other, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
