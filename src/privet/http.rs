//! Axum adapter for the Privet handler.
//!
//! The host owns the listener (and TLS termination); this module only
//! turns HTTP requests into handler calls and handler results into
//! responses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use serde_json::{json, Value};
use tracing::info;

use crate::privet::handler::PrivetHandler;

/// Build a router that forwards every request to the Privet handler.
pub fn create_router(handler: Arc<PrivetHandler>) -> Router {
    Router::new().fallback(dispatch).with_state(handler)
}

/// Bind and serve the local API. Convenience for hosts without their own
/// listener plumbing.
pub async fn serve(handler: Arc<PrivetHandler>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "privet", addr = %addr, "privet listener started");
    axum::serve(listener, create_router(handler)).await
}

async fn dispatch(
    State(handler): State<Arc<PrivetHandler>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut input: Option<Value> = if body.is_empty() {
        Some(json!({}))
    } else {
        serde_json::from_slice(&body).ok()
    };

    // Query parameters fold into the input document, so GET routes can
    // carry parameters like `id` the way POST bodies do.
    if let (Some(Value::Object(map)), Some(query)) = (input.as_mut(), uri.query()) {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.entry(name.into_owned())
                .or_insert_with(|| Value::String(value.into_owned()));
        }
    }

    let response = handler.handle_request(
        method.as_str(),
        uri.path(),
        auth_header.as_deref(),
        input,
    );
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}
