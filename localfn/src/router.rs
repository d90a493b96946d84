//! HTTP and WebSocket front end for the invocation engine

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use localfn_core::{EmulatorError, ErrorCode};
use localfn_lambda::{
    ChannelItem, ConnectionRegistry, Dispatcher, InvocationType, QueueChannel, Reply,
};

use crate::config::WebSocketConfig;

/// Shared state for the router
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub connections: Arc<ConnectionRegistry>,
    pub websocket: Option<WebSocketConfig>,
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(health_check))
        .route("/invoke/:function", post(invoke))
        .route("/ws", get(websocket_upgrade))
        .route(
            "/@connections/:connection_id",
            post(post_to_connection).delete(delete_connection),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let functions: Vec<String> = state
        .dispatcher
        .list_functions()
        .iter()
        .map(|f| f.function_key.clone())
        .collect();

    Json(json!({
        "status": "running",
        "functions": functions,
        "connections": state.connections.len(),
    }))
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    Path(function): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let invocation_type = match headers.get("x-amz-invocation-type") {
        None => InvocationType::RequestResponse,
        Some(value) => match value.to_str().ok().and_then(InvocationType::from_str) {
            Some(invocation_type) => invocation_type,
            None => {
                let error = EmulatorError::new(
                    ErrorCode::Configuration,
                    format!("Invalid invocation type: {:?}", value),
                );
                return reply_response(Reply::from_error(&error));
            }
        },
    };

    let event = parse_event(&body);
    info!(function = %function, invocation_type = ?invocation_type, "Invoke request");

    let reply = state
        .dispatcher
        .invoke_with_type(&function, event, invocation_type)
        .await;

    reply_response(reply)
}

/// Request body as an event: JSON when it parses, text otherwise
fn parse_event(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }

    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in reply.headers.iter().flatten() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid reply header"),
        }
    }

    if !headers.contains_key(header::CONTENT_TYPE) && !matches!(reply.body, Some(Value::String(_)) | None) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    (status, headers, reply.body_text()).into_response()
}

async fn post_to_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    body: Bytes,
) -> Response {
    match state.connections.send(&connection_id, Some(body)) {
        Some(true) => StatusCode::OK.into_response(),
        Some(false) => gone(&connection_id),
        None => {
            let error = EmulatorError::new(ErrorCode::Configuration, "Message payload is empty");
            reply_response(Reply::from_error(&error))
        }
    }
}

async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Response {
    if state.connections.remove(&connection_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        gone(&connection_id)
    }
}

fn gone(connection_id: &str) -> Response {
    let error = EmulatorError::new(
        ErrorCode::Gone,
        format!("Connection {} is gone", connection_id),
    );
    reply_response(Reply::from_error(&error))
}

async fn websocket_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (channel, mut outbound) = QueueChannel::new();
    state.connections.register(connection_id.clone(), channel);
    info!(connection_id = %connection_id, "WebSocket connected");

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                ChannelItem::Data(bytes) => {
                    if sender.send(outbound_message(bytes)).await.is_err() {
                        break;
                    }
                }
                ChannelItem::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let body = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        dispatch_message(&state, &connection_id, body).await;
    }

    // The peer is gone; an explicit remove may already have closed it.
    state.connections.forget(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Frame for a pushed payload; bytes that are not UTF-8 go out unchanged as binary
fn outbound_message(bytes: Bytes) -> Message {
    match std::str::from_utf8(&bytes) {
        Ok(text) => Message::Text(text.to_string()),
        Err(_) => Message::Binary(bytes.to_vec()),
    }
}

async fn dispatch_message(state: &AppState, connection_id: &str, body: String) {
    let Some(websocket) = &state.websocket else {
        debug!(connection_id = %connection_id, "No websocket function configured, dropping message");
        return;
    };

    let event = json!({
        "requestContext": {
            "connectionId": connection_id,
            "eventType": "MESSAGE",
            "routeKey": websocket.route_key,
            "requestTimeEpoch": chrono::Utc::now().timestamp_millis(),
        },
        "body": body,
        "isBase64Encoded": false,
    });

    let reply = state.dispatcher.invoke(&websocket.function, event).await;
    if reply.status_code >= 400 {
        warn!(
            connection_id = %connection_id,
            function = %websocket.function,
            status = reply.status_code,
            "WebSocket message handler failed"
        );
    }
}
