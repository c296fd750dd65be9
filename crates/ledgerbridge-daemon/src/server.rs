//! HTTP and WebSocket front of the gateway.

use crate::handler::Gateway;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use ledgerbridge_core::MessageKind;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/app", get(upgrade))
        .route("/status", get(status))
        .route("/{action}", get(action))
        .with_state(gateway)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let broadcaster = gateway.spawn_state_broadcast();
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    broadcaster.abort();
    Ok(())
}

async fn status() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    tx: Option<String>,
}

async fn action(
    State(gateway): State<Arc<Gateway>>,
    Path(action): Path<String>,
    Query(query): Query<ActionQuery>,
) -> Response {
    let kind = match action.parse::<MessageKind>() {
        Ok(kind) if kind.is_action() => kind,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    tracing::debug!(%kind, "http action");
    let reply = gateway.handle_http(kind, query.tx.as_deref()).await;
    let status = if reply.kind == MessageKind::EventError {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, [(header::CONTENT_TYPE, "application/json")], reply.encode()).into_response()
}

async fn upgrade(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (id, mut outbound) = gateway.connect().await;
    let (mut sink, mut stream) = socket.split();
    tracing::debug!(id, "stream client connected");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // Signing waits on the user; keep reading meanwhile.
                    let gateway = gateway.clone();
                    tokio::spawn(async move { gateway.handle_text(id, text.as_str()).await });
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let gateway = gateway.clone();
                        tokio::spawn(async move { gateway.handle_text(id, &text).await });
                    }
                    Err(_) => {
                        tracing::debug!(id, "ignoring non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(id, "websocket error: {}", e);
                    break;
                }
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    if sink.send(Message::Text(message.encode().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    gateway.disconnect(id).await;
    tracing::debug!(id, "stream client disconnected");
}
