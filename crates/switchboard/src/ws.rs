//! Local WebSocket adapter.
//!
//! Development stand-in for the upstream gateway runtime: authenticates
//! the handshake from the `Authorization` query parameter, creates the
//! connection record, pumps inbound frames into the router, and forwards
//! outbound frames delivered through the local transport. Disconnect
//! cleanup always succeeds; the transport is already closed.

use crate::state::AppState;
use crate::store::{ConnectionRecord, ConnectionStore};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "Authorization")]
    authorization: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    // Auth is a connection-establishment property; frames after the
    // handshake are not re-authenticated.
    let Some(token) = params.authorization else {
        return (StatusCode::UNAUTHORIZED, "missing Authorization parameter").into_response();
    };

    let claims = match state.verifier.verify(&token).await {
        Ok(claims) => claims,
        Err(e) => {
            tracing::info!(error = %e, "handshake rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    if claims.is_expired() {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }

    ws.on_upgrade(move |socket| session(state, claims, socket))
}

async fn session(state: Arc<AppState>, claims: crate::auth::Claims, socket: WebSocket) {
    let connection_id = format!("conn_{}", Uuid::new_v4().simple());

    let record = match ConnectionRecord::new(
        &connection_id,
        &claims.user_id,
        &claims.tenant_id,
        "local",
        state.config.ttl.connection_ttl(),
    ) {
        Ok(record) => record.with_permissions(claims.permissions.clone()),
        Err(e) => {
            tracing::error!(error = %e, "failed to build connection record");
            return;
        }
    };

    let mut outbound = state.transport.register(&connection_id);
    if let Err(e) = state.connections.save(record).await {
        tracing::error!(connection_id, error = %e, "failed to save connection record");
        state.transport.unregister(&connection_id);
        return;
    }
    tracing::info!(
        connection_id,
        user_id = %claims.user_id,
        tenant_id = %claims.tenant_id,
        "connection established"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    // Every inbound frame refreshes liveness.
                    if let Err(e) = state.connections.update_last_ping(&connection_id).await {
                        tracing::warn!(connection_id, error = %e, "failed to refresh last_ping");
                    }
                    if let Err(e) = state.connections.record_receive(&connection_id).await {
                        tracing::warn!(connection_id, error = %e, "failed to bump received counter");
                    }

                    if let Err(e) = state
                        .router
                        .route(&state.cancel, text.as_str().as_bytes(), &connection_id)
                        .await
                    {
                        tracing::warn!(connection_id, error = %e, "route failed");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong/binary ignored
                Some(Err(e)) => {
                    tracing::debug!(connection_id, error = %e, "socket read error");
                    break;
                }
            },
        }
    }

    state.cleanup_connection(&connection_id).await;
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.health().await)
}
