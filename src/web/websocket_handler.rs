use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::server::subscription_manager::{ClientId, HubEvent};
use crate::server::trade_ingest::Ingested;
use crate::services::auth_service;
use crate::web::AppState;
use crate::web::error::AppError;
use crate::web::models::WebSocketAuthQuery;

/// Bots push fills and errors here. Every message is acknowledged; a bad
/// message is answered with an error and the socket stays open.
pub async fn trade_history_handler(ws: WebSocketUpgrade, State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bot_socket(socket, app_state))
}

async fn handle_bot_socket(mut socket: WebSocket, app_state: Arc<AppState>) {
    info!("Bot event socket connected.");
    while let Some(Ok(msg)) = socket.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Ping(p) => {
                if socket.send(Message::Pong(p)).await.is_err() {
                    break;
                }
                continue;
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Pong(_) => continue,
        };

        let reply = match serde_json::from_str::<Value>(text.as_str()) {
            Ok(message) => match app_state.ingest.ingest_message(message).await {
                Ok(Ingested::Trade(entry)) => json!({ "message": "Message received", "trade_id": entry.id }),
                Ok(Ingested::Error(entry)) => json!({ "message": "Message received", "error_id": entry.id }),
                Ok(Ingested::Ignored) => json!({ "message": "Message received" }),
                Err(e) => {
                    warn!(error = %e, "Rejected bot event.");
                    json!({ "error": e.to_string() })
                }
            },
            Err(e) => {
                warn!(error = %e, "Bot sent a message that is not JSON.");
                json!({ "error": format!("Invalid JSON: {e}") })
            }
        };
        if socket.send(Message::Text(Utf8Bytes::from(reply.to_string()))).await.is_err() {
            break;
        }
    }
    info!("Bot event socket closed.");
}

/// Backtest results for one client. Whatever a peer sends on this socket is
/// relayed to every socket of the same client.
pub async fn backtest_result_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<ClientId>,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscription(socket, app_state, client_id, true))
}

/// Live events for the authenticated caller. Token comes from `?token=`.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<WebSocketAuthQuery>,
) -> impl IntoResponse {
    let token = match query.token {
        Some(token) => token,
        None => {
            return AppError::Unauthorized("Missing authentication token".to_string()).into_response();
        }
    };
    let user = match auth_service::authenticate_token(&token, &app_state.config.jwt_secret) {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "WebSocket authentication failed.");
            return e.into_response();
        }
    };
    info!(user_id = user.id, "User authenticated for event socket.");
    ws.on_upgrade(move |socket| handle_subscription(socket, app_state, user.id, false))
}

async fn handle_subscription(mut socket: WebSocket, app_state: Arc<AppState>, client_id: ClientId, relay_inbound: bool) {
    let mut subscription = app_state.hub.subscribe(client_id);

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                // `None` means the hub pruned this channel.
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&*event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(client_id, error = %e, "Failed to serialize hub event.");
                        continue;
                    }
                };
                if socket.send(Message::Text(Utf8Bytes::from(payload))).await.is_err() {
                    debug!(client_id, "Send failed. Closing subscription.");
                    break;
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(t))) => {
                        if t.as_str() == "ping" {
                            if socket.send(Message::Text(Utf8Bytes::from("pong"))).await.is_err() {
                                break;
                            }
                        } else if relay_inbound {
                            match serde_json::from_str::<Value>(t.as_str()) {
                                Ok(result) => {
                                    let delivered = app_state.hub.publish(client_id, HubEvent::BacktestResult(result));
                                    debug!(client_id, delivered, "Relayed backtest result.");
                                }
                                Err(e) => warn!(client_id, error = %e, "Ignoring non-JSON backtest message."),
                            }
                        }
                    }
                    Some(Ok(Message::Ping(p))) => {
                        if socket.send(Message::Pong(p)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    app_state.hub.unsubscribe(&subscription.handle);
    info!(client_id, "Client subscription closed.");
}
