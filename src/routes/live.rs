use crate::{
    broadcast::{BroadcastStats, ChannelSubscriber},
    server::SharedState,
};
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Json, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

pub async fn live_feed(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (subscriber, mut rx) = ChannelSubscriber::new(state.live_feed.subscriber_buffer);
    let id = state.broadcaster.connect(Arc::new(subscriber));
    state
        .metrics
        .record_live_connections(state.broadcaster.active_connections());

    let (mut sender, mut receiver) = socket.split();

    // Drains this connection's queue. Ends when the manager drops the subscriber.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let Some(message) = text_message(payload) else {
                continue;
            };
            if let Err(e) = sender.send(message).await {
                tracing::debug!(connection = %id, "Live send failed: {}", e);
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Clients are not expected to send anything; inbound frames are read and dropped.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => tracing::debug!(connection = %id, "Ignoring inbound live message"),
                Err(e) => {
                    tracing::debug!(connection = %id, "Live connection error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.broadcaster.disconnect(id);
    state
        .metrics
        .record_live_connections(state.broadcaster.active_connections());
}

/// Wraps a serialized payload as a text frame without copying it.
fn text_message(payload: Bytes) -> Option<Message> {
    match Utf8Bytes::try_from(payload) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!("Live payload is not valid UTF-8: {}", e);
            None
        }
    }
}

pub async fn live_stats(State(state): State<SharedState>) -> Json<BroadcastStats> {
    Json(state.broadcaster.stats())
}
