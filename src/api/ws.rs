// =============================================================================
// WebSocket Handlers — live price and indicator channels
// =============================================================================
//
// `/ws/prices` and `/ws/indicators` each register one hub subscriber per
// socket. On connect the client receives a `connection` message, then:
//   - client text frames go to `BroadcastHub::handle_message`; replies come
//     back through the subscriber's own queue,
//   - everything the hub queues for the subscriber is written to the socket,
//   - Ping frames are answered with Pong,
//   - shutdown sends a Close frame.
//
// The subscriber is unregistered when the socket goes away, whichever side
// closed it.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::{Channel, ServerMessage};

// =============================================================================
// Upgrade handlers
// =============================================================================

pub async fn prices_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Channel::Prices))
}

pub async fn indicators_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Channel::Indicators))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    let (sender, receiver) = socket.split();
    run_session(sender, receiver, state, channel).await;
}

// =============================================================================
// Session loop
// =============================================================================

/// Drive one subscriber until either side hangs up or the service stops.
async fn run_session<S, R>(mut sender: S, mut receiver: R, state: Arc<AppState>, channel: Channel)
where
    S: Sink<Message, Error = axum::Error> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (id, mut outbound) = state.hub.register_subscriber(channel);
    let shutdown = state.shutdown.clone();

    let hello = ServerMessage::connected(id, channel).to_json();
    if let Err(e) = sender.send(Message::Text(hello)).await {
        warn!(client = %id, error = %e, "failed to send connection message");
        state.hub.unregister_subscriber(id);
        return;
    }

    loop {
        tokio::select! {
            // ── Hub -> client ───────────────────────────────────────────
            queued = outbound.recv() => {
                let Some(text) = queued else {
                    debug!(client = %id, "subscriber queue closed by hub");
                    break;
                };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(client = %id, error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            // ── Client -> hub ───────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(client = %id, msg = %text, "client message");
                        state.hub.handle_message(id, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(client = %id, error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        state.hub.send_to(id, &ServerMessage::error("binary frames are not supported"));
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(client = %id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %id, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => {
                        debug!(client = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.unregister_subscriber(id);
    info!(client = %id, ?channel, "WebSocket session closed");
}

// =============================================================================
// Tests
// =============================================================================
