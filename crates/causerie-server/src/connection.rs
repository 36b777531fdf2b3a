//! Per-socket session handling.
//!
//! Every WebSocket goes through three phases: an authentication handshake
//! (first frame, bounded by a timeout), registration (session registry,
//! presence, bus subscriptions for every conversation the user is in), and
//! the main loop that multiplexes client frames with bus fan-out.
//!
//! Fan-out passes through a per-connection [`DeliveryFilter`], which drops
//! the sender's own echo, events from blocked users, and duplicates the
//! at-least-once bus may redeliver.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use causerie_core::collab::Permission;
use causerie_core::filter::DeliveryFilter;
use causerie_core::{InboundMessage, MessagePipeline, PresenceTracker};
use causerie_shared::constants::{AUTH_TIMEOUT_SECS, DEDUP_WINDOW, PRESENCE_TOPIC, PROTOCOL_VERSION};
use causerie_shared::error::RejectKind;
use causerie_shared::events::BusEvent;
use causerie_shared::protocol::{ClientEvent, ServerEvent};
use causerie_shared::types::{DeliveryState, UserId};

use crate::api::AppState;

/// Handles decoded client events for one authenticated user.
///
/// Split out from the socket loop so the request/response logic is testable
/// without a WebSocket. `None` means the operation succeeded without a
/// direct reply (the effect arrives through bus fan-out instead).
struct EventHandler {
    user_id: UserId,
    pipeline: Arc<MessagePipeline>,
    presence: PresenceTracker,
}

impl EventHandler {
    async fn handle(&self, event: ClientEvent) -> Option<ServerEvent> {
        match event {
            ClientEvent::Authenticate { .. } => Some(ServerEvent::Error {
                kind: RejectKind::InvalidMessage,
                detail: "already authenticated".into(),
            }),

            ClientEvent::SendMessage {
                conversation_id,
                encrypted_content,
                encryption,
                content_type,
                reply_to,
            } => {
                let inbound = InboundMessage {
                    conversation_id,
                    encrypted_content,
                    encryption,
                    content_type,
                    reply_to,
                };
                match self.pipeline.send(self.user_id, inbound).await {
                    Ok(message) => Some(ServerEvent::Acknowledged { message }),
                    Err(e) => Some(reject(e)),
                }
            }

            ClientEvent::EditMessage {
                message_id,
                encrypted_content,
            } => match self
                .pipeline
                .edit(self.user_id, message_id, encrypted_content)
                .await
            {
                Ok(message) => Some(ServerEvent::Acknowledged { message }),
                Err(e) => Some(reject(e)),
            },

            ClientEvent::DeleteMessage { message_id } => {
                match self.pipeline.delete(self.user_id, message_id).await {
                    Ok(message) => Some(ServerEvent::Acknowledged { message }),
                    Err(e) => Some(reject(e)),
                }
            }

            ClientEvent::AckDelivered { message_id } => self
                .pipeline
                .ack(self.user_id, message_id, DeliveryState::Delivered)
                .await
                .err()
                .map(reject),

            ClientEvent::AckRead { message_id } => self
                .pipeline
                .ack(self.user_id, message_id, DeliveryState::Read)
                .await
                .err()
                .map(reject),

            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => self
                .pipeline
                .typing(self.user_id, conversation_id, is_typing)
                .await
                .err()
                .map(reject),

            ClientEvent::SetPresence { status } => {
                self.presence.set_status(self.user_id, status).await;
                None
            }

            ClientEvent::FetchHistory {
                conversation_id,
                cursor,
                after_seq,
                limit,
            } => match (cursor, after_seq) {
                (Some(_), Some(_)) => Some(ServerEvent::Error {
                    kind: RejectKind::InvalidMessage,
                    detail: "cursor and after_seq are mutually exclusive".into(),
                }),

                // Reconnect gap-fill: only what was appended after the
                // client's last known sequence, oldest first.
                (None, Some(seq)) => match self
                    .pipeline
                    .fetch_missed(self.user_id, conversation_id, seq, limit)
                    .await
                {
                    Ok(messages) => Some(ServerEvent::HistoryPage {
                        conversation_id,
                        messages,
                        next_cursor: None,
                    }),
                    Err(e) => Some(reject(e)),
                },

                (cursor, None) => match self
                    .pipeline
                    .fetch_history(self.user_id, conversation_id, cursor.as_deref(), limit)
                    .await
                {
                    Ok(page) => Some(ServerEvent::HistoryPage {
                        conversation_id,
                        messages: page.messages,
                        next_cursor: page.next_cursor,
                    }),
                    Err(e) => Some(reject(e)),
                },
            },
        }
    }
}

fn reject(err: causerie_core::PipelineError) -> ServerEvent {
    ServerEvent::Error {
        kind: err.reject_kind(),
        detail: err.to_string(),
    }
}

/// Bus event → wire event. The filter has already decided it is wanted.
fn translate(event: BusEvent) -> ServerEvent {
    match event {
        BusEvent::MessageNew(message) => ServerEvent::MessageNew { message },
        BusEvent::MessageUpdated(message) => ServerEvent::MessageUpdated { message },
        BusEvent::MessageDeleted {
            conversation_id,
            message_id,
        } => ServerEvent::MessageDeleted {
            conversation_id,
            message_id,
        },
        BusEvent::DeliveryChanged {
            conversation_id,
            message_id,
            user_id,
            status,
            at,
        } => ServerEvent::DeliveryChanged {
            conversation_id,
            message_id,
            user_id,
            status,
            at,
        },
        BusEvent::PresenceChanged {
            user_id,
            status,
            at,
        } => ServerEvent::PresenceChanged {
            user_id,
            status,
            at,
        },
        BusEvent::TypingChanged {
            conversation_id,
            user_id,
            is_typing,
        } => ServerEvent::TypingChanged {
            conversation_id,
            user_id,
            is_typing,
        },
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    match event.to_json() {
        Ok(json) => sink.send(Message::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize server event");
            Ok(())
        }
    }
}

/// Wait for the authenticate frame and verify it.
async fn auth_handshake(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
) -> Result<causerie_core::collab::AuthContext, String> {
    let frame = tokio::time::timeout(Duration::from_secs(AUTH_TIMEOUT_SECS), stream.next())
        .await
        .map_err(|_| "authentication timed out".to_string())?;

    let Some(Ok(Message::Text(text))) = frame else {
        return Err("expected an authenticate frame".into());
    };

    let ClientEvent::Authenticate { token } =
        ClientEvent::from_json(&text).map_err(|e| format!("malformed frame: {e}"))?
    else {
        return Err("first frame must be authenticate".into());
    };

    let context = state
        .authenticator
        .verify(&token)
        .map_err(|e| e.to_string())?;

    if !context.has(Permission::Chat) {
        return Err("token lacks chat permission".into());
    }

    Ok(context)
}

/// Drive one WebSocket connection to completion.
pub async fn run(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let context = match auth_handshake(&state, &mut stream).await {
        Ok(context) => context,
        Err(detail) => {
            debug!(%detail, "Connection rejected during handshake");
            let _ = send_event(
                &mut sink,
                &ServerEvent::Error {
                    kind: RejectKind::Unauthenticated,
                    detail,
                },
            )
            .await;
            let _ = sink.close().await;
            return;
        }
    };
    let user_id = context.user_id;

    if state.config.max_connections > 0
        && state.registry.total_sessions().await >= state.config.max_connections
    {
        warn!(user = %user_id.to_hex(), "Connection refused: server at capacity");
        let _ = send_event(
            &mut sink,
            &ServerEvent::Error {
                kind: RejectKind::Forbidden,
                detail: "server at capacity".into(),
            },
        )
        .await;
        let _ = sink.close().await;
        return;
    }

    // Registration: session registry, presence, bus subscriptions.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(64);
    let session_id = state.registry.register(user_id, outbound_tx).await;
    state.presence.on_session_registered(user_id).await;

    let conversations = match state.store.conversations_for_user(user_id).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "Failed to load conversations; dropping connection");
            state.registry.unregister(session_id).await;
            state.presence.on_session_unregistered(user_id).await;
            return;
        }
    };

    // One forwarder task per topic funnels decoded events into the loop.
    let (bus_tx, mut bus_rx) = mpsc::channel::<BusEvent>(256);
    let mut forwarders = Vec::new();
    let mut topics: Vec<String> = conversations.iter().map(|c| c.to_topic()).collect();
    topics.push(PRESENCE_TOPIC.to_string());
    for topic in topics {
        let mut sub = state.bus.subscribe(&topic);
        let tx = bus_tx.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(payload) => match BusEvent::from_bytes(&payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(topic = sub.topic(), error = %e, "Undecodable bus event"),
                    },
                    Err(causerie_bus::SubscriptionError::Lagged { skipped }) => {
                        // Keep going; history fetch covers the gap.
                        warn!(topic = sub.topic(), skipped, "Subscription lagged");
                    }
                    Err(causerie_bus::SubscriptionError::Closed) => break,
                }
            }
        }));
    }
    drop(bus_tx);

    info!(
        user = %user_id.to_hex(),
        session = %session_id.0,
        conversations = conversations.len(),
        "Session established"
    );

    let ready = ServerEvent::Ready {
        user_id,
        session_id,
        protocol: PROTOCOL_VERSION.to_string(),
        conversations: conversations.clone(),
    };
    if send_event(&mut sink, &ready).await.is_err() {
        cleanup(&state, session_id, user_id, forwarders).await;
        return;
    }

    let handler = EventHandler {
        user_id,
        pipeline: state.pipeline.clone(),
        presence: state.presence.clone(),
    };
    let mut filter = DeliveryFilter::new(user_id, DEDUP_WINDOW);

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let event = match ClientEvent::from_json(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                let err = ServerEvent::Error {
                                    kind: RejectKind::InvalidMessage,
                                    detail: format!("malformed frame: {e}"),
                                };
                                if send_event(&mut sink, &err).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        if let Some(reply) = handler.handle(event).await {
                            if send_event(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: ignored
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket read error");
                        break;
                    }
                }
            }

            Some(event) = bus_rx.recv() => {
                let blocked = state.block_list.blocked_by(user_id);
                if filter.should_forward(&event, &blocked) {
                    if send_event(&mut sink, &translate(event)).await.is_err() {
                        break;
                    }
                }
            }

            Some(event) = outbound_rx.recv() => {
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup(&state, session_id, user_id, forwarders).await;
    info!(user = %user_id.to_hex(), session = %session_id.0, "Session closed");
}

async fn cleanup(
    state: &AppState,
    session_id: causerie_shared::types::SessionId,
    user_id: UserId,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
) {
    for task in forwarders {
        task.abort();
    }
    state.registry.unregister(session_id).await;
    state.presence.on_session_unregistered(user_id).await;
}
