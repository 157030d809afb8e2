//! Real-time order-event stream attached to the primary listener.
//!
//! [`attach`] is the only way to obtain an [`EventStreamService`]; without an
//! event-bus client it asks the terminator to end the process and reports
//! [`StreamBootstrapError::MissingEventBus`].

use std::{sync::Arc, time::Instant};

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::broadcast::{error::RecvError, Receiver},
    time::interval,
};
use tracing::{debug, error, info, warn};

use gateway_domain::capability::{AppDependencies, EventBusClient, StreamOptions};
use gateway_domain::model::OrderEvent;

use crate::supervisor::Supervisor;

const ORDERS_CHANNEL: &str = "orders";
const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamBootstrapError {
    #[error("event bus client missing; real-time stream cannot start")]
    MissingEventBus,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket protocol error: {0}")]
    Protocol(String),
}

/// Event service bound to the event-bus client. Cloned into every worker.
#[derive(Clone)]
pub struct EventStreamService {
    client: Arc<dyn EventBusClient>,
    options: StreamOptions,
    supervisor: Arc<Supervisor>,
}

impl EventStreamService {
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::new(self.clone()))
            .route(self.options.path(), web::get().to(stream_handler));
    }
}

pub fn attach(
    deps: &AppDependencies,
    supervisor: &Arc<Supervisor>,
) -> Result<EventStreamService, StreamBootstrapError> {
    match &deps.event_bus_client {
        Some(client) => {
            info!(path = deps.stream_options.path(), "real-time stream attached");
            Ok(EventStreamService {
                client: Arc::clone(client),
                options: deps.stream_options.clone(),
                supervisor: Arc::clone(supervisor),
            })
        }
        None => {
            error!("could not establish event bus connection, exiting");
            supervisor.terminator().exit(FAILURE_EXIT_CODE);
            Err(StreamBootstrapError::MissingEventBus)
        }
    }
}

async fn stream_handler(
    req: HttpRequest,
    body: web::Payload,
    stream: web::Data<EventStreamService>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, messages) = actix_ws::handle(&req, body)?;
    counter!("gateway_stream_sessions_total", "result" => "opened").increment(1);

    let events = stream.client.subscribe();
    let options = stream.options.clone();
    stream
        .supervisor
        .spawn_observed("stream_session", run_session(session, messages, events, options));

    Ok(response)
}

async fn run_session(
    mut session: Session,
    mut messages: MessageStream,
    mut events: Receiver<OrderEvent>,
    options: StreamOptions,
) -> Result<(), StreamError> {
    let mut subscriptions: Vec<Subscription> = Vec::new();
    let mut heartbeat = interval(options.heartbeat_interval());
    let mut last_seen = Instant::now();

    // A failed send means the peer is gone; that ends the session normally.
    let reason = 'session: loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > options.client_timeout() {
                    debug!("stream client timed out");
                    counter!("gateway_stream_sessions_total", "result" => "timed_out").increment(1);
                    break Some(CloseReason::from(CloseCode::Away));
                }
                if session.ping(b"").await.is_err() {
                    break 'session None;
                }
            }
            message = messages.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Some(reply) = handle_client_message(&text, &mut subscriptions) {
                            if session.text(reply).await.is_err() {
                                break 'session None;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        last_seen = Instant::now();
                        if session.pong(&bytes).await.is_err() {
                            break 'session None;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => break reason,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(err)) => {
                        counter!("gateway_stream_sessions_total", "result" => "protocol_error")
                            .increment(1);
                        return Err(StreamError::Protocol(err.to_string()));
                    }
                    None => break None,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        for frame in updates_for(&event, &subscriptions) {
                            if session.text(frame).await.is_err() {
                                break 'session None;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stream subscriber lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => {
                        info!("event bus closed; ending stream session");
                        break Some(CloseReason::from(CloseCode::Away));
                    }
                }
            }
        }
    };

    counter!("gateway_stream_sessions_total", "result" => "closed").increment(1);
    // The peer may already be gone.
    let _ = session.close(reason).await;
    Ok(())
}

/// Optional constraints carried by a subscribe message. Absent fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    pub maker_token: Option<String>,
    pub taker_token: Option<String>,
    pub maker_address: Option<String>,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &OrderEvent) -> bool {
        fn field_matches(expected: &Option<String>, actual: &str) -> bool {
            expected
                .as_deref()
                .is_none_or(|expected| expected.eq_ignore_ascii_case(actual))
        }

        field_matches(&self.maker_token, &event.maker_token)
            && field_matches(&self.taker_token, &event.taker_token)
            && field_matches(&self.maker_address, &event.maker_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub request_id: String,
    pub filter: SubscriptionFilter,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        channel: String,
        request_id: String,
        #[serde(default)]
        payload: SubscriptionFilter,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { request_id: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerMessage<'a> {
    #[serde(rename_all = "camelCase")]
    Update {
        channel: &'static str,
        request_id: &'a str,
        payload: [&'a OrderEvent; 1],
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<&'a str>,
        reason: String,
    },
}

fn encode(message: &ServerMessage<'_>) -> Option<String> {
    serde_json::to_string(message)
        .map_err(|err| warn!(%err, "failed to encode stream message"))
        .ok()
}

/// Applies one client text frame to the session's subscriptions. Returns the
/// error frame to send back, if any; the session stays open either way.
pub fn handle_client_message(text: &str, subscriptions: &mut Vec<Subscription>) -> Option<String> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            return encode(&ServerMessage::Error {
                request_id: None,
                reason: format!("malformed message: {err}"),
            })
        }
    };

    match message {
        ClientMessage::Subscribe {
            channel,
            request_id,
            payload,
        } => {
            if channel != ORDERS_CHANNEL {
                return encode(&ServerMessage::Error {
                    request_id: Some(&request_id),
                    reason: format!("unsupported channel `{channel}`"),
                });
            }
            subscriptions.retain(|existing| existing.request_id != request_id);
            subscriptions.push(Subscription {
                request_id,
                filter: payload,
            });
            None
        }
        ClientMessage::Unsubscribe { request_id } => {
            subscriptions.retain(|existing| existing.request_id != request_id);
            None
        }
    }
}

/// Update frames for every subscription the event satisfies.
pub fn updates_for(event: &OrderEvent, subscriptions: &[Subscription]) -> Vec<String> {
    subscriptions
        .iter()
        .filter(|subscription| subscription.filter.matches(event))
        .filter_map(|subscription| {
            encode(&ServerMessage::Update {
                channel: ORDERS_CHANNEL,
                request_id: &subscription.request_id,
                payload: [event],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testing::RecordingTerminator;
    use actix_web::{
        dev::Payload, error::PayloadError, http::header, test::TestRequest, web::Bytes,
        FromRequest,
    };
    use futures::stream;
    use gateway_domain::model::OrderEventKind;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn event(maker_token: &str, taker_token: &str) -> OrderEvent {
        OrderEvent {
            order_hash: "0x01".into(),
            maker_address: "0xmaker".into(),
            maker_token: maker_token.into(),
            taker_token: taker_token.into(),
            kind: OrderEventKind::Added,
            order: json!({"salt": "1"}),
        }
    }

    fn subscribe(subscriptions: &mut Vec<Subscription>, request_id: &str, payload: Value) {
        let message = json!({
            "type": "subscribe",
            "channel": "orders",
            "requestId": request_id,
            "payload": payload,
        });
        assert_eq!(handle_client_message(&message.to_string(), subscriptions), None);
    }

    #[test]
    fn subscriptions_receive_only_matching_events() {
        let mut subscriptions = Vec::new();
        subscribe(&mut subscriptions, "all", json!({}));
        subscribe(&mut subscriptions, "weth", json!({"makerToken": "0xAAA"}));

        let frames = updates_for(&event("0xaaa", "0xbbb"), &subscriptions);
        assert_eq!(frames.len(), 2);

        let frames = updates_for(&event("0xccc", "0xbbb"), &subscriptions);
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "update");
        assert_eq!(frame["channel"], "orders");
        assert_eq!(frame["requestId"], "all");
        assert_eq!(frame["payload"][0]["makerToken"], "0xccc");
    }

    #[test]
    fn resubscribing_replaces_and_unsubscribe_removes() {
        let mut subscriptions = Vec::new();
        subscribe(&mut subscriptions, "a", json!({"takerToken": "0x1"}));
        subscribe(&mut subscriptions, "a", json!({"takerToken": "0x2"}));
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].filter.taker_token.as_deref(), Some("0x2"));

        let reply = handle_client_message(
            &json!({"type": "unsubscribe", "requestId": "a"}).to_string(),
            &mut subscriptions,
        );
        assert_eq!(reply, None);
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn bad_messages_yield_error_frames() {
        let mut subscriptions = Vec::new();

        let reply = handle_client_message("not json", &mut subscriptions).unwrap();
        let frame: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(frame["type"], "error");
        assert!(frame.get("requestId").is_none());

        let reply = handle_client_message(
            &json!({"type": "subscribe", "channel": "fills", "requestId": "x"}).to_string(),
            &mut subscriptions,
        )
        .unwrap();
        let frame: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(frame["requestId"], "x");
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn missing_event_bus_exits_non_zero() {
        let terminator = Arc::new(RecordingTerminator::default());
        let supervisor = Arc::new(Supervisor::with_terminator(terminator.clone()));
        let deps = crate::tests::stub_dependencies();

        let err = attach(&deps, &supervisor).err().expect("attach refuses");
        assert_eq!(err, StreamBootstrapError::MissingEventBus);
        assert_eq!(terminator.codes(), vec![FAILURE_EXIT_CODE]);
    }

    #[actix_web::test]
    async fn vanished_peer_ends_the_session_without_error() {
        let req = TestRequest::get()
            .insert_header((header::UPGRADE, "websocket"))
            .insert_header((header::CONNECTION, "upgrade"))
            .insert_header((header::SEC_WEBSOCKET_VERSION, "13"))
            .insert_header((header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_http_request();
        // The client never sends anything, so only the heartbeat can fire.
        let mut silent: Payload = Payload::Stream {
            payload: Box::pin(stream::pending::<Result<Bytes, PayloadError>>()),
        };
        let body = web::Payload::from_request(&req, &mut silent)
            .await
            .expect("payload");
        let (response, session, messages) = actix_ws::handle(&req, body).expect("handshake");
        drop(response);

        let (_publisher, events) = broadcast::channel(4);
        let options = StreamOptions::new("/ws", Duration::from_secs(1));
        let outcome = run_session(session, messages, events, options).await;
        assert!(outcome.is_ok());
    }
}
