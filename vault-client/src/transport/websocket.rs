//! WebSocket relay transport using tungstenite.
//!
//! One connection per relay. A reader task routes incoming frames to the
//! caller waiting on them: `OK` to the matching publish, `EVENT`/`EOSE`/
//! `CLOSED` to the matching subscription. A writer task owns the sink.

use super::{FailureReason, RelayTransport, TransportError, TransportOp, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use keyrelay_core::RejectCategory;
use keyrelay_types::{ClientMessage, Event, EventId, Filter, RelayMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Frames buffered per subscription before the reader waits.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Messages buffered for the writer task.
const OUTBOUND_BUFFER: usize = 64;

/// Timeouts for a WebSocket relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketRelayConfig {
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Upper bound on waiting for an `OK`, or between query frames
    pub ack_timeout: Duration,
}

impl Default for WebSocketRelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Frame limits enforced by tungstenite while reading.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..WebSocketConfig::default()
    }
}

enum SubscriptionFrame {
    Event(Box<Event>),
    Eose,
    Closed(String),
}

#[derive(Default)]
struct Routes {
    acks: HashMap<EventId, oneshot::Sender<(bool, String)>>,
    subscriptions: HashMap<String, mpsc::Sender<SubscriptionFrame>>,
}

impl Routes {
    fn clear(&mut self) {
        // Dropping the senders wakes every waiter with a closed channel
        self.acks.clear();
        self.subscriptions.clear();
    }
}

#[derive(Clone)]
struct Link {
    outbound: mpsc::Sender<Message>,
    routes: Arc<Mutex<Routes>>,
    alive: Arc<AtomicBool>,
}

struct Connection {
    link: Link,
    reader: JoinHandle<()>,
}

impl Connection {
    fn shutdown(&self) {
        let _ = self.link.outbound.try_send(Message::Close(None));
        self.link.alive.store(false, Ordering::SeqCst);
        lock(&self.link.routes).clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A relay reached over `ws://` or `wss://`.
pub struct WebSocketRelay {
    url: String,
    config: WebSocketRelayConfig,
    dial: tokio::sync::Mutex<()>,
    conn: Mutex<Option<Connection>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WebSocketRelay {
    /// Create a transport for `url` with default timeouts. Does not connect.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, WebSocketRelayConfig::default())
    }

    /// Create a transport with explicit timeouts. Does not connect.
    pub fn with_config(url: impl Into<String>, config: WebSocketRelayConfig) -> Self {
        Self {
            url: url.into(),
            config,
            dial: tokio::sync::Mutex::new(()),
            conn: Mutex::new(None),
            next_subscription: AtomicU64::new(0),
        }
    }

    fn error(&self, op: TransportOp, reason: FailureReason) -> TransportError {
        TransportError::new(op, self.url.clone(), reason)
    }

    fn link(&self, op: TransportOp) -> Result<Link, TransportError> {
        match lock(&self.conn).as_ref() {
            Some(conn) if conn.link.alive.load(Ordering::SeqCst) => Ok(conn.link.clone()),
            _ => Err(self.error(op, FailureReason::NotConnected)),
        }
    }

    async fn send(
        &self,
        link: &Link,
        op: TransportOp,
        message: &ClientMessage,
    ) -> Result<(), TransportError> {
        let text = message
            .to_json()
            .map_err(|e| self.error(op, FailureReason::Protocol(e.to_string())))?;
        link.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| self.error(op, FailureReason::Closed("writer stopped".into())))
    }

    async fn drain(
        &self,
        frames: &mut mpsc::Receiver<SubscriptionFrame>,
        sink: &mpsc::Sender<Event>,
    ) -> Result<usize, TransportError> {
        let mut delivered = 0;
        loop {
            let next = tokio::time::timeout(self.config.ack_timeout, frames.recv());
            let frame = match next.await {
                Err(_) => return Err(self.error(TransportOp::Query, FailureReason::Timeout)),
                Ok(None) => {
                    return Err(self.error(
                        TransportOp::Query,
                        FailureReason::Closed("connection dropped during query".into()),
                    ))
                }
                Ok(Some(frame)) => frame,
            };
            match frame {
                SubscriptionFrame::Event(event) => {
                    if sink.send(*event).await.is_err() {
                        return Ok(delivered);
                    }
                    delivered += 1;
                }
                SubscriptionFrame::Eose => return Ok(delivered),
                SubscriptionFrame::Closed(message) => {
                    let reason = FailureReason::rejected(message);
                    return Err(self.error(TransportOp::Subscribe, reason));
                }
            }
        }
    }
}

fn connect_failure(err: WsError) -> FailureReason {
    match err {
        WsError::Http(response) => match response.status().as_u16() {
            401 => FailureReason::Unauthorized("HTTP 401".into()),
            403 => FailureReason::Forbidden("HTTP 403".into()),
            404 => FailureReason::NotFound("HTTP 404".into()),
            429 => FailureReason::RateLimited("HTTP 429".into()),
            status if status >= 500 => FailureReason::Unreachable(format!("HTTP {}", status)),
            status => FailureReason::Protocol(format!("unexpected HTTP status {}", status)),
        },
        WsError::Url(e) => FailureReason::InvalidEndpoint(e.to_string()),
        other => FailureReason::Unreachable(other.to_string()),
    }
}

/// Route one text frame. Subscription frames are returned for the reader to
/// deliver, so it can wait on a full subscriber without holding the routes.
fn route(
    url: &str,
    routes: &Mutex<Routes>,
    text: &str,
) -> Option<(mpsc::Sender<SubscriptionFrame>, SubscriptionFrame)> {
    let message = match RelayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("Ignoring unparsable frame from {}: {}", url, e);
            return None;
        }
    };

    let mut routes = lock(routes);
    match message {
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(tx) = routes.acks.remove(&event_id) {
                let _ = tx.send((accepted, message));
            }
            None
        }
        RelayMessage::Event {
            subscription_id,
            event,
        } => routes
            .subscriptions
            .get(&subscription_id)
            .map(|tx| (tx.clone(), SubscriptionFrame::Event(event))),
        RelayMessage::Eose(subscription_id) => routes
            .subscriptions
            .get(&subscription_id)
            .map(|tx| (tx.clone(), SubscriptionFrame::Eose)),
        RelayMessage::Closed {
            subscription_id,
            message,
        } => routes
            .subscriptions
            .remove(&subscription_id)
            .map(|tx| (tx, SubscriptionFrame::Closed(message))),
        RelayMessage::Notice(notice) => {
            tracing::info!("Notice from {}: {}", url, notice);
            None
        }
    }
}

async fn read_loop<S>(mut read: S, url: String, link: Link)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some((tx, frame)) = route(&url, &link.routes, &text) {
                    // A subscriber that stopped listening is not an error
                    let _ = tx.send(frame).await;
                }
            }
            Ok(Message::Ping(payload)) => {
                if link.outbound.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", url, e);
                break;
            }
        }
    }
    tracing::debug!("Reader for {} stopped", url);
    link.alive.store(false, Ordering::SeqCst);
    lock(&link.routes).clear();
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let _dial = self.dial.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(self.error(
                TransportOp::Connect,
                FailureReason::InvalidEndpoint(format!("unsupported scheme in {}", self.url)),
            ));
        }

        let dial = connect_async_with_config(self.url.as_str(), Some(socket_config()), false);
        let handshake = tokio::time::timeout(self.config.connect_timeout, dial);
        let (stream, _response) = match handshake.await {
            Err(_) => return Err(self.error(TransportOp::Connect, FailureReason::Timeout)),
            Ok(Err(e)) => return Err(self.error(TransportOp::Connect, connect_failure(e))),
            Ok(Ok(pair)) => pair,
        };

        let (mut write, read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let link = Link {
            outbound,
            routes: Arc::new(Mutex::new(Routes::default())),
            alive: Arc::new(AtomicBool::new(true)),
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });
        let reader = tokio::spawn(read_loop(read, self.url.clone(), link.clone()));

        let previous = lock(&self.conn).replace(Connection { link, reader });
        if let Some(previous) = previous {
            previous.shutdown();
        }
        tracing::info!("Connected to relay {}", self.url);
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<(), TransportError> {
        let link = self.link(TransportOp::Publish)?;
        let (tx, rx) = oneshot::channel();
        lock(&link.routes).acks.insert(event.id, tx);

        let message = ClientMessage::Event(Box::new(event.clone()));
        if let Err(e) = self.send(&link, TransportOp::Publish, &message).await {
            lock(&link.routes).acks.remove(&event.id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Err(_) => {
                lock(&link.routes).acks.remove(&event.id);
                Err(self.error(TransportOp::Publish, FailureReason::Timeout))
            }
            Ok(Err(_)) => Err(self.error(
                TransportOp::Publish,
                FailureReason::Closed("connection dropped before acknowledgement".into()),
            )),
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, message))) => {
                let category = RejectCategory::from_message(&message);
                if category.is_already_stored() {
                    tracing::debug!("{} already holds {}", self.url, event.id);
                    return Ok(());
                }
                Err(self.error(
                    TransportOp::Publish,
                    FailureReason::Rejected { category, message },
                ))
            }
        }
    }

    async fn query(
        &self,
        filter: &Filter,
        sink: mpsc::Sender<Event>,
    ) -> Result<usize, TransportError> {
        let link = self.link(TransportOp::Query)?;
        let subscription_id = format!(
            "keyrelay-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, mut frames) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&link.routes)
            .subscriptions
            .insert(subscription_id.clone(), tx);

        let request = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters: vec![filter.clone()],
        };
        let result = match self.send(&link, TransportOp::Query, &request).await {
            Ok(()) => self.drain(&mut frames, &sink).await,
            Err(e) => Err(e),
        };

        lock(&link.routes).subscriptions.remove(&subscription_id);
        if link.alive.load(Ordering::SeqCst) {
            let close = ClientMessage::Close(subscription_id);
            let _ = self.send(&link, TransportOp::Query, &close).await;
        }
        result
    }

    fn is_connected(&self) -> bool {
        lock(&self.conn)
            .as_ref()
            .map(|conn| conn.link.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(conn) = lock(&self.conn).take() {
            conn.shutdown();
            tracing::debug!("Closed connection to {}", self.url);
        }
        Ok(())
    }
}
