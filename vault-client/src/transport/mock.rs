//! Mock relay for testing.
//!
//! An in-memory relay: stores published events, answers filters, and lets
//! tests inject failures and inspect what was sent.

use super::{FailureReason, RelayTransport, TransportError, TransportOp};
use async_trait::async_trait;
use keyrelay_types::{Event, Filter, Kind, PublicKey};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Mock relay for testing.
///
/// Clones share state, so a test can keep a handle while the pool owns
/// another.
#[derive(Debug)]
pub struct MockRelay {
    url: String,
    inner: Arc<Mutex<MockRelayInner>>,
}

#[derive(Debug, Default)]
struct MockRelayInner {
    connected: bool,
    unreachable: bool,
    honor_deletions: bool,
    stored: Vec<Event>,
    published: Vec<Event>,
    reject_publish_with: Option<String>,
    fail_connect: VecDeque<FailureReason>,
    fail_publish: VecDeque<FailureReason>,
    fail_query: VecDeque<FailureReason>,
    query_delay: Option<Duration>,
    connect_attempts: u32,
    publish_attempts: u32,
    query_attempts: u32,
    close_calls: u32,
}

impl MockRelay {
    /// Create a new mock relay with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Arc::default(),
        }
    }

    /// A relay that refuses every connection.
    pub fn unreachable(url: impl Into<String>) -> Self {
        let relay = Self::new(url);
        relay.set_unreachable(true);
        relay
    }

    fn lock(&self) -> MutexGuard<'_, MockRelayInner> {
        // A panicking test thread must not cascade into unrelated assertions
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every connect attempt fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        let mut inner = self.lock();
        inner.unreachable = unreachable;
        if unreachable {
            inner.connected = false;
        }
    }

    /// Apply kind-5 deletion requests to stored events.
    pub fn set_honor_deletions(&self, honor: bool) {
        self.lock().honor_deletions = honor;
    }

    /// Reject every publish with this relay message (e.g. `"blocked: banned"`).
    pub fn reject_publish_with(&self, message: &str) {
        self.lock().reject_publish_with = Some(message.to_string());
    }

    /// Delay each query before streaming results.
    pub fn set_query_delay(&self, delay: Duration) {
        self.lock().query_delay = Some(delay);
    }

    /// Cause the next connect() to fail with the given reason.
    pub fn fail_next_connect(&self, reason: FailureReason) {
        self.lock().fail_connect.push_back(reason);
    }

    /// Cause the next `n` publish() calls to fail with the given reason.
    pub fn fail_next_publishes(&self, n: usize, reason: FailureReason) {
        let mut inner = self.lock();
        for _ in 0..n {
            inner.fail_publish.push_back(reason.clone());
        }
    }

    /// Cause the next `n` query() calls to fail with the given reason.
    pub fn fail_next_queries(&self, n: usize, reason: FailureReason) {
        let mut inner = self.lock();
        for _ in 0..n {
            inner.fail_query.push_back(reason.clone());
        }
    }

    /// Drop the connection as if the network went away.
    pub fn drop_connection(&self) {
        self.lock().connected = false;
    }

    /// Put an event straight into storage, bypassing publish.
    pub fn insert_stored(&self, event: Event) {
        let mut inner = self.lock();
        if !inner.stored.iter().any(|e| e.id == event.id) {
            inner.stored.push(event);
        }
    }

    /// Events currently stored.
    pub fn stored_events(&self) -> Vec<Event> {
        self.lock().stored.clone()
    }

    /// Every event successfully published, in order.
    pub fn published_events(&self) -> Vec<Event> {
        self.lock().published.clone()
    }

    /// Number of connect attempts made.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Number of publish attempts made.
    pub fn publish_attempts(&self) -> u32 {
        self.lock().publish_attempts
    }

    /// Number of query attempts made.
    pub fn query_attempts(&self) -> u32 {
        self.lock().query_attempts
    }

    /// Number of close() calls.
    pub fn close_calls(&self) -> u32 {
        self.lock().close_calls
    }

    fn error(&self, op: TransportOp, reason: FailureReason) -> TransportError {
        TransportError::new(op, self.url.clone(), reason)
    }
}

impl Clone for MockRelay {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Drop stored events a deletion request is entitled to remove.
///
/// The signer may delete its own events, and wraps whose `p` tag names it.
fn apply_deletion(stored: &mut Vec<Event>, deletion: &Event) {
    let signer: &PublicKey = &deletion.pubkey;
    let signer_hex = signer.to_hex();
    let targets: Vec<&str> = deletion.tag_values("e").collect();
    stored.retain(|event| {
        let targeted = targets.contains(&event.id.to_hex().as_str());
        let entitled = &event.pubkey == signer
            || (event.kind == Kind::GIFT_WRAP && event.tag_value("p") == Some(signer_hex.as_str()));
        !(targeted && entitled)
    });
}

#[async_trait]
impl RelayTransport for MockRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.connect_attempts += 1;

        if inner.unreachable {
            return Err(self.error(
                TransportOp::Connect,
                FailureReason::Unreachable("connection refused".into()),
            ));
        }

        // Check for forced failure
        if let Some(reason) = inner.fail_connect.pop_front() {
            return Err(self.error(TransportOp::Connect, reason));
        }

        inner.connected = true;
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.publish_attempts += 1;

        if !inner.connected {
            return Err(self.error(TransportOp::Publish, FailureReason::NotConnected));
        }

        // Check for forced failure
        if let Some(reason) = inner.fail_publish.pop_front() {
            return Err(self.error(TransportOp::Publish, reason));
        }
        if let Some(message) = inner.reject_publish_with.clone() {
            return Err(self.error(TransportOp::Publish, FailureReason::rejected(message)));
        }
        if !event.has_valid_id() {
            return Err(self.error(
                TransportOp::Publish,
                FailureReason::rejected("invalid: event id does not match"),
            ));
        }

        inner.published.push(event.clone());
        if inner.stored.iter().any(|e| e.id == event.id) {
            // Relays answer "duplicate:" here, which callers treat as accepted
            return Ok(());
        }
        if event.kind == Kind::DELETION && inner.honor_deletions {
            apply_deletion(&mut inner.stored, event);
        }
        inner.stored.push(event.clone());
        Ok(())
    }

    async fn query(
        &self,
        filter: &Filter,
        sink: mpsc::Sender<Event>,
    ) -> Result<usize, TransportError> {
        let (delay, mut matching) = {
            let mut inner = self.lock();
            inner.query_attempts += 1;

            if !inner.connected {
                return Err(self.error(TransportOp::Query, FailureReason::NotConnected));
            }
            if let Some(reason) = inner.fail_query.pop_front() {
                return Err(self.error(TransportOp::Query, reason));
            }

            let matching: Vec<Event> = inner
                .stored
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            (inner.query_delay, matching)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Newest first, like real relays, then apply the limit
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }

        let mut delivered = 0;
        for event in matching {
            if sink.send(event).await.is_err() {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.close_calls += 1;
        inner.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_types::{EventId, Signature, Tag, Timestamp, UnsignedEvent};

    fn event(pubkey: [u8; 32], kind: Kind, tags: Vec<Tag>, created_at: u64) -> Event {
        let unsigned = UnsignedEvent::new(
            PublicKey::new(pubkey),
            Timestamp::from_secs(created_at),
            kind,
            tags,
            String::new(),
        );
        let id = unsigned.compute_id();
        unsigned.into_signed(id, Signature::new([0u8; 64]))
    }

    async fn collect(relay: &MockRelay, filter: &Filter) -> Vec<Event> {
        let (tx, mut rx) = mpsc::channel(64);
        relay.query(filter, tx).await.unwrap();
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    // ===========================================
    // MockRelay Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_relay_connects() {
        let relay = MockRelay::new("wss://a.test");
        assert!(!relay.is_connected());

        relay.connect().await.unwrap();

        assert!(relay.is_connected());
        assert_eq!(relay.url(), "wss://a.test");
    }

    #[tokio::test]
    async fn mock_relay_stores_and_serves_events() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();

        let e1 = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        let e2 = event([1; 32], Kind::GIFT_WRAP, vec![], 20);
        relay.publish(&e1).await.unwrap();
        relay.publish(&e2).await.unwrap();

        let got = collect(&relay, &Filter::new().kind(Kind::GIFT_WRAP)).await;
        assert_eq!(got, vec![e2, e1]);
    }

    #[tokio::test]
    async fn mock_relay_deduplicates_by_id() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();

        let e = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        relay.publish(&e).await.unwrap();
        relay.publish(&e).await.unwrap();

        assert_eq!(relay.stored_events().len(), 1);
        assert_eq!(relay.published_events().len(), 2);
    }

    #[tokio::test]
    async fn mock_relay_applies_limit() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        for t in 0..5 {
            relay.insert_stored(event([1; 32], Kind::GIFT_WRAP, vec![], t));
        }

        let got = collect(&relay, &Filter::new().limit(2)).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].created_at, Timestamp::from_secs(4));
    }

    #[tokio::test]
    async fn mock_relay_requires_connection() {
        let relay = MockRelay::new("wss://a.test");
        let e = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        let err = relay.publish(&e).await.unwrap_err();
        assert_eq!(err.op, TransportOp::Publish);
        assert_eq!(err.reason, FailureReason::NotConnected);
    }

    #[tokio::test]
    async fn mock_relay_rejects_invalid_ids() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        let mut e = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        e.content = "changed".into();
        let err = relay.publish(&e).await.unwrap_err();
        assert!(matches!(err.reason, FailureReason::Rejected { .. }));
    }

    // ===========================================
    // Failure Injection Tests
    // ===========================================

    #[tokio::test]
    async fn unreachable_relay_fails_connect() {
        let relay = MockRelay::unreachable("wss://down.test");
        let err = relay.connect().await.unwrap_err();
        assert_eq!(err.op, TransportOp::Connect);
        assert!(matches!(err.reason, FailureReason::Unreachable(_)));
        assert_eq!(relay.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn fail_next_publishes_then_recovers() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        relay.fail_next_publishes(2, FailureReason::Timeout);

        let e = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        assert!(relay.publish(&e).await.is_err());
        assert!(relay.publish(&e).await.is_err());
        assert!(relay.publish(&e).await.is_ok());
        assert_eq!(relay.publish_attempts(), 3);
    }

    #[tokio::test]
    async fn reject_publish_with_message() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        relay.reject_publish_with("blocked: no thanks");

        let e = event([1; 32], Kind::GIFT_WRAP, vec![], 10);
        let err = relay.publish(&e).await.unwrap_err();
        assert!(matches!(
            err.reason,
            FailureReason::Rejected {
                category: keyrelay_core::RejectCategory::Blocked,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dropped_connection_requires_reconnect() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        relay.drop_connection();
        assert!(!relay.is_connected());

        let (tx, _rx) = mpsc::channel(1);
        assert!(relay.query(&Filter::new(), tx).await.is_err());
        relay.connect().await.unwrap();
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        relay.close().await.unwrap();
        relay.close().await.unwrap();
        assert!(!relay.is_connected());
        assert_eq!(relay.close_calls(), 2);
    }

    // ===========================================
    // Deletion Tests
    // ===========================================

    #[tokio::test]
    async fn deletions_ignored_by_default() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        let owner = [7u8; 32];
        let wrap = event(
            [1; 32],
            Kind::GIFT_WRAP,
            vec![Tag::pubkey(&PublicKey::new(owner))],
            10,
        );
        relay.publish(&wrap).await.unwrap();

        let deletion = event(owner, Kind::DELETION, vec![Tag::event(&wrap.id)], 11);
        relay.publish(&deletion).await.unwrap();

        let wraps = collect(&relay, &Filter::new().kind(Kind::GIFT_WRAP)).await;
        assert_eq!(wraps.len(), 1);
    }

    #[tokio::test]
    async fn honored_deletion_removes_recipient_wraps_only() {
        let relay = MockRelay::new("wss://a.test");
        relay.connect().await.unwrap();
        relay.set_honor_deletions(true);

        let owner = [7u8; 32];
        let mine = event(
            [1; 32],
            Kind::GIFT_WRAP,
            vec![Tag::pubkey(&PublicKey::new(owner))],
            10,
        );
        let theirs = event(
            [2; 32],
            Kind::GIFT_WRAP,
            vec![Tag::pubkey(&PublicKey::new([8u8; 32]))],
            10,
        );
        relay.publish(&mine).await.unwrap();
        relay.publish(&theirs).await.unwrap();

        let deletion = event(
            owner,
            Kind::DELETION,
            vec![Tag::event(&mine.id), Tag::event(&theirs.id)],
            11,
        );
        relay.publish(&deletion).await.unwrap();

        let remaining: Vec<EventId> = collect(&relay, &Filter::new().kind(Kind::GIFT_WRAP))
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(remaining, vec![theirs.id]);
    }
}
