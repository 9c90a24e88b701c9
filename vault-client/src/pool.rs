//! Relay pool: parallel fan-out over every configured endpoint.
//!
//! Each call spawns one task per endpoint into a [`JoinSet`]. Every attempt
//! waits for the shared rate limiter, reconnects if the endpoint dropped, then
//! runs the operation; transient failures are retried under the pool's
//! backoff schedule.
//!
//! - publish succeeds when at least one endpoint accepts
//! - query merges and de-duplicates by event id, and returns when every
//!   endpoint has finished or the deadline passes

use crate::config::{RetryConfig, VaultConfig};
use crate::resilience::{retry, RateLimiter, RetryOutcome};
use crate::transport::{
    FailureReason, RelayTransport, TransportError, TransportOp, WebSocketRelay,
};
use keyrelay_core::BackoffPolicy;
use keyrelay_types::{Event, EventId, Filter};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

/// Events buffered between endpoint tasks and the merger.
const QUERY_BUFFER: usize = 256;

/// Retry schedules used by the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolPolicies {
    /// Schedule for publishing
    pub publish: BackoffPolicy,
    /// Schedule for querying
    pub query: BackoffPolicy,
}

impl Default for PoolPolicies {
    fn default() -> Self {
        Self {
            publish: BackoffPolicy::interactive_publish(),
            query: BackoffPolicy::background_query(),
        }
    }
}

impl PoolPolicies {
    /// Build from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            publish: config.publish_policy(),
            query: config.query_policy(),
        }
    }
}

/// What went wrong at one endpoint, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    /// Endpoint URL
    pub endpoint: String,
    /// Last error seen
    pub error: TransportError,
    /// Attempts made
    pub attempts: u32,
}

/// Result of connecting the pool.
#[derive(Debug, Clone, Default)]
pub struct ConnectReport {
    /// Endpoints now connected
    pub connected: Vec<String>,
    /// Endpoints that could not be reached
    pub failures: Vec<EndpointFailure>,
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReport {
    /// Event that was published
    pub event_id: EventId,
    /// Endpoints that accepted it
    pub accepted: Vec<String>,
    /// Endpoints that did not
    pub failures: Vec<EndpointFailure>,
}

/// Result of a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Events from all endpoints, de-duplicated by id, newest first
    pub events: Vec<Event>,
    /// Endpoints that failed or had not finished by the deadline
    pub failures: Vec<EndpointFailure>,
    /// Whether the deadline cut the query short
    pub timed_out: bool,
}

/// Pool-level errors.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// No endpoints are configured.
    #[error("no relay endpoints configured")]
    NoEndpoints,

    /// The pool was closed.
    #[error("relay pool is closed")]
    Closed,

    /// No endpoint accepted the event.
    #[error("publish of {event_id} failed on all {} endpoints", .failures.len())]
    Publish {
        /// Event that was rejected
        event_id: EventId,
        /// One entry per endpoint
        failures: Vec<EndpointFailure>,
    },

    /// No endpoint finished the query successfully.
    #[error("query failed on all {} endpoints", .failures.len())]
    Query {
        /// One entry per endpoint
        failures: Vec<EndpointFailure>,
    },
}

/// A set of relays driven together.
pub struct RelayPool {
    endpoints: RwLock<Vec<Arc<dyn RelayTransport>>>,
    limiter: RateLimiter,
    policies: PoolPolicies,
    closed: AtomicBool,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("policies", &self.policies)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reconnect if needed, wait for a slot.
async fn ready(
    transport: &dyn RelayTransport,
    limiter: &RateLimiter,
) -> Result<(), TransportError> {
    limiter.wait_for_slot().await;
    if !transport.is_connected() {
        tracing::debug!("Reconnecting to {}", transport.url());
        transport.connect().await?;
    }
    Ok(())
}

async fn publish_once(
    transport: &dyn RelayTransport,
    limiter: &RateLimiter,
    event: &Event,
) -> Result<(), TransportError> {
    ready(transport, limiter).await?;
    transport.publish(event).await
}

async fn query_once(
    transport: &dyn RelayTransport,
    limiter: &RateLimiter,
    filter: &Filter,
    sink: mpsc::Sender<Event>,
) -> Result<usize, TransportError> {
    ready(transport, limiter).await?;
    transport.query(filter, sink).await
}

/// Failures for endpoints whose task never reported back.
fn unfinished(
    urls: &[String],
    finished: &[bool],
    op: TransportOp,
    reason: FailureReason,
    attempts: impl Fn(usize) -> u32,
) -> Vec<EndpointFailure> {
    urls.iter()
        .zip(finished)
        .enumerate()
        .filter(|(_, (_, done))| !**done)
        .map(|(index, (url, _))| EndpointFailure {
            endpoint: url.clone(),
            error: TransportError::new(op, url.clone(), reason.clone()),
            attempts: attempts(index),
        })
        .collect()
}

impl RelayPool {
    /// Create an empty pool. Endpoints are added by [`RelayPool::connect`].
    pub fn new(limiter: RateLimiter, policies: PoolPolicies) -> Self {
        Self {
            endpoints: RwLock::new(Vec::new()),
            limiter,
            policies,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a pool of WebSocket relays from configuration and connect them.
    ///
    /// The caller validates `config` first.
    pub async fn from_config(config: &VaultConfig) -> Result<(Self, ConnectReport), PoolError> {
        let pool = Self::new(
            RateLimiter::from_config(&config.rate_limit),
            PoolPolicies::from_config(&config.retry),
        );
        let transport = config.transport_config();
        let endpoints = config.relays.iter().map(|url| {
            let relay = WebSocketRelay::with_config(url.as_str(), transport);
            Arc::new(relay) as Arc<dyn RelayTransport>
        });
        let report = pool.connect(endpoints).await?;
        Ok((pool, report))
    }

    /// Shared rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Retry schedules.
    pub fn policies(&self) -> &PoolPolicies {
        &self.policies
    }

    /// URLs of every registered endpoint.
    pub async fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|t| t.url().to_string())
            .collect()
    }

    /// Whether [`RelayPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> Result<Vec<Arc<dyn RelayTransport>>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let endpoints = self.endpoints.read().await.clone();
        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }
        Ok(endpoints)
    }

    /// Register `endpoints` and connect every registered endpoint in parallel.
    ///
    /// Unreachable endpoints are reported and stay registered; later
    /// operations retry them.
    pub async fn connect<I>(&self, endpoints: I) -> Result<ConnectReport, PoolError>
    where
        I: IntoIterator<Item = Arc<dyn RelayTransport>>,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        self.endpoints.write().await.extend(endpoints);
        let endpoints = self.snapshot().await?;

        let mut tasks = JoinSet::new();
        for transport in endpoints {
            tasks.spawn(async move {
                let result = transport.connect().await;
                (transport.url().to_string(), result)
            });
        }

        let mut report = ConnectReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((url, Ok(()))) => report.connected.push(url),
                Ok((url, Err(error))) => {
                    tracing::warn!("Could not connect to {}: {}", url, error.reason);
                    report.failures.push(EndpointFailure {
                        endpoint: url,
                        error,
                        attempts: 1,
                    });
                }
                Err(e) => tracing::warn!("Connect task failed: {}", e),
            }
        }
        tracing::info!(
            "Connected to {}/{} relays",
            report.connected.len(),
            report.connected.len() + report.failures.len()
        );
        Ok(report)
    }

    /// Broadcast an event to every endpoint.
    ///
    /// # Errors
    ///
    /// [`PoolError::Publish`] when no endpoint accepted the event.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport, PoolError> {
        let endpoints = self.snapshot().await?;
        let urls: Vec<String> = endpoints.iter().map(|t| t.url().to_string()).collect();

        let mut tasks = JoinSet::new();
        for (index, transport) in endpoints.into_iter().enumerate() {
            let limiter = self.limiter.clone();
            let policy = self.policies.publish;
            let event = event.clone();
            tasks.spawn(async move {
                let outcome = retry(&policy, |_| {
                    publish_once(transport.as_ref(), &limiter, &event)
                })
                .await;
                (index, outcome)
            });
        }

        let mut finished = vec![false; urls.len()];
        let mut accepted = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, RetryOutcome { result, attempts }) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!("Publish task failed: {}", e);
                    continue;
                }
            };
            finished[index] = true;
            match result {
                Ok(()) => accepted.push(urls[index].clone()),
                Err(error) => {
                    tracing::warn!(
                        "Publish of {} to {} failed after {} attempts: {}",
                        event.id,
                        urls[index],
                        attempts,
                        error.reason
                    );
                    failures.push(EndpointFailure {
                        endpoint: urls[index].clone(),
                        error,
                        attempts,
                    });
                }
            }
        }
        failures.extend(unfinished(
            &urls,
            &finished,
            TransportOp::Publish,
            FailureReason::Closed("task ended unexpectedly".into()),
            |_| 1,
        ));

        if accepted.is_empty() {
            return Err(PoolError::Publish {
                event_id: event.id,
                failures,
            });
        }
        tracing::debug!(
            "Published {} to {}/{} relays",
            event.id,
            accepted.len(),
            urls.len()
        );
        Ok(PublishReport {
            event_id: event.id,
            accepted,
            failures,
        })
    }

    /// Query every endpoint and merge the results.
    ///
    /// Returns when every endpoint reached end-of-stored-events or failed, or
    /// when `timeout` passes. On timeout the events gathered so far are
    /// returned with `timed_out` set and the unfinished endpoints listed as
    /// failures, as long as at least one endpoint finished.
    ///
    /// # Errors
    ///
    /// [`PoolError::Query`] when no endpoint finished successfully, whether
    /// every one failed or the deadline passed first.
    pub async fn query(
        &self,
        filter: &Filter,
        timeout: Duration,
    ) -> Result<QueryOutcome, PoolError> {
        let endpoints = self.snapshot().await?;
        let urls: Vec<String> = endpoints.iter().map(|t| t.url().to_string()).collect();
        let attempt_counts: Vec<Arc<AtomicU32>> =
            urls.iter().map(|_| Arc::new(AtomicU32::new(0))).collect();

        let (tx, mut rx) = mpsc::channel::<Event>(QUERY_BUFFER);
        let mut tasks = JoinSet::new();
        for (index, transport) in endpoints.into_iter().enumerate() {
            let limiter = self.limiter.clone();
            let policy = self.policies.query;
            let filter = filter.clone();
            let tx = tx.clone();
            let counter = Arc::clone(&attempt_counts[index]);
            tasks.spawn(async move {
                let outcome = retry(&policy, |attempt| {
                    counter.store(attempt, Ordering::SeqCst);
                    query_once(transport.as_ref(), &limiter, &filter, tx.clone())
                })
                .await;
                (index, outcome)
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut finished = vec![false; urls.len()];
        let mut failures = Vec::new();
        let mut succeeded = 0usize;
        let mut rx_open = true;
        let mut timed_out = false;

        while rx_open || !tasks.is_empty() {
            tokio::select! {
                received = rx.recv(), if rx_open => match received {
                    Some(event) => {
                        if seen.insert(event.id) {
                            events.push(event);
                        }
                    }
                    None => rx_open = false,
                },
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    let (index, RetryOutcome { result, attempts }) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(e)) => {
                            tracing::warn!("Query task failed: {}", e);
                            continue;
                        }
                        None => continue,
                    };
                    finished[index] = true;
                    match result {
                        Ok(count) => {
                            tracing::trace!("{} returned {} events", urls[index], count);
                            succeeded += 1;
                        }
                        Err(error) => {
                            tracing::warn!(
                                "Query to {} failed after {} attempts: {}",
                                urls[index],
                                attempts,
                                error.reason
                            );
                            failures.push(EndpointFailure {
                                endpoint: urls[index].clone(),
                                error,
                                attempts,
                            });
                        }
                    }
                }
                _ = &mut deadline => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        // Keep whatever already arrived
        while let Ok(event) = rx.try_recv() {
            if seen.insert(event.id) {
                events.push(event);
            }
        }

        if timed_out {
            tracing::warn!(
                "Query timed out after {:?} with {}/{} relays finished",
                timeout,
                finished.iter().filter(|f| **f).count(),
                urls.len()
            );
        }
        let reason = if timed_out {
            FailureReason::Timeout
        } else {
            FailureReason::Closed("task ended unexpectedly".into())
        };
        failures.extend(unfinished(&urls, &finished, TransportOp::Query, reason, |index| {
            attempt_counts[index].load(Ordering::SeqCst).max(1)
        }));

        // Nothing answered, whether from errors or the deadline
        if succeeded == 0 {
            return Err(PoolError::Query { failures });
        }

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(QueryOutcome {
            events,
            failures,
            timed_out,
        })
    }

    /// Close every endpoint. Idempotent; later operations return
    /// [`PoolError::Closed`].
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let endpoints = self.endpoints.read().await.clone();
        for transport in endpoints {
            if let Err(e) = transport.close().await {
                tracing::debug!("Error closing {}: {}", transport.url(), e);
            }
        }
        tracing::debug!("Relay pool closed");
        Ok(())
    }
}
