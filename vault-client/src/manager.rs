//! SecretManager - the main interface for keyrelay.
//!
//! This module provides [`SecretManager`], the primary API for applications
//! to store, read and delete encrypted secret bundles on relays.
//!
//! # Architecture
//!
//! SecretManager uses pure logic (from keyrelay-core) to resolve record
//! versions and drives the relay pool to perform the actual I/O.
//!
//! ```text
//! Application → SecretManager → envelope codec → RelayPool → Transports
//!                    ↓
//!              keyrelay-core (resolver, d-tags)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keyrelay_client::{Keys, SecretManager, SecretBundle, VaultConfig};
//!
//! let config = VaultConfig::from_file(Path::new("keyrelay.toml"))?;
//! let (vault, _report) = SecretManager::from_config(Keys::generate(), &config).await?;
//!
//! let mut bundle = SecretBundle::new();
//! bundle.insert("API_KEY", "sk_live_123");
//! vault.publish("billing", "prod", &bundle).await?;
//!
//! let current = vault.fetch("billing", "prod").await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyrelay_core::{
    envelope_ids_by_dtag, resolve_latest, ConsistencyError, DTag, RecordState, RecordVersion,
};
use keyrelay_types::{EventId, Filter, Kind, SecretBundle, Timestamp, APP_TYPE_TAG};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, VaultConfig};
use crate::crypto::{Identity, Keys};
use crate::envelope::{self, DecodeError, EncodeError};
use crate::pool::{ConnectReport, EndpointFailure, PoolError, PublishReport, RelayPool};
use crate::transport::RelayTransport;

/// Default overall deadline for feed scans.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client errors.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Relay pool error.
    #[error("relay error: {0}")]
    Pool(#[from] PoolError),

    /// Building an envelope failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Opening an envelope failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid project or environment identifier.
    #[error("invalid record key: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No relay holds the requested envelope.
    #[error("envelope {0} not found")]
    EnvelopeNotFound(EventId),

    /// The query deadline passed before every relay answered, so the answer
    /// could be missing newer versions.
    #[error("lookup timed out with {} relays unfinished or failed", .failures.len())]
    Incomplete {
        /// Relays that failed or did not finish
        failures: Vec<EndpointFailure>,
    },
}

/// The current state of every record visible to one identity.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecrets {
    records: BTreeMap<DTag, RecordVersion>,
    /// Endpoints that failed during the scan
    pub failures: Vec<EndpointFailure>,
    /// Whether the scan hit its deadline before every endpoint finished
    pub timed_out: bool,
}

impl ResolvedSecrets {
    /// Winning version for a record, tombstones included.
    pub fn version(&self, project: &str, environment: &str) -> Option<&RecordVersion> {
        let key = DTag::compose(project, environment).ok()?;
        self.records.get(&key)
    }

    /// Current content of a record. A deleted record reads as an empty bundle.
    pub fn get(&self, project: &str, environment: &str) -> Option<&SecretBundle> {
        self.version(project, environment).map(|v| &v.content)
    }

    /// Whether a record is absent, live or deleted.
    pub fn state(&self, project: &str, environment: &str) -> RecordState {
        RecordState::of(self.version(project, environment))
    }

    /// Records that are not deleted.
    pub fn live(&self) -> impl Iterator<Item = (&DTag, &SecretBundle)> {
        self.records
            .iter()
            .filter(|(_, v)| !v.is_tombstone())
            .map(|(k, v)| (k, &v.content))
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record was found.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Winning version per record.
    pub fn records(&self) -> &BTreeMap<DTag, RecordVersion> {
        &self.records
    }

    /// Consume into the winning version per record.
    pub fn into_records(self) -> BTreeMap<DTag, RecordVersion> {
        self.records
    }
}

/// Result of [`SecretManager::purge`].
#[derive(Debug, Clone)]
pub struct PurgeReport {
    /// Publication of the tombstone
    pub tombstone: PublishReport,
    /// Publication of the deletion request, if any earlier envelopes existed
    pub deletion: Option<PublishReport>,
    /// Envelopes the deletion request referenced
    pub requested: Vec<EventId>,
}

struct Scan {
    versions: Vec<RecordVersion>,
    failures: Vec<EndpointFailure>,
    timed_out: bool,
}

impl Scan {
    /// Fail unless every relay finished before the deadline.
    fn complete(self) -> Result<Self, VaultError> {
        if self.timed_out {
            return Err(VaultError::Incomplete {
                failures: self.failures,
            });
        }
        Ok(self)
    }
}

/// Everything one complete scan knows about a record.
struct History {
    ids: Vec<EventId>,
    latest: Option<Timestamp>,
}

/// Encrypted secret storage for one identity.
///
/// Generic over the identity so signing and encryption can live outside the
/// process (hardware keys, remote signers).
pub struct SecretManager<I: Identity = Keys> {
    identity: Arc<I>,
    pool: RelayPool,
    query_timeout: Duration,
    /// Newest timestamp this manager wrote per record
    written: Mutex<HashMap<DTag, Timestamp>>,
}

impl<I: Identity> std::fmt::Debug for SecretManager<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("public_key", &self.identity.public_key())
            .field("pool", &self.pool)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl<I: Identity> SecretManager<I> {
    /// Create a manager over an existing pool.
    pub fn new(identity: I, pool: RelayPool) -> Self {
        Self {
            identity: Arc::new(identity),
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Build the pool from configuration and connect to every relay.
    pub async fn from_config(
        identity: I,
        config: &VaultConfig,
    ) -> Result<(Self, ConnectReport), VaultError> {
        config.validate()?;
        let (pool, report) = RelayPool::from_config(config).await?;
        let manager = Self::new(identity, pool).with_query_timeout(config.query_timeout());
        Ok((manager, report))
    }

    /// Set the overall deadline for feed scans.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Register and connect additional endpoints.
    pub async fn connect<E>(&self, endpoints: E) -> Result<ConnectReport, VaultError>
    where
        E: IntoIterator<Item = Arc<dyn RelayTransport>>,
    {
        Ok(self.pool.connect(endpoints).await?)
    }

    /// Public key records are addressed to.
    pub fn public_key(&self) -> keyrelay_types::PublicKey {
        self.identity.public_key()
    }

    /// Identity used for signing and encryption.
    pub fn identity(&self) -> &I {
        &self.identity
    }

    /// Underlying relay pool.
    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Store a new version of `project|environment`.
    ///
    /// `content` must serialize to a JSON object.
    pub async fn publish<T>(
        &self,
        project: &str,
        environment: &str,
        content: &T,
    ) -> Result<PublishReport, VaultError>
    where
        T: Serialize + ?Sized,
    {
        let d_tag = DTag::compose(project, environment)?;
        let created_at = self.next_timestamp(&d_tag, None);
        self.publish_at(project, environment, content, created_at)
            .await
    }

    /// Store a version with an explicit timestamp.
    pub async fn publish_at<T>(
        &self,
        project: &str,
        environment: &str,
        content: &T,
        created_at: Timestamp,
    ) -> Result<PublishReport, VaultError>
    where
        T: Serialize + ?Sized,
    {
        let d_tag = DTag::compose(project, environment)?;
        let identity = self.identity.as_ref();
        let event = envelope::wrap_at(content, identity, &d_tag.as_tag(), created_at)?;
        let report = self.pool.publish(&event).await?;
        self.remember(d_tag.clone(), created_at);
        tracing::info!(
            "Published {} for {} to {} relays",
            report.event_id,
            d_tag,
            report.accepted.len()
        );
        Ok(report)
    }

    /// Timestamp for a new version of `d_tag` that sorts after every version
    /// this manager wrote or `seen` reports, and is never behind the clock.
    fn next_timestamp(&self, d_tag: &DTag, seen: Option<Timestamp>) -> Timestamp {
        let written = self.lock_written().get(d_tag).copied();
        let now = Timestamp::now();
        match written.max(seen) {
            Some(latest) if latest >= now => {
                Timestamp::from_secs(latest.as_secs().saturating_add(1))
            }
            _ => now,
        }
    }

    fn remember(&self, d_tag: DTag, created_at: Timestamp) {
        let mut written = self.lock_written();
        let entry = written.entry(d_tag).or_insert(created_at);
        if created_at > *entry {
            *entry = created_at;
        }
    }

    fn lock_written(&self) -> std::sync::MutexGuard<'_, HashMap<DTag, Timestamp>> {
        self.written.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feed_filter(&self, since: Option<Timestamp>) -> Filter {
        let filter = Filter::new()
            .kind(Kind::GIFT_WRAP)
            .pubkey_tag(&self.identity.public_key())
            .hashtag(APP_TYPE_TAG);
        match since {
            Some(since) => filter.since(since),
            None => filter,
        }
    }

    async fn scan(&self, since: Option<Timestamp>) -> Result<Scan, VaultError> {
        let outcome = self
            .pool
            .query(&self.feed_filter(since), self.query_timeout)
            .await?;

        let total = outcome.events.len();
        let mut versions = Vec::with_capacity(total);
        for event in &outcome.events {
            match envelope::unwrap(event, self.identity.as_ref()) {
                Ok(version) => versions.push(version),
                Err(e) if e.is_skippable() => {
                    tracing::trace!("Skipping envelope {}: {}", event.id, e);
                }
                Err(e) => {
                    tracing::warn!("Skipping envelope {}: {}", event.id, e);
                }
            }
        }
        tracing::debug!("Decoded {}/{} envelopes", versions.len(), total);

        Ok(Scan {
            versions,
            failures: outcome.failures,
            timed_out: outcome.timed_out,
        })
    }

    /// Resolve the current state of every record, optionally only looking at
    /// envelopes created at or after `since`.
    pub async fn fetch_all(&self, since: Option<Timestamp>) -> Result<ResolvedSecrets, VaultError> {
        let scan = self.scan(since).await?;
        Ok(ResolvedSecrets {
            records: resolve_latest(scan.versions),
            failures: scan.failures,
            timed_out: scan.timed_out,
        })
    }

    /// Current content of one record.
    ///
    /// `None` if the record was never written; an empty bundle if it was
    /// deleted. Fails with [`VaultError::Incomplete`] if the scan hit its
    /// deadline, since a slower relay may hold a newer version.
    pub async fn fetch(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Option<SecretBundle>, VaultError> {
        let key = DTag::compose(project, environment)?;
        let scan = self.scan(None).await?.complete()?;
        let mut records = resolve_latest(scan.versions);
        Ok(records.remove(&key).map(|v| v.content))
    }

    /// Open one envelope by id. Decode failures are returned, not skipped.
    pub async fn fetch_envelope(&self, id: EventId) -> Result<RecordVersion, VaultError> {
        let outcome = self
            .pool
            .query(&Filter::new().id(id).limit(1), self.query_timeout)
            .await?;
        let event = match outcome.events.into_iter().find(|e| e.id == id) {
            Some(event) => event,
            None if outcome.timed_out => {
                return Err(VaultError::Incomplete {
                    failures: outcome.failures,
                })
            }
            None => return Err(VaultError::EnvelopeNotFound(id)),
        };
        Ok(envelope::unwrap(&event, self.identity.as_ref())?)
    }

    /// Every envelope id ever published for one record, newest first.
    pub async fn envelope_ids(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Vec<EventId>, VaultError> {
        let key = DTag::compose(project, environment)?;
        Ok(self.history(&key).await?.ids)
    }

    async fn history(&self, key: &DTag) -> Result<History, VaultError> {
        let scan = self.scan(None).await?.complete()?;
        let latest = scan
            .versions
            .iter()
            .filter(|v| DTag::parse(&v.d_tag).map_or(false, |d| d == *key))
            .map(|v| v.created_at)
            .max();
        let ids = envelope_ids_by_dtag(&scan.versions)
            .remove(key)
            .unwrap_or_default();
        Ok(History { ids, latest })
    }

    /// Mark `project|environment` deleted by publishing a tombstone.
    pub async fn delete(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<PublishReport, VaultError> {
        let key = DTag::compose(project, environment)?;
        self.delete_logical_record(&key.as_tag()).await
    }

    /// Publish a tombstone for a raw d-tag.
    ///
    /// The tombstone is stamped after the newest version any relay reports,
    /// so it wins even when issued in the same second as the write it
    /// deletes. Writing again later revives the record.
    pub async fn delete_logical_record(&self, d_tag: &str) -> Result<PublishReport, VaultError> {
        let key = DTag::parse(d_tag)?;
        let history = self.history(&key).await?;
        self.tombstone(key, &history).await
    }

    async fn tombstone(&self, key: DTag, history: &History) -> Result<PublishReport, VaultError> {
        let created_at = self.next_timestamp(&key, history.latest);
        let identity = self.identity.as_ref();
        let tombstone = envelope::create_tombstone_at(identity, &key.as_tag(), created_at)?;
        let report = self.pool.publish(&tombstone).await?;
        self.remember(key.clone(), created_at);
        tracing::info!("Tombstoned {} at {}", key, created_at);
        Ok(report)
    }

    /// Ask relays to drop the given envelopes.
    ///
    /// Best effort: relays may ignore the request, and copies may survive
    /// elsewhere.
    pub async fn request_physical_deletion(
        &self,
        ids: &[EventId],
        reason: &str,
    ) -> Result<PublishReport, VaultError> {
        let request = envelope::create_deletion_request(ids, self.identity.as_ref(), reason)?;
        let report = self.pool.publish(&request).await?;
        tracing::info!(
            "Requested deletion of {} envelopes from {} relays",
            ids.len(),
            report.accepted.len()
        );
        Ok(report)
    }

    /// Tombstone a record, then request deletion of every earlier envelope.
    pub async fn purge(
        &self,
        project: &str,
        environment: &str,
        reason: &str,
    ) -> Result<PurgeReport, VaultError> {
        let key = DTag::compose(project, environment)?;
        let history = self.history(&key).await?;
        let tombstone = self.tombstone(key, &history).await?;
        let requested = history.ids;
        let deletion = if requested.is_empty() {
            None
        } else {
            Some(self.request_physical_deletion(&requested, reason).await?)
        };
        Ok(PurgeReport {
            tombstone,
            deletion,
            requested,
        })
    }

    /// Close every relay connection.
    pub async fn close(&self) -> Result<(), VaultError> {
        Ok(self.pool.close().await?)
    }
}
