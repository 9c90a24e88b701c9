//! # keyrelay-client
//!
//! Client library for keyrelay encrypted secret storage.
//!
//! This is the main library that applications use to keep secret bundles on
//! untrusted relays.
//!
//! ## Features
//!
//! - **Three-layer envelopes**: rumor, self-addressed seal, ephemeral-key wrap
//! - **E2E Encryption**: X25519 + HKDF-SHA256 + XChaCha20-Poly1305, padded
//! - **Multi-relay pool**: parallel publish and query with bounded retries
//! - **Shared rate limiting**: one admission window for every request
//! - **Deletion**: tombstones plus best-effort deletion requests
//! - **Transport Abstraction**: Pluggable relay transport (WebSocket, mock)
//!
//! ## Example
//!
//! ```ignore
//! use keyrelay_client::{Keys, SecretManager, VaultConfig};
//!
//! let config = VaultConfig::with_relays(["wss://relay.example.com"]);
//! let (vault, _report) = SecretManager::from_config(Keys::generate(), &config).await?;
//!
//! vault.publish("app1", "dev", &serde_json::json!({"API_KEY": "sk_test_1"})).await?;
//! let secrets = vault.fetch_all(None).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod manager;
pub mod pool;
pub mod resilience;
pub mod transport;

pub use config::{
    ConfigError, QueryConfig, RateLimitConfig, RetryConfig, RetryPolicyConfig, TransportConfig,
    VaultConfig,
};
pub use crypto::{
    verify, Cipher, CryptoError, Identity, Keys, Signer, KEY_SIZE, MAX_PLAINTEXT_SIZE, NONCE_SIZE,
};
pub use envelope::{
    create_deletion_request, create_tombstone, create_tombstone_at, unwrap, wrap, wrap_at,
    DecodeError, EncodeError, MAX_CONTENT_SIZE,
};
pub use manager::{PurgeReport, ResolvedSecrets, SecretManager, VaultError, DEFAULT_QUERY_TIMEOUT};
pub use pool::{
    ConnectReport, EndpointFailure, PoolError, PoolPolicies, PublishReport, QueryOutcome,
    RelayPool,
};
pub use resilience::{retry, with_backoff, RateLimiter, RetryOutcome};
pub use transport::{
    FailureReason, MockRelay, RelayTransport, TransportError, TransportOp, WebSocketRelay,
    WebSocketRelayConfig, MAX_MESSAGE_SIZE,
};

pub use keyrelay_core::{
    BackoffPolicy, Classify, ConsistencyError, DTag, ErrorClass, RecordState, RecordVersion,
    RejectCategory,
};
pub use keyrelay_types::{Event, EventId, Filter, Kind, PublicKey, SecretBundle, Tag, Timestamp};
