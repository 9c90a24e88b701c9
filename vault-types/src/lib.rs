//! # keyrelay-types
//!
//! Wire format types for keyrelay encrypted secret storage.
//!
//! This crate provides the foundational types used across all keyrelay crates:
//! - [`EventId`], [`PublicKey`], [`Signature`], [`Timestamp`] - Identity and ordering types
//! - [`Event`], [`UnsignedEvent`], [`Kind`], [`Tag`] - The signed event every relay stores
//! - [`Rumor`], [`Seal`], [`Wrap`], [`Layer`] - The three typed envelope layers
//! - [`Filter`] - Relay-side query filter
//! - [`ClientMessage`], [`RelayMessage`] - Relay protocol frames
//! - [`SecretBundle`] - The key/value content carried inside a rumor
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bundle;
mod envelope;
mod error;
mod event;
mod filter;
mod ids;
mod messages;

pub use bundle::SecretBundle;
pub use envelope::{Layer, Rumor, Seal, Wrap, APP_TYPE_TAG};
pub use error::WireError;
pub use event::{Event, Kind, Tag, UnsignedEvent};
pub use filter::Filter;
pub use ids::{EventId, PublicKey, Signature, Timestamp};
pub use messages::{ClientMessage, RelayMessage};
