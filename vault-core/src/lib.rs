//! # keyrelay-core
//!
//! Pure logic for keyrelay (no I/O, instant tests).
//!
//! This crate holds the decisions the client makes without touching the
//! network:
//! - [`dtag`] - composing and parsing logical record keys
//! - [`resolver`] - reducing many record versions to the latest per key
//! - [`backoff`] - bounded exponential retry schedules with full jitter
//! - [`classify`] - permanent vs transient failure classification
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects (apart from drawing jitter entropy). Time is an input,
//! never read from a clock. The actual I/O is performed by `keyrelay-client`,
//! which drives these pieces.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod classify;
pub mod dtag;
pub mod resolver;

pub use backoff::BackoffPolicy;
pub use classify::{Classify, ErrorClass, RejectCategory};
pub use dtag::{compose_dtag, parse_dtag, ConsistencyError, DTag, SEPARATOR};
pub use resolver::{envelope_ids_by_dtag, merge, resolve_latest, RecordState, RecordVersion};
