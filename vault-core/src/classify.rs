//! Permanent vs transient error classification.
//!
//! Retrying only makes sense when a later attempt could succeed. Failures
//! that are a property of the request itself (bad signature, forbidden,
//! authentication required) are permanent and must not be retried; anything
//! environmental (timeouts, refused connections, rate limiting, unknown
//! errors) is transient.

use std::fmt;

/// Whether a failure may succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retrying cannot help
    Permanent,
    /// Retrying may help
    Transient,
}

impl ErrorClass {
    /// Whether this class allows a retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Transient => write!(f, "transient"),
        }
    }
}

/// Types that know their own retry class.
pub trait Classify {
    /// Classify this error.
    fn class(&self) -> ErrorClass;

    /// Shorthand for `class() == Permanent`.
    fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }
}

impl Classify for ErrorClass {
    fn class(&self) -> ErrorClass {
        *self
    }
}

/// Machine-readable rejection prefix carried by relay `OK`/`CLOSED` messages.
///
/// Relays send messages like `"blocked: you are banned"`. The text before the
/// first colon is the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCategory {
    /// `auth-required:` - the relay wants authentication first
    AuthRequired,
    /// `restricted:` - the key is not allowed to write or read here
    Restricted,
    /// `blocked:` - the key or IP is banned
    Blocked,
    /// `invalid:` - malformed event or bad signature
    Invalid,
    /// `rate-limited:` - slow down
    RateLimited,
    /// `pow:` - proof of work required
    Pow,
    /// `duplicate:` - already stored
    Duplicate,
    /// `error:` - relay-side failure
    Error,
    /// No recognised prefix
    Unknown,
}

impl RejectCategory {
    /// Extract the category from a relay message.
    pub fn from_message(message: &str) -> Self {
        let prefix = match message.split_once(':') {
            Some((prefix, _)) => prefix.trim(),
            None => return RejectCategory::Unknown,
        };
        match prefix {
            "auth-required" => RejectCategory::AuthRequired,
            "restricted" => RejectCategory::Restricted,
            "blocked" => RejectCategory::Blocked,
            "invalid" => RejectCategory::Invalid,
            "rate-limited" => RejectCategory::RateLimited,
            "pow" => RejectCategory::Pow,
            "duplicate" => RejectCategory::Duplicate,
            "error" => RejectCategory::Error,
            _ => RejectCategory::Unknown,
        }
    }

    /// Whether the relay already holds the event.
    ///
    /// A duplicate rejection means the write is already durable there.
    pub fn is_already_stored(self) -> bool {
        matches!(self, RejectCategory::Duplicate)
    }
}

impl Classify for RejectCategory {
    fn class(&self) -> ErrorClass {
        match self {
            RejectCategory::AuthRequired
            | RejectCategory::Restricted
            | RejectCategory::Blocked
            | RejectCategory::Invalid
            | RejectCategory::Pow
            | RejectCategory::Duplicate => ErrorClass::Permanent,
            RejectCategory::RateLimited | RejectCategory::Error | RejectCategory::Unknown => {
                ErrorClass::Transient
            }
        }
    }
}

impl fmt::Display for RejectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectCategory::AuthRequired => "auth-required",
            RejectCategory::Restricted => "restricted",
            RejectCategory::Blocked => "blocked",
            RejectCategory::Invalid => "invalid",
            RejectCategory::RateLimited => "rate-limited",
            RejectCategory::Pow => "pow",
            RejectCategory::Duplicate => "duplicate",
            RejectCategory::Error => "error",
            RejectCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
