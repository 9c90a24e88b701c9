//! Signed events - the unit every relay stores.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{EventId, PublicKey, Signature, Timestamp, WireError};

/// Event kind discriminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(u16);

impl Kind {
    /// Request that relays drop the referenced events.
    pub const DELETION: Kind = Kind(5);
    /// Rumor encrypted to its author and signed by the author.
    pub const SEAL: Kind = Kind(13);
    /// Seal encrypted under a single-use ephemeral key.
    pub const GIFT_WRAP: Kind = Kind(1059);
    /// Replaceable application data addressed by a `d` tag.
    pub const APP_DATA: Kind = Kind(30078);

    /// Create a Kind from its numeric value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Numeric value of this Kind.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

/// A single event tag: a name followed by one or more values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    /// Build a tag from its raw parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// `["d", identifier]` - names a replaceable record.
    pub fn identifier(d: &str) -> Self {
        Self::new(["d", d])
    }

    /// `["p", pubkey]` - points at a recipient.
    pub fn pubkey(pubkey: &PublicKey) -> Self {
        Self(vec!["p".to_string(), pubkey.to_hex()])
    }

    /// `["e", event_id]` - references another event.
    pub fn event(id: &EventId) -> Self {
        Self(vec!["e".to_string(), id.to_hex()])
    }

    /// `["t", marker]` - free-form label used for relay-side filtering.
    pub fn hashtag(marker: &str) -> Self {
        Self::new(["t", marker])
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value (second element).
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// All parts of the tag.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// An event before signing.
///
/// The rumor layer is transported in this form (plus its id); seals, wraps and
/// deletion requests are signed into an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Author public key
    pub pubkey: PublicKey,
    /// Creation time claimed by the author
    pub created_at: Timestamp,
    /// Event kind
    pub kind: Kind,
    /// Tags
    pub tags: Vec<Tag>,
    /// Content (plaintext JSON or ciphertext, depending on kind)
    pub content: String,
}

impl UnsignedEvent {
    /// Create a new unsigned event.
    pub fn new(
        pubkey: PublicKey,
        created_at: Timestamp,
        kind: Kind,
        tags: Vec<Tag>,
        content: String,
    ) -> Self {
        Self {
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Compute the event id.
    pub fn compute_id(&self) -> EventId {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Attach an id and signature produced by the author.
    pub fn into_signed(self, id: EventId, sig: Signature) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A signed event as stored and served by relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// SHA-256 over the canonical serialization
    pub id: EventId,
    /// Signer public key
    pub pubkey: PublicKey,
    /// Creation time claimed by the signer
    pub created_at: Timestamp,
    /// Event kind
    pub kind: Kind,
    /// Tags
    pub tags: Vec<Tag>,
    /// Content
    pub content: String,
    /// Signature over `id`
    pub sig: Signature,
}

impl Event {
    /// Recompute the id from the event contents.
    pub fn compute_id(&self) -> EventId {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Whether the declared id matches the contents.
    pub fn has_valid_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// First value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).next()
    }

    /// First values of every tag with the given name.
    pub fn tag_values<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Id = SHA-256 of `[0, pubkey, created_at, kind, tags, content]` in compact JSON.
fn compute_id(
    pubkey: &PublicKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([
        0,
        pubkey.to_hex(),
        created_at.as_secs(),
        kind.as_u16(),
        tags,
        content
    ]);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    EventId::new(bytes)
}
