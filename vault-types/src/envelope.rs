//! Typed envelope layers.
//!
//! A secret travels as three nested layers:
//!
//! ```text
//! Wrap (kind 1059, signed by a one-time key, p + t tags)
//!  └─ Seal (kind 13, signed by the author, no tags)
//!      └─ Rumor (kind 30078, unsigned, d tag, JSON content)
//! ```
//!
//! Each layer has a dedicated parse function that checks the kind and the
//! structural requirements of that layer. Cryptographic checks (signatures,
//! decryption) live in the client crate.

use serde::{Deserialize, Serialize};

use crate::{Event, EventId, Kind, PublicKey, Tag, Timestamp, UnsignedEvent, WireError};

/// Application-type marker placed in every wrap's `t` tag.
///
/// Lets relays index wraps for this application without learning anything
/// about their contents.
pub const APP_TYPE_TAG: &str = "keyrelay";

/// The innermost, unsigned record.
///
/// Never transmitted on its own. Its id is computed like any other event id
/// but no signature exists, so a leaked rumor cannot be proven authentic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    /// Event id computed over the rumor contents
    pub id: EventId,
    /// Author public key
    pub pubkey: PublicKey,
    /// Logical version timestamp
    pub created_at: Timestamp,
    /// Always [`Kind::APP_DATA`]
    pub kind: Kind,
    /// `[["d", d_tag]]`
    pub tags: Vec<Tag>,
    /// Canonical JSON object
    pub content: String,
}

impl Rumor {
    /// Build a rumor for a logical record.
    pub fn new(author: PublicKey, created_at: Timestamp, d_tag: &str, content: String) -> Self {
        let unsigned = UnsignedEvent::new(
            author,
            created_at,
            Kind::APP_DATA,
            vec![Tag::identifier(d_tag)],
            content,
        );
        Self::from_unsigned(unsigned)
    }

    /// Attach a computed id to an unsigned event.
    pub fn from_unsigned(unsigned: UnsignedEvent) -> Self {
        let id = unsigned.compute_id();
        Self {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
        }
    }

    /// Parse a decrypted rumor, checking its kind and id.
    pub fn parse(json: &str) -> Result<Self, WireError> {
        let rumor: Rumor = serde_json::from_str(json)?;
        if rumor.kind != Kind::APP_DATA {
            return Err(WireError::UnexpectedKind {
                expected: Kind::APP_DATA,
                actual: rumor.kind,
            });
        }
        if rumor.compute_id() != rumor.id {
            return Err(WireError::IdMismatch);
        }
        Ok(rumor)
    }

    /// Recompute the id from the contents.
    pub fn compute_id(&self) -> EventId {
        UnsignedEvent::new(
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags.clone(),
            self.content.clone(),
        )
        .compute_id()
    }

    /// Value of the `d` tag, if present.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(Tag::value)
    }

    /// Serialize to compact JSON (the sealed plaintext).
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Middle layer: the rumor encrypted to its author, signed by the author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal(Event);

impl Seal {
    /// Accept an event as a seal if its kind matches.
    pub fn from_event(event: Event) -> Result<Self, WireError> {
        if event.kind != Kind::SEAL {
            return Err(WireError::UnexpectedKind {
                expected: Kind::SEAL,
                actual: event.kind,
            });
        }
        Ok(Self(event))
    }

    /// Parse a decrypted seal.
    pub fn parse(json: &str) -> Result<Self, WireError> {
        Self::from_event(Event::from_json(json)?)
    }

    /// The signer, who must also be the rumor author.
    pub fn author(&self) -> &PublicKey {
        &self.0.pubkey
    }

    /// Underlying event.
    pub fn event(&self) -> &Event {
        &self.0
    }

    /// Take the underlying event.
    pub fn into_event(self) -> Event {
        self.0
    }
}

/// Outer layer: the only unit relays ever see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrap(Event);

impl Wrap {
    /// Accept an event as a wrap if its kind matches and it names a recipient.
    pub fn from_event(event: Event) -> Result<Self, WireError> {
        if event.kind != Kind::GIFT_WRAP {
            return Err(WireError::UnexpectedKind {
                expected: Kind::GIFT_WRAP,
                actual: event.kind,
            });
        }
        let recipient = event.tag_value("p").ok_or(WireError::MissingTag("p"))?;
        PublicKey::from_hex(recipient)?;
        Ok(Self(event))
    }

    /// Parse a wrap from JSON.
    pub fn parse(json: &str) -> Result<Self, WireError> {
        Self::from_event(Event::from_json(json)?)
    }

    /// Recipient named by the `p` tag.
    pub fn recipient(&self) -> Option<PublicKey> {
        self.0
            .tag_value("p")
            .and_then(|hex| PublicKey::from_hex(hex).ok())
    }

    /// Application marker from the `t` tag.
    pub fn app_tag(&self) -> Option<&str> {
        self.0.tag_value("t")
    }

    /// One-time signing key.
    pub fn ephemeral_key(&self) -> &PublicKey {
        &self.0.pubkey
    }

    /// Envelope id.
    pub fn id(&self) -> EventId {
        self.0.id
    }

    /// Underlying event.
    pub fn event(&self) -> &Event {
        &self.0
    }

    /// Take the underlying event.
    pub fn into_event(self) -> Event {
        self.0
    }
}

/// Any one of the three layers, dispatched by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Innermost record
    Rumor(Rumor),
    /// Author-signed middle layer
    Seal(Seal),
    /// Outermost layer
    Wrap(Wrap),
}

impl Layer {
    /// Parse any layer, choosing the variant from the `kind` field.
    pub fn parse(json: &str) -> Result<Self, WireError> {
        #[derive(Deserialize)]
        struct KindOnly {
            kind: Kind,
        }
        let KindOnly { kind } = serde_json::from_str(json)?;
        match kind {
            Kind::APP_DATA => Ok(Layer::Rumor(Rumor::parse(json)?)),
            Kind::SEAL => Ok(Layer::Seal(Seal::parse(json)?)),
            Kind::GIFT_WRAP => Ok(Layer::Wrap(Wrap::parse(json)?)),
            other => Err(WireError::InvalidData(format!(
                "kind {} is not an envelope layer",
                other
            ))),
        }
    }
}
