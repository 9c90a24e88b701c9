//! Envelope codec: secret bundles in and out of three-layer envelopes.
//!
//! Encoding (innermost first):
//! 1. Rumor - canonical JSON content with a `d` tag, unsigned
//! 2. Seal - rumor encrypted to the author, signed by the author
//! 3. Wrap - seal encrypted under a fresh one-time key to the recipient,
//!    tagged with the recipient and the application marker
//!
//! Only the wrap leaves the process. Its signer is unlinkable to the author,
//! and an update is indistinguishable from a tombstone without the
//! recipient's key. Re-wrapping identical content always yields a new
//! envelope id and ciphertext.

use keyrelay_core::RecordVersion;
use keyrelay_types::{
    Event, EventId, Kind, Rumor, Seal, SecretBundle, Tag, Timestamp, UnsignedEvent, WireError,
    Wrap, APP_TYPE_TAG,
};
use serde::Serialize;
use thiserror::Error;

use crate::crypto::{verify, Cipher, CryptoError, Identity, Keys, Signer};

/// Largest canonical content accepted for a single record (32 KiB).
pub const MAX_CONTENT_SIZE: usize = 32 * 1024;

/// Errors building an envelope.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Canonical content exceeds [`MAX_CONTENT_SIZE`]
    #[error("content is {size} bytes, limit is {limit}")]
    Oversize {
        /// Canonical size in bytes
        size: usize,
        /// Limit in bytes
        limit: usize,
    },

    /// Content does not serialize to a JSON object
    #[error("content is not a JSON object: {0}")]
    NonSerializable(String),

    /// A deletion request must reference at least one envelope
    #[error("deletion request references no envelopes")]
    EmptyDeletion,

    /// Encryption failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors opening an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Addressed to someone else, or not decryptable with our key
    #[error("envelope is not addressed to this identity")]
    NotForUs,

    /// Structurally invalid at some layer
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// An id or signature does not verify, or the seal signer is not the rumor author
    #[error("envelope signature mismatch: {0}")]
    SignatureMismatch(String),
}

impl DecodeError {
    /// Whether a scanner reading a shared feed should silently skip this envelope.
    pub fn is_skippable(&self) -> bool {
        matches!(self, DecodeError::NotForUs | DecodeError::Malformed(_))
    }
}

/// Wrap content for `identity` under `d_tag`, timestamped now.
pub fn wrap<T, I>(content: &T, identity: &I, d_tag: &str) -> Result<Event, EncodeError>
where
    T: Serialize + ?Sized,
    I: Identity + ?Sized,
{
    wrap_at(content, identity, d_tag, Timestamp::now())
}

/// Wrap content with an explicit version timestamp.
pub fn wrap_at<T, I>(
    content: &T,
    identity: &I,
    d_tag: &str,
    created_at: Timestamp,
) -> Result<Event, EncodeError>
where
    T: Serialize + ?Sized,
    I: Identity + ?Sized,
{
    let bundle = SecretBundle::from_serialize(content)
        .map_err(|e| EncodeError::NonSerializable(e.to_string()))?;
    let canonical = bundle
        .to_canonical_json()
        .map_err(|e| EncodeError::NonSerializable(e.to_string()))?;
    if canonical.len() > MAX_CONTENT_SIZE {
        return Err(EncodeError::Oversize {
            size: canonical.len(),
            limit: MAX_CONTENT_SIZE,
        });
    }

    let author = identity.public_key();

    // Layer 1: rumor
    let rumor = Rumor::new(author, created_at, d_tag, canonical);
    let rumor_json = rumor
        .to_json()
        .map_err(|e| EncodeError::NonSerializable(e.to_string()))?;

    // Layer 2: seal, encrypted to ourselves
    let sealed = identity.encrypt(&author, rumor_json.as_bytes())?;
    let seal = sign_event(
        UnsignedEvent::new(author, created_at, Kind::SEAL, Vec::new(), sealed),
        identity,
    );
    let seal_json = seal
        .to_json()
        .map_err(|e| EncodeError::NonSerializable(e.to_string()))?;

    // Layer 3: wrap, under a key used exactly once
    let ephemeral = Keys::generate();
    let wrapped = ephemeral.encrypt(&author, seal_json.as_bytes())?;
    let wrap = sign_event(
        UnsignedEvent::new(
            ephemeral.public_key(),
            created_at,
            Kind::GIFT_WRAP,
            vec![Tag::pubkey(&author), Tag::hashtag(APP_TYPE_TAG)],
            wrapped,
        ),
        &ephemeral,
    );

    tracing::trace!("wrapped envelope {} for {}", wrap.id, d_tag);
    Ok(wrap)
}

/// Open a wrap addressed to `identity`.
pub fn unwrap<I>(event: &Event, identity: &I) -> Result<RecordVersion, DecodeError>
where
    I: Identity + ?Sized,
{
    let wrap = Wrap::from_event(event.clone()).map_err(malformed)?;
    if wrap.recipient() != Some(identity.public_key()) {
        return Err(DecodeError::NotForUs);
    }
    check_signature(wrap.event(), "wrap")?;

    let seal_json = identity
        .decrypt(wrap.ephemeral_key(), &wrap.event().content)
        .map_err(decrypt_error)?;
    let seal = Seal::parse(&utf8(seal_json)?).map_err(malformed)?;
    check_signature(seal.event(), "seal")?;

    let rumor_json = identity
        .decrypt(seal.author(), &seal.event().content)
        .map_err(decrypt_error)?;
    let rumor = Rumor::parse(&utf8(rumor_json)?).map_err(malformed)?;
    if &rumor.pubkey != seal.author() {
        return Err(DecodeError::SignatureMismatch(
            "seal signer is not the rumor author".into(),
        ));
    }

    let d_tag = rumor
        .d_tag()
        .ok_or_else(|| DecodeError::Malformed("rumor has no d tag".into()))?
        .to_string();
    let content = SecretBundle::from_json_object(&rumor.content).map_err(malformed)?;

    Ok(RecordVersion {
        content,
        d_tag,
        created_at: rumor.created_at,
        author: rumor.pubkey,
        origin_id: wrap.id(),
    })
}

/// A wrap with empty content: the record reads as deleted once it wins.
pub fn create_tombstone<I>(identity: &I, d_tag: &str) -> Result<Event, EncodeError>
where
    I: Identity + ?Sized,
{
    wrap(&SecretBundle::new(), identity, d_tag)
}

/// Tombstone with an explicit version timestamp.
pub fn create_tombstone_at<I>(
    identity: &I,
    d_tag: &str,
    created_at: Timestamp,
) -> Result<Event, EncodeError>
where
    I: Identity + ?Sized,
{
    wrap_at(&SecretBundle::new(), identity, d_tag, created_at)
}

/// A signed kind-5 request asking relays to drop the listed envelopes.
///
/// Relays are free to ignore it.
pub fn create_deletion_request<S>(
    ids: &[EventId],
    identity: &S,
    reason: &str,
) -> Result<Event, EncodeError>
where
    S: Signer + ?Sized,
{
    if ids.is_empty() {
        return Err(EncodeError::EmptyDeletion);
    }
    let tags = ids.iter().map(Tag::event).collect();
    Ok(sign_event(
        UnsignedEvent::new(
            identity.public_key(),
            Timestamp::now(),
            Kind::DELETION,
            tags,
            reason.to_string(),
        ),
        identity,
    ))
}

fn sign_event<S: Signer + ?Sized>(unsigned: UnsignedEvent, signer: &S) -> Event {
    let id = unsigned.compute_id();
    let sig = signer.sign(id.as_bytes());
    unsigned.into_signed(id, sig)
}

fn check_signature(event: &Event, layer: &str) -> Result<(), DecodeError> {
    if !event.has_valid_id() {
        return Err(DecodeError::SignatureMismatch(format!(
            "{} id does not match contents",
            layer
        )));
    }
    verify(&event.pubkey, event.id.as_bytes(), &event.sig)
        .map_err(|_| DecodeError::SignatureMismatch(format!("{} signature invalid", layer)))
}

fn decrypt_error(e: CryptoError) -> DecodeError {
    match e {
        CryptoError::DecryptionFailed | CryptoError::WeakSharedSecret => DecodeError::NotForUs,
        other => DecodeError::Malformed(other.to_string()),
    }
}

fn malformed(e: WireError) -> DecodeError {
    DecodeError::Malformed(e.to_string())
}

fn utf8(bytes: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(bytes).map_err(|_| DecodeError::Malformed("layer is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_types::PublicKey;
    use serde_json::json;

    fn sample() -> SecretBundle {
        [("API_KEY", json!("sk_test_1")), ("DEBUG", json!(true))]
            .into_iter()
            .collect()
    }

    // ===========================================
    // Encoding
    // ===========================================

    #[test]
    fn wrap_then_unwrap_returns_content() {
        let keys = Keys::generate();
        let event = wrap(&sample(), &keys, "app1|dev").unwrap();

        let version = unwrap(&event, &keys).unwrap();
        assert_eq!(version.content, sample());
        assert_eq!(version.d_tag, "app1|dev");
        assert_eq!(version.author, keys.public_key());
        assert_eq!(version.origin_id, event.id);
    }

    #[test]
    fn wrap_hides_author_and_names_recipient() {
        let keys = Keys::generate();
        let event = wrap(&sample(), &keys, "app1|dev").unwrap();

        assert_eq!(event.kind, Kind::GIFT_WRAP);
        assert_ne!(event.pubkey, keys.public_key());
        assert_eq!(event.tag_value("p"), Some(keys.public_key().to_hex().as_str()));
        assert_eq!(event.tag_value("t"), Some(APP_TYPE_TAG));
        // Neither the d-tag nor the content is visible
        assert!(event.tag_value("d").is_none());
        assert!(!event.content.contains("sk_test_1"));
        assert!(event.has_valid_id());
        assert!(verify(&event.pubkey, event.id.as_bytes(), &event.sig).is_ok());
    }

    #[test]
    fn identical_content_gives_distinct_envelopes() {
        let keys = Keys::generate();
        let at = Timestamp::from_secs(1000);
        let a = wrap_at(&sample(), &keys, "p|e", at).unwrap();
        let b = wrap_at(&sample(), &keys, "p|e", at).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.content, b.content);
        assert_ne!(a.pubkey, b.pubkey);
    }

    #[test]
    fn wrap_at_carries_timestamp_through_all_layers() {
        let keys = Keys::generate();
        let event = wrap_at(&sample(), &keys, "p|e", Timestamp::from_secs(1234)).unwrap();
        assert_eq!(event.created_at, Timestamp::from_secs(1234));
        assert_eq!(
            unwrap(&event, &keys).unwrap().created_at,
            Timestamp::from_secs(1234)
        );
    }

    #[test]
    fn oversize_content_is_rejected() {
        let keys = Keys::generate();
        let mut big = SecretBundle::new();
        big.insert("BLOB", "x".repeat(MAX_CONTENT_SIZE));
        assert!(matches!(
            wrap(&big, &keys, "p|e"),
            Err(EncodeError::Oversize {
                limit: MAX_CONTENT_SIZE,
                ..
            })
        ));
    }

    #[test]
    fn non_object_content_is_rejected() {
        let keys = Keys::generate();
        assert!(matches!(
            wrap(&vec!["a", "b"], &keys, "p|e"),
            Err(EncodeError::NonSerializable(_))
        ));
        assert!(matches!(
            wrap("plain string", &keys, "p|e"),
            Err(EncodeError::NonSerializable(_))
        ));
    }

    #[test]
    fn serializable_structs_are_accepted() {
        #[derive(Serialize)]
        struct Creds {
            user: String,
            port: u16,
        }
        let keys = Keys::generate();
        let event = wrap(
            &Creds {
                user: "admin".into(),
                port: 5432,
            },
            &keys,
            "db|prod",
        )
        .unwrap();
        let version = unwrap(&event, &keys).unwrap();
        assert_eq!(version.content.get("port"), Some(&json!(5432)));
    }

    // ===========================================
    // Decoding failures
    // ===========================================

    #[test]
    fn other_recipient_is_not_for_us() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = wrap(&sample(), &alice, "p|e").unwrap();

        let err = unwrap(&event, &bob).unwrap_err();
        assert!(matches!(err, DecodeError::NotForUs));
        assert!(err.is_skippable());
    }

    #[test]
    fn forged_recipient_tag_is_not_for_us() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = wrap(&sample(), &alice, "p|e").unwrap();

        // Re-sign with bob as recipient; bob still cannot decrypt
        let ephemeral = Keys::generate();
        let forged = sign_event(
            UnsignedEvent::new(
                ephemeral.public_key(),
                event.created_at,
                Kind::GIFT_WRAP,
                vec![Tag::pubkey(&bob.public_key()), Tag::hashtag(APP_TYPE_TAG)],
                event.content.clone(),
            ),
            &ephemeral,
        );
        assert!(matches!(unwrap(&forged, &bob), Err(DecodeError::NotForUs)));
    }

    #[test]
    fn tampered_wrap_is_signature_mismatch() {
        let keys = Keys::generate();
        let mut event = wrap(&sample(), &keys, "p|e").unwrap();
        event.created_at = Timestamp::from_secs(event.created_at.as_secs() + 1);

        let err = unwrap(&event, &keys).unwrap_err();
        assert!(matches!(err, DecodeError::SignatureMismatch(_)));
        assert!(!err.is_skippable());
    }

    #[test]
    fn bad_wrap_signature_is_signature_mismatch() {
        let keys = Keys::generate();
        let mut event = wrap(&sample(), &keys, "p|e").unwrap();
        event.sig = keys.sign(b"something else");
        assert!(matches!(
            unwrap(&event, &keys),
            Err(DecodeError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn non_wrap_kind_is_malformed() {
        let keys = Keys::generate();
        let deletion = create_deletion_request(&[EventId::new([1; 32])], &keys, "").unwrap();
        assert!(matches!(
            unwrap(&deletion, &keys),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_ciphertext_is_malformed() {
        let keys = Keys::generate();
        let ephemeral = Keys::generate();
        let event = sign_event(
            UnsignedEvent::new(
                ephemeral.public_key(),
                Timestamp::from_secs(1),
                Kind::GIFT_WRAP,
                vec![Tag::pubkey(&keys.public_key())],
                "%%% not base64 %%%".into(),
            ),
            &ephemeral,
        );
        assert!(matches!(
            unwrap(&event, &keys),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn impersonated_rumor_author_is_rejected() {
        let keys = Keys::generate();
        let author = keys.public_key();

        // Rumor claims another author, but the seal is signed by `keys`
        let impostor = PublicKey::new([9u8; 32]);
        let rumor = Rumor::new(impostor, Timestamp::from_secs(1), "p|e", "{}".into());
        let sealed = keys.encrypt(&author, rumor.to_json().unwrap().as_bytes()).unwrap();
        let seal = sign_event(
            UnsignedEvent::new(author, Timestamp::from_secs(1), Kind::SEAL, vec![], sealed),
            &keys,
        );
        let ephemeral = Keys::generate();
        let wrapped = ephemeral
            .encrypt(&author, seal.to_json().unwrap().as_bytes())
            .unwrap();
        let event = sign_event(
            UnsignedEvent::new(
                ephemeral.public_key(),
                Timestamp::from_secs(1),
                Kind::GIFT_WRAP,
                vec![Tag::pubkey(&author)],
                wrapped,
            ),
            &ephemeral,
        );

        assert!(matches!(
            unwrap(&event, &keys),
            Err(DecodeError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn array_rumor_content_is_malformed() {
        let keys = Keys::generate();
        let author = keys.public_key();
        let rumor = Rumor::new(author, Timestamp::from_secs(1), "p|e", "[1,2,3]".into());
        let sealed = keys.encrypt(&author, rumor.to_json().unwrap().as_bytes()).unwrap();
        let seal = sign_event(
            UnsignedEvent::new(author, Timestamp::from_secs(1), Kind::SEAL, vec![], sealed),
            &keys,
        );
        let ephemeral = Keys::generate();
        let wrapped = ephemeral
            .encrypt(&author, seal.to_json().unwrap().as_bytes())
            .unwrap();
        let event = sign_event(
            UnsignedEvent::new(
                ephemeral.public_key(),
                Timestamp::from_secs(1),
                Kind::GIFT_WRAP,
                vec![Tag::pubkey(&author)],
                wrapped,
            ),
            &ephemeral,
        );

        assert!(matches!(
            unwrap(&event, &keys),
            Err(DecodeError::Malformed(_))
        ));
    }

    // ===========================================
    // Tombstones and deletion requests
    // ===========================================

    #[test]
    fn tombstone_unwraps_to_empty_content() {
        let keys = Keys::generate();
        let event = create_tombstone(&keys, "proj|prod").unwrap();
        let version = unwrap(&event, &keys).unwrap();
        assert!(version.content.is_empty());
        assert!(version.is_tombstone());
        assert_eq!(version.d_tag, "proj|prod");
    }

    #[test]
    fn tombstone_looks_like_any_other_wrap() {
        let keys = Keys::generate();
        let live = wrap(&SecretBundle::from_iter([("K", "v")]), &keys, "p|e").unwrap();
        let tomb = create_tombstone(&keys, "p|e").unwrap();
        assert_eq!(live.kind, tomb.kind);
        assert_eq!(live.tags.len(), tomb.tags.len());
        assert_eq!(live.tag_value("t"), tomb.tag_value("t"));
    }

    #[test]
    fn deletion_request_references_every_id() {
        let keys = Keys::generate();
        let ids = [EventId::new([1; 32]), EventId::new([2; 32])];
        let event = create_deletion_request(&ids, &keys, "rotated").unwrap();

        assert_eq!(event.kind, Kind::DELETION);
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(event.content, "rotated");
        let referenced: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(referenced, vec![ids[0].to_hex(), ids[1].to_hex()]);
        assert!(verify(&event.pubkey, event.id.as_bytes(), &event.sig).is_ok());
    }

    #[test]
    fn empty_deletion_request_is_rejected() {
        let keys = Keys::generate();
        assert!(matches!(
            create_deletion_request(&[], &keys, "none"),
            Err(EncodeError::EmptyDeletion)
        ));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EncodeError>();
        assert_send_sync::<DecodeError>();
    }
}
