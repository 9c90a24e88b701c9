//! Replaceable state resolver.
//!
//! Relays may return the same logical record many times: duplicates,
//! superseded versions, tombstones, in any order. The resolver reduces them
//! to one current version per d-tag.
//!
//! ## Rule
//!
//! For each d-tag, the version with the greatest `created_at` wins. Equal
//! timestamps are broken by the greater origin envelope id, compared over
//! the raw id bytes. The reduction is therefore a `max` over a total order,
//! which makes it commutative and associative: encounter order never changes
//! the result.
//!
//! Timestamps are supplied by publishing devices. A device whose clock runs
//! behind will lose to older writes from a device whose clock runs ahead.

use std::collections::BTreeMap;
use std::fmt;

use keyrelay_types::{EventId, PublicKey, SecretBundle, Timestamp};

use crate::dtag::DTag;

/// One decrypted version of a logical record.
#[derive(Clone, PartialEq)]
pub struct RecordVersion {
    /// Decrypted key/value content (empty for a tombstone)
    pub content: SecretBundle,
    /// Raw d-tag
    pub d_tag: String,
    /// Timestamp claimed by the author
    pub created_at: Timestamp,
    /// Author who sealed the rumor
    pub author: PublicKey,
    /// Id of the outer envelope this version came from
    pub origin_id: EventId,
}

impl RecordVersion {
    /// Whether this version is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.content.is_empty()
    }

    /// Ordering key used by the resolver.
    fn rank(&self) -> (Timestamp, EventId) {
        (self.created_at, self.origin_id)
    }

    /// Whether this version supersedes `other`.
    pub fn supersedes(&self, other: &RecordVersion) -> bool {
        self.rank() > other.rank()
    }
}

impl fmt::Debug for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordVersion")
            .field("d_tag", &self.d_tag)
            .field("created_at", &self.created_at)
            .field("author", &self.author)
            .field("origin_id", &self.origin_id)
            .field("content", &format!("[{} entries REDACTED]", self.content.len()))
            .finish()
    }
}

/// Observable state of a logical record after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// No version exists
    Absent,
    /// The latest version carries content
    Live,
    /// The latest version is empty
    Tombstoned,
}

impl RecordState {
    /// Derive the state from a resolved version, if any.
    pub fn of(version: Option<&RecordVersion>) -> Self {
        match version {
            None => RecordState::Absent,
            Some(v) if v.is_tombstone() => RecordState::Tombstoned,
            Some(_) => RecordState::Live,
        }
    }
}

/// Reduce versions to the latest one per d-tag.
///
/// Versions whose d-tag cannot be parsed are skipped.
pub fn resolve_latest<I>(versions: I) -> BTreeMap<DTag, RecordVersion>
where
    I: IntoIterator<Item = RecordVersion>,
{
    let mut latest: BTreeMap<DTag, RecordVersion> = BTreeMap::new();

    for version in versions {
        let key = match DTag::parse(&version.d_tag) {
            Ok(key) => key,
            Err(e) => {
                tracing::trace!("skipping version {}: {}", version.origin_id, e);
                continue;
            }
        };

        match latest.get(&key) {
            Some(current) if !version.supersedes(current) => {}
            _ => {
                latest.insert(key, version);
            }
        }
    }

    latest
}

/// Merge two already-resolved maps.
///
/// Equivalent to resolving the union of their inputs.
pub fn merge(
    mut left: BTreeMap<DTag, RecordVersion>,
    right: BTreeMap<DTag, RecordVersion>,
) -> BTreeMap<DTag, RecordVersion> {
    for (key, version) in right {
        match left.get(&key) {
            Some(current) if !version.supersedes(current) => {}
            _ => {
                left.insert(key, version);
            }
        }
    }
    left
}

/// Group envelope ids by d-tag, newest first.
///
/// Physical deletion needs every envelope ever published for a record, not
/// only the winning one.
pub fn envelope_ids_by_dtag<'a, I>(versions: I) -> BTreeMap<DTag, Vec<EventId>>
where
    I: IntoIterator<Item = &'a RecordVersion>,
{
    let mut grouped: BTreeMap<DTag, Vec<(Timestamp, EventId)>> = BTreeMap::new();
    for version in versions {
        if let Ok(key) = DTag::parse(&version.d_tag) {
            grouped.entry(key).or_default().push(version.rank());
        }
    }
    grouped
        .into_iter()
        .map(|(key, mut ranks)| {
            ranks.sort_unstable_by(|a, b| b.cmp(a));
            ranks.dedup();
            (key, ranks.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn version(d_tag: &str, created_at: u64, id_byte: u8, content: SecretBundle) -> RecordVersion {
        RecordVersion {
            content,
            d_tag: d_tag.to_string(),
            created_at: Timestamp::from_secs(created_at),
            author: PublicKey::new([1u8; 32]),
            origin_id: EventId::new([id_byte; 32]),
        }
    }

    fn bundle(pairs: &[(&str, serde_json::Value)]) -> SecretBundle {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    fn key(d: &str) -> DTag {
        DTag::parse(d).unwrap()
    }

    // ===========================================
    // Latest-wins
    // ===========================================

    #[test]
    fn later_version_replaces_earlier() {
        let v1 = version("app|dev", 1000, 1, bundle(&[("V", json!("1"))]));
        let v2 = version(
            "app|dev",
            2000,
            2,
            bundle(&[("V", json!("2")), ("NEW", json!("x"))]),
        );

        let resolved = resolve_latest([v1, v2.clone()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&key("app|dev")].content, v2.content);
    }

    #[test]
    fn earlier_arrival_order_does_not_matter() {
        let v1 = version("app|dev", 1000, 1, bundle(&[("V", json!("1"))]));
        let v2 = version("app|dev", 2000, 2, bundle(&[("V", json!("2"))]));

        let forward = resolve_latest([v1.clone(), v2.clone()]);
        let backward = resolve_latest([v2, v1]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn tombstone_wins_when_newer() {
        let live = version("proj|prod", 1000, 1, bundle(&[("SECRET", json!("value"))]));
        let tomb = version("proj|prod", 1100, 2, SecretBundle::new());

        let resolved = resolve_latest([live, tomb]);
        let latest = &resolved[&key("proj|prod")];
        assert!(latest.content.is_empty());
        assert_eq!(RecordState::of(Some(latest)), RecordState::Tombstoned);
    }

    #[test]
    fn rewrite_after_tombstone_revives_record() {
        let live = version("p|e", 1000, 1, bundle(&[("A", json!(1))]));
        let tomb = version("p|e", 1100, 2, SecretBundle::new());
        let revived = version("p|e", 1200, 3, bundle(&[("A", json!(2))]));

        let resolved = resolve_latest([tomb, revived, live]);
        assert_eq!(
            RecordState::of(resolved.get(&key("p|e"))),
            RecordState::Live
        );
        assert_eq!(resolved[&key("p|e")].content.get("A"), Some(&json!(2)));
    }

    #[test]
    fn equal_timestamps_break_on_greater_envelope_id() {
        let low = version("p|e", 1000, 0x10, bundle(&[("W", json!("low"))]));
        let high = version("p|e", 1000, 0xf0, bundle(&[("W", json!("high"))]));

        for input in [vec![low.clone(), high.clone()], vec![high.clone(), low.clone()]] {
            let resolved = resolve_latest(input);
            assert_eq!(resolved[&key("p|e")].origin_id, high.origin_id);
        }
    }

    #[test]
    fn duplicates_collapse() {
        let v = version("p|e", 1000, 7, bundle(&[("K", json!("v"))]));
        let resolved = resolve_latest([v.clone(), v.clone(), v.clone()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&key("p|e")], v);
    }

    #[test]
    fn records_are_independent() {
        let a = version("a|dev", 5000, 1, bundle(&[("A", json!(1))]));
        let b = version("b|dev", 10, 2, bundle(&[("B", json!(1))]));
        let resolved = resolve_latest([a, b]);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn unparsable_dtags_are_skipped() {
        let bad = version("no-separator", 9999, 9, bundle(&[("X", json!(1))]));
        let good = version("p|e", 1, 1, bundle(&[("Y", json!(1))]));
        let resolved = resolve_latest([bad, good]);
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key(&key("p|e")));
    }

    #[test]
    fn absent_record_state() {
        let resolved = resolve_latest(Vec::<RecordVersion>::new());
        assert_eq!(
            RecordState::of(resolved.get(&key("p|e"))),
            RecordState::Absent
        );
    }

    #[test]
    fn merge_matches_resolving_union() {
        let a = vec![
            version("p|e", 1000, 1, bundle(&[("V", json!(1))])),
            version("q|e", 3000, 2, bundle(&[("V", json!(1))])),
        ];
        let b = vec![
            version("p|e", 2000, 3, bundle(&[("V", json!(2))])),
            version("q|e", 1000, 4, bundle(&[("V", json!(0))])),
        ];

        let merged = merge(resolve_latest(a.clone()), resolve_latest(b.clone()));
        let union = resolve_latest(a.into_iter().chain(b));
        assert_eq!(merged, union);
    }

    #[test]
    fn envelope_ids_grouped_newest_first() {
        let versions = [
            version("p|e", 1000, 1, SecretBundle::new()),
            version("p|e", 3000, 3, SecretBundle::new()),
            version("p|e", 2000, 2, SecretBundle::new()),
            version("p|e", 2000, 2, SecretBundle::new()),
            version("q|e", 1, 9, SecretBundle::new()),
        ];
        let grouped = envelope_ids_by_dtag(versions.iter());
        assert_eq!(
            grouped[&key("p|e")],
            vec![
                EventId::new([3; 32]),
                EventId::new([2; 32]),
                EventId::new([1; 32])
            ]
        );
        assert_eq!(grouped[&key("q|e")], vec![EventId::new([9; 32])]);
    }

    #[test]
    fn debug_redacts_content() {
        let v = version("p|e", 1, 1, bundle(&[("TOKEN", json!("abc123"))]));
        let debug = format!("{:?}", v);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("abc123"));
    }

    // ===========================================
    // Order independence
    // ===========================================

    fn arb_version() -> impl Strategy<Value = RecordVersion> {
        (
            0usize..3,
            0u64..5,
            any::<u8>(),
            0u8..3,
        )
            .prop_map(|(d, t, id, v)| {
                let d_tag = ["a|x", "b|x", "c|y"][d];
                let content = if v == 0 {
                    SecretBundle::new()
                } else {
                    bundle(&[("V", json!(v))])
                };
                // Envelope ids are content hashes: distinct versions never share one
                let mut origin = [0u8; 32];
                origin[0] = id;
                origin[1] = d as u8;
                origin[2] = t as u8;
                origin[3] = v;
                RecordVersion {
                    origin_id: EventId::new(origin),
                    ..version(d_tag, t, id, content)
                }
            })
    }

    proptest! {
        #[test]
        fn resolution_is_order_independent(
            (versions, shuffled) in prop::collection::vec(arb_version(), 0..24)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(resolve_latest(versions), resolve_latest(shuffled));
        }

        #[test]
        fn resolution_is_associative(
            a in prop::collection::vec(arb_version(), 0..10),
            b in prop::collection::vec(arb_version(), 0..10),
            c in prop::collection::vec(arb_version(), 0..10),
        ) {
            let ab = merge(resolve_latest(a.clone()), resolve_latest(b.clone()));
            let left = merge(ab, resolve_latest(c.clone()));
            let right = merge(resolve_latest(a), merge(resolve_latest(b), resolve_latest(c)));
            prop_assert_eq!(left, right);
        }
    }
}
