//! Relay query filter.

use serde::{Deserialize, Serialize};

use crate::{Event, EventId, Kind, PublicKey, Timestamp};

/// Selects stored events on a relay.
///
/// Every present field must match; absent fields match everything. Tag
/// filters (`#p`, `#t`, `#e`) match when any tag of that name carries one of
/// the listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Exact event ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    /// Signer public keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    /// Event kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    /// Values of `p` tags
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    /// Values of `t` tags
    #[serde(rename = "#t", default, skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    /// Values of `e` tags
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub e_tags: Option<Vec<String>>,
    /// Only events created at or after this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    /// Only events created at or before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    /// Maximum number of stored events to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// An empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single event id.
    pub fn id(self, id: EventId) -> Self {
        self.ids([id])
    }

    /// Match any of the given ids.
    pub fn ids<I: IntoIterator<Item = EventId>>(mut self, ids: I) -> Self {
        self.ids.get_or_insert_with(Vec::new).extend(ids);
        self
    }

    /// Match events signed by this key.
    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author);
        self
    }

    /// Match events of this kind.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Match events whose `p` tag points at this key.
    pub fn pubkey_tag(mut self, pubkey: &PublicKey) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pubkey.to_hex());
        self
    }

    /// Match events carrying this `t` marker.
    pub fn hashtag(mut self, marker: &str) -> Self {
        self.t_tags
            .get_or_insert_with(Vec::new)
            .push(marker.to_string());
        self
    }

    /// Match events referencing this event id.
    pub fn event_tag(mut self, id: &EventId) -> Self {
        self.e_tags.get_or_insert_with(Vec::new).push(id.to_hex());
        self
    }

    /// Lower time bound (inclusive).
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Upper time bound (inclusive).
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Cap on the number of stored events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether an event satisfies this filter (ignores `limit`).
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        tag_matches(event, "p", self.p_tags.as_deref())
            && tag_matches(event, "t", self.t_tags.as_deref())
            && tag_matches(event, "e", self.e_tags.as_deref())
    }
}

fn tag_matches(event: &Event, name: &str, wanted: Option<&[String]>) -> bool {
    match wanted {
        None => true,
        Some(values) => event
            .tag_values(name)
            .any(|v| values.iter().any(|w| w == v)),
    }
}
