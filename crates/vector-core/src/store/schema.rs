//! Key encoding for the timeline tables and the last-writer-wins value
//! wrapper shared by the profile/follow/relay-list tables.

use crate::model::{EventId, PubKey};
use serde::{Deserialize, Serialize};

/// `(PubKey, inverted_ts)` timeline key. Timestamps are big-endian inverted
/// (`i64::MAX - created_at`) so that lexicographic byte order within a
/// pubkey's prefix already runs newest-first (§6).
pub fn timeline_key(author: &PubKey, created_at: i64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(author.as_bytes());
    key[32..].copy_from_slice(&inverted_ts(created_at).to_be_bytes());
    key
}

pub fn inverted_ts(created_at: i64) -> u64 {
    (i64::MAX - created_at) as u64
}

pub fn timeline_prefix(author: &PubKey) -> [u8; 32] {
    *author.as_bytes()
}

/// A stored value tagged with the `created_at` (and, for deterministic
/// tie-breaking, the originating event id) of the event that produced it.
/// Used for `profiles`, `follows`, `general_relays`, `dm_relays`: each
/// replace is last-writer-wins by `created_at`, ties broken by the lower
/// (lexicographically smaller) event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub created_at: i64,
    pub event_id: EventId,
}

impl<T> Stamped<T> {
    pub fn new(value: T, created_at: i64, event_id: EventId) -> Self {
        Self {
            value,
            created_at,
            event_id,
        }
    }

    /// True if `self` should replace `current` under the last-writer-wins
    /// rule: strictly newer wins; on a tie the lower event id wins.
    pub fn supersedes(&self, current: &Stamped<T>) -> bool {
        self.created_at > current.created_at
            || (self.created_at == current.created_at && self.event_id < current.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_key_orders_newest_first_ascending() {
        let pk = PubKey::from_bytes([1u8; 32]);
        let newer = timeline_key(&pk, 200);
        let older = timeline_key(&pk, 100);
        assert!(newer < older, "a larger created_at must sort first");
    }

    #[test]
    fn supersedes_prefers_strictly_newer() {
        let older = Stamped::new((), 100, EventId([0xffu8; 32]));
        let newer = Stamped::new((), 200, EventId([0u8; 32]));
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn supersedes_breaks_ties_on_lower_id() {
        let a = Stamped::new((), 100, EventId([0x01; 32]));
        let b = Stamped::new((), 100, EventId([0x02; 32]));
        assert!(a.supersedes(&b));
        assert!(!b.supersedes(&a));
    }
}
