//! C1: transactional persistence of events, profiles, follow lists, and
//! derived timeline indices, backed by an embedded LMDB environment (the
//! `Lmdb` capability of spec.md §1, realized here with `heed`). Grounded on
//! the teacher's `db/events.rs`/`db/profiles.rs` operation shapes, with the
//! storage engine itself enriched from the pack's LMDB-based Nostr clients
//! since the teacher used SQLite for reasons specific to its desktop app.

mod schema;

pub use schema::Stamped;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{Event, EventId, EventWithRelays, Follow, Kind, Profile, PubKey, Relay};
use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

type EventsDb = Database<Bytes, SerdeBincode<EventWithRelays>>;
type ProfilesDb = Database<Bytes, SerdeBincode<Stamped<Profile>>>;
type FollowsDb = Database<Bytes, SerdeBincode<Stamped<Vec<Follow>>>>;
type RelaysDb = Database<Bytes, SerdeBincode<Stamped<Vec<Relay>>>>;
type TimelineDb = Database<Bytes, Bytes>;
type RelayStatsDb = Database<Bytes, SerdeBincode<RelayCounters>>;

/// Per-relay validation counters (§7), persisted rather than held in the
/// connection handle since `dump` reads the store from its own process,
/// with no running `start` to query in-memory state from.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct RelayCounters {
    pub invalid_events: u64,
    pub decrypt_errors: u64,
}

/// An operation produced by [`crate::router`] and applied transactionally
/// by [`EventStore::apply`]. Routing logic stays I/O-free; only `apply`
/// touches LMDB.
#[derive(Debug, Clone)]
pub enum StoreOp {
    UpsertEvent(EventWithRelays),
    IndexPostTimeline {
        author: PubKey,
        created_at: i64,
        event_id: EventId,
    },
    IndexChatTimeline {
        participant: PubKey,
        created_at: i64,
        event_id: EventId,
    },
    /// Removes `target` iff it is currently stored and owned by `requested_by`.
    DeleteRequested {
        target: EventId,
        requested_by: PubKey,
    },
    UpsertProfile(PubKey, Stamped<Profile>),
    ReplaceFollows(PubKey, Stamped<Vec<Follow>>),
    ReplaceGeneralRelays(PubKey, Stamped<Vec<Relay>>),
    ReplaceDmRelays(PubKey, Stamped<Vec<Relay>>),
}

pub enum Timeline {
    Post,
    Chat,
}

/// Transactional, ordered key-value store with five logical tables (plus
/// two relay-list tables) and a single process-wide write lock; readers use
/// independent snapshot transactions.
pub struct EventStore {
    env: Env,
    events: EventsDb,
    profiles: ProfilesDb,
    follows: FollowsDb,
    general_relays: RelaysDb,
    dm_relays: RelaysDb,
    post_timeline: TimelineDb,
    chat_timeline: TimelineDb,
    relay_stats: RelayStatsDb,
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Opens (creating if absent) the LMDB environment at `path` with the
    /// eight named sub-databases and the capacity floors of §6.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path).map_err(|e| StoreError::Env(e.to_string()))?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.max_map_size_bytes)
                .max_readers(config.max_readers)
                .max_dbs(config.max_named_databases)
                .open(path)
                .map_err(|e| StoreError::Env(e.to_string()))?
        };

        let mut wtxn = env.write_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        let events = env
            .database_options()
            .types::<Bytes, SerdeBincode<EventWithRelays>>()
            .name("events")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let profiles = env
            .database_options()
            .types::<Bytes, SerdeBincode<Stamped<Profile>>>()
            .name("profiles")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let follows = env
            .database_options()
            .types::<Bytes, SerdeBincode<Stamped<Vec<Follow>>>>()
            .name("follows")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let general_relays = env
            .database_options()
            .types::<Bytes, SerdeBincode<Stamped<Vec<Relay>>>>()
            .name("general_relays")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let dm_relays = env
            .database_options()
            .types::<Bytes, SerdeBincode<Stamped<Vec<Relay>>>>()
            .name("dm_relays")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let post_timeline = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("post_timeline")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let chat_timeline = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("chat_timeline")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        let relay_stats = env
            .database_options()
            .types::<Bytes, SerdeBincode<RelayCounters>>()
            .name("relay_stats")
            .create(&mut wtxn)
            .map_err(|e| StoreError::Env(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            events,
            profiles,
            follows,
            general_relays,
            dm_relays,
            post_timeline,
            chat_timeline,
            relay_stats,
            write_lock: Mutex::new(()),
        })
    }

    /// Applies a batch of store operations inside one write transaction.
    /// Per §5, writers are serialized by `write_lock`; readers never block.
    pub fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        for op in ops {
            self.apply_one(&mut wtxn, op)?;
        }
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    fn apply_one(&self, wtxn: &mut RwTxn<'_>, op: StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::UpsertEvent(mut ev) => {
                let key = *ev.event.id.as_bytes();
                if let Some(existing) = self
                    .events
                    .get(wtxn, &key)
                    .map_err(|e| StoreError::Transaction(e.to_string()))?
                {
                    ev.relays.extend(existing.relays);
                }
                self.events
                    .put(wtxn, &key, &ev)
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
            }
            StoreOp::IndexPostTimeline {
                author,
                created_at,
                event_id,
            } => {
                let key = schema::timeline_key(&author, created_at);
                self.post_timeline
                    .put(wtxn, &key, event_id.as_bytes())
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
            }
            StoreOp::IndexChatTimeline {
                participant,
                created_at,
                event_id,
            } => {
                let key = schema::timeline_key(&participant, created_at);
                self.chat_timeline
                    .put(wtxn, &key, event_id.as_bytes())
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
            }
            StoreOp::DeleteRequested {
                target,
                requested_by,
            } => {
                let key = *target.as_bytes();
                let Some(stored) = self
                    .events
                    .get(wtxn, &key)
                    .map_err(|e| StoreError::Transaction(e.to_string()))?
                else {
                    return Ok(());
                };
                if stored.event.pubkey != requested_by {
                    debug!(%target, "deletion ignored: author mismatch");
                    return Ok(());
                }
                self.events
                    .delete(wtxn, &key)
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
                self.remove_from_timeline(wtxn, &self.post_timeline, &stored.event)?;
                self.remove_from_timeline(wtxn, &self.chat_timeline, &stored.event)?;
            }
            StoreOp::UpsertProfile(pubkey, candidate) => {
                self.replace_if_newer(wtxn, self.profiles, &pubkey, candidate)?;
            }
            StoreOp::ReplaceFollows(pubkey, candidate) => {
                self.replace_if_newer(wtxn, self.follows, &pubkey, candidate)?;
            }
            StoreOp::ReplaceGeneralRelays(pubkey, candidate) => {
                self.replace_if_newer(wtxn, self.general_relays, &pubkey, candidate)?;
            }
            StoreOp::ReplaceDmRelays(pubkey, candidate) => {
                self.replace_if_newer(wtxn, self.dm_relays, &pubkey, candidate)?;
            }
        }
        Ok(())
    }

    fn replace_if_newer<T: serde::Serialize + for<'a> serde::Deserialize<'a> + Clone>(
        &self,
        wtxn: &mut RwTxn<'_>,
        db: Database<Bytes, SerdeBincode<Stamped<T>>>,
        pubkey: &PubKey,
        candidate: Stamped<T>,
    ) -> Result<(), StoreError> {
        let key = *pubkey.as_bytes();
        let current = db
            .get(wtxn, &key)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let should_write = match &current {
            Some(existing) => candidate.supersedes(existing),
            None => true,
        };
        if should_write {
            db.put(wtxn, &key, &candidate)
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
        }
        Ok(())
    }

    /// Removes the timeline entry for `event` from `db`, trying both the
    /// author (post) and every `p`-tagged participant (chat) keyspaces,
    /// since the caller doesn't track which table originally indexed it.
    fn remove_from_timeline(
        &self,
        wtxn: &mut RwTxn<'_>,
        db: &TimelineDb,
        event: &Event,
    ) -> Result<(), StoreError> {
        let mut candidates = vec![event.pubkey];
        candidates.extend(event.tag_p_targets().copied());
        for pk in candidates {
            let key = schema::timeline_key(&pk, event.created_at);
            if let Some(found) = db
                .get(wtxn, &key)
                .map_err(|e| StoreError::Transaction(e.to_string()))?
            {
                if found == event.id.as_bytes() {
                    db.delete(wtxn, &key)
                        .map_err(|e| StoreError::Transaction(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<EventWithRelays>, StoreError> {
        let rtxn = self.read_txn()?;
        self.events
            .get(&rtxn, id.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    pub fn get_profile(&self, pubkey: &PubKey) -> Result<(Profile, i64), StoreError> {
        let rtxn = self.read_txn()?;
        let stamped = self
            .profiles
            .get(&rtxn, pubkey.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(match stamped {
            Some(s) => (s.value, s.created_at),
            None => (Profile::default(), 0),
        })
    }

    pub fn get_follows(&self, pubkey: &PubKey) -> Result<Vec<Follow>, StoreError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .follows
            .get(&rtxn, pubkey.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .map(|s| s.value)
            .unwrap_or_default())
    }

    pub fn get_general_relays(&self, pubkey: &PubKey) -> Result<Vec<Relay>, StoreError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .general_relays
            .get(&rtxn, pubkey.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .map(|s| s.value)
            .unwrap_or_default())
    }

    pub fn get_dm_relays(&self, pubkey: &PubKey) -> Result<Vec<Relay>, StoreError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .dm_relays
            .get(&rtxn, pubkey.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .map(|s| s.value)
            .unwrap_or_default())
    }

    /// Newest-first event ids for `author`, via a prefix scan whose keys
    /// already sort newest-first because `created_at` is stored inverted.
    pub fn get_timeline_ids(
        &self,
        timeline: Timeline,
        author: &PubKey,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError> {
        let rtxn = self.read_txn()?;
        let db = match timeline {
            Timeline::Post => &self.post_timeline,
            Timeline::Chat => &self.chat_timeline,
        };
        let prefix = schema::timeline_prefix(author);
        let mut ids = Vec::with_capacity(limit);
        let iter = db
            .prefix_iter(&rtxn, &prefix)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        for entry in iter.take(limit) {
            let (_key, value) = entry.map_err(|e| StoreError::Transaction(e.to_string()))?;
            match <[u8; 32]>::try_from(value) {
                Ok(bytes) => ids.push(EventId(bytes)),
                Err(_) => warn!("skipping malformed timeline value for {author}"),
            }
        }
        Ok(ids)
    }

    /// The minimum, over `authors`, of the maximum `created_at` stored for
    /// any of `kinds` authored by that identity — used to derive `since`
    /// for resubscription so already-persisted history isn't re-fetched.
    /// `None` if any author has no matching stored event (forces a full
    /// history fetch for that author on the shared subscription).
    pub fn get_latest_timestamp(
        &self,
        authors: &[PubKey],
        kinds: &[Kind],
    ) -> Result<Option<i64>, StoreError> {
        if authors.is_empty() {
            return Ok(None);
        }
        let rtxn = self.read_txn()?;
        let mut floor: Option<i64> = None;
        for author in authors {
            let mut max_for_author: Option<i64> = None;
            for entry in self
                .events
                .iter(&rtxn)
                .map_err(|e| StoreError::Transaction(e.to_string()))?
            {
                let (_key, ev) = entry.map_err(|e| StoreError::Transaction(e.to_string()))?;
                if &ev.event.pubkey == author && kinds.contains(&ev.event.kind) {
                    max_for_author = Some(max_for_author.map_or(ev.event.created_at, |m| {
                        m.max(ev.event.created_at)
                    }));
                }
            }
            let Some(max_for_author) = max_for_author else {
                return Ok(None);
            };
            floor = Some(floor.map_or(max_for_author, |f| f.min(max_for_author)));
        }
        Ok(floor)
    }

    /// Increments `relay`'s invalid-event counter by one, consumed by the
    /// CLI's `dump` command (§7).
    pub fn record_invalid_event(&self, relay: &str) -> Result<(), StoreError> {
        self.bump_relay_counter(relay, |c| c.invalid_events += 1)
    }

    /// Increments `relay`'s decrypt-failure counter by one, consumed by the
    /// CLI's `dump` command (§7).
    pub fn record_decrypt_error(&self, relay: &str) -> Result<(), StoreError> {
        self.bump_relay_counter(relay, |c| c.decrypt_errors += 1)
    }

    fn bump_relay_counter(
        &self,
        relay: &str,
        update: impl FnOnce(&mut RelayCounters),
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let mut counters = self
            .relay_stats
            .get(&wtxn, relay.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .unwrap_or_default();
        update(&mut counters);
        self.relay_stats
            .put(&mut wtxn, relay.as_bytes(), &counters)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    pub fn get_relay_counters(&self, relay: &str) -> Result<RelayCounters, StoreError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .relay_stats
            .get(&rtxn, relay.as_bytes())
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .unwrap_or_default())
    }

    pub fn get_all_relay_counters(&self) -> Result<Vec<(String, RelayCounters)>, StoreError> {
        let rtxn = self.read_txn()?;
        let mut out = Vec::new();
        for entry in self
            .relay_stats
            .iter(&rtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?
        {
            let (key, counters) = entry.map_err(|e| StoreError::Transaction(e.to_string()))?;
            let relay = String::from_utf8_lossy(key).into_owned();
            out.push((relay, counters));
        }
        Ok(out)
    }

    fn read_txn(&self) -> Result<RoTxn<'_>, StoreError> {
        self.env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventId, Kind};

    fn store(dir: &tempfile::TempDir) -> EventStore {
        EventStore::open(dir.path(), &StoreConfig::default()).unwrap()
    }

    fn sample_event(pubkey: PubKey, created_at: i64, kind: Kind) -> Event {
        let mut ev = Event {
            id: EventId([0u8; 32]),
            pubkey,
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: [0u8; 64],
        };
        ev.id = ev.canonical_id();
        ev
    }

    #[test]
    fn upsert_event_merges_relay_sets_on_reinsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let pk = PubKey::from_bytes([2u8; 32]);
        let ev = sample_event(pk, 100, Kind::ShortTextNote);

        store
            .apply(vec![StoreOp::UpsertEvent(EventWithRelays::new(
                ev.clone(),
                "wss://a",
            ))])
            .unwrap();
        store
            .apply(vec![StoreOp::UpsertEvent(EventWithRelays::new(
                ev.clone(),
                "wss://b",
            ))])
            .unwrap();

        let stored = store.get_event(&ev.id).unwrap().unwrap();
        assert_eq!(stored.relays.len(), 2);
    }

    #[test]
    fn profile_last_writer_wins_by_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let pk = PubKey::from_bytes([3u8; 32]);

        let older = Stamped::new(
            Profile {
                name: Some("a".into()),
                ..Default::default()
            },
            100,
            EventId([1u8; 32]),
        );
        let newer = Stamped::new(
            Profile {
                name: Some("b".into()),
                ..Default::default()
            },
            200,
            EventId([2u8; 32]),
        );
        let stale = Stamped::new(
            Profile {
                name: Some("c".into()),
                ..Default::default()
            },
            150,
            EventId([3u8; 32]),
        );

        store.apply(vec![StoreOp::UpsertProfile(pk, older)]).unwrap();
        store.apply(vec![StoreOp::UpsertProfile(pk, newer)]).unwrap();
        store.apply(vec![StoreOp::UpsertProfile(pk, stale)]).unwrap();

        let (profile, ts) = store.get_profile(&pk).unwrap();
        assert_eq!(profile.name.as_deref(), Some("b"));
        assert_eq!(ts, 200);
    }

    #[test]
    fn deletion_requires_matching_author() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let author = PubKey::from_bytes([4u8; 32]);
        let other = PubKey::from_bytes([5u8; 32]);
        let ev = sample_event(author, 100, Kind::ShortTextNote);

        store
            .apply(vec![StoreOp::UpsertEvent(EventWithRelays::new(
                ev.clone(),
                "wss://a",
            ))])
            .unwrap();
        store
            .apply(vec![StoreOp::DeleteRequested {
                target: ev.id,
                requested_by: other,
            }])
            .unwrap();
        assert!(store.get_event(&ev.id).unwrap().is_some());

        store
            .apply(vec![StoreOp::DeleteRequested {
                target: ev.id,
                requested_by: author,
            }])
            .unwrap();
        assert!(store.get_event(&ev.id).unwrap().is_none());
    }

    #[test]
    fn timeline_scan_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let pk = PubKey::from_bytes([6u8; 32]);

        for created_at in [100, 300, 200] {
            let ev = sample_event(pk, created_at, Kind::ShortTextNote);
            store
                .apply(vec![
                    StoreOp::UpsertEvent(EventWithRelays::new(ev.clone(), "wss://a")),
                    StoreOp::IndexPostTimeline {
                        author: pk,
                        created_at,
                        event_id: ev.id,
                    },
                ])
                .unwrap();
        }

        let ids = store.get_timeline_ids(Timeline::Post, &pk, 10).unwrap();
        let timestamps: Vec<i64> = ids
            .iter()
            .map(|id| store.get_event(id).unwrap().unwrap().event.created_at)
            .collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }
}
