//! Desired-topology derivation and the reconcile diff used by the
//! controller (§4.6). Pure with respect to connections — it only reads the
//! store and returns a value describing what *should* be connected and
//! subscribed; realizing it is the controller's job. Grounded on the
//! bundled `rust-nostr` gossip module's relay→pubkey bipartite derivation
//! and outbox-cap/prioritization logic, the one place in the whole pack
//! that builds this kind of map from scratch instead of calling into an
//! SDK's gossip layer.

use crate::model::{
    giftwrap_filter, mentions_filter, profiles_filter, user_posts_filter, Filter, Follow, Kind,
    PubKey, Relay,
};
use crate::store::EventStore;
use std::collections::{BTreeSet, HashMap};

/// What should be subscribed on one relay, and (for bipartite relays only)
/// the pubkey set behind it — used purely to detect churn in `reconcile`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayIntent {
    pub filters: Vec<Filter>,
    pub pubkeys: BTreeSet<PubKey>,
}

pub type Topology = HashMap<String, RelayIntent>;

/// Computes the desired topology from the viewer's identity, follow list,
/// and declared relays, reading `since` floors and followed identities'
/// outbox relays from the store.
pub fn derive_topology(
    store: &EventStore,
    viewer: PubKey,
    follows: &[Follow],
    viewer_inbox_relays: &[Relay],
    viewer_dm_relays: &[Relay],
    outbox_fanout_cap: usize,
) -> Topology {
    let mut topology = Topology::new();

    for relay in viewer_dm_relays {
        let since = store
            .get_latest_timestamp(&[viewer], &[Kind::GiftWrap])
            .unwrap_or(None);
        topology
            .entry(relay.uri.clone())
            .or_default()
            .filters
            .push(giftwrap_filter(viewer, since));
    }

    for relay in viewer_inbox_relays {
        let since = store
            .get_latest_timestamp(
                &[viewer],
                &[Kind::ShortTextNote, Kind::Repost, Kind::Comment, Kind::EventDeletion],
            )
            .unwrap_or(None);
        topology
            .entry(relay.uri.clone())
            .or_default()
            .filters
            .push(mentions_filter(viewer, since));
    }

    let inbox_uris: BTreeSet<&str> = viewer_inbox_relays.iter().map(|r| r.uri.as_str()).collect();
    let mut bipartite: HashMap<String, BTreeSet<PubKey>> = HashMap::new();
    for follow in follows {
        let outbox = store.get_general_relays(&follow.target).unwrap_or_default();
        let mut outbox_uris: Vec<&str> = outbox
            .iter()
            .filter(|r| r.role.is_outbox())
            .map(|r| r.uri.as_str())
            .collect();
        // Stable partition: prioritized (also an inbox relay of the
        // viewer) first, then the rest, preserving each group's order.
        outbox_uris.sort_by_key(|uri| !inbox_uris.contains(uri));
        for uri in outbox_uris.into_iter().take(outbox_fanout_cap) {
            bipartite.entry(uri.to_string()).or_default().insert(follow.target);
        }
    }

    for (relay_uri, pubkeys) in bipartite {
        let pks: Vec<PubKey> = pubkeys.iter().copied().collect();
        let since_profiles = store
            .get_latest_timestamp(
                &pks,
                &[Kind::RelayListMetadata, Kind::PreferredDmRelays, Kind::FollowList],
            )
            .unwrap_or(None);
        let since_posts = store
            .get_latest_timestamp(&pks, &[Kind::ShortTextNote, Kind::Repost, Kind::EventDeletion])
            .unwrap_or(None);
        let entry = topology.entry(relay_uri).or_default();
        entry.filters.push(profiles_filter(pks.clone(), since_profiles));
        entry.filters.push(user_posts_filter(pks, since_posts));
        entry.pubkeys = pubkeys;
    }

    topology
}

#[derive(Debug, Default, Clone)]
pub struct ReconcilePlan {
    pub to_remove: Vec<String>,
    pub to_add: Vec<(String, RelayIntent)>,
    pub to_update: Vec<(String, RelayIntent)>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty() && self.to_update.is_empty()
    }
}

/// Diffs `live` against `desired` (§4.6): relays present only in `live` are
/// removed, relays present only in `desired` are added, and relays present
/// in both with a different pubkey set are updated (resubscribed).
pub fn reconcile(live: &Topology, desired: &Topology) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for uri in live.keys() {
        if !desired.contains_key(uri) {
            plan.to_remove.push(uri.clone());
        }
    }
    for (uri, intent) in desired {
        match live.get(uri) {
            None => plan.to_add.push((uri.clone(), intent.clone())),
            Some(live_intent) if live_intent.pubkeys != intent.pubkeys => {
                plan.to_update.push((uri.clone(), intent.clone()));
            }
            Some(_) => {}
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::model::RelayRole;

    fn relay(uri: &str, role: RelayRole) -> Relay {
        Relay {
            uri: uri.to_string(),
            role,
        }
    }

    #[test]
    fn bipartite_caps_outbox_fanout_and_prioritizes_inbox_relays() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path(), &StoreConfig::default()).unwrap();
        let viewer = PubKey::from_bytes([1u8; 32]);
        let follow_pk = PubKey::from_bytes([2u8; 32]);

        store
            .apply(vec![crate::store::StoreOp::ReplaceGeneralRelays(
                follow_pk,
                crate::store::Stamped::new(
                    vec![
                        relay("wss://other-one", RelayRole::OutboxOnly),
                        relay("wss://viewer-inbox", RelayRole::OutboxOnly),
                        relay("wss://other-two", RelayRole::OutboxOnly),
                        relay("wss://other-three", RelayRole::OutboxOnly),
                    ],
                    100,
                    crate::model::EventId([0u8; 32]),
                ),
            )])
            .unwrap();

        let follows = vec![Follow {
            target: follow_pk,
            relay_hint: None,
            petname: None,
        }];
        let viewer_inbox = vec![relay("wss://viewer-inbox", RelayRole::InboxOnly)];

        let topology = derive_topology(&store, viewer, &follows, &viewer_inbox, &[], 2);

        // The viewer's own inbox relay plus the 2 capped outbox relays,
        // prioritizing the one that overlaps the viewer's inbox.
        assert!(topology.contains_key("wss://viewer-inbox"));
        let bipartite_relays: Vec<&String> = topology
            .keys()
            .filter(|uri| uri.as_str() != "wss://viewer-inbox")
            .collect();
        assert_eq!(bipartite_relays.len(), 1);
    }

    #[test]
    fn reconcile_is_empty_when_nothing_changed() {
        let mut topology = Topology::new();
        topology.insert(
            "wss://a".to_string(),
            RelayIntent {
                filters: vec![],
                pubkeys: [PubKey::from_bytes([1u8; 32])].into_iter().collect(),
            },
        );
        let plan = reconcile(&topology, &topology.clone());
        assert!(plan.is_empty());
    }
}
