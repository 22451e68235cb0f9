//! C5: classifies each arriving event by kind and decides its store
//! operations, plus whether it should trigger a topology reconfigure. Pure
//! with respect to I/O — gift-wrap decryption is CPU-bound, not I/O, so it
//! stays here rather than moving into the store (§5: "signature
//! verification and decryption are synchronous ... must not hold any
//! lock"). Grounded on the teacher's `handle_event_with_context` kind
//! dispatch, trimmed to this spec's kind set and made side-effect-free:
//! this function only decides what should happen, `EventStore::apply`
//! performs it.

use crate::crypto;
use crate::model::{is_valid_relay_uri, Event, Follow, Kind, Profile, PubKey, Relay, RelayRole, Tag};
use crate::store::{Stamped, StoreOp};
use nostr::Keys;
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureRequest {
    ViewerFollowListChanged,
    RelayListChanged(PubKey),
    ViewerDmRelaysChanged,
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Applied(Vec<StoreOp>, Option<ReconfigureRequest>),
    /// Failed `crypto::validate` — dropped without store effect.
    InvalidEvent,
    /// A `GiftWrap` that could not be unwrapped.
    DecryptFailed,
}

/// Routes one externally sourced event. `viewer`/`viewer_pubkey` are only
/// used for gift-wrap decryption and to tell whether a metadata event is
/// about the viewer's own identity.
pub fn route(relay: &str, event: &Event, viewer: &Keys, viewer_pubkey: &PubKey) -> RouteOutcome {
    if !crypto::validate(event) {
        return RouteOutcome::InvalidEvent;
    }

    let mut ops = vec![StoreOp::UpsertEvent(crate::model::EventWithRelays::new(
        event.clone(),
        relay.to_string(),
    ))];
    let mut reconfigure = None;

    match event.kind {
        Kind::ShortTextNote | Kind::Comment => {
            ops.push(StoreOp::IndexPostTimeline {
                author: event.pubkey,
                created_at: event.created_at,
                event_id: event.id,
            });
        }
        Kind::Repost => {
            if let Some(()) = validate_repost(event) {
                ops.push(StoreOp::IndexPostTimeline {
                    author: event.pubkey,
                    created_at: event.created_at,
                    event_id: event.id,
                });
            }
        }
        Kind::GiftWrap => match crypto::unwrap_gift_wrap(event, viewer) {
            Ok(rumor) => {
                for participant in gift_wrap_participants(&rumor.pubkey, &rumor.tags, viewer_pubkey)
                {
                    ops.push(StoreOp::IndexChatTimeline {
                        participant,
                        created_at: rumor.created_at,
                        event_id: event.id,
                    });
                }
            }
            Err(_) => return RouteOutcome::DecryptFailed,
        },
        Kind::EventDeletion => {
            for target in event.tag_e_targets() {
                ops.push(StoreOp::DeleteRequested {
                    target: *target,
                    requested_by: event.pubkey,
                });
            }
        }
        Kind::Metadata => match serde_json::from_str::<Profile>(&event.content) {
            Ok(profile) => ops.push(StoreOp::UpsertProfile(
                event.pubkey,
                Stamped::new(profile, event.created_at, event.id),
            )),
            Err(e) => warn!(error = %e, "malformed profile metadata, event still persisted"),
        },
        Kind::FollowList => {
            let follows: Vec<Follow> = event
                .tags
                .iter()
                .filter_map(|t| match t {
                    Tag::PTag {
                        pubkey,
                        relay_hint,
                        petname,
                    } => Some(Follow {
                        target: *pubkey,
                        relay_hint: relay_hint
                            .as_ref()
                            .filter(|uri| is_valid_relay_uri(uri))
                            .map(|uri| Relay {
                                uri: uri.clone(),
                                role: RelayRole::Both,
                            }),
                        petname: petname.clone(),
                    }),
                    _ => None,
                })
                .collect();
            ops.push(StoreOp::ReplaceFollows(
                event.pubkey,
                Stamped::new(follows, event.created_at, event.id),
            ));
            if event.pubkey == *viewer_pubkey {
                reconfigure = Some(ReconfigureRequest::ViewerFollowListChanged);
            }
        }
        Kind::RelayListMetadata => {
            let relays = parse_relay_tags(event);
            ops.push(StoreOp::ReplaceGeneralRelays(
                event.pubkey,
                Stamped::new(relays, event.created_at, event.id),
            ));
            reconfigure = Some(ReconfigureRequest::RelayListChanged(event.pubkey));
        }
        Kind::PreferredDmRelays => {
            let relays = parse_relay_tags(event)
                .into_iter()
                .map(|r| Relay {
                    role: RelayRole::DmRelay,
                    ..r
                })
                .collect();
            ops.push(StoreOp::ReplaceDmRelays(
                event.pubkey,
                Stamped::new(relays, event.created_at, event.id),
            ));
            if event.pubkey == *viewer_pubkey {
                reconfigure = Some(ReconfigureRequest::ViewerDmRelaysChanged);
            }
        }
        Kind::Seal | Kind::Reaction | Kind::Unknown(_) => {
            // Stored above via UpsertEvent; not routed further (§3).
        }
    }

    RouteOutcome::Applied(ops, reconfigure)
}

fn validate_repost(event: &Event) -> Option<()> {
    let inner: Event = serde_json::from_str(&event.content).ok()?;
    if !crypto::validate(&inner) {
        return None;
    }
    if event.tag_e_targets().next().is_none() {
        return None;
    }
    Some(())
}

fn parse_relay_tags(event: &Event) -> Vec<Relay> {
    event
        .tags
        .iter()
        .filter_map(|t| match t {
            Tag::RelayTag { uri, marker } if is_valid_relay_uri(uri) => Some(Relay {
                uri: uri.clone(),
                role: match marker.as_deref() {
                    Some("read") => RelayRole::InboxOnly,
                    Some("write") => RelayRole::OutboxOnly,
                    _ => RelayRole::Both,
                },
            }),
            _ => None,
        })
        .collect()
}

/// Participants of a decrypted gift-wrap rumor (§4.1): if the rumor's
/// author is the viewer, participants are every `PTag` target; otherwise
/// participants are the rumor author plus every `PTag` target, minus the
/// viewer.
fn gift_wrap_participants(
    rumor_author: &PubKey,
    rumor_tags: &[Tag],
    viewer: &PubKey,
) -> BTreeSet<PubKey> {
    let tagged: BTreeSet<PubKey> = rumor_tags.iter().filter_map(Tag::as_pubkey).copied().collect();
    if rumor_author == viewer {
        tagged
    } else {
        let mut participants = tagged;
        participants.insert(*rumor_author);
        participants.remove(viewer);
        participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PubKey;

    #[test]
    fn self_authored_rumor_excludes_viewer() {
        let viewer = PubKey::from_bytes([1u8; 32]);
        let u1 = PubKey::from_bytes([2u8; 32]);
        let u2 = PubKey::from_bytes([3u8; 32]);
        let tags = vec![
            Tag::PTag {
                pubkey: u1,
                relay_hint: None,
                petname: None,
            },
            Tag::PTag {
                pubkey: u2,
                relay_hint: None,
                petname: None,
            },
        ];
        let participants = gift_wrap_participants(&viewer, &tags, &viewer);
        assert_eq!(participants, [u1, u2].into_iter().collect());
    }

    #[test]
    fn other_authored_rumor_includes_author_excludes_viewer() {
        let viewer = PubKey::from_bytes([1u8; 32]);
        let u1 = PubKey::from_bytes([2u8; 32]);
        let u2 = PubKey::from_bytes([3u8; 32]);
        let tags = vec![
            Tag::PTag {
                pubkey: viewer,
                relay_hint: None,
                petname: None,
            },
            Tag::PTag {
                pubkey: u2,
                relay_hint: None,
                petname: None,
            },
        ];
        let participants = gift_wrap_participants(&u1, &tags, &viewer);
        assert_eq!(participants, [u1, u2].into_iter().collect());
    }
}
