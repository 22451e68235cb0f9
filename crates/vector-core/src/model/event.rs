use super::PubKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// The 32-byte canonical id of an [`Event`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        EventId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Event kinds relevant to the inbox. Anything else round-trips through
/// [`Kind::Unknown`] so unrecognized kinds are still persisted, just not
/// routed (per spec.md's Event Router contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Metadata,
    ShortTextNote,
    FollowList,
    EventDeletion,
    Repost,
    Reaction,
    Seal,
    GiftWrap,
    RelayListMetadata,
    PreferredDmRelays,
    Comment,
    Unknown(u16),
}

impl Kind {
    pub fn as_u16(self) -> u16 {
        match self {
            Kind::Metadata => 0,
            Kind::ShortTextNote => 1,
            Kind::FollowList => 3,
            Kind::EventDeletion => 5,
            Kind::Repost => 6,
            Kind::Reaction => 7,
            Kind::Seal => 13,
            Kind::GiftWrap => 1059,
            Kind::RelayListMetadata => 10002,
            Kind::PreferredDmRelays => 10050,
            Kind::Comment => 1111,
            Kind::Unknown(n) => n,
        }
    }

    pub fn from_u16(n: u16) -> Self {
        match n {
            0 => Kind::Metadata,
            1 => Kind::ShortTextNote,
            3 => Kind::FollowList,
            5 => Kind::EventDeletion,
            6 => Kind::Repost,
            7 => Kind::Reaction,
            13 => Kind::Seal,
            1059 => Kind::GiftWrap,
            10002 => Kind::RelayListMetadata,
            10050 => Kind::PreferredDmRelays,
            1111 => Kind::Comment,
            other => Kind::Unknown(other),
        }
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Kind::from_u16(u16::deserialize(d)?))
    }
}

/// A tagged entry in an event's tag list. Order within the event is
/// preserved by storing tags in a `Vec`, not a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    ETag {
        event_id: EventId,
        relay_hint: Option<String>,
        marker: Option<String>,
    },
    PTag {
        pubkey: PubKey,
        relay_hint: Option<String>,
        petname: Option<String>,
    },
    RelayTag {
        uri: String,
        marker: Option<String>,
    },
    Other(Vec<String>),
}

impl Tag {
    fn to_strings(&self) -> Vec<String> {
        match self {
            Tag::ETag {
                event_id,
                relay_hint,
                marker,
            } => {
                let mut v = vec!["e".to_string(), event_id.to_hex()];
                push_opt(&mut v, relay_hint, marker);
                v
            }
            Tag::PTag {
                pubkey,
                relay_hint,
                petname,
            } => {
                let mut v = vec!["p".to_string(), pubkey.to_hex()];
                push_opt(&mut v, relay_hint, petname);
                v
            }
            Tag::RelayTag { uri, marker } => {
                let mut v = vec!["r".to_string(), uri.clone()];
                if let Some(m) = marker {
                    v.push(m.clone());
                }
                v
            }
            Tag::Other(raw) => raw.clone(),
        }
    }

    fn from_strings(raw: Vec<String>) -> Tag {
        let at = |i: usize| raw.get(i).cloned();
        match raw.first().map(String::as_str) {
            Some("e") => match at(1).and_then(|s| EventId::from_hex(&s).ok()) {
                Some(event_id) => Tag::ETag {
                    event_id,
                    relay_hint: at(2).filter(|s| !s.is_empty()),
                    marker: at(3),
                },
                None => Tag::Other(raw),
            },
            Some("p") => match at(1).and_then(|s| PubKey::from_hex(&s).ok()) {
                Some(pubkey) => Tag::PTag {
                    pubkey,
                    relay_hint: at(2).filter(|s| !s.is_empty()),
                    petname: at(3),
                },
                None => Tag::Other(raw),
            },
            Some("r") => match at(1) {
                Some(uri) => Tag::RelayTag {
                    uri,
                    marker: at(2),
                },
                None => Tag::Other(raw),
            },
            _ => Tag::Other(raw),
        }
    }

    /// The pubkey this tag names, if it's a `p` tag.
    pub fn as_pubkey(&self) -> Option<&PubKey> {
        match self {
            Tag::PTag { pubkey, .. } => Some(pubkey),
            _ => None,
        }
    }

    /// The event id this tag names, if it's an `e` tag.
    pub fn as_event_id(&self) -> Option<&EventId> {
        match self {
            Tag::ETag { event_id, .. } => Some(event_id),
            _ => None,
        }
    }
}

fn push_opt(v: &mut Vec<String>, relay_hint: &Option<String>, third: &Option<String>) {
    match (relay_hint, third) {
        (Some(r), Some(t)) => {
            v.push(r.clone());
            v.push(t.clone());
        }
        (Some(r), None) => v.push(r.clone()),
        (None, Some(t)) => {
            v.push(String::new());
            v.push(t.clone());
        }
        (None, None) => {}
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_strings().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        Ok(Tag::from_strings(raw))
    }
}

/// A signed protocol event. Immutable once constructed; `id` and `sig` are
/// trusted only after [`crate::crypto::validate`] has been run on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PubKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    #[serde(with = "sig_hex")]
    pub sig: [u8; 64],
}

mod sig_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let mut buf = [0u8; 64];
        hex::decode_to_slice(&s, &mut buf).map_err(serde::de::Error::custom)?;
        Ok(buf)
    }
}

impl Event {
    /// The NIP-01 canonical id: SHA-256 over the minimal-whitespace JSON
    /// array `[0, pubkey, created_at, kind, tags, content]`.
    pub fn canonical_id(&self) -> EventId {
        #[derive(Serialize)]
        struct Preimage<'a>(u8, &'a PubKey, i64, u16, &'a Vec<Tag>, &'a str);

        let preimage = Preimage(
            0,
            &self.pubkey,
            self.created_at,
            self.kind.as_u16(),
            &self.tags,
            &self.content,
        );
        // serde_json's default Vec/String output already has no extraneous
        // whitespace, matching the protocol's minimal-whitespace rule.
        let json = serde_json::to_vec(&preimage).expect("preimage always serializes");
        let digest = Sha256::digest(&json);
        EventId(digest.into())
    }

    pub fn tag_p_targets(&self) -> impl Iterator<Item = &PubKey> {
        self.tags.iter().filter_map(Tag::as_pubkey)
    }

    pub fn tag_e_targets(&self) -> impl Iterator<Item = &EventId> {
        self.tags.iter().filter_map(Tag::as_event_id)
    }
}

/// An [`Event`] together with the set of relay URIs it has been observed on.
/// Re-observation is a union-merge of the relay set, never a replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWithRelays {
    pub event: Event,
    pub relays: BTreeSet<String>,
}

impl EventWithRelays {
    pub fn new(event: Event, relay: impl Into<String>) -> Self {
        let mut relays = BTreeSet::new();
        relays.insert(relay.into());
        Self { event, relays }
    }

    /// Union-merge another observation of the same event id into this one.
    pub fn observe(&mut self, relay: impl Into<String>) {
        self.relays.insert(relay.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pubkey() -> PubKey {
        PubKey::from_bytes([7u8; 32])
    }

    #[test]
    fn tag_round_trips_through_json() {
        let tag = Tag::PTag {
            pubkey: sample_pubkey(),
            relay_hint: Some("wss://relay.example".to_string()),
            petname: None,
        };
        let json = serde_json::to_value(&tag).unwrap();
        let back: Tag = serde_json::from_value(json).unwrap();
        assert_eq!(tag, back);
    }

    #[test]
    fn unknown_kind_round_trips() {
        let k = Kind::from_u16(30315);
        assert_eq!(k, Kind::Unknown(30315));
        assert_eq!(k.as_u16(), 30315);
    }

    #[test]
    fn canonical_id_is_deterministic() {
        let event = Event {
            id: EventId([0u8; 32]),
            pubkey: sample_pubkey(),
            created_at: 100,
            kind: Kind::ShortTextNote,
            tags: vec![],
            content: "hello".to_string(),
            sig: [0u8; 64],
        };
        let a = event.canonical_id();
        let b = event.canonical_id();
        assert_eq!(a, b);
    }
}
