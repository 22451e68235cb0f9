//! Shared signing/encryption helpers for the scenario tests. Lives outside
//! `src/` since nothing in the crate itself needs to mint signed events —
//! only tests standing in for a relay feed do.

use nostr::nips::nip44;
use nostr::Keys;
use secp256k1::{Keypair, Message, Secp256k1};
use serde::Serialize;
use vector_core::model::{Event, EventId, Kind, PubKey, Tag};

/// The unsigned 5-field shape a rumor takes on the wire, mirroring
/// `crypto::UnsignedRumor` — no `id`/`sig`, since a rumor is never signed.
#[derive(Serialize)]
struct RumorWire {
    pubkey: PubKey,
    created_at: i64,
    kind: Kind,
    tags: Vec<Tag>,
    content: String,
}

pub struct Identity {
    pub nostr_keys: Keys,
    keypair: Keypair,
    pub pubkey: PubKey,
}

pub fn identity() -> Identity {
    let nostr_keys = Keys::generate();
    let secp = Secp256k1::new();
    let sk_bytes = hex::decode(nostr_keys.secret_key().to_secret_hex()).expect("hex secret");
    let sk = secp256k1::SecretKey::from_slice(&sk_bytes).expect("valid secret key");
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let pubkey = PubKey::from_bytes(keypair.x_only_public_key().0.serialize());
    Identity {
        nostr_keys,
        keypair,
        pubkey,
    }
}

/// Stamps `event.pubkey`/`id`/`sig` for `author`, leaving every other field
/// as the caller built it.
pub fn sign(author: &Identity, mut event: Event) -> Event {
    event.pubkey = author.pubkey;
    event.id = event.canonical_id();
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*event.id.as_bytes());
    let sig = secp.sign_schnorr(&msg, &author.keypair);
    event.sig = *sig.as_ref();
    event
}

pub fn unsigned(kind: Kind, created_at: i64, tags: Vec<Tag>, content: impl Into<String>) -> Event {
    Event {
        id: EventId([0u8; 32]),
        pubkey: PubKey::from_bytes([0u8; 32]),
        created_at,
        kind,
        tags,
        content: content.into(),
        sig: [0u8; 64],
    }
}

/// Builds a gift-wrapped rumor authored by `rumor_author` and addressed (via
/// NIP-44) to `viewer`, sealed and wrapped by `wrapper` — per NIP-59 the
/// wrapper is normally a throwaway key, but the unwrap pipeline only
/// requires `seal.pubkey == rumor.pubkey`, so tests pass the same identity
/// for `wrapper` and `rumor_author` for the self-gift-wrap scenario and a
/// distinct one otherwise.
pub fn gift_wrap(
    wrapper: &Identity,
    rumor_author: &Identity,
    viewer: &Identity,
    rumor_tags: Vec<Tag>,
    rumor_created_at: i64,
    wrap_created_at: i64,
) -> Event {
    let viewer_nostr_pk = viewer.nostr_keys.public_key();

    let rumor = RumorWire {
        pubkey: rumor_author.pubkey,
        created_at: rumor_created_at,
        kind: Kind::ShortTextNote,
        tags: rumor_tags,
        content: "hi".to_string(),
    };
    let rumor_json = serde_json::to_string(&rumor).expect("rumor serializes");

    let seal_ciphertext = nip44::encrypt(
        rumor_author.nostr_keys.secret_key(),
        &viewer_nostr_pk,
        &rumor_json,
        nip44::Version::V2,
    )
    .expect("seal layer encrypts");
    let seal = sign(
        rumor_author,
        unsigned(Kind::Seal, wrap_created_at, vec![], seal_ciphertext),
    );
    let seal_json = serde_json::to_string(&seal).expect("seal serializes");

    let wrap_ciphertext = nip44::encrypt(
        wrapper.nostr_keys.secret_key(),
        &viewer_nostr_pk,
        &seal_json,
        nip44::Version::V2,
    )
    .expect("wrap layer encrypts");
    sign(
        wrapper,
        unsigned(Kind::GiftWrap, wrap_created_at, vec![], wrap_ciphertext),
    )
}
