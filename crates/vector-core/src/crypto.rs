//! C2: Schnorr verification and the nested gift-wrap → seal → rumor unwrap
//! pipeline. Stateless — every function takes its inputs and returns a
//! value, touching no shared state. Grounded on the `client.unwrap_gift_wrap`
//! call site in the teacher's event handler, reimplemented one layer down
//! against bare NIP-44/NIP-59 primitives since this spec models the unwrap
//! as its own component rather than delegating to an SDK client.

use crate::error::CryptoError;
use crate::model::{Event, Kind, PubKey, Tag};
use nostr::nips::nip44;
use nostr::{Keys, PublicKey as NostrPublicKey};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// An unsigned event skeleton recovered from inside a seal. Never persisted
/// on its own — the router turns it into `chat_timeline` entries.
#[derive(Debug, Clone)]
pub struct Rumor {
    pub pubkey: PubKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Recomputes the canonical id and verifies the Schnorr signature. MUST be
/// called on every externally sourced event before any side-effect.
pub fn validate(event: &Event) -> bool {
    if event.id != event.canonical_id() {
        return false;
    }
    verify_schnorr(&event.pubkey, event.id.as_bytes(), &event.sig)
}

fn verify_schnorr(pubkey: &PubKey, digest: &[u8; 32], sig: &[u8; 64]) -> bool {
    let Ok(xonly) = XOnlyPublicKey::from_slice(pubkey.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(sig) else {
        return false;
    };
    let message = Message::from_digest(*digest);
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&signature, &message, &xonly).is_ok()
}

fn to_nostr_pubkey(pubkey: &PubKey) -> Result<NostrPublicKey, CryptoError> {
    NostrPublicKey::from_slice(pubkey.as_bytes()).map_err(|_| CryptoError::DecryptFailed)
}

/// The unsigned 5-field event skeleton a rumor actually is on the wire
/// (§4.2): no `id`, no `sig`. Decrypting straight into `Event` would demand
/// both, which a genuine rumor never carries.
#[derive(Debug, Clone, Deserialize)]
struct UnsignedRumor {
    pubkey: PubKey,
    created_at: i64,
    kind: Kind,
    tags: Vec<Tag>,
    content: String,
}

/// Decrypts one NIP-44 layer addressed from `sender` to `viewer`, then
/// parses the plaintext as `T`.
fn decrypt_and_parse<T: DeserializeOwned>(
    viewer: &Keys,
    sender: &PubKey,
    ciphertext: &str,
) -> Result<T, CryptoError> {
    let sender_pk = to_nostr_pubkey(sender)?;
    let plaintext = nip44::decrypt(viewer.secret_key(), &sender_pk, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;
    serde_json::from_str(&plaintext).map_err(|_| CryptoError::DecryptFailed)
}

/// Given a `GiftWrap` event and the viewer's keypair: decrypt the outer
/// layer to a `Seal`, validate it, decrypt the inner layer to the rumor
/// skeleton, and check that the seal's author matches the rumor's claimed
/// author.
pub fn unwrap_gift_wrap(gift_wrap: &Event, viewer: &Keys) -> Result<Rumor, CryptoError> {
    let seal: Event = decrypt_and_parse(viewer, &gift_wrap.pubkey, &gift_wrap.content)?;
    if !validate(&seal) {
        return Err(CryptoError::InvalidInnerSignature);
    }
    let rumor: UnsignedRumor = decrypt_and_parse(viewer, &seal.pubkey, &seal.content)?;
    if seal.pubkey != rumor.pubkey {
        return Err(CryptoError::AuthorMismatch);
    }
    Ok(Rumor {
        pubkey: rumor.pubkey,
        created_at: rumor.created_at,
        kind: rumor.kind,
        tags: rumor.tags,
        content: rumor.content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventId;

    #[test]
    fn tampered_content_fails_validation() {
        let event = Event {
            id: EventId([0u8; 32]),
            pubkey: PubKey::from_bytes([1u8; 32]),
            created_at: 1,
            kind: Kind::ShortTextNote,
            tags: vec![],
            content: "hello".to_string(),
            sig: [0u8; 64],
        };
        // id is all-zero, which will never equal the real canonical hash.
        assert!(!validate(&event));
    }
}
