//! Error taxonomy for the inbox core.
//!
//! One variant-rich enum per layer, matching the propagation policy: local
//! recovery happens inside per-relay tasks, and only `StoreError` /
//! `ConfigError` ever reach the controller as an `InboxError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("gift-wrap or seal could not be decrypted")]
    DecryptFailed,
    #[error("inner seal event failed signature verification")]
    InvalidInnerSignature,
    #[error("seal author does not match rumor author")]
    AuthorMismatch,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lmdb environment error: {0}")]
    Env(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("value decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("socket closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("malformed frame: {0}")]
    ProtocolParse(String),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("event rejected: {reason}")]
    InvalidEvent { reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("default relay set is empty")]
    EmptyDefaultRelays,
    #[error("invalid relay uri: {0}")]
    InvalidRelayUri(String),
    #[error("key material unavailable: {0}")]
    KeyMaterial(String),
}

/// Top-level error surfaced to callers of [`crate::controller::InboxModel`].
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = InboxError> = std::result::Result<T, E>;
