//! InboxModel core: relay connection pooling, per-identity relay topology
//! derivation, event ingestion and validation, nested gift-wrap/seal/rumor
//! decryption, and the transactional local event store with derived
//! timeline indices.
//!
//! `controller::InboxModel` is the entry point; everything else is a
//! component it wires together (see each module's doc comment for which
//! piece of the architecture it is).

pub mod config;
pub mod connection;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod model;
pub mod router;
pub mod store;
pub mod subscription;
pub mod topology;
pub mod transport;

pub use config::InboxConfig;
pub use controller::InboxModel;
pub use error::{InboxError, Result};
pub use keystore::{FileKeyStore, KeyStore};
pub use store::EventStore;
pub use transport::TungsteniteTransport;
