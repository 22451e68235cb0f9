use super::relay::Relay;
use super::PubKey;
use serde::{Deserialize, Serialize};

/// A single entry in a follow list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub target: PubKey,
    pub relay_hint: Option<Relay>,
    pub petname: Option<String>,
}
