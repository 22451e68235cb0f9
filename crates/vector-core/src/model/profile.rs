use serde::{Deserialize, Serialize};

/// Decoded `kind=0` metadata content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default, rename = "picture")]
    pub picture_url: Option<String>,
    #[serde(default)]
    pub nip05: Option<String>,
}
