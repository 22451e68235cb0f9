use super::{Kind, PubKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A subscription filter. `None` fields are omitted from the wire encoding
/// entirely rather than sent as empty sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<PubKey>>,
    #[serde(rename = "kinds", skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub tag_p: Option<BTreeSet<PubKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().map(Kind::as_u16).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PubKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn since(mut self, since: Option<i64>) -> Self {
        self.since = since;
        self
    }
}

/// `profilesFilter`: identity metadata kinds for a set of authors.
pub fn profiles_filter(authors: impl IntoIterator<Item = PubKey>, since: Option<i64>) -> Filter {
    Filter::default()
        .authors(authors)
        .kinds([
            Kind::Metadata,
            Kind::FollowList,
            Kind::RelayListMetadata,
            Kind::PreferredDmRelays,
        ])
        .since(since)
}

/// `giftWrapFilter`: sealed DMs addressed to the viewer.
pub fn giftwrap_filter(viewer: PubKey, since: Option<i64>) -> Filter {
    Filter {
        tag_p: Some([viewer].into_iter().collect()),
        kinds: Some([Kind::GiftWrap].into_iter().map(Kind::as_u16).collect()),
        since,
        ..Filter::default()
    }
}

/// `mentionsFilter`: public posts/replies/deletions that mention the viewer.
pub fn mentions_filter(viewer: PubKey, since: Option<i64>) -> Filter {
    Filter {
        tag_p: Some([viewer].into_iter().collect()),
        kinds: Some(
            [
                Kind::ShortTextNote,
                Kind::Repost,
                Kind::Comment,
                Kind::EventDeletion,
            ]
            .into_iter()
            .map(Kind::as_u16)
            .collect(),
        ),
        since,
        ..Filter::default()
    }
}

/// `userPostsFilter`: public posts authored by a set of followed identities.
pub fn user_posts_filter(authors: impl IntoIterator<Item = PubKey>, since: Option<i64>) -> Filter {
    Filter::default()
        .authors(authors)
        .kinds([Kind::ShortTextNote, Kind::Repost, Kind::EventDeletion])
        .since(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted_from_wire_form() {
        let filter = Filter::default();
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn giftwrap_filter_targets_the_viewer() {
        let viewer = PubKey::from_bytes([1u8; 32]);
        let filter = giftwrap_filter(viewer, Some(42));
        assert!(filter.tag_p.unwrap().contains(&viewer));
        assert_eq!(filter.since, Some(42));
    }
}
