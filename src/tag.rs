use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The closed set of tag item types. Extending it is a compile-time change;
/// the database file format records which types were enabled when it was
/// written (see [`crate::db::save`]).
#[derive(
    Debug, Display, EnumIter, EnumString, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(ascii_case_insensitive)]
pub enum TagType {
    Artist,
    Album,
    Title,
    Track,
    Name,
    Genre,
    Date,
    Composer,
    Performer,
    Comment,
    Disc,
}

/// One `(type, value)` pair. A song may carry multiple items of the same
/// type; their order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagItem {
    pub kind: TagType,
    pub value: String,
}

/// Metadata attached to a song: a duration plus an ordered multimap of
/// tag items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    /// total duration in whole seconds, `None` when unknown
    pub time: Option<u32>,
    pub items: Vec<TagItem>,
}

impl Tag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, kind: TagType, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.items.push(TagItem { kind, value });
    }

    pub fn has_type(&self, kind: TagType) -> bool {
        self.items.iter().any(|item| item.kind == kind)
    }

    /// First value of the given type, if any.
    pub fn first(&self, kind: TagType) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.kind == kind)
            .map(|item| item.value.as_str())
    }

    pub fn values_of(&self, kind: TagType) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(move |item| item.kind == kind)
            .map(|item| item.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_none() && self.items.is_empty()
    }

    /// Duration as a float, for protocol output.
    pub fn duration_secs(&self) -> Option<f64> {
        self.time.map(f64::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn names_round_trip() {
        for kind in TagType::iter() {
            assert_eq!(TagType::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn multiple_values_keep_order() {
        let mut tag = Tag::new();
        tag.add_item(TagType::Performer, "alpha");
        tag.add_item(TagType::Artist, "solo");
        tag.add_item(TagType::Performer, "beta");
        assert_eq!(
            tag.values_of(TagType::Performer).collect::<Vec<_>>(),
            ["alpha", "beta"]
        );
        assert_eq!(tag.first(TagType::Artist), Some("solo"));
    }

    #[test]
    fn empty_values_are_dropped() {
        let mut tag = Tag::new();
        tag.add_item(TagType::Genre, "");
        assert!(!tag.has_type(TagType::Genre));
    }
}
