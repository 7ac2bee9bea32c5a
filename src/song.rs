use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::tag::Tag;

/// Playback sub-range for virtual tracks inside container files, in
/// milliseconds since the start of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SongRange {
    pub start_ms: u32,
    /// `None` plays to the end of the file
    pub end_ms: Option<u32>,
}

/// An immutable song record. Identity is the URI: relative to the music
/// directory for database songs, or a full URL for detached songs queued
/// directly by a client.
///
/// Songs are shared as [`SongHandle`]s; a detached song lives exactly as
/// long as its last holder (queue slot, decoder, player), a database song
/// until it is removed from its directory and released everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub uri: Utf8PathBuf,
    /// last-modified time in seconds since the epoch
    pub mtime: Option<i64>,
    pub tag: Option<Tag>,
    pub range: Option<SongRange>,
    pub in_database: bool,
}

pub type SongHandle = Arc<Song>;

impl Song {
    pub fn file(uri: impl Into<Utf8PathBuf>) -> Self {
        Song {
            uri: uri.into(),
            mtime: None,
            tag: None,
            range: None,
            in_database: true,
        }
    }

    /// A song that is not owned by the database, e.g. a remote URL.
    pub fn detached(uri: impl Into<Utf8PathBuf>) -> Self {
        Song {
            uri: uri.into(),
            mtime: None,
            tag: None,
            range: None,
            in_database: false,
        }
    }

    pub fn is_remote(&self) -> bool {
        uri_has_scheme(self.uri.as_str())
    }

    /// Duration in seconds, honoring a virtual-track sub-range.
    pub fn duration_secs(&self) -> Option<f64> {
        if let Some(range) = self.range {
            let end = range.end_ms.map(f64::from);
            let start = f64::from(range.start_ms);
            return match (end, self.tag.as_ref().and_then(Tag::duration_secs)) {
                (Some(end), _) => Some((end - start) / 1000.0),
                (None, Some(total)) => Some(total - start / 1000.0),
                (None, None) => None,
            };
        }
        self.tag.as_ref().and_then(Tag::duration_secs)
    }

    /// File name component for database songs.
    pub fn file_name(&self) -> &str {
        self.uri.file_name().unwrap_or(self.uri.as_str())
    }
}

/// `scheme://` prefix check; a one-letter "scheme" is treated as a Windows
/// drive, not a URL.
pub fn uri_has_scheme(uri: &str) -> bool {
    match uri.split_once("://") {
        Some((scheme, _)) => scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

/// Suffix (lower-cased file extension) of a URI, used to pick a decoder.
pub fn uri_suffix(uri: &Utf8Path) -> Option<String> {
    uri.extension().map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagType;

    #[test]
    fn scheme_detection() {
        assert!(uri_has_scheme("http://radio.example/stream"));
        assert!(!uri_has_scheme("some/dir/file.ogg"));
        assert!(!uri_has_scheme("c://not/a/scheme"));
    }

    #[test]
    fn range_duration() {
        let mut song = Song::file("disc.wav");
        let mut tag = Tag::new();
        tag.time = Some(600);
        tag.add_item(TagType::Title, "whole disc");
        song.tag = Some(tag);
        song.range = Some(SongRange {
            start_ms: 30_000,
            end_ms: Some(90_000),
        });
        assert_eq!(song.duration_secs(), Some(60.0));
    }
}
