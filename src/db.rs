//! The song database: an in-memory directory tree mapping URIs to song
//! records, kept in sync with the music directory by incremental walks.

pub mod directory;
pub mod save;
pub mod update;
pub mod watch;

use std::collections::HashSet;
use std::sync::RwLock;

use camino::Utf8Path;
use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::song::SongHandle;
use crate::tag::TagType;
use directory::{Directory, Visitor};

/// Shared handle to the tree. All structural changes happen behind the
/// write lock; the lock is never held across blocking filesystem calls
/// (the walker stats and reads directories before locking).
#[derive(Debug)]
pub struct Database {
    root: RwLock<Directory>,
    /// mtime of the last successful save/load, for `stats`
    updated_at: RwLock<Option<i64>>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            root: RwLock::new(Directory::new_root()),
            updated_at: RwLock::new(None),
        }
    }

    pub fn with_root<R>(&self, f: impl FnOnce(&Directory) -> R) -> R {
        f(&self.root.read().unwrap())
    }

    pub fn with_root_mut<R>(&self, f: impl FnOnce(&mut Directory) -> R) -> R {
        f(&mut self.root.write().unwrap())
    }

    pub fn get_song(&self, uri: &Utf8Path) -> Option<SongHandle> {
        self.with_root(|root| root.lookup_song(uri).cloned())
    }

    pub fn directory_exists(&self, path: &Utf8Path) -> bool {
        self.with_root(|root| {
            path.as_str().is_empty() || root.lookup_directory(path).is_some()
        })
    }

    /// Depth-first traversal. With no URI the whole tree is visited; a URI
    /// naming a song visits only that song; a URI naming a directory visits
    /// the sub-tree.
    pub fn walk(&self, uri: Option<&Utf8Path>, visitor: &mut dyn Visitor) -> Result<()> {
        let root = self.root.read().unwrap();
        let Some(uri) = uri.filter(|u| !u.as_str().is_empty()) else {
            return root.walk(visitor);
        };

        if let Some(song) = root.lookup_song(uri) {
            return visitor.on_song(song);
        }
        let directory = root
            .lookup_directory(uri)
            .ok_or_else(|| eyre!("No such directory: {uri}"))?;
        directory.walk(visitor)
    }

    pub fn song_count(&self) -> usize {
        self.with_root(Directory::song_count)
    }

    pub fn mark_updated(&self, seconds: i64) {
        *self.updated_at.write().unwrap() = Some(seconds);
    }

    pub fn updated_at(&self) -> Option<i64> {
        *self.updated_at.read().unwrap()
    }

    /// Aggregate numbers for the `stats` command.
    pub fn stats(&self) -> DbStats {
        struct Collect {
            artists: HashSet<String>,
            albums: HashSet<String>,
            songs: usize,
            playtime: u64,
        }
        impl Visitor for Collect {
            fn on_song(&mut self, song: &SongHandle) -> Result<()> {
                self.songs += 1;
                if let Some(tag) = &song.tag {
                    self.playtime += u64::from(tag.time.unwrap_or(0));
                    for value in tag.values_of(TagType::Artist) {
                        self.artists.insert(value.to_string());
                    }
                    for value in tag.values_of(TagType::Album) {
                        self.albums.insert(value.to_string());
                    }
                }
                Ok(())
            }
        }

        let mut collect = Collect {
            artists: HashSet::new(),
            albums: HashSet::new(),
            songs: 0,
            playtime: 0,
        };
        // infallible visitor
        let _ = self.walk(None, &mut collect);
        DbStats {
            artists: collect.artists.len(),
            albums: collect.albums.len(),
            songs: collect.songs,
            db_playtime: collect.playtime,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub artists: usize,
    pub albums: usize,
    pub songs: usize,
    pub db_playtime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use crate::tag::Tag;
    use std::sync::Arc;

    fn tagged_song(uri: &str, artist: &str, album: &str, time: u32) -> SongHandle {
        let mut song = Song::file(uri);
        let mut tag = Tag::new();
        tag.time = Some(time);
        tag.add_item(TagType::Artist, artist);
        tag.add_item(TagType::Album, album);
        song.tag = Some(tag);
        Arc::new(song)
    }

    #[test]
    fn walk_subject_selection() {
        let db = Database::new();
        db.with_root_mut(|root| {
            let a = root.make_child("a");
            a.songs
                .insert("x.wav".into(), tagged_song("a/x.wav", "one", "first", 10));
            let b = root.make_child("b");
            b.songs
                .insert("y.wav".into(), tagged_song("b/y.wav", "two", "second", 20));
        });

        struct Uris(Vec<String>);
        impl Visitor for Uris {
            fn on_song(&mut self, song: &SongHandle) -> Result<()> {
                self.0.push(song.uri.to_string());
                Ok(())
            }
        }

        let mut all = Uris(Vec::new());
        db.walk(None, &mut all).unwrap();
        assert_eq!(all.0, ["a/x.wav", "b/y.wav"]);

        let mut one = Uris(Vec::new());
        db.walk(Some(Utf8Path::new("b")), &mut one).unwrap();
        assert_eq!(one.0, ["b/y.wav"]);

        let mut song_only = Uris(Vec::new());
        db.walk(Some(Utf8Path::new("a/x.wav")), &mut song_only).unwrap();
        assert_eq!(song_only.0, ["a/x.wav"]);

        assert!(db.walk(Some(Utf8Path::new("missing")), &mut Uris(Vec::new())).is_err());
    }

    #[test]
    fn stats_deduplicate_tags() {
        let db = Database::new();
        db.with_root_mut(|root| {
            let a = root.make_child("a");
            a.songs
                .insert("x.wav".into(), tagged_song("a/x.wav", "same", "first", 10));
            a.songs
                .insert("y.wav".into(), tagged_song("a/y.wav", "same", "second", 20));
        });
        let stats = db.stats();
        assert_eq!(stats.artists, 1);
        assert_eq!(stats.albums, 2);
        assert_eq!(stats.songs, 2);
        assert_eq!(stats.db_playtime, 30);
    }
}
