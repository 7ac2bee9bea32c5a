use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::song::SongHandle;

/// Metadata for a playlist file found during the walk; stored playlists in
/// the music tree are listed, not parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistMeta {
    pub mtime: i64,
}

/// One node of the database tree. The owning edges run parent → child only;
/// each node knows its own full relative path, so no back-pointers are
/// needed to reconstruct URIs.
#[derive(Debug, Default)]
pub struct Directory {
    /// empty for the root
    pub path: Utf8PathBuf,
    pub children: BTreeMap<String, Directory>,
    pub songs: BTreeMap<String, SongHandle>,
    pub playlists: BTreeMap<String, PlaylistMeta>,

    /// filesystem identity for symlink-loop detection
    pub device: u64,
    pub inode: u64,
    pub have_stat: bool,
    pub mtime: Option<i64>,

    /// true when this node represents the virtual contents of a single
    /// media file (e.g. a disc image with several tracks)
    pub is_container: bool,
}

impl Directory {
    pub fn new_root() -> Self {
        Directory::default()
    }

    pub fn new_child(parent_path: &Utf8Path, name: &str) -> Self {
        Directory {
            path: if parent_path.as_str().is_empty() {
                Utf8PathBuf::from(name)
            } else {
                parent_path.join(name)
            },
            ..Directory::default()
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.as_str().is_empty()
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or("")
    }

    pub fn get_child(&self, name: &str) -> Option<&Directory> {
        self.children.get(name)
    }

    /// Existing child or a freshly inserted empty one.
    pub fn make_child(&mut self, name: &str) -> &mut Directory {
        let path = self.path.clone();
        self.children
            .entry(name.to_string())
            .or_insert_with(|| Directory::new_child(&path, name))
    }

    pub fn get_song(&self, name: &str) -> Option<&SongHandle> {
        self.songs.get(name)
    }

    /// Resolve a `/`-separated relative path to a directory node.
    pub fn lookup_directory(&self, path: &Utf8Path) -> Option<&Directory> {
        let mut node = self;
        for component in path.components() {
            node = node.get_child(component.as_str())?;
        }
        Some(node)
    }

    pub fn lookup_directory_mut(&mut self, path: &Utf8Path) -> Option<&mut Directory> {
        let mut node = self;
        for component in path.components() {
            node = node.children.get_mut(component.as_str())?;
        }
        Some(node)
    }

    /// Resolve a path to a song: the final component names the song inside
    /// its parent directory.
    pub fn lookup_song(&self, uri: &Utf8Path) -> Option<&SongHandle> {
        let name = uri.file_name()?;
        let parent = match uri.parent() {
            Some(parent) if !parent.as_str().is_empty() => self.lookup_directory(parent)?,
            _ => self,
        };
        parent.get_song(name)
    }

    pub fn song_count(&self) -> usize {
        self.songs.len() + self.children.values().map(Directory::song_count).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.songs.is_empty() && self.playlists.is_empty()
    }
}

/// Depth-first traversal callbacks. Any callback may abort the walk by
/// returning an error.
pub trait Visitor {
    fn on_directory(&mut self, _directory: &Directory) -> color_eyre::Result<()> {
        Ok(())
    }

    fn on_song(&mut self, _song: &SongHandle) -> color_eyre::Result<()> {
        Ok(())
    }

    fn on_playlist(&mut self, _directory: &Directory, _name: &str) -> color_eyre::Result<()> {
        Ok(())
    }
}

impl Directory {
    /// Visit this directory's contents (children sorted by name), songs and
    /// playlists, recursing depth-first. The node itself is not announced;
    /// [`crate::db::Database::walk`] handles the subject.
    pub fn walk(&self, visitor: &mut dyn Visitor) -> color_eyre::Result<()> {
        for song in self.songs.values() {
            visitor.on_song(song)?;
        }
        for name in self.playlists.keys() {
            visitor.on_playlist(self, name)?;
        }
        for child in self.children.values() {
            visitor.on_directory(child)?;
            child.walk(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use std::sync::Arc;

    fn sample_tree() -> Directory {
        let mut root = Directory::new_root();
        let artist = root.make_child("artist");
        let album = artist.make_child("album");
        album.songs.insert(
            "01.wav".to_string(),
            Arc::new(Song::file("artist/album/01.wav")),
        );
        root
    }

    #[test]
    fn lookup_by_path() {
        let root = sample_tree();
        let album = root
            .lookup_directory(Utf8Path::new("artist/album"))
            .unwrap();
        assert_eq!(album.path, "artist/album");
        assert_eq!(album.name(), "album");

        let song = root.lookup_song(Utf8Path::new("artist/album/01.wav")).unwrap();
        assert_eq!(song.uri, "artist/album/01.wav");
        assert!(root.lookup_song(Utf8Path::new("artist/missing.wav")).is_none());
    }

    #[test]
    fn walk_visits_everything() {
        struct Count {
            directories: usize,
            songs: usize,
        }
        impl Visitor for Count {
            fn on_directory(&mut self, _: &Directory) -> color_eyre::Result<()> {
                self.directories += 1;
                Ok(())
            }
            fn on_song(&mut self, _: &SongHandle) -> color_eyre::Result<()> {
                self.songs += 1;
                Ok(())
            }
        }

        let root = sample_tree();
        let mut count = Count {
            directories: 0,
            songs: 0,
        };
        root.walk(&mut count).unwrap();
        assert_eq!(count.directories, 2);
        assert_eq!(count.songs, 1);
    }
}
