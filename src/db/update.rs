//! The incremental database walk: compares the directory tree against the
//! filesystem, honoring `.mpdignore` exclusions, the symlink policy and
//! mtime-based caching, and replaces multi-track container files with
//! virtual directories.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::db::Database;
use crate::db::directory::PlaylistMeta;
use crate::decoder::plugins;
use crate::song::{Song, uri_suffix};

/// At most this many update requests may sit in the backlog; further
/// requests are rejected with job id 0.
pub const MAX_PENDING_JOBS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateJob {
    pub id: u32,
    pub uri: Option<Utf8PathBuf>,
    pub discard: bool,
}

/// Bookkeeping for queued update jobs; the walk itself runs on a blocking
/// thread owned by the server glue.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    next_id: u32,
    pending: VecDeque<UpdateJob>,
    running: Option<UpdateJob>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        UpdateQueue {
            next_id: 1,
            pending: VecDeque::new(),
            running: None,
        }
    }

    /// Returns the job id, or 0 when the backlog is full.
    pub fn enqueue(&mut self, uri: Option<Utf8PathBuf>, discard: bool) -> u32 {
        if self.pending.len() >= MAX_PENDING_JOBS {
            return 0;
        }
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.pending.push_back(UpdateJob { id, uri, discard });
        id
    }

    /// Claim the next job if none is running.
    pub fn take_next(&mut self) -> Option<UpdateJob> {
        if self.running.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.running = Some(job.clone());
        Some(job)
    }

    pub fn finish(&mut self, id: u32) {
        if self.running.as_ref().is_some_and(|job| job.id == id) {
            self.running = None;
        }
    }

    /// Job id reported in `status` while a walk is active.
    pub fn active_id(&self) -> Option<u32> {
        self.running.as_ref().map(|job| job.id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub follow_inside_symlinks: bool,
    pub follow_outside_symlinks: bool,
    /// re-read tags even when the mtime is unchanged
    pub discard: bool,
}

/// Run one walk job against the database. Returns true when the tree was
/// modified (callers raise the database idle event on that).
pub fn walk(
    db: &Database,
    music_dir: &Utf8Path,
    uri: Option<&Utf8Path>,
    options: WalkOptions,
) -> bool {
    let mut walker = Walker {
        db,
        music_dir,
        options,
        modified: false,
    };

    match uri.filter(|u| !u.as_str().is_empty()) {
        Some(uri) => walker.update_uri(uri),
        None => {
            if let Some(st) = stat_directory(music_dir.as_std_path()) {
                walker.update_directory(Utf8Path::new(""), &st, &mut Vec::new());
            }
        }
    }

    walker.modified
}

/// `(device, inode, mtime, is_dir, is_file)` snapshot of one stat call.
#[derive(Debug, Clone, Copy)]
struct StatInfo {
    device: u64,
    inode: u64,
    mtime: i64,
    is_dir: bool,
    is_file: bool,
}

fn stat_info(metadata: &fs::Metadata) -> StatInfo {
    #[cfg(unix)]
    let (device, inode) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.dev(), metadata.ino())
    };
    #[cfg(not(unix))]
    let (device, inode) = (0, 0);

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    StatInfo {
        device,
        inode,
        mtime,
        is_dir: metadata.is_dir(),
        is_file: metadata.is_file(),
    }
}

fn stat_path(path: &Path) -> Option<StatInfo> {
    fs::metadata(path).ok().map(|m| stat_info(&m))
}

fn stat_directory(path: &Path) -> Option<StatInfo> {
    stat_path(path).filter(|st| st.is_dir)
}

struct Walker<'a> {
    db: &'a Database,
    music_dir: &'a Utf8Path,
    options: WalkOptions,
    modified: bool,
}

impl Walker<'_> {
    fn fs_path(&self, relative: &Utf8Path) -> Utf8PathBuf {
        if relative.as_str().is_empty() {
            self.music_dir.to_path_buf()
        } else {
            self.music_dir.join(relative)
        }
    }

    /// Update a single URI: make sure its parents exist in the tree, then
    /// treat the final component like a walk entry.
    fn update_uri(&mut self, uri: &Utf8Path) {
        let Some(name) = uri.file_name() else {
            return;
        };
        let parent_rel = uri.parent().unwrap_or(Utf8Path::new(""));

        // create (and stat-check) each ancestor on the way down
        let mut ancestors = Vec::new();
        let mut current = Utf8PathBuf::new();
        if let Some(root_st) = stat_directory(self.music_dir.as_std_path()) {
            self.set_directory_stat(Utf8Path::new(""), &root_st);
            ancestors.push((root_st.device, root_st.inode));
        }
        for component in parent_rel.components() {
            current.push(component.as_str());
            let Some(st) = stat_directory(self.fs_path(&current).as_std_path()) else {
                return;
            };
            if ancestors.contains(&(st.device, st.inode)) {
                debug!("recursive directory found at {current}");
                return;
            }
            if self.skip_symlink(&current) {
                return;
            }
            self.db.with_root_mut(|root| {
                let mut node = root;
                for piece in current.components() {
                    node = node.make_child(piece.as_str());
                }
                node.device = st.device;
                node.inode = st.inode;
                node.have_stat = true;
            });
            ancestors.push((st.device, st.inode));
        }

        let entry_rel = if parent_rel.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            parent_rel.join(name)
        };

        if self.skip_symlink(&entry_rel) {
            self.modified |= self.delete_name_in(parent_rel, name);
            return;
        }
        match stat_path(self.fs_path(&entry_rel).as_std_path()) {
            Some(st) => self.update_directory_child(parent_rel, name, &st, &mut ancestors),
            None => self.modified |= self.delete_name_in(parent_rel, name),
        }
    }

    fn set_directory_stat(&self, relative: &Utf8Path, st: &StatInfo) {
        self.db.with_root_mut(|root| {
            if let Some(node) = root.lookup_directory_mut(relative) {
                node.device = st.device;
                node.inode = st.inode;
                node.have_stat = true;
            }
        });
    }

    /// Walk one directory. `ancestors` carries the `(device, inode)` pairs
    /// of every directory above it, for symlink-loop detection.
    fn update_directory(
        &mut self,
        relative: &Utf8Path,
        st: &StatInfo,
        ancestors: &mut Vec<(u64, u64)>,
    ) -> bool {
        let fs_path = self.fs_path(relative);

        let entries = match fs::read_dir(fs_path.as_std_path()) {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Failed to open directory {fs_path}: {error}");
                return false;
            }
        };

        self.set_directory_stat(relative, st);

        let exclude = load_exclude_list(&fs_path.join(".mpdignore"));
        if !exclude.is_empty() {
            self.remove_excluded(relative, &exclude);
        }
        self.purge_deleted(relative);

        ancestors.push((st.device, st.inode));

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                // names that are not valid UTF-8 cannot become URIs
                continue;
            };
            if skip_name(&name) || matches_any(&exclude, &name) {
                continue;
            }

            let child_rel = if relative.as_str().is_empty() {
                Utf8PathBuf::from(&name)
            } else {
                relative.join(&name)
            };

            if self.skip_symlink(&child_rel) {
                self.modified |= self.delete_name_in(relative, &name);
                continue;
            }

            match stat_path(self.fs_path(&child_rel).as_std_path()) {
                Some(child_st) => {
                    self.update_directory_child(relative, &name, &child_st, ancestors)
                }
                None => self.modified |= self.delete_name_in(relative, &name),
            }
        }

        ancestors.pop();

        self.db.with_root_mut(|root| {
            if let Some(node) = root.lookup_directory_mut(relative) {
                node.mtime = Some(st.mtime);
            }
        });

        true
    }

    fn update_directory_child(
        &mut self,
        parent_rel: &Utf8Path,
        name: &str,
        st: &StatInfo,
        ancestors: &mut Vec<(u64, u64)>,
    ) {
        let child_rel = if parent_rel.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            parent_rel.join(name)
        };

        if st.is_file {
            self.update_regular_file(parent_rel, name, st);
        } else if st.is_dir {
            if ancestors.contains(&(st.device, st.inode)) {
                debug!("recursive directory found at {child_rel}");
                return;
            }

            self.db.with_root_mut(|root| {
                let parent = root
                    .lookup_directory_mut(parent_rel)
                    .expect("parent directory was created by the walk");
                // a file cannot shadow a directory of the same name
                if parent.songs.remove(name).is_some() {
                    self.modified = true;
                }
                if parent.get_child(name).is_none() {
                    self.modified = true;
                }
                parent.make_child(name);
            });

            if !self.update_directory(&child_rel, st, ancestors) {
                self.db.with_root_mut(|root| {
                    if let Some(parent) = root.lookup_directory_mut(parent_rel) {
                        parent.children.remove(name);
                    }
                });
            }
        } else {
            debug!("update: {child_rel} is not a directory or regular file");
        }
    }

    fn update_regular_file(&mut self, parent_rel: &Utf8Path, name: &str, st: &StatInfo) {
        let Some(suffix) = uri_suffix(Utf8Path::new(name)) else {
            return;
        };

        if plugins::supports_suffix(&suffix) {
            self.update_song_file(parent_rel, name, st);
        } else if is_playlist_suffix(&suffix) {
            self.db.with_root_mut(|root| {
                let Some(parent) = root.lookup_directory_mut(parent_rel) else {
                    return;
                };
                let meta = PlaylistMeta { mtime: st.mtime };
                if parent.playlists.get(name) != Some(&meta) {
                    parent.playlists.insert(name.to_string(), meta);
                    self.modified = true;
                }
            });
        }
    }

    fn update_song_file(&mut self, parent_rel: &Utf8Path, name: &str, st: &StatInfo) {
        let unchanged = self.db.with_root(|root| {
            root.lookup_directory(parent_rel)
                .and_then(|parent| parent.get_song(name))
                .is_some_and(|song| song.mtime == Some(st.mtime))
        });
        if unchanged && !self.options.discard {
            return;
        }

        let child_rel = if parent_rel.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            parent_rel.join(name)
        };
        let fs_path = self.fs_path(&child_rel);

        // tag scanning does blocking I/O, keep it outside the db lock
        let tracks = plugins::container_scan(&fs_path);
        if tracks.len() > 1 {
            // the file becomes a virtual directory of its tracks
            self.db.with_root_mut(|root| {
                let Some(parent) = root.lookup_directory_mut(parent_rel) else {
                    return;
                };
                parent.songs.remove(name);
                parent.children.remove(name);
                let container = parent.make_child(name);
                container.is_container = true;
                container.mtime = Some(st.mtime);
                for track in tracks {
                    let mut song = Song::file(container.path.join(&track.name));
                    song.mtime = Some(st.mtime);
                    song.tag = track.tag;
                    song.range = Some(track.range);
                    container.songs.insert(track.name.clone(), Arc::new(song));
                }
            });
            self.modified = true;
            debug!("container {child_rel} expanded");
            return;
        }

        let tag = plugins::scan_tags(&suffix_of(name), &fs_path);
        let Some(tag) = tag else {
            // the decoder no longer claims this file
            self.modified |= self.delete_name_in(parent_rel, name);
            return;
        };

        let mut song = Song::file(child_rel);
        song.mtime = Some(st.mtime);
        song.tag = Some(tag);

        self.db.with_root_mut(|root| {
            let Some(parent) = root.lookup_directory_mut(parent_rel) else {
                return;
            };
            // an old directory of the same name is gone now
            parent.children.remove(name);
            parent.songs.insert(name.to_string(), Arc::new(song));
        });
        self.modified = true;
    }

    /// Delete whatever carries this name inside the directory. Returns true
    /// when something was removed.
    fn delete_name_in(&self, parent_rel: &Utf8Path, name: &str) -> bool {
        self.db.with_root_mut(|root| {
            let Some(parent) = root.lookup_directory_mut(parent_rel) else {
                return false;
            };
            let mut removed = parent.children.remove(name).is_some();
            removed |= parent.songs.remove(name).is_some();
            removed |= parent.playlists.remove(name).is_some();
            removed
        })
    }

    fn remove_excluded(&mut self, relative: &Utf8Path, exclude: &[String]) {
        self.db.with_root_mut(|root| {
            let Some(node) = root.lookup_directory_mut(relative) else {
                return;
            };
            let before =
                node.children.len() + node.songs.len() + node.playlists.len();
            node.children.retain(|name, _| !matches_any(exclude, name));
            node.songs.retain(|name, _| !matches_any(exclude, name));
            node.playlists.retain(|name, _| !matches_any(exclude, name));
            if node.children.len() + node.songs.len() + node.playlists.len() != before {
                self.modified = true;
            }
        });
    }

    /// Drop database entries whose filesystem counterpart is gone.
    fn purge_deleted(&mut self, relative: &Utf8Path) {
        let (child_names, song_names, playlist_names) = self.db.with_root(|root| {
            match root.lookup_directory(relative) {
                Some(node) => (
                    node.children.keys().cloned().collect::<Vec<_>>(),
                    node.songs.keys().cloned().collect::<Vec<_>>(),
                    node.playlists.keys().cloned().collect::<Vec<_>>(),
                ),
                None => Default::default(),
            }
        });

        for name in child_names {
            let path = self.fs_path(&relative.join(&name));
            // container directories are backed by a plain file
            let on_disk = match stat_path(path.as_std_path()) {
                Some(st) => st.is_dir || st.is_file,
                None => false,
            };
            if !on_disk {
                self.modified |= self.delete_name_in(relative, &name);
            }
        }
        for name in song_names {
            let st = stat_path(self.fs_path(&relative.join(&name)).as_std_path());
            if !st.is_some_and(|st| st.is_file) {
                self.modified |= self.delete_name_in(relative, &name);
            }
        }
        for name in playlist_names {
            let st = stat_path(self.fs_path(&relative.join(&name)).as_std_path());
            if !st.is_some_and(|st| st.is_file) {
                self.modified |= self.delete_name_in(relative, &name);
            }
        }
    }

    /// Apply the symlink policy to one entry (relative path below the music
    /// directory). Returns true when the entry must be skipped.
    fn skip_symlink(&self, relative: &Utf8Path) -> bool {
        let fs_path = self.fs_path(relative);
        let target = match fs::read_link(fs_path.as_std_path()) {
            Ok(target) => target,
            // not a symlink
            Err(_) => return false,
        };

        let inside = self.options.follow_inside_symlinks;
        let outside = self.options.follow_outside_symlinks;
        if !inside && !outside {
            return true;
        }
        if inside && outside {
            return false;
        }

        if target.is_absolute() {
            let canonical_root = fs::canonicalize(self.music_dir.as_std_path())
                .unwrap_or_else(|_| self.music_dir.as_std_path().to_path_buf());
            let canonical = fs::canonicalize(&target).unwrap_or(target);
            return if canonical.starts_with(&canonical_root) {
                !inside
            } else {
                !outside
            };
        }

        // simulate "./" and "../" components against our depth below the
        // music directory
        let mut depth = relative.components().count().saturating_sub(1);
        let mut components = target.components().peekable();
        while let Some(component) = components.peek() {
            use std::path::Component;
            match component {
                Component::CurDir => {
                    components.next();
                }
                Component::ParentDir => {
                    if depth == 0 {
                        // escaped the music directory
                        return !outside;
                    }
                    depth -= 1;
                    components.next();
                }
                _ => break,
            }
        }
        !inside
    }
}

/// `.` and `..` never appear from read_dir; names with newlines can never
/// be sent over the protocol.
fn skip_name(name: &str) -> bool {
    name == "." || name == ".." || name.contains('\n')
}

fn suffix_of(name: &str) -> String {
    uri_suffix(Utf8Path::new(name)).unwrap_or_default()
}

fn is_playlist_suffix(suffix: &str) -> bool {
    suffix.eq_ignore_ascii_case("m3u")
}

/// Load `.mpdignore`: one shell-style pattern per line, `#` starts a
/// comment.
fn load_exclude_list(path: &Utf8Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path.as_std_path()) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, name))
}

/// Minimal fnmatch: `*` matches any run, `?` one character.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[char], name: &[char]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some(('*', rest)) => {
                (0..=name.len()).any(|skip| inner(rest, &name[skip..]))
            }
            Some(('?', rest)) => !name.is_empty() && inner(rest, &name[1..]),
            Some((c, rest)) => name.split_first().is_some_and(|(n, tail)| n == c && inner(rest, tail)),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    inner(&pattern, &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*.tmp", "junk.tmp"));
        assert!(glob_match("??.wav", "ab.wav"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("*.tmp", "junk.wav"));
        assert!(!glob_match("??.wav", "abc.wav"));
    }

    #[test]
    fn job_queue_limits() {
        let mut queue = UpdateQueue::new();
        for i in 0..MAX_PENDING_JOBS {
            assert_eq!(queue.enqueue(None, false), (i + 1) as u32);
        }
        // backlog full
        assert_eq!(queue.enqueue(None, false), 0);

        let job = queue.take_next().unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(queue.active_id(), Some(1));
        // only one walk at a time
        assert!(queue.take_next().is_none());
        queue.finish(1);
        assert_eq!(queue.take_next().unwrap().id, 2);
    }
}
