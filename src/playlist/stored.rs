//! Stored playlists: `*.m3u` files in the playlist directory, edited in
//! place by the `playlist*` command family. Lines starting with `#` are
//! comments; every other line is a URI.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use tracing::warn;

use crate::protocol::{Ack, AckError, AckResult};
use crate::queue::Queue;

pub const SUFFIX: &str = "m3u";

/// Playlist names become file names; path separators and line breaks can
/// never be part of one.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\n', '\r'])
}

fn check_name(name: &str) -> AckResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(AckError::new(Ack::Arg, "invalid playlist name"))
    }
}

fn path_for(directory: &Utf8Path, name: &str) -> Utf8PathBuf {
    directory.join(format!("{name}.{SUFFIX}"))
}

/// All stored playlists with their mtimes, sorted by name.
pub fn list(directory: &Utf8Path) -> Vec<(String, i64)> {
    let Ok(entries) = fs::read_dir(directory.as_std_path()) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let file_name = file_name.to_str()?;
            let name = file_name.strip_suffix(&format!(".{SUFFIX}"))?;
            if !is_valid_name(name) {
                return None;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            Some((name.to_string(), mtime))
        })
        .sorted()
        .collect()
}

/// Load a playlist's URIs, enforcing the length ceiling.
pub fn load(directory: &Utf8Path, name: &str, max_length: usize) -> AckResult<Vec<String>> {
    check_name(name)?;
    let path = path_for(directory, name);
    let text = fs::read_to_string(path.as_std_path()).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            AckError::no_such_playlist()
        } else {
            warn!("failed to read playlist {path}: {error}");
            AckError::new(Ack::PlaylistLoad, "could not read playlist")
        }
    })?;

    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if entries.len() >= max_length {
            return Err(AckError::playlist_too_large());
        }
        entries.push(line.to_string());
    }
    Ok(entries)
}

fn write_lines(directory: &Utf8Path, name: &str, lines: &[String]) -> AckResult<()> {
    fs::create_dir_all(directory.as_std_path())
        .map_err(|e| AckError::system(e.to_string()))?;
    let path = path_for(directory, name);
    let mut file =
        fs::File::create(path.as_std_path()).map_err(|e| AckError::system(e.to_string()))?;
    for line in lines {
        writeln!(file, "{line}").map_err(|e| AckError::system(e.to_string()))?;
    }
    Ok(())
}

/// `save <name>`: snapshot the queue. Refuses to overwrite.
pub fn save_queue(directory: &Utf8Path, name: &str, queue: &Queue) -> AckResult<()> {
    check_name(name)?;
    if path_for(directory, name).as_std_path().exists() {
        return Err(AckError::new(Ack::Exist, "Playlist already exists"));
    }
    let lines: Vec<String> = queue
        .items()
        .iter()
        .map(|item| item.song.uri.to_string())
        .collect();
    write_lines(directory, name, &lines)
}

/// `playlistadd`: append one URI, creating the playlist when necessary.
pub fn append_uri(
    directory: &Utf8Path,
    name: &str,
    uri: &str,
    max_length: usize,
) -> AckResult<()> {
    check_name(name)?;
    let mut entries = match load(directory, name, max_length) {
        Ok(entries) => entries,
        Err(error) if error.code == Ack::NoExist => Vec::new(),
        Err(error) => return Err(error),
    };
    if entries.len() >= max_length {
        return Err(AckError::playlist_too_large());
    }
    entries.push(uri.to_string());
    write_lines(directory, name, &entries)
}

/// `playlistclear`: truncate to an empty playlist.
pub fn clear(directory: &Utf8Path, name: &str) -> AckResult<()> {
    check_name(name)?;
    if !path_for(directory, name).as_std_path().exists() {
        return Err(AckError::no_such_playlist());
    }
    write_lines(directory, name, &[])
}

pub fn delete_position(
    directory: &Utf8Path,
    name: &str,
    position: usize,
    max_length: usize,
) -> AckResult<()> {
    let mut entries = load(directory, name, max_length)?;
    if position >= entries.len() {
        return Err(AckError::bad_range());
    }
    entries.remove(position);
    write_lines(directory, name, &entries)
}

pub fn move_item(
    directory: &Utf8Path,
    name: &str,
    from: usize,
    to: usize,
    max_length: usize,
) -> AckResult<()> {
    let mut entries = load(directory, name, max_length)?;
    if from >= entries.len() || to >= entries.len() {
        return Err(AckError::bad_range());
    }
    let entry = entries.remove(from);
    entries.insert(to, entry);
    write_lines(directory, name, &entries)
}

pub fn rename(directory: &Utf8Path, old: &str, new: &str) -> AckResult<()> {
    check_name(old)?;
    check_name(new)?;
    let old_path = path_for(directory, old);
    let new_path = path_for(directory, new);
    if !old_path.as_std_path().exists() {
        return Err(AckError::no_such_playlist());
    }
    if new_path.as_std_path().exists() {
        return Err(AckError::new(Ack::Exist, "Playlist already exists"));
    }
    fs::rename(old_path.as_std_path(), new_path.as_std_path())
        .map_err(|e| AckError::system(e.to_string()))
}

pub fn remove(directory: &Utf8Path, name: &str) -> AckResult<()> {
    check_name(name)?;
    let path = path_for(directory, name);
    fs::remove_file(path.as_std_path()).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            AckError::no_such_playlist()
        } else {
            AckError::system(error.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("road trip"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("two\nlines"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn append_load_edit_cycle() {
        let (_dir, directory) = setup();
        append_uri(&directory, "mix", "a.wav", 100).unwrap();
        append_uri(&directory, "mix", "b.wav", 100).unwrap();
        append_uri(&directory, "mix", "c.wav", 100).unwrap();
        assert_eq!(load(&directory, "mix", 100).unwrap(), ["a.wav", "b.wav", "c.wav"]);

        move_item(&directory, "mix", 2, 0, 100).unwrap();
        assert_eq!(load(&directory, "mix", 100).unwrap(), ["c.wav", "a.wav", "b.wav"]);

        delete_position(&directory, "mix", 1, 100).unwrap();
        assert_eq!(load(&directory, "mix", 100).unwrap(), ["c.wav", "b.wav"]);

        clear(&directory, "mix").unwrap();
        assert_eq!(load(&directory, "mix", 100).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn comments_are_skipped() {
        let (_dir, directory) = setup();
        std::fs::write(
            path_for(&directory, "noted").as_std_path(),
            "# a comment\nsong.wav\n\n# another\n",
        )
        .unwrap();
        assert_eq!(load(&directory, "noted", 100).unwrap(), ["song.wav"]);
    }

    #[test]
    fn length_ceiling_is_enforced() {
        let (_dir, directory) = setup();
        append_uri(&directory, "tiny", "a.wav", 2).unwrap();
        append_uri(&directory, "tiny", "b.wav", 2).unwrap();
        let error = append_uri(&directory, "tiny", "c.wav", 2).unwrap_err();
        assert_eq!(error.code, Ack::PlaylistMax);
        assert_eq!(load(&directory, "tiny", 2).unwrap().len(), 2);
    }

    #[test]
    fn rename_and_remove() {
        let (_dir, directory) = setup();
        append_uri(&directory, "old", "a.wav", 10).unwrap();
        rename(&directory, "old", "new").unwrap();
        assert!(load(&directory, "old", 10).is_err());
        assert_eq!(load(&directory, "new", 10).unwrap(), ["a.wav"]);

        // renaming over an existing playlist collides
        append_uri(&directory, "other", "b.wav", 10).unwrap();
        assert_eq!(
            rename(&directory, "new", "other").unwrap_err().code,
            Ack::Exist
        );

        remove(&directory, "new").unwrap();
        assert_eq!(remove(&directory, "new").unwrap_err().code, Ack::NoExist);
    }

    #[test]
    fn listing_shows_names_sorted() {
        let (_dir, directory) = setup();
        append_uri(&directory, "zebra", "a.wav", 10).unwrap();
        append_uri(&directory, "alpha", "a.wav", 10).unwrap();
        std::fs::write(directory.join("not-a-playlist.txt").as_std_path(), "x").unwrap();
        let names: Vec<String> = list(&directory).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["alpha", "zebra"]);
    }

    #[test]
    fn save_refuses_overwrite() {
        let (_dir, directory) = setup();
        let queue = Queue::new(8);
        save_queue(&directory, "snapshot", &queue).unwrap();
        assert_eq!(
            save_queue(&directory, "snapshot", &queue).unwrap_err().code,
            Ack::Exist
        );
    }
}
