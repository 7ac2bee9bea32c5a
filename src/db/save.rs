//! Textual serialization of the database tree.
//!
//! The file starts with an `info_begin`/`info_end` header recording the
//! format revision, the daemon version, the filesystem charset and the
//! enabled tag types. The tree follows: each non-root directory is
//! bracketed by `begin:`/`end:` lines carrying its full path, songs by
//! `song_begin:`/`song_end`.

use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;

use camino::Utf8Path;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use strum::IntoEnumIterator;

use crate::db::Database;
use crate::db::directory::{Directory, PlaylistMeta};
use crate::song::{Song, SongRange};
use crate::tag::{Tag, TagType};

const FORMAT: u32 = 1;
const FS_CHARSET: &str = "UTF-8";

impl Database {
    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        self.with_root(|root| save_internal(out, root))
    }

    /// Replace the tree with the file contents. On a malformed file the
    /// error is returned and the in-memory tree is left empty.
    pub fn load(&self, input: &mut dyn BufRead) -> Result<()> {
        self.with_root_mut(|root| *root = Directory::new_root());
        let root = load_internal(input)?;
        self.with_root_mut(|tree| *tree = root);
        Ok(())
    }
}

fn save_internal(out: &mut dyn Write, root: &Directory) -> Result<()> {
    writeln!(out, "info_begin")?;
    writeln!(out, "format: {FORMAT}")?;
    writeln!(out, "mpd_version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "fs_charset: {FS_CHARSET}")?;
    for tag_type in TagType::iter() {
        writeln!(out, "tag: {tag_type}")?;
    }
    writeln!(out, "info_end")?;

    save_directory(out, root)
}

fn save_directory(out: &mut dyn Write, directory: &Directory) -> Result<()> {
    if !directory.is_root() {
        writeln!(out, "begin: {}", directory.path)?;
        if let Some(mtime) = directory.mtime {
            writeln!(out, "mtime: {mtime}")?;
        }
    }

    for (name, child) in &directory.children {
        writeln!(out, "directory: {name}")?;
        save_directory(out, child)?;
    }

    for song in directory.songs.values() {
        save_song(out, song)?;
    }

    for (name, meta) in &directory.playlists {
        writeln!(out, "playlist_begin: {name}")?;
        writeln!(out, "mtime: {}", meta.mtime)?;
        writeln!(out, "playlist_end")?;
    }

    if !directory.is_root() {
        writeln!(out, "end: {}", directory.path)?;
    }
    Ok(())
}

fn save_song(out: &mut dyn Write, song: &Song) -> Result<()> {
    writeln!(out, "song_begin: {}", song.uri)?;
    if let Some(mtime) = song.mtime {
        writeln!(out, "mtime: {mtime}")?;
    }
    if let Some(range) = song.range {
        match range.end_ms {
            Some(end) => writeln!(out, "range: {}-{}", range.start_ms, end)?,
            None => writeln!(out, "range: {}-", range.start_ms)?,
        }
    }
    if let Some(tag) = &song.tag {
        // unknown duration keeps the negative sentinel on disk
        writeln!(out, "Time: {}", tag.time.map_or(-1, |t| t as i64))?;
        for item in &tag.items {
            writeln!(out, "{}: {}", item.kind, item.value)?;
        }
    }
    writeln!(out, "song_end")?;
    Ok(())
}

struct Lines<'a> {
    input: &'a mut dyn BufRead,
    number: usize,
}

impl Lines<'_> {
    fn next(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        self.number += 1;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn expect(&mut self) -> Result<String> {
        self.next()?
            .ok_or_else(|| eyre!("unexpected end of database file at line {}", self.number))
    }
}

fn load_internal(input: &mut dyn BufRead) -> Result<Directory> {
    let mut lines = Lines { input, number: 0 };

    match lines.next()? {
        Some(line) if line == "info_begin" => {}
        _ => bail!("database corrupted: missing info_begin"),
    }

    let mut format = None;
    loop {
        let line = lines.expect()?;
        if line == "info_end" {
            break;
        } else if let Some(value) = line.strip_prefix("format: ") {
            format = Some(value.parse::<u32>().map_err(|_| eyre!("bad format line"))?);
        } else if line.strip_prefix("mpd_version: ").is_some() {
            // informational only
        } else if let Some(charset) = line.strip_prefix("fs_charset: ") {
            if charset != FS_CHARSET {
                bail!("database charset is {charset:?} instead of {FS_CHARSET:?}");
            }
        } else if let Some(name) = line.strip_prefix("tag: ") {
            TagType::from_str(name).map_err(|_| eyre!("unrecognized tag {name:?}"))?;
        } else {
            bail!("malformed header line: {line}");
        }
    }

    if format != Some(FORMAT) {
        bail!("database format mismatch");
    }

    let mut root = Directory::new_root();
    load_directory(&mut lines, &mut root)?;
    Ok(root)
}

fn load_directory(lines: &mut Lines<'_>, directory: &mut Directory) -> Result<()> {
    loop {
        let Some(line) = lines.next()? else {
            if directory.is_root() {
                return Ok(());
            }
            bail!("unexpected end of file inside {:?}", directory.path);
        };

        if let Some(path) = line.strip_prefix("end: ") {
            if directory.is_root() || path != directory.path {
                bail!("mismatched end: {path}");
            }
            return Ok(());
        } else if let Some(name) = line.strip_prefix("directory: ") {
            let begin = lines.expect()?;
            let Some(path) = begin.strip_prefix("begin: ") else {
                bail!("expected begin: after directory: {name}");
            };
            if Utf8Path::new(path).file_name() != Some(name) {
                bail!("wrong path in database: {path:?} under {name:?}");
            }
            let child = directory.make_child(name);
            if child.path != path {
                bail!("wrong path in database: {path:?} expected {:?}", child.path);
            }
            load_directory(lines, child)?;
        } else if let Some(value) = line.strip_prefix("mtime: ") {
            directory.mtime = Some(value.parse().map_err(|_| eyre!("bad mtime line"))?);
        } else if let Some(uri) = line.strip_prefix("song_begin: ") {
            let song = load_song(lines, uri)?;
            let name = song.file_name().to_string();
            directory.songs.insert(name, Arc::new(song));
        } else if let Some(name) = line.strip_prefix("playlist_begin: ") {
            let meta = load_playlist(lines)?;
            directory.playlists.insert(name.to_string(), meta);
        } else {
            bail!("unknown line in database: {line}");
        }
    }
}

fn load_song(lines: &mut Lines<'_>, uri: &str) -> Result<Song> {
    let mut song = Song::file(uri);
    loop {
        let line = lines.expect()?;
        if line == "song_end" {
            return Ok(song);
        } else if let Some(value) = line.strip_prefix("mtime: ") {
            song.mtime = Some(value.parse().map_err(|_| eyre!("bad song mtime"))?);
        } else if let Some(value) = line.strip_prefix("range: ") {
            song.range = Some(parse_range(value)?);
        } else if let Some(value) = line.strip_prefix("Time: ") {
            let seconds: i64 = value.parse().map_err(|_| eyre!("bad Time line"))?;
            song.tag.get_or_insert_with(Tag::new).time =
                (seconds >= 0).then_some(seconds as u32);
        } else if let Some((key, value)) = line.split_once(": ") {
            let kind =
                TagType::from_str(key).map_err(|_| eyre!("unknown song line: {line}"))?;
            song.tag.get_or_insert_with(Tag::new).add_item(kind, value);
        } else {
            bail!("unknown song line: {line}");
        }
    }
}

fn load_playlist(lines: &mut Lines<'_>) -> Result<PlaylistMeta> {
    let mut meta = PlaylistMeta { mtime: 0 };
    loop {
        let line = lines.expect()?;
        if line == "playlist_end" {
            return Ok(meta);
        } else if let Some(value) = line.strip_prefix("mtime: ") {
            meta.mtime = value.parse().map_err(|_| eyre!("bad playlist mtime"))?;
        } else {
            bail!("unknown playlist line: {line}");
        }
    }
}

fn parse_range(value: &str) -> Result<SongRange> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| eyre!("bad range line"))?;
    Ok(SongRange {
        start_ms: start.parse().map_err(|_| eyre!("bad range start"))?,
        end_ms: if end.is_empty() {
            None
        } else {
            Some(end.parse().map_err(|_| eyre!("bad range end"))?)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_db() -> Database {
        let db = Database::new();
        db.with_root_mut(|root| {
            root.mtime = Some(10);
            let artist = root.make_child("artist");
            artist.mtime = Some(20);
            let album = artist.make_child("album");
            album.mtime = Some(30);

            let mut song = Song::file("artist/album/01 intro.wav");
            song.mtime = Some(40);
            let mut tag = Tag::new();
            tag.time = Some(181);
            tag.add_item(TagType::Artist, "Someone");
            tag.add_item(TagType::Title, "Intro");
            tag.add_item(TagType::Performer, "A");
            tag.add_item(TagType::Performer, "B");
            song.tag = Some(tag);
            album.songs.insert("01 intro.wav".into(), Arc::new(song));

            let mut track = Song::file("artist/album/disc.wav/track-2");
            track.range = Some(SongRange {
                start_ms: 60_000,
                end_ms: Some(120_000),
            });
            let container = album.make_child("disc.wav");
            container.is_container = true;
            container.songs.insert("track-2".into(), Arc::new(track));

            album
                .playlists
                .insert("mix.m3u".into(), PlaylistMeta { mtime: 77 });
        });
        db
    }

    #[test]
    fn round_trip_preserves_tree() {
        let db = sample_db();
        let mut text = Vec::new();
        db.save(&mut text).unwrap();

        let restored = Database::new();
        restored.load(&mut text.as_slice()).unwrap();

        let mut text2 = Vec::new();
        restored.save(&mut text2).unwrap();
        assert_eq!(
            String::from_utf8(text).unwrap(),
            String::from_utf8(text2).unwrap()
        );

        let song = restored
            .get_song(Utf8Path::new("artist/album/01 intro.wav"))
            .unwrap();
        let tag = song.tag.as_ref().unwrap();
        assert_eq!(tag.time, Some(181));
        assert_eq!(tag.values_of(TagType::Performer).collect::<Vec<_>>(), ["A", "B"]);

        let track = restored
            .get_song(Utf8Path::new("artist/album/disc.wav/track-2"))
            .unwrap();
        assert_eq!(
            track.range,
            Some(SongRange {
                start_ms: 60_000,
                end_ms: Some(120_000)
            })
        );
    }

    #[test]
    fn malformed_input_leaves_tree_empty() {
        let db = sample_db();
        let garbage = "info_begin\nformat: 1\nfs_charset: UTF-8\ninfo_end\nnonsense\n";
        assert!(db.load(&mut garbage.as_bytes()).is_err());
        assert_eq!(db.song_count(), 0);
    }

    #[test]
    fn header_mismatch_is_rejected() {
        let db = Database::new();
        let wrong_charset =
            "info_begin\nformat: 1\nfs_charset: latin1\ninfo_end\n";
        assert!(db.load(&mut wrong_charset.as_bytes()).is_err());

        let wrong_format = "info_begin\nformat: 99\nfs_charset: UTF-8\ninfo_end\n";
        assert!(db.load(&mut wrong_format.as_bytes()).is_err());

        let missing_header = "directory: a\n";
        assert!(db.load(&mut missing_header.as_bytes()).is_err());
    }
}
