//! The state file: a snapshot of playback state written on shutdown and
//! restored on startup.

use std::io::Write;
use std::str::FromStr;

use camino::Utf8PathBuf;
use color_eyre::Result;
use tracing::warn;

use crate::player::{PlayerControl, PlayerState};
use crate::playlist::Playlist;
use crate::song::Song;
use crate::tag::{Tag, TagType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavedPlayState {
    Play,
    Pause,
    #[default]
    Stop,
}

/// One restored queue entry: a URI to look up in the database, or a
/// detached song carried in full.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedEntry {
    Database { uri: Utf8PathBuf },
    Detached(Song),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedState {
    pub state: SavedPlayState,
    pub current: Option<usize>,
    /// elapsed seconds into the current song
    pub time: f64,
    pub random: bool,
    pub repeat: bool,
    pub single: bool,
    pub consume: bool,
    pub crossfade: u32,
    pub mixrampdb: f32,
    pub mixrampdelay: f32,
    pub sw_volume: u8,
    pub entries: Vec<(u8, SavedEntry)>,
}

pub fn save(
    out: &mut dyn Write,
    playlist: &Playlist,
    pc: &PlayerControl,
    sw_volume: u8,
) -> Result<()> {
    let state = if playlist.is_playing() {
        match pc.state() {
            PlayerState::Pause => "pause",
            _ => "play",
        }
    } else {
        "stop"
    };
    writeln!(out, "state: {state}")?;
    if let Some(position) = playlist.current_position() {
        writeln!(out, "current: {position}")?;
        writeln!(out, "time: {}", pc.elapsed_time() as u64)?;
    }
    writeln!(out, "random: {}", playlist.queue.random as u8)?;
    writeln!(out, "repeat: {}", playlist.queue.repeat as u8)?;
    writeln!(out, "single: {}", playlist.queue.single as u8)?;
    writeln!(out, "consume: {}", playlist.queue.consume as u8)?;
    writeln!(out, "crossfade: {}", pc.cross_fade_seconds() as u32)?;
    writeln!(out, "mixrampdb: {:.6}", 0.0)?;
    writeln!(out, "mixrampdelay: {:.6}", 0.0)?;
    writeln!(out, "sw_volume: {sw_volume}")?;

    writeln!(out, "playlist_begin")?;
    for (position, item) in playlist.queue.items().iter().enumerate() {
        if item.priority != 0 {
            writeln!(out, "Prio: {}", item.priority)?;
        }
        if item.song.in_database {
            writeln!(out, "{position}:{}", item.song.uri)?;
        } else {
            writeln!(out, "song_begin: {}", item.song.uri)?;
            if let Some(tag) = &item.song.tag {
                writeln!(out, "Time: {}", tag.time.map_or(-1, |t| t as i64))?;
                for tag_item in &tag.items {
                    writeln!(out, "{}: {}", tag_item.kind, tag_item.value)?;
                }
            }
            writeln!(out, "song_end")?;
        }
    }
    writeln!(out, "playlist_end")?;
    Ok(())
}

/// Parse a state file. Unknown keys are skipped so old files stay loadable.
pub fn parse(text: &str) -> SavedState {
    let mut state = SavedState {
        sw_volume: 100,
        ..SavedState::default()
    };
    let mut lines = text.lines();
    let mut pending_priority = 0u8;
    let mut in_playlist = false;

    while let Some(line) = lines.next() {
        if in_playlist {
            if line == "playlist_end" {
                in_playlist = false;
            } else if let Some(value) = line.strip_prefix("Prio: ") {
                pending_priority = value.parse().unwrap_or(0);
            } else if let Some(uri) = line.strip_prefix("song_begin: ") {
                let song = parse_detached_song(&mut lines, uri);
                state
                    .entries
                    .push((pending_priority, SavedEntry::Detached(song)));
                pending_priority = 0;
            } else if let Some((_position, uri)) = line.split_once(':') {
                state.entries.push((
                    pending_priority,
                    SavedEntry::Database {
                        uri: Utf8PathBuf::from(uri),
                    },
                ));
                pending_priority = 0;
            } else {
                warn!("unrecognized playlist line in state file: {line}");
            }
            continue;
        }

        if line == "playlist_begin" {
            in_playlist = true;
        } else if let Some(value) = line.strip_prefix("state: ") {
            state.state = match value {
                "play" => SavedPlayState::Play,
                "pause" => SavedPlayState::Pause,
                _ => SavedPlayState::Stop,
            };
        } else if let Some(value) = line.strip_prefix("current: ") {
            state.current = value.parse().ok();
        } else if let Some(value) = line.strip_prefix("time: ") {
            state.time = value.parse().unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("random: ") {
            state.random = value == "1";
        } else if let Some(value) = line.strip_prefix("repeat: ") {
            state.repeat = value == "1";
        } else if let Some(value) = line.strip_prefix("single: ") {
            state.single = value == "1";
        } else if let Some(value) = line.strip_prefix("consume: ") {
            state.consume = value == "1";
        } else if let Some(value) = line.strip_prefix("crossfade: ") {
            state.crossfade = value.parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("mixrampdb: ") {
            state.mixrampdb = value.parse().unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("mixrampdelay: ") {
            state.mixrampdelay = value.parse().unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("sw_volume: ") {
            state.sw_volume = value.parse().unwrap_or(100);
        }
    }

    state
}

fn parse_detached_song<'a>(lines: &mut impl Iterator<Item = &'a str>, uri: &str) -> Song {
    let mut song = Song::detached(uri);
    for line in lines {
        if line == "song_end" {
            break;
        } else if let Some(value) = line.strip_prefix("Time: ") {
            let seconds: i64 = value.parse().unwrap_or(-1);
            song.tag.get_or_insert_with(Tag::new).time =
                (seconds >= 0).then_some(seconds as u32);
        } else if let Some((key, value)) = line.split_once(": ")
            && let Ok(kind) = TagType::from_str(key)
        {
            song.tag.get_or_insert_with(Tag::new).add_item(kind, value);
        }
    }
    song
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleBus;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn playlist_with_songs() -> Playlist {
        let (tx, _rx) = unbounded_channel();
        let pc = PlayerControl::new(4, tx);
        let mut playlist = Playlist::new(16, pc, IdleBus::new());

        let mut local = Song::file("artist/one.wav");
        local.mtime = Some(5);
        // queue snapshots keep the in_database marker even without a
        // database behind them
        playlist.append_song(Arc::new(local)).unwrap();

        let mut remote = Song::detached("http://radio.example/stream");
        let mut tag = Tag::new();
        tag.add_item(TagType::Name, "Radio Example");
        remote.tag = Some(tag);
        playlist.append_song(Arc::new(remote)).unwrap();

        playlist.queue.set_priority_range(0, 1, 7, None);
        playlist.queue.repeat = true;
        playlist
    }

    #[test]
    fn round_trip() {
        let playlist = playlist_with_songs();
        let (tx, _rx) = unbounded_channel();
        let pc = PlayerControl::new(4, tx);
        pc.set_cross_fade_seconds(3.0);

        let mut out = Vec::new();
        save(&mut out, &playlist, &pc, 80).unwrap();
        let text = String::from_utf8(out).unwrap();

        let state = parse(&text);
        assert_eq!(state.state, SavedPlayState::Stop);
        assert!(state.repeat);
        assert!(!state.random);
        assert_eq!(state.crossfade, 3);
        assert_eq!(state.sw_volume, 80);
        assert_eq!(state.entries.len(), 2);
        assert_eq!(
            state.entries[0],
            (
                7,
                SavedEntry::Database {
                    uri: Utf8PathBuf::from("artist/one.wav")
                }
            )
        );
        let (priority, SavedEntry::Detached(song)) = &state.entries[1] else {
            panic!("expected a detached song block");
        };
        assert_eq!(*priority, 0);
        assert_eq!(song.uri, "http://radio.example/stream");
        assert_eq!(
            song.tag.as_ref().unwrap().first(TagType::Name),
            Some("Radio Example")
        );
    }

    #[test]
    fn playing_state_records_position_and_time() {
        let text = "state: pause\ncurrent: 3\ntime: 142\nrandom: 1\n\
                    playlist_begin\n0:a.wav\nplaylist_end\n";
        let state = parse(text);
        assert_eq!(state.state, SavedPlayState::Pause);
        assert_eq!(state.current, Some(3));
        assert_eq!(state.time, 142.0);
        assert!(state.random);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let state = parse("flux_capacitor: 1\nstate: play\n");
        assert_eq!(state.state, SavedPlayState::Play);
    }
}
