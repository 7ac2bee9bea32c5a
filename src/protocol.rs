//! Wire-level pieces of the control protocol: the ACK error taxonomy,
//! argument parsing, the request tokenizer and the response encoder.

pub mod response;
pub mod tokenizer;

use serde::Serialize;

use crate::audio::AudioFormat;
use crate::idle::SubSystem;
use crate::song::Song;
use crate::tag::Tag;

pub const VERSION: &str = "0.17.0";

/// Longest accepted request line, in bytes. Overflowing it expires the
/// session and discards the partial line.
pub const MAX_LINE_LENGTH: usize = 40_960;

/// The closed set of protocol error kinds, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    NotList = 1,
    Arg = 2,
    Password = 3,
    Permission = 4,
    Unknown = 5,
    NoExist = 50,
    PlaylistMax = 51,
    System = 52,
    PlaylistLoad = 53,
    UpdateAlready = 54,
    PlayerSync = 55,
    Exist = 56,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AckError {
    pub code: Ack,
    pub message: String,
}

pub type AckResult<T> = Result<T, AckError>;

impl AckError {
    pub fn new(code: Ack, message: impl Into<String>) -> Self {
        AckError {
            code,
            message: message.into(),
        }
    }

    pub fn bad_range() -> Self {
        Self::new(Ack::Arg, "Bad song index")
    }

    pub fn no_such_song() -> Self {
        Self::new(Ack::NoExist, "No such song")
    }

    pub fn no_such_playlist() -> Self {
        Self::new(Ack::NoExist, "No such playlist")
    }

    pub fn not_playing() -> Self {
        Self::new(Ack::PlayerSync, "Not playing")
    }

    pub fn playlist_too_large() -> Self {
        Self::new(Ack::PlaylistMax, "playlist is at the max size")
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(Ack::System, message)
    }

    /// The full reply line: `ACK [<kind>@<index>] {<command>} <message>`.
    pub fn to_line(&self, command: &str, list_index: usize) -> String {
        format!(
            "ACK [{}@{}] {{{}}} {}\n",
            self.code as u32, list_index, command, self.message
        )
    }
}

pub fn parse_unsigned(arg: &str) -> AckResult<u32> {
    arg.parse()
        .map_err(|_| AckError::new(Ack::Arg, "need a positive integer"))
}

pub fn parse_signed(arg: &str) -> AckResult<i64> {
    arg.parse()
        .map_err(|_| AckError::new(Ack::Arg, format!("\"{arg}\" is not a integer")))
}

pub fn parse_float(arg: &str) -> AckResult<f64> {
    arg.parse()
        .map_err(|_| AckError::new(Ack::Arg, format!("\"{arg}\" is not a number")))
}

pub fn parse_bool(arg: &str) -> AckResult<bool> {
    match arg {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(AckError::new(Ack::Arg, format!("\"{arg}\" is not 0 or 1"))),
    }
}

/// A `START:END` position range (end exclusive, may be open); a single
/// number addresses one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u32,
    pub end: Option<u32>,
}

impl Range {
    pub fn single(position: u32) -> Self {
        Range {
            start: position,
            end: Some(position + 1),
        }
    }

    pub fn parse(arg: &str) -> AckResult<Self> {
        let Some((start, end)) = arg.split_once(':') else {
            return Ok(Range::single(parse_unsigned(arg)?));
        };
        let start = parse_unsigned(start)?;
        let end = if end.is_empty() {
            None
        } else {
            let end = parse_unsigned(end)?;
            if end <= start {
                return Err(AckError::bad_range());
            }
            Some(end)
        };
        Ok(Range { start, end })
    }

    /// Resolve against a queue length; the start must address an existing
    /// position.
    pub fn resolve(&self, length: usize) -> AckResult<(usize, usize)> {
        let start = self.start as usize;
        let end = self.end.map_or(length, |e| (e as usize).min(length));
        if start >= length || end <= start {
            return Err(AckError::bad_range());
        }
        Ok((start, end))
    }
}

/// `seekcur` argument: absolute seconds, or an offset when prefixed with
/// `+`/`-`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    Absolute(f64),
    Relative(f64),
}

impl SeekTarget {
    pub fn parse(arg: &str) -> AckResult<Self> {
        if let Some(rest) = arg.strip_prefix('+') {
            Ok(SeekTarget::Relative(parse_float(rest)?))
        } else if arg.starts_with('-') {
            Ok(SeekTarget::Relative(parse_float(arg)?))
        } else {
            Ok(SeekTarget::Absolute(parse_float(arg)?))
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStateName {
    Play,
    Pause,
    Stop,
}

/// `status` reply. Field order is part of the protocol contract.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub volume: i8,
    pub repeat: bool,
    pub random: bool,
    pub single: bool,
    pub consume: bool,
    /// queue version number
    pub playlist: u32,
    pub playlistlength: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xfade: Option<u32>,
    pub state: PlayerStateName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub song: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub songid: Option<u32>,
    /// `elapsed:total`, whole seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nextsong: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nextsongid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updating_db: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub artists: usize,
    pub albums: usize,
    pub songs: usize,
    pub uptime: u64,
    pub playtime: u64,
    pub db_playtime: u64,
    pub db_update: i64,
}

/// One `changed: <subsystem>` line.
pub fn changed_line(subsystem: SubSystem) -> String {
    format!("changed: {subsystem}\n")
}

/// Append a song record: `file:`, `Last-Modified:`, `Range:`, `Time:` and
/// the tag items, in that order.
pub fn print_song(out: &mut String, song: &Song) {
    out.push_str("file: ");
    out.push_str(song.uri.as_str());
    out.push('\n');
    if let Some(mtime) = song.mtime
        && let Ok(stamp) = jiff::Timestamp::from_second(mtime)
    {
        out.push_str(&format!("Last-Modified: {stamp}\n"));
    }
    if let Some(range) = song.range {
        match range.end_ms {
            Some(end) => out.push_str(&format!(
                "Range: {:.3}-{:.3}\n",
                f64::from(range.start_ms) / 1000.0,
                f64::from(end) / 1000.0
            )),
            None => out.push_str(&format!(
                "Range: {:.3}-\n",
                f64::from(range.start_ms) / 1000.0
            )),
        }
    }
    if let Some(tag) = &song.tag {
        print_tag(out, tag);
    }
}

pub fn print_tag(out: &mut String, tag: &Tag) {
    if let Some(time) = tag.time {
        out.push_str(&format!("Time: {time}\n"));
    }
    for item in &tag.items {
        out.push_str(&format!("{}: {}\n", item.kind, item.value));
    }
}

/// A song record plus its queue position and id.
pub fn print_queue_song(out: &mut String, song: &Song, position: usize, id: u32) {
    print_song(out, song);
    out.push_str(&format!("Pos: {position}\nId: {id}\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ack_line() {
        let err = AckError::new(Ack::Arg, "need a positive integer");
        assert_eq!(
            err.to_line("play", 0),
            "ACK [2@0] {play} need a positive integer\n"
        );
    }

    #[test]
    fn range_forms() {
        assert_eq!(Range::parse("3").unwrap(), Range::single(3));
        assert_eq!(
            Range::parse("2:5").unwrap(),
            Range {
                start: 2,
                end: Some(5)
            }
        );
        assert_eq!(Range::parse("2:").unwrap(), Range { start: 2, end: None });
        assert!(Range::parse("5:2").is_err());
        assert!(Range::parse("x").is_err());
    }

    #[test]
    fn seek_targets() {
        assert_eq!(
            SeekTarget::parse("12.5").unwrap(),
            SeekTarget::Absolute(12.5)
        );
        assert_eq!(SeekTarget::parse("+3").unwrap(), SeekTarget::Relative(3.0));
        assert_eq!(SeekTarget::parse("-3").unwrap(), SeekTarget::Relative(-3.0));
    }

    #[test]
    fn song_record() {
        let mut song = Song::file("a/b.wav");
        let mut tag = Tag::new();
        tag.time = Some(42);
        tag.add_item(crate::tag::TagType::Title, "b");
        song.tag = Some(tag);
        let mut out = String::new();
        print_queue_song(&mut out, &song, 0, 7);
        assert_eq!(out, "file: a/b.wav\nTime: 42\nTitle: b\nPos: 0\nId: 7\n");
    }
}
