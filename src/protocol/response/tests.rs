use pretty_assertions::assert_eq;

use super::to_string;
use crate::audio::AudioFormat;
use crate::protocol::{PlayerStateName, StatusResponse};

#[test]
fn serialize_idle_status() {
    assert_eq!(
        to_string(&StatusResponse {
            volume: -1,
            repeat: false,
            random: false,
            single: false,
            consume: false,
            playlist: 1,
            playlistlength: 0,
            xfade: None,
            state: PlayerStateName::Stop,
            song: None,
            songid: None,
            time: None,
            elapsed: None,
            bitrate: None,
            audio: None,
            nextsong: None,
            nextsongid: None,
            updating_db: None,
            error: None,
        })
        .unwrap(),
        "volume: -1
repeat: 0
random: 0
single: 0
consume: 0
playlist: 1
playlistlength: 0
state: stop
"
    );
}

#[test]
fn serialize_playing_status() {
    assert_eq!(
        to_string(&StatusResponse {
            volume: 50,
            repeat: false,
            random: true,
            single: false,
            consume: true,
            playlist: 22,
            playlistlength: 3,
            xfade: Some(5),
            state: PlayerStateName::Play,
            song: Some(1),
            songid: Some(5),
            time: Some("2:320".to_string()),
            elapsed: Some(2.0),
            bitrate: Some(1411),
            audio: Some(AudioFormat::new(44_100, 16, 2)),
            nextsong: Some(2),
            nextsongid: Some(6),
            updating_db: None,
            error: Some("Failed to open \"default\" (null)".to_string()),
        })
        .unwrap(),
        "volume: 50
repeat: 0
random: 1
single: 0
consume: 1
playlist: 22
playlistlength: 3
xfade: 5
state: play
song: 1
songid: 5
time: 2:320
elapsed: 2.000
bitrate: 1411
audio: 44100:16:2
nextsong: 2
nextsongid: 6
error: Failed to open \"default\" (null)
"
    );
}

#[test]
fn sequences_concatenate() {
    let lines = vec!["command: play".to_string(), "command: stop".to_string()];
    assert_eq!(to_string(&lines).unwrap(), "command: play\ncommand: stop\n");
}
