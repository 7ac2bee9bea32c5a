//! The decoder worker: waits for commands, opens the song behind
//! `next_song`, picks a plugin and runs its decode entry point.

use std::sync::Arc;
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::decoder::{
    DecodeSession, DecoderCommand, DecoderControl, DecoderError, DecoderState, plugins,
};
use crate::notify::Notify;
use crate::pipe::MusicPipe;
use crate::song::{SongHandle, uri_suffix};

pub struct DecoderThread {
    pub dc: Arc<DecoderControl>,
    pub pipe: Arc<MusicPipe>,
    /// the player's notifier, signalled on every state transition
    pub player_notify: Arc<Notify>,
    pub music_dir: Utf8PathBuf,
}

pub fn spawn(thread: DecoderThread) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("decoder".to_string())
        .spawn(move || run(thread))
        .expect("failed to spawn decoder thread")
}

fn run(thread: DecoderThread) {
    let DecoderThread {
        dc,
        pipe,
        player_notify,
        music_dir,
    } = thread;

    loop {
        let command = {
            let state = dc.lock();
            if state.quit {
                return;
            }
            state.command
        };

        match command {
            DecoderCommand::Start | DecoderCommand::Seek => {
                decode_start(&dc, &pipe, &player_notify, &music_dir);
                let mut state = dc.lock();
                if state.error.is_none() {
                    state.state = DecoderState::Stop;
                } else {
                    state.state = DecoderState::Error;
                }
                state.command = DecoderCommand::None;
                drop(state);
                player_notify.signal();
            }
            DecoderCommand::Stop => {
                dc.lock().command = DecoderCommand::None;
                player_notify.signal();
            }
            DecoderCommand::None => dc.notify.wait(),
        }
    }
}

/// Run one decode job: resolve the URI, pick a plugin, decode until done or
/// commanded away.
fn decode_start(
    dc: &DecoderControl,
    pipe: &MusicPipe,
    player_notify: &Notify,
    music_dir: &Utf8Path,
) {
    let song: SongHandle = {
        let mut state = dc.lock();
        state.error = None;
        let Some(song) = state.next_song.take() else {
            return;
        };
        state.current_song = Some(Arc::clone(&song));
        state.state = DecoderState::Start;
        state.command = DecoderCommand::None;
        song
    };
    player_notify.signal();

    if song.is_remote() {
        // no remote input support built in
        warn!("cannot open remote stream {}", song.uri);
        dc.lock().error = Some(DecoderError::File);
        return;
    }

    // virtual tracks live under the container file's path
    let file_uri = match song.range {
        Some(_) => song.uri.parent().unwrap_or(song.uri.as_path()),
        None => song.uri.as_path(),
    };
    let path = music_dir.join(file_uri);

    let Some(suffix) = uri_suffix(&path) else {
        dc.lock().error = Some(DecoderError::UnkType);
        return;
    };
    let Some(plugin) = plugins::from_suffix(&suffix) else {
        dc.lock().error = Some(DecoderError::UnkType);
        return;
    };

    debug!("decoding {} with {}", song.uri, plugin.name());

    let mut session = DecodeSession::new(dc, pipe, player_notify, song.range);
    match plugin.decode(&mut session, &path) {
        Ok(()) => {
            pipe.flush();
        }
        Err(error) => {
            warn!("decoder failed on {}: {error:#}", song.uri);
            dc.lock().error = Some(DecoderError::File);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::decoder::plugins::test_wav;
    use crate::song::Song;
    use std::io::Write;
    use std::time::Duration;

    struct Fixture {
        dc: Arc<DecoderControl>,
        pipe: Arc<MusicPipe>,
        player_notify: Arc<Notify>,
        handle: JoinHandle<()>,
        _dir: tempfile::TempDir,
        music_dir: Utf8PathBuf,
    }

    fn fixture(pipe_size: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let music_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut file =
            std::fs::File::create(music_dir.join("song.wav").as_std_path()).unwrap();
        file.write_all(&test_wav::wav_bytes(8000, 1, 8000)).unwrap();

        let dc = Arc::new(DecoderControl::new());
        let player_notify = Arc::new(Notify::new());
        let pipe = Arc::new(MusicPipe::new(pipe_size, Arc::clone(&player_notify)));
        let handle = spawn(DecoderThread {
            dc: Arc::clone(&dc),
            pipe: Arc::clone(&pipe),
            player_notify: Arc::clone(&player_notify),
            music_dir: music_dir.clone(),
        });
        Fixture {
            dc,
            pipe,
            player_notify,
            handle,
            _dir: dir,
            music_dir,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn decodes_whole_file_into_pipe() {
        let fx = fixture(64);
        fx.dc
            .start(&fx.player_notify, Arc::new(Song::file("song.wav")));

        wait_until(|| fx.dc.is_idle());
        assert!(!fx.dc.has_failed());
        assert_eq!(fx.dc.out_format(), Some(AudioFormat::new(8000, 16, 1)));

        // one second of 8 kHz mono: 16000 bytes
        let mut bytes = 0;
        while let Some(chunk) = fx.pipe.head_snapshot() {
            bytes += chunk.data.len();
            fx.pipe.shift();
        }
        assert_eq!(bytes, 16_000);

        fx.dc.quit(&fx.player_notify);
        fx.handle.join().unwrap();
    }

    #[test]
    fn stop_cancels_mid_song() {
        // tiny pipe: the decoder must block in submit and still honor STOP
        let fx = fixture(2);
        fx.dc
            .start(&fx.player_notify, Arc::new(Song::file("song.wav")));
        wait_until(|| !fx.pipe.is_empty());

        fx.dc.stop(&fx.player_notify);
        assert!(fx.dc.is_idle());

        fx.dc.quit(&fx.player_notify);
        fx.handle.join().unwrap();
    }

    #[test]
    fn unknown_file_sets_error() {
        let fx = fixture(8);
        std::fs::write(fx.music_dir.join("noise.xyz").as_std_path(), b"junk").unwrap();
        fx.dc
            .start(&fx.player_notify, Arc::new(Song::file("noise.xyz")));
        wait_until(|| fx.dc.is_idle());
        assert!(fx.dc.has_failed());
        assert_eq!(fx.dc.error(), Some(DecoderError::UnkType));

        fx.dc.quit(&fx.player_notify);
        fx.handle.join().unwrap();
    }

    #[test]
    fn seek_restarts_from_target() {
        let fx = fixture(64);
        fx.dc
            .start(&fx.player_notify, Arc::new(Song::file("song.wav")));
        wait_until(|| fx.dc.lock().state == DecoderState::Decode || fx.dc.is_idle());

        if fx.dc.lock().state == DecoderState::Decode {
            // half a second in; afterwards at most ~0.5 s of audio remains
            let ok = fx.dc.seek(&fx.player_notify, 0.5);
            assert!(ok);
        }
        wait_until(|| fx.dc.is_idle());

        let mut bytes = 0;
        while let Some(chunk) = fx.pipe.head_snapshot() {
            bytes += chunk.data.len();
            fx.pipe.shift();
        }
        assert!(bytes <= 8_000, "got {bytes} bytes after seek");

        fx.dc.quit(&fx.player_notify);
        fx.handle.join().unwrap();
    }
}
