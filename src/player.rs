//! The player half of the playback pair: control block and the worker that
//! consumes the music pipe and feeds the audio outputs.

pub mod crossfade;
pub mod thread;
pub mod volume;

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::UnboundedSender;

use crate::audio::AudioFormat;
use crate::notify::Notify;
use crate::song::SongHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Stop,
    Pause,
    Play,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerCommand {
    #[default]
    None,
    Exit,
    Stop,
    Play,
    Pause,
    Seek,
    CloseAudio,
    /// `next_song` has been updated
    Queue,
    /// forget `next_song`; if it is already playing, stop everything
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerError {
    File,
    Audio,
    System,
    UnkType,
}

impl PlayerError {
    pub fn message(self, song: Option<&SongHandle>) -> String {
        let uri = song.map_or("?", |s| s.uri.as_str());
        match self {
            PlayerError::File => format!("problems decoding \"{uri}\""),
            PlayerError::Audio => "problems opening audio device".to_string(),
            PlayerError::System => "system error occurred".to_string(),
            PlayerError::UnkType => format!("file type of \"{uri}\" is unknown"),
        }
    }
}

/// Notifications the worker sends to the server glue (the playlist
/// controller reacts to them on the main loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// the player started the queued song, finished, or stopped
    Playlist,
    /// a stream sent a new tag for the current song
    Tag,
}

#[derive(Debug, Default)]
pub struct PcState {
    pub command: PlayerCommand,
    pub state: PlayerState,
    pub error: Option<PlayerError>,
    pub errored_song: Option<SongHandle>,
    /// exclusive handoff slot: written by the requester, cleared by the
    /// worker once consumed
    pub next_song: Option<SongHandle>,
    pub seek_where: f64,
    pub bit_rate: u16,
    pub audio_format: Option<AudioFormat>,
    pub total_time: f32,
    pub elapsed_time: f32,
    pub cross_fade_seconds: f32,
    /// thousandths, see [`volume::VOLUME_FULL`]
    pub software_volume: u16,
    pub total_play_time: f64,
}

/// Point-in-time view for the `status` command.
#[derive(Debug, Clone, Copy)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub elapsed_time: f32,
    pub total_time: f32,
    pub bit_rate: u16,
    pub audio_format: Option<AudioFormat>,
}

pub struct PlayerControl {
    state: Mutex<PcState>,
    /// wakes the worker; shared with the music pipe's producer side
    pub notify: Arc<Notify>,
    /// wakes requesters waiting for command completion
    main_notify: Notify,
    events: UnboundedSender<PlayerEvent>,
    pub buffered_before_play: usize,
}

impl PlayerControl {
    pub fn new(
        buffered_before_play: usize,
        events: UnboundedSender<PlayerEvent>,
    ) -> Arc<Self> {
        Arc::new(PlayerControl {
            state: Mutex::new(PcState {
                software_volume: volume::VOLUME_FULL,
                ..PcState::default()
            }),
            notify: Arc::new(Notify::new()),
            main_notify: Notify::new(),
            events,
            buffered_before_play,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, PcState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    /// Worker side: mark the pending command consumed; the caller signals
    /// [`PlayerControl::signal_main`] after releasing the lock.
    pub(crate) fn command_finished(state: &mut PcState) {
        assert!(state.command != PlayerCommand::None);
        state.command = PlayerCommand::None;
    }

    pub(crate) fn signal_main(&self) {
        self.main_notify.signal();
    }

    /// Issue a command and block until the worker consumed it.
    fn issue(&self, f: impl FnOnce(&mut PcState)) {
        {
            let mut state = self.lock();
            f(&mut state);
        }
        loop {
            self.notify.signal();
            if self.lock().command == PlayerCommand::None {
                return;
            }
            self.main_notify.wait();
        }
    }

    pub fn play(&self, song: SongHandle) {
        self.stop();
        self.issue(|state| {
            state.next_song = Some(song);
            state.command = PlayerCommand::Play;
        });
    }

    /// Stop playback and wait until the worker is idle.
    pub fn stop(&self) {
        if self.lock().state != PlayerState::Stop {
            self.issue(|state| state.command = PlayerCommand::Stop);
        }
    }

    /// Hand over the song to pre-decode after the current one.
    pub fn queue_song(&self, song: SongHandle) {
        self.issue(|state| {
            state.next_song = Some(song);
            state.command = PlayerCommand::Queue;
        });
    }

    /// Cancel the queued song (see [`PlayerCommand::Cancel`]).
    pub fn cancel(&self) {
        self.issue(|state| state.command = PlayerCommand::Cancel);
    }

    pub fn pause_toggle(&self) {
        if self.lock().state != PlayerState::Stop {
            self.issue(|state| state.command = PlayerCommand::Pause);
        }
    }

    pub fn set_pause(&self, pause: bool) {
        let state = self.lock().state;
        match (state, pause) {
            (PlayerState::Play, true) | (PlayerState::Pause, false) => self.pause_toggle(),
            _ => {}
        }
    }

    /// Returns false when nothing is playing.
    pub fn seek(&self, song: SongHandle, seek_where: f64) -> bool {
        if self.lock().state == PlayerState::Stop {
            return false;
        }
        self.issue(|state| {
            state.next_song = Some(song);
            state.seek_where = seek_where;
            state.command = PlayerCommand::Seek;
        });
        true
    }

    pub fn close_audio(&self) {
        self.stop();
        self.issue(|state| state.command = PlayerCommand::CloseAudio);
    }

    /// Ask the worker to exit; the caller joins the thread handle.
    pub fn exit(&self) {
        self.issue(|state| state.command = PlayerCommand::Exit);
    }

    pub fn state(&self) -> PlayerState {
        self.lock().state
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.lock();
        PlayerStatus {
            state: state.state,
            elapsed_time: state.elapsed_time,
            total_time: state.total_time,
            bit_rate: state.bit_rate,
            audio_format: state.audio_format,
        }
    }

    pub fn error(&self) -> Option<PlayerError> {
        self.lock().error
    }

    pub fn error_message(&self) -> Option<String> {
        let state = self.lock();
        state
            .error
            .map(|e| e.message(state.errored_song.as_ref()))
    }

    pub fn clear_error(&self) {
        let mut state = self.lock();
        state.error = None;
        state.errored_song = None;
    }

    /// A song is leaving the queue; drop dangling references to it.
    pub fn song_deleted(&self, song: &SongHandle) {
        let mut state = self.lock();
        if state
            .errored_song
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, song))
        {
            state.error = None;
            state.errored_song = None;
        }
    }

    pub fn cross_fade_seconds(&self) -> f32 {
        self.lock().cross_fade_seconds
    }

    pub fn set_cross_fade_seconds(&self, seconds: f32) {
        self.lock().cross_fade_seconds = seconds.max(0.0);
    }

    /// 0..=100 from the protocol, stored in thousandths.
    pub fn set_software_volume(&self, percent: u8) {
        self.lock().software_volume = u16::from(percent.min(100)) * 10;
    }

    pub fn elapsed_time(&self) -> f32 {
        self.lock().elapsed_time
    }

    pub fn total_play_time(&self) -> f64 {
        self.lock().total_play_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use std::thread as std_thread;

    fn control() -> Arc<PlayerControl> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        PlayerControl::new(4, tx)
    }

    #[test]
    fn issue_waits_for_worker() {
        let pc = control();
        let worker_pc = Arc::clone(&pc);
        let worker = std_thread::spawn(move || {
            worker_pc.notify.wait();
            let mut state = worker_pc.lock();
            assert_eq!(state.command, PlayerCommand::Queue);
            assert!(state.next_song.take().is_some());
            PlayerControl::command_finished(&mut state);
            drop(state);
            worker_pc.signal_main();
        });

        pc.queue_song(Arc::new(Song::file("a.wav")));
        assert_eq!(pc.lock().command, PlayerCommand::None);
        assert!(pc.lock().next_song.is_none());
        worker.join().unwrap();
    }

    #[test]
    fn stop_is_a_noop_when_stopped() {
        // no worker exists; this must not block
        let pc = control();
        pc.stop();
        assert!(!pc.seek(Arc::new(Song::file("a.wav")), 1.0));
    }

    #[test]
    fn volume_and_crossfade_setters() {
        let pc = control();
        pc.set_software_volume(50);
        assert_eq!(pc.lock().software_volume, 500);
        pc.set_software_volume(200);
        assert_eq!(pc.lock().software_volume, 1000);

        pc.set_cross_fade_seconds(-3.0);
        assert_eq!(pc.cross_fade_seconds(), 0.0);
        pc.set_cross_fade_seconds(5.0);
        assert_eq!(pc.cross_fade_seconds(), 5.0);
    }
}
