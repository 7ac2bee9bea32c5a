//! The decoder half of the playback pair: a control block driven by
//! synchronous commands, a worker thread, and the plugin seam that turns
//! files into PCM.

pub mod plugins;
pub mod thread;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio::AudioFormat;
use crate::notify::Notify;
use crate::pipe::MusicPipe;
use crate::song::{SongHandle, SongRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    Stop,
    Start,
    Decode,
    /// the last START failed: I/O error or no plugin claimed the file
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderCommand {
    #[default]
    None,
    Start,
    Stop,
    Seek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderError {
    /// the file could not be opened or decoded
    File,
    /// no decoder claims this file type
    UnkType,
}

#[derive(Debug, Default)]
pub struct DcState {
    pub state: DecoderState,
    pub command: DecoderCommand,
    pub quit: bool,
    pub seek_where: f64,
    pub seek_error: bool,
    pub seekable: bool,
    /// format of the song file
    pub in_format: Option<AudioFormat>,
    /// format sent into the music pipe
    pub out_format: Option<AudioFormat>,
    pub current_song: Option<SongHandle>,
    /// exclusive handoff slot written by the requester, consumed by the
    /// worker
    pub next_song: Option<SongHandle>,
    pub total_time: f32,
    pub error: Option<DecoderError>,
}

/// Shared state plus the worker's notifier. Commands are synchronous from
/// the requester's perspective: write the command field, signal the worker,
/// wait (on the requester's own notifier) until the field returns to
/// `None`.
#[derive(Debug, Default)]
pub struct DecoderControl {
    state: Mutex<DcState>,
    pub notify: Notify,
}

impl DecoderControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, DcState> {
        self.state.lock().unwrap()
    }

    pub fn is_idle(&self) -> bool {
        let dc = self.lock();
        matches!(dc.state, DecoderState::Stop | DecoderState::Error)
            && dc.command != DecoderCommand::Start
    }

    pub fn is_starting(&self) -> bool {
        let dc = self.lock();
        dc.command == DecoderCommand::Start || dc.state == DecoderState::Start
    }

    pub fn has_failed(&self) -> bool {
        self.lock().state == DecoderState::Error
    }

    pub fn error(&self) -> Option<DecoderError> {
        self.lock().error
    }

    pub fn current_song(&self) -> Option<SongHandle> {
        let dc = self.lock();
        match dc.state {
            DecoderState::Start | DecoderState::Decode => dc.current_song.clone(),
            DecoderState::Stop | DecoderState::Error => None,
        }
    }

    pub fn out_format(&self) -> Option<AudioFormat> {
        self.lock().out_format
    }

    pub fn in_format(&self) -> Option<AudioFormat> {
        self.lock().in_format
    }

    pub fn total_time(&self) -> f32 {
        self.lock().total_time
    }

    /// Block (on `notify`, the caller's own notifier) until the worker has
    /// consumed the pending command.
    pub fn command_wait(&self, notify: &Notify) {
        loop {
            if self.lock().command == DecoderCommand::None {
                return;
            }
            self.notify.signal();
            notify.wait();
        }
    }

    pub fn start(&self, notify: &Notify, song: SongHandle) {
        {
            let mut dc = self.lock();
            dc.next_song = Some(song);
            dc.command = DecoderCommand::Start;
        }
        self.command_wait(notify);
    }

    /// Fire-and-forget start, used for pre-decoding the queued song.
    pub fn start_async(&self, song: SongHandle) {
        {
            let mut dc = self.lock();
            dc.next_song = Some(song);
            dc.command = DecoderCommand::Start;
        }
        self.notify.signal();
    }

    pub fn stop(&self, notify: &Notify) {
        {
            let mut dc = self.lock();
            if dc.command == DecoderCommand::None
                && matches!(dc.state, DecoderState::Stop | DecoderState::Error)
            {
                return;
            }
            dc.command = DecoderCommand::Stop;
        }
        self.command_wait(notify);
    }

    /// Returns false when the decoder cannot seek (not decoding, or the
    /// input is not seekable) or the seek failed.
    pub fn seek(&self, notify: &Notify, seek_where: f64) -> bool {
        {
            let mut dc = self.lock();
            if dc.state != DecoderState::Decode || !dc.seekable {
                return false;
            }
            dc.seek_where = seek_where;
            dc.seek_error = false;
            dc.command = DecoderCommand::Seek;
        }
        self.command_wait(notify);
        !self.lock().seek_error
    }

    pub fn quit(&self, notify: &Notify) {
        self.lock().quit = true;
        self.stop(notify);
        self.notify.signal();
    }
}

/// The API a decoder plugin sees while producing one song: command checks,
/// seek plumbing and PCM submission into the music pipe.
pub struct DecodeSession<'a> {
    dc: &'a DecoderControl,
    pipe: &'a MusicPipe,
    player_notify: &'a Notify,
    range: Option<SongRange>,
    initialized: bool,
}

impl<'a> DecodeSession<'a> {
    pub fn new(
        dc: &'a DecoderControl,
        pipe: &'a MusicPipe,
        player_notify: &'a Notify,
        range: Option<SongRange>,
    ) -> Self {
        DecodeSession {
            dc,
            pipe,
            player_notify,
            range,
            initialized: false,
        }
    }

    /// Seconds into the file where decoding must begin (virtual tracks).
    pub fn start_time(&self) -> f64 {
        self.range
            .map_or(0.0, |r| f64::from(r.start_ms) / 1000.0)
    }

    /// Seconds into the file where decoding must stop.
    pub fn end_time(&self) -> Option<f64> {
        self.range
            .and_then(|r| r.end_ms)
            .map(|end| f64::from(end) / 1000.0)
    }

    /// Announce the stream parameters; must be called once before any PCM
    /// is submitted. Moves the decoder to the DECODE state and wakes the
    /// player waiting on startup.
    pub fn ready(&mut self, format: AudioFormat, seekable: bool, total_time: f32) {
        assert!(!self.initialized);
        {
            let mut dc = self.dc.lock();
            dc.state = DecoderState::Decode;
            dc.in_format = Some(format);
            // the pipe carries the decoded format unchanged
            dc.out_format = Some(format);
            dc.seekable = seekable;
            dc.total_time = total_time;
        }
        self.initialized = true;
        self.player_notify.signal();
    }

    /// The command the plugin must honor before decoding the next block.
    pub fn pending_command(&self) -> DecoderCommand {
        self.dc.lock().command
    }

    pub fn seek_target(&self) -> f64 {
        self.dc.lock().seek_where
    }

    /// Complete a SEEK command: stale chunks are dropped, the requester is
    /// woken.
    pub fn seek_done(&mut self, success: bool) {
        self.pipe.clear();
        {
            let mut dc = self.dc.lock();
            dc.seek_error = !success;
            dc.command = DecoderCommand::None;
        }
        self.player_notify.signal();
    }

    /// Publish a tag change mid-stream; it rides to the player on the next
    /// chunk.
    pub fn submit_tag(&mut self, tag: crate::tag::Tag) {
        self.pipe.tag(tag);
    }

    /// Push whole PCM frames into the pipe, blocking while it is full.
    /// Returns the command that interrupted the submission, or `None` when
    /// everything was written.
    pub fn submit(&mut self, data: &[u8], time: f32, bit_rate: u16) -> DecoderCommand {
        assert!(self.initialized, "ready() must be called first");
        let format = self.dc.lock().out_format.expect("format set by ready()");

        let mut offset = 0;
        while offset < data.len() {
            let written = self.pipe.append(&data[offset..], &format, time, bit_rate);
            offset += written;
            if offset == data.len() {
                break;
            }

            // pipe full: yield until the player frees chunks or commands us
            let command = self.pending_command();
            if command != DecoderCommand::None {
                return command;
            }
            self.dc.notify.wait();
        }
        DecoderCommand::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::CHUNK_SIZE;
    use crate::song::Song;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn start_rendezvous() {
        let dc = Arc::new(DecoderControl::new());
        let requester_notify = Arc::new(Notify::new());

        // fake worker: consume one command
        let worker_dc = Arc::clone(&dc);
        let worker_notify = Arc::clone(&requester_notify);
        let worker = thread::spawn(move || {
            worker_dc.notify.wait();
            let mut state = worker_dc.lock();
            assert_eq!(state.command, DecoderCommand::Start);
            assert!(state.next_song.is_some());
            state.command = DecoderCommand::None;
            state.state = DecoderState::Decode;
            drop(state);
            worker_notify.signal();
        });

        dc.start(
            &requester_notify,
            Arc::new(Song::file("x.wav")),
        );
        assert_eq!(dc.lock().command, DecoderCommand::None);
        worker.join().unwrap();
    }

    #[test]
    fn submit_blocks_until_space() {
        let dc = Arc::new(DecoderControl::new());
        let player_notify = Arc::new(Notify::new());
        let pipe = Arc::new(MusicPipe::new(3, Arc::clone(&player_notify)));

        let consumer_pipe = Arc::clone(&pipe);
        let consumer_dc = Arc::clone(&dc);
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            while consumer_pipe.head_snapshot().is_some() {
                consumer_pipe.shift();
                consumer_dc.notify.signal();
            }
        });

        let mut session = DecodeSession::new(&dc, &pipe, &player_notify, None);
        session.ready(AudioFormat::default(), true, 1.0);
        // four chunks worth into a 3-slot ring: must block and then finish
        let data = vec![0u8; CHUNK_SIZE * 4];
        let interrupted = session.submit(&data, 0.0, 1411);
        assert_eq!(interrupted, DecoderCommand::None);
        consumer.join().unwrap();
    }

    #[test]
    fn submit_aborts_on_command() {
        let dc = DecoderControl::new();
        let player_notify = Notify::new();
        let pipe = MusicPipe::new(2, Arc::new(Notify::new()));

        let mut session = DecodeSession::new(&dc, &pipe, &player_notify, None);
        session.ready(AudioFormat::default(), true, 1.0);
        dc.lock().command = DecoderCommand::Stop;
        let data = vec![0u8; CHUNK_SIZE * 4];
        assert_eq!(session.submit(&data, 0.0, 0), DecoderCommand::Stop);
    }
}
