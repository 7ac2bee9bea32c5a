//! The player worker: pre-buffers the pipe, opens the audio outputs,
//! plays chunks, mixes cross-fades and hands over to the queued song.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::audio::AudioFormat;
use crate::config::{MixerType, ReplayGainMode};
use crate::decoder::{DecoderControl, DecoderError};
use crate::output::OutputSet;
use crate::pipe::{CHUNK_SIZE, ChunkData, MusicPipe};
use crate::player::{
    PlayerCommand, PlayerControl, PlayerError, PlayerEvent, PlayerState, crossfade, volume,
};
use crate::song::SongHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Xfade {
    Unknown,
    Disabled,
    Enabled,
}

/// Per-song state local to the play loop.
struct Playing {
    /// still waiting for `buffered_before_play`?
    buffering: bool,
    /// the decoder is starting and has not provided data yet
    decoder_starting: bool,
    paused: bool,
    /// a new song sits in the control block's `next_song` slot
    queued: bool,
    song: Option<SongHandle>,
    xfade: Xfade,
    /// index of the first chunk of the next song, -1 when none
    next_song_chunk: i64,
    /// replay-gain factor for the current song
    rg_scale: f32,
}

pub struct PlayerThread {
    pub pc: Arc<PlayerControl>,
    pub dc: Arc<DecoderControl>,
    pub pipe: Arc<MusicPipe>,
    pub outputs: Arc<Mutex<OutputSet>>,
    pub mixer: MixerType,
    pub replaygain: ReplayGainMode,
    pub replaygain_preamp: f32,
}

pub fn spawn(thread: PlayerThread) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("player".to_string())
        .spawn(move || thread.run())
        .expect("failed to spawn player thread")
}

impl PlayerThread {
    fn run(self) {
        loop {
            let command = self.pc.lock().command;
            match command {
                PlayerCommand::Play | PlayerCommand::Queue => {
                    self.do_play();
                }
                PlayerCommand::Stop | PlayerCommand::Seek | PlayerCommand::Pause => {
                    let mut state = self.pc.lock();
                    state.next_song = None;
                    PlayerControl::command_finished(&mut state);
                    drop(state);
                    self.pc.signal_main();
                }
                PlayerCommand::CloseAudio => {
                    self.outputs.lock().unwrap().close_all();
                    self.finish_command();
                }
                PlayerCommand::Cancel => {
                    self.pc.lock().next_song = None;
                    self.finish_command();
                }
                PlayerCommand::Exit => {
                    self.dc.quit(&self.pc.notify);
                    self.outputs.lock().unwrap().close_all();
                    self.finish_command();
                    return;
                }
                PlayerCommand::None => self.pc.notify.wait(),
            }
        }
    }

    fn finish_command(&self) {
        let mut state = self.pc.lock();
        PlayerControl::command_finished(&mut state);
        drop(state);
        self.pc.signal_main();
    }

    fn stop_decoder(&self) {
        self.dc.stop(&self.pc.notify);
        self.pc.lock().state = PlayerState::Stop;
        self.pc.emit(PlayerEvent::Playlist);
    }

    fn set_error(&self, error: PlayerError, song: Option<SongHandle>) {
        let mut state = self.pc.lock();
        state.error = Some(error);
        state.errored_song = song;
    }

    fn decoder_error(&self) -> PlayerError {
        match self.dc.error() {
            Some(DecoderError::UnkType) => PlayerError::UnkType,
            _ => PlayerError::File,
        }
    }

    /// Consume `next_song` after the decoder accepted it; false on decoder
    /// failure.
    fn wait_for_decoder(&self, playing: &mut Playing) -> bool {
        self.dc.command_wait(&self.pc.notify);

        if self.dc.has_failed() {
            let failed = self.dc.lock().current_song.clone();
            let error = self.decoder_error();
            let mut state = self.pc.lock();
            state.error = Some(error);
            state.errored_song = failed.or_else(|| state.next_song.clone());
            state.next_song = None;
            return false;
        }

        let mut state = self.pc.lock();
        playing.song = state.next_song.take();
        playing.queued = false;
        playing.decoder_starting = true;
        playing.rg_scale = self.replay_gain_scale(playing.song.as_ref());
        state.total_time = playing
            .song
            .as_ref()
            .and_then(|s| s.duration_secs())
            .unwrap_or(0.0) as f32;
        state.elapsed_time = 0.0;
        state.bit_rate = 0;
        state.audio_format = None;
        drop(state);

        // let the playlist controller advance current → queued
        self.pc.emit(PlayerEvent::Playlist);
        true
    }

    fn replay_gain_scale(&self, song: Option<&SongHandle>) -> f32 {
        let album = match self.replaygain {
            ReplayGainMode::Off => return 1.0,
            ReplayGainMode::Track => false,
            ReplayGainMode::Album => true,
        };
        let info = song
            .and_then(|s| s.tag.as_ref())
            .map(volume::ReplayGainInfo::from_tag)
            .unwrap_or_default();
        volume::replay_gain_scale(&info, album, self.replaygain_preamp)
    }

    /// Handle a SEEK command; returns false when the decoder failed and the
    /// song must be aborted.
    fn seek_decoder(&self, playing: &mut Playing) -> bool {
        let target_song = self.pc.lock().next_song.clone();
        let Some(target_song) = target_song else {
            self.finish_command();
            return false;
        };

        let same_song = self
            .dc
            .current_song()
            .is_some_and(|current| Arc::ptr_eq(&current, &target_song));

        if !same_song {
            // seek into a different song: restart the decoder there
            self.dc.stop(&self.pc.notify);
            playing.next_song_chunk = -1;
            self.pipe.clear();
            self.dc.start_async(Arc::clone(&target_song));
            if !self.wait_for_decoder(playing) {
                self.finish_command();
                return false;
            }
        } else {
            let mut state = self.pc.lock();
            state.next_song = None;
            playing.queued = false;
        }

        // the decoder must be past its startup window before it can seek
        while self.dc.is_starting() && !self.dc.has_failed() {
            self.dc.notify.signal();
            self.pc.notify.wait();
        }

        let (seek_where, total_time) = {
            let state = self.pc.lock();
            (state.seek_where, state.total_time)
        };
        let mut seek_where = seek_where;
        if total_time > 0.0 && seek_where > f64::from(total_time) {
            // never hand the decoder the exact end of the song
            seek_where = f64::from(total_time) - 0.1;
        }
        seek_where = seek_where.max(0.0);

        let ok = self.dc.seek(&self.pc.notify, seek_where);
        if ok {
            self.pc.lock().elapsed_time = seek_where as f32;
        }
        self.finish_command();
        ok
    }

    /// React to a command that arrived mid-song. STOP/EXIT/CLOSE_AUDIO are
    /// left pending for the caller to see.
    fn process_command(&self, playing: &mut Playing, play_format: &Option<AudioFormat>) {
        let command = self.pc.lock().command;
        match command {
            PlayerCommand::None
            | PlayerCommand::Play
            | PlayerCommand::Stop
            | PlayerCommand::Exit
            | PlayerCommand::CloseAudio => {}

            PlayerCommand::Queue => {
                debug_assert!(self.pc.lock().next_song.is_some());
                playing.queued = true;
                self.finish_command();
            }

            PlayerCommand::Pause => {
                playing.paused = !playing.paused;
                if playing.paused {
                    self.outputs.lock().unwrap().pause_all();
                    self.pc.lock().state = PlayerState::Pause;
                } else {
                    let reopened = play_format
                        .as_ref()
                        .map(|format| self.outputs.lock().unwrap().open_all(format));
                    match reopened {
                        Some(Ok(())) | None => self.pc.lock().state = PlayerState::Play,
                        Some(Err(error)) => {
                            warn!("problems reopening audio device: {error:#}");
                            self.set_error(PlayerError::Audio, playing.song.clone());
                            playing.paused = true;
                        }
                    }
                }
                self.finish_command();
            }

            PlayerCommand::Seek => {
                self.outputs.lock().unwrap().drop_buffered_all();
                if self.seek_decoder(playing) {
                    playing.xfade = Xfade::Unknown;
                    // a seek aborts the pre-buffer wait
                    playing.buffering = false;
                }
            }

            PlayerCommand::Cancel => {
                if self.pc.lock().next_song.is_none() {
                    // too late, the queued song is already playing; stop
                    // everything
                    self.pc.lock().command = PlayerCommand::Stop;
                    return;
                }
                if playing.next_song_chunk >= 0 {
                    // pre-decoding already began: cancel it and drop its
                    // chunks
                    self.dc.stop(&self.pc.notify);
                    self.pipe.chop(playing.next_song_chunk as usize);
                    playing.next_song_chunk = -1;
                }
                self.pc.lock().next_song = None;
                playing.queued = false;
                self.finish_command();
            }
        }
    }

    /// Scale and emit one chunk. Returns false on an audio failure.
    fn play_chunk(
        &self,
        playing: &Playing,
        mut chunk: ChunkData,
        format: &AudioFormat,
    ) -> bool {
        {
            let mut state = self.pc.lock();
            state.elapsed_time = chunk.time;
            state.bit_rate = chunk.bit_rate;
        }

        if chunk.tag.is_some() {
            // a stream updated its metadata mid-song
            self.pc.emit(PlayerEvent::Tag);
        }

        if chunk.data.is_empty() {
            return true;
        }

        if self.mixer == MixerType::Software || playing.rg_scale != 1.0 {
            let sw_volume = match self.mixer {
                MixerType::Software => self.pc.lock().software_volume,
                MixerType::None => volume::VOLUME_FULL,
            };
            volume::apply_volume(&mut chunk.data, sw_volume, playing.rg_scale);
        }

        if let Err(error) = self.outputs.lock().unwrap().play_all(&chunk.data) {
            warn!("audio output failed: {error:#}");
            self.set_error(PlayerError::Audio, playing.song.clone());
            return false;
        }

        self.pc.lock().total_play_time += format.size_to_time() * chunk.data.len() as f64;
        true
    }

    /// Play the song in `next_song`, then every queued successor, until
    /// commanded away or the queue runs dry.
    fn do_play(&self) {
        let mut playing = Playing {
            buffering: true,
            decoder_starting: false,
            paused: false,
            queued: false,
            song: None,
            xfade: Xfade::Unknown,
            next_song_chunk: -1,
            rg_scale: 1.0,
        };
        let mut cross_fade_chunks = 0usize;
        // position of the next cross-faded chunk of the incoming song
        let mut next_chunk: i64 = 0;
        let mut play_format: Option<AudioFormat> = None;
        let silence = [0u8; CHUNK_SIZE];

        self.pipe.clear();
        self.pipe.set_lazy(false);

        let first_song = self
            .pc
            .lock()
            .next_song
            .clone()
            .expect("PLAY command carries a song");
        self.dc.start(&self.pc.notify, first_song);
        if !self.wait_for_decoder(&mut playing) {
            self.stop_decoder();
            self.finish_command();
            return;
        }

        {
            let mut state = self.pc.lock();
            state.elapsed_time = 0.0;
            state.state = PlayerState::Play;
            PlayerControl::command_finished(&mut state);
        }
        self.pc.signal_main();

        loop {
            self.process_command(&mut playing, &play_format);
            let command = self.pc.lock().command;
            if matches!(
                command,
                PlayerCommand::Stop | PlayerCommand::Exit | PlayerCommand::CloseAudio
            ) {
                self.outputs.lock().unwrap().drop_buffered_all();
                break;
            }

            if playing.buffering {
                if self.pipe.available() < self.pc.buffered_before_play && !self.dc.is_idle()
                {
                    // not enough decoded chunks yet
                    self.pc.notify.wait();
                    continue;
                }
                playing.buffering = false;
                self.pipe.set_lazy(true);
            }

            if playing.decoder_starting {
                if self.dc.has_failed() {
                    let error = self.decoder_error();
                    self.set_error(error, playing.song.clone());
                    break;
                } else if !self.dc.is_starting() {
                    playing.decoder_starting = false;
                    let Some(format) = self.dc.out_format() else {
                        self.set_error(PlayerError::File, playing.song.clone());
                        break;
                    };
                    if let Err(error) = self.outputs.lock().unwrap().open_all(&format) {
                        warn!(
                            "problems opening audio device while playing \"{}\": {error:#}",
                            playing.song.as_ref().map_or("?", |s| s.uri.as_str())
                        );
                        self.set_error(PlayerError::Audio, playing.song.clone());
                        break;
                    }
                    if playing.paused {
                        self.outputs.lock().unwrap().close_all();
                    }
                    let mut state = self.pc.lock();
                    state.total_time = self.dc.total_time();
                    state.audio_format = self.dc.in_format();
                    drop(state);
                    play_format = Some(format);
                } else {
                    // decoder not ready yet
                    self.pc.notify.wait();
                    continue;
                }
            }

            if self.dc.is_idle() && playing.queued {
                // decoder finished the current song: let it pre-decode the
                // queued one, remembering where it starts in the pipe
                debug_assert!(playing.next_song_chunk < 0);
                let next = self.pc.lock().next_song.clone();
                if let Some(next) = next {
                    playing.queued = false;
                    playing.next_song_chunk = self.pipe.tail_index() as i64;
                    self.dc.start_async(next);
                }
            }

            if playing.next_song_chunk >= 0
                && playing.xfade == Xfade::Unknown
                && !self.dc.is_starting()
            {
                // decide whether this transition cross-fades, and over how
                // many chunks
                let reserved = self.pipe.size() - self.pc.buffered_before_play;
                cross_fade_chunks = match (self.dc.out_format(), play_format) {
                    (Some(next_format), Some(current_format)) => crossfade::calc(
                        self.pc.cross_fade_seconds(),
                        self.dc.total_time(),
                        &next_format,
                        &current_format,
                        reserved,
                    ),
                    _ => 0,
                };
                if cross_fade_chunks > 0 {
                    playing.xfade = Xfade::Enabled;
                    next_chunk = -1;
                } else {
                    playing.xfade = Xfade::Disabled;
                }
            }

            if playing.paused {
                self.pc.notify.wait();
            } else if !self.pipe.is_empty() && !self.pipe.head_is(playing.next_song_chunk) {
                if playing.xfade == Xfade::Enabled && playing.next_song_chunk >= 0 {
                    let fade_position = self.pipe.relative(playing.next_song_chunk as usize);
                    if fade_position <= cross_fade_chunks {
                        if next_chunk < 0 {
                            // beginning of the fade; the outgoing song may
                            // be shorter than the configured window
                            cross_fade_chunks = fade_position;
                        }
                        match self.pipe.absolute(cross_fade_chunks) {
                            Some(incoming) if cross_fade_chunks > 0 => {
                                next_chunk = incoming as i64;
                                self.pipe.set_lazy(true);
                                self.pipe.mix_head_with(incoming, |head, other| {
                                    crossfade::apply(
                                        head,
                                        other,
                                        cross_fade_chunks - fade_position,
                                        cross_fade_chunks,
                                    );
                                });
                            }
                            _ => {
                                if self.dc.is_idle() {
                                    // the incoming song has nothing more to
                                    // give; abort the fade
                                    playing.xfade = Xfade::Disabled;
                                } else {
                                    // wait for more decoded chunks
                                    self.pipe.set_lazy(false);
                                    self.dc.notify.signal();
                                    self.pc.notify.wait();
                                    next_chunk = 0;
                                    continue;
                                }
                            }
                        }
                    }
                }

                let Some(chunk) = self.pipe.head_snapshot() else {
                    continue;
                };
                let format = play_format.unwrap_or_default();
                if !self.play_chunk(&playing, chunk, &format) {
                    break;
                }
                self.pipe.shift();

                // wake the decoder in larger steps, not per chunk
                if self.pipe.available()
                    <= (self.pc.buffered_before_play + self.pipe.size() * 3) / 4
                {
                    self.dc.notify.signal();
                }
            } else if self.pipe.head_is(playing.next_song_chunk) {
                // the head chunk belongs to the queued song now
                if playing.xfade == Xfade::Enabled && next_chunk >= 0 {
                    // skip the part already played during the mix
                    self.pipe.skip(cross_fade_chunks);
                }
                playing.xfade = Xfade::Unknown;
                playing.next_song_chunk = -1;
                if !self.wait_for_decoder(&mut playing) {
                    break;
                }
            } else if self.dc.is_idle() {
                // nothing left to decode or play
                break;
            } else {
                // starving: keep the device busy with silence
                let format = play_format.unwrap_or_default();
                let frame_size = format.frame_size();
                let length = (CHUNK_SIZE / frame_size) * frame_size;
                if self.outputs.lock().unwrap().play_all(&silence[..length]).is_err() {
                    self.set_error(PlayerError::Audio, playing.song.clone());
                    break;
                }
            }
        }

        if playing.queued {
            self.pc.lock().next_song = None;
        }
        self.stop_decoder();
    }
}
