//! Server assembly: owns the database, the play queue, both worker
//! threads and the event plumbing between them. One `System` exists per
//! process, shared behind a `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use color_eyre::eyre::bail;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::{Config, MixerType};
use crate::db::update::{UpdateQueue, WalkOptions};
use crate::db::{Database, update, watch};
use crate::decoder::thread::DecoderThread;
use crate::decoder::{DecoderControl, thread as decoder_thread};
use crate::idle::{IdleBus, SubSystem};
use crate::output::{NullOutput, OutputSet};
use crate::pipe::MusicPipe;
use crate::player::thread::PlayerThread;
use crate::player::{PlayerControl, PlayerEvent, PlayerState, thread as player_thread};
use crate::playlist::Playlist;
use crate::protocol::{AckError, AckResult, PlayerStateName, StatusResponse, StatsResponse};
use crate::song::SongHandle;
use crate::state_file::{self, SavedEntry, SavedPlayState};

pub struct System {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub playlist: Playlist,
    pub pc: Arc<PlayerControl>,
    pub dc: Arc<DecoderControl>,
    pub outputs: Arc<StdMutex<OutputSet>>,
    pub idle: IdleBus,
    pub updates: UpdateQueue,

    /// last `setvol` value (0..=100), meaningless without a mixer
    sw_volume: u8,
    password_table: HashMap<String, u8>,
    started_at: Instant,
    update_kick: UnboundedSender<()>,

    player_handle: Option<std::thread::JoinHandle<()>>,
    decoder_handle: Option<std::thread::JoinHandle<()>>,
    _watcher: Option<Box<dyn std::any::Any + Send>>,
}

impl System {
    /// Build the whole machine and spawn its background workers. The
    /// returned handle is what client sessions operate on.
    pub fn start(config: Config) -> Result<Arc<Mutex<System>>> {
        let config = Arc::new(config);
        let password_table = config.password_table()?;
        let idle = IdleBus::new();

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let pc = PlayerControl::new(config.buffered_before_play(), player_tx);
        let dc = Arc::new(DecoderControl::new());
        let pipe = Arc::new(MusicPipe::new(
            config.pipe_chunks(),
            Arc::clone(&pc.notify),
        ));

        let mut outputs = OutputSet::new();
        for output in &config.outputs {
            match output.plugin.as_str() {
                "null" => outputs.add(&output.name, Box::new(NullOutput::new(output.sync))),
                other => bail!("unknown audio output plugin {other:?}"),
            }
        }
        let outputs = Arc::new(StdMutex::new(outputs));

        let decoder_handle = decoder_thread::spawn(DecoderThread {
            dc: Arc::clone(&dc),
            pipe: Arc::clone(&pipe),
            player_notify: Arc::clone(&pc.notify),
            music_dir: config.music_directory.clone(),
        });
        let player_handle = player_thread::spawn(PlayerThread {
            pc: Arc::clone(&pc),
            dc: Arc::clone(&dc),
            pipe,
            outputs: Arc::clone(&outputs),
            mixer: config.mixer,
            replaygain: config.replaygain,
            replaygain_preamp: config.replaygain_preamp,
        });

        let db = Arc::new(Database::new());
        let playlist = Playlist::new(
            config.max_playlist_length,
            Arc::clone(&pc),
            idle.clone(),
        );

        let (update_kick, update_rx) = mpsc::unbounded_channel();

        let mut system = System {
            config,
            db,
            playlist,
            pc,
            dc,
            outputs,
            idle,
            updates: UpdateQueue::new(),
            sw_volume: 100,
            password_table,
            started_at: Instant::now(),
            update_kick,
            player_handle: Some(player_handle),
            decoder_handle: Some(decoder_handle),
            _watcher: None,
        };

        system.load_db_file();
        system.load_state_file();

        let system = Arc::new(Mutex::new(system));
        task::spawn(player_event_loop(Arc::clone(&system), player_rx));
        task::spawn(update_loop(Arc::clone(&system), update_rx));
        Ok(system)
    }

    /// Attach the filesystem watcher when `auto_update` is configured;
    /// must run inside the runtime.
    pub async fn start_auto_update(system: &Arc<Mutex<System>>) {
        let mut sys = system.lock().await;
        if !sys.config.auto_update {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match watch::start(&sys.config.music_directory, tx) {
            Ok(watcher) => {
                sys._watcher = Some(Box::new(watcher));
                task::spawn(watch_loop(Arc::clone(system), rx));
                info!("watching {} for changes", sys.config.music_directory);
            }
            Err(error) => warn!("auto_update disabled: {error:#}"),
        }
    }

    // ----- status & stats ---------------------------------------------

    pub fn volume(&self) -> i8 {
        match self.config.mixer {
            MixerType::None => -1,
            MixerType::Software => self.sw_volume as i8,
        }
    }

    pub fn set_volume(&mut self, volume: u8) -> AckResult<()> {
        if self.config.mixer == MixerType::None {
            return Err(AckError::system("problems setting volume"));
        }
        if volume > 100 {
            return Err(AckError::new(
                crate::protocol::Ack::Arg,
                "Invalid volume value",
            ));
        }
        self.sw_volume = volume;
        self.pc.set_software_volume(volume);
        self.idle.emit(SubSystem::Mixer);
        Ok(())
    }

    pub fn sw_volume(&self) -> u8 {
        self.sw_volume
    }

    pub fn status(&self) -> StatusResponse {
        let player = self.pc.status();
        let state = match player.state {
            PlayerState::Play => PlayerStateName::Play,
            PlayerState::Pause => PlayerStateName::Pause,
            PlayerState::Stop => PlayerStateName::Stop,
        };

        let current = (player.state != PlayerState::Stop)
            .then(|| self.playlist.current_song())
            .flatten();
        let next = (player.state != PlayerState::Stop)
            .then(|| self.playlist.queued_position())
            .flatten();

        let crossfade = self.pc.cross_fade_seconds() as u32;

        StatusResponse {
            volume: self.volume(),
            repeat: self.playlist.queue.repeat,
            random: self.playlist.queue.random,
            single: self.playlist.queue.single,
            consume: self.playlist.queue.consume,
            playlist: self.playlist.queue.version(),
            playlistlength: self.playlist.queue.len() as u32,
            xfade: (crossfade > 0).then_some(crossfade),
            state,
            song: current.as_ref().map(|(position, _, _)| *position as u32),
            songid: current.as_ref().map(|(_, id, _)| *id),
            time: current.as_ref().map(|_| {
                format!(
                    "{}:{}",
                    player.elapsed_time as u32, player.total_time as u32
                )
            }),
            elapsed: current
                .as_ref()
                .map(|_| f64::from(player.elapsed_time)),
            bitrate: current
                .as_ref()
                .and_then(|_| (player.bit_rate > 0).then_some(u32::from(player.bit_rate))),
            audio: current.as_ref().and_then(|_| player.audio_format),
            nextsong: next.map(|position| position as u32),
            nextsongid: next.map(|position| self.playlist.queue.position_to_id(position)),
            updating_db: self.updates.active_id(),
            error: self.pc.error_message(),
        }
    }

    pub fn stats(&self) -> StatsResponse {
        let db = self.db.stats();
        StatsResponse {
            artists: db.artists,
            albums: db.albums,
            songs: db.songs,
            uptime: self.started_at.elapsed().as_secs(),
            playtime: self.pc.total_play_time() as u64,
            db_playtime: db.db_playtime,
            db_update: self.db.updated_at().unwrap_or(0),
        }
    }

    pub fn check_password(&self, password: &str) -> Option<u8> {
        self.password_table.get(password).copied()
    }

    // ----- database persistence ----------------------------------------

    pub fn enqueue_update(&mut self, uri: Option<Utf8PathBuf>, discard: bool) -> u32 {
        let id = self.updates.enqueue(uri, discard);
        if id != 0 {
            let _ = self.update_kick.send(());
        }
        id
    }

    fn load_db_file(&mut self) {
        let path = &self.config.db_file;
        match File::open(path.as_std_path()) {
            Ok(file) => {
                if let Err(error) = self.db.load(&mut BufReader::new(file)) {
                    warn!("discarding database file {path}: {error:#}");
                } else {
                    info!("loaded database with {} songs", self.db.song_count());
                    self.db.mark_updated(file_mtime(path));
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!("could not open database file {path}: {error}"),
        }
    }

    pub fn save_db_file(&self) {
        let path = &self.config.db_file;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent.as_std_path());
        }
        let result = File::create(path.as_std_path())
            .map_err(color_eyre::Report::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                self.db.save(&mut writer)?;
                writer.flush()?;
                Ok(())
            });
        match result {
            Ok(()) => debug!("database saved to {path}"),
            Err(error) => warn!("failed to save database to {path}: {error:#}"),
        }
    }

    // ----- state file ---------------------------------------------------

    fn load_state_file(&mut self) {
        let Some(path) = self.config.state_file.clone() else {
            return;
        };
        let text = match std::fs::read_to_string(path.as_std_path()) {
            Ok(text) => text,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not read state file {path}: {error}");
                }
                return;
            }
        };
        let state = state_file::parse(&text);

        for (priority, entry) in &state.entries {
            let song: Option<SongHandle> = match entry {
                SavedEntry::Database { uri } => self.db.get_song(uri),
                SavedEntry::Detached(song) => Some(Arc::new(song.clone())),
            };
            let Some(song) = song else {
                debug!("state file references unknown song");
                continue;
            };
            if let Ok(id) = self.playlist.append_song(song)
                && *priority != 0
                && let Some(position) = self.playlist.queue.id_to_position(id)
            {
                let _ = self.playlist.set_priority(position, position + 1, *priority);
            }
        }

        self.playlist.set_repeat(state.repeat);
        self.playlist.set_single(state.single);
        self.playlist.set_consume(state.consume);
        self.playlist.set_random(state.random);
        self.pc.set_cross_fade_seconds(state.crossfade as f32);
        self.sw_volume = state.sw_volume.min(100);
        if self.config.mixer == MixerType::Software {
            self.pc.set_software_volume(self.sw_volume);
        }

        if let Some(position) = state.current {
            match state.state {
                SavedPlayState::Stop => self.playlist.restore(position, false),
                SavedPlayState::Play | SavedPlayState::Pause => {
                    self.playlist.restore(position, true);
                    if state.time > 0.0 {
                        let _ = self.playlist.seek(position, state.time);
                    }
                    if state.state == SavedPlayState::Pause {
                        self.pc.set_pause(true);
                    }
                }
            }
        }
    }

    pub fn save_state_file(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        let result = File::create(path.as_std_path())
            .map_err(color_eyre::Report::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                state_file::save(&mut writer, &self.playlist, &self.pc, self.sw_volume)?;
                writer.flush()?;
                Ok(())
            });
        if let Err(error) = result {
            warn!("failed to write state file {path}: {error:#}");
        }
    }

    /// Persist everything and stop the worker threads.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.save_state_file();
        self.playlist.stop();
        self.pc.exit();
        if let Some(handle) = self.player_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.decoder_handle.take() {
            let _ = handle.join();
        }
        self.save_db_file();
    }
}

fn file_mtime(path: &Utf8Path) -> i64 {
    std::fs::metadata(path.as_std_path())
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Forward player-thread events into the playlist controller.
async fn player_event_loop(
    system: Arc<Mutex<System>>,
    mut events: UnboundedReceiver<PlayerEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut sys = system.lock().await;
        match event {
            PlayerEvent::Playlist => sys.playlist.sync_with_player(),
            PlayerEvent::Tag => {
                sys.playlist.tag_changed();
                sys.idle.emit(SubSystem::Player);
            }
        }
    }
}

/// Run queued database updates, one at a time, on blocking threads.
async fn update_loop(system: Arc<Mutex<System>>, mut kicks: UnboundedReceiver<()>) {
    while kicks.recv().await.is_some() {
        loop {
            let job = {
                let mut sys = system.lock().await;
                sys.updates.take_next()
            };
            let Some(job) = job else { break };

            let (db, music_dir, options) = {
                let sys = system.lock().await;
                (
                    Arc::clone(&sys.db),
                    sys.config.music_directory.clone(),
                    WalkOptions {
                        follow_inside_symlinks: sys.config.follow_inside_symlinks,
                        follow_outside_symlinks: sys.config.follow_outside_symlinks,
                        discard: job.discard,
                    },
                )
            };

            info!("update job {} starting ({:?})", job.id, job.uri);
            let uri = job.uri.clone();
            let walk_db = Arc::clone(&db);
            let modified = task::spawn_blocking(move || {
                update::walk(&walk_db, &music_dir, uri.as_deref(), options)
            })
            .await
            .unwrap_or_else(|error| {
                warn!("update job panicked: {error}");
                false
            });

            let mut sys = system.lock().await;
            sys.updates.finish(job.id);
            sys.idle.emit(SubSystem::Update);
            if modified {
                sys.db.mark_updated(jiff::Timestamp::now().as_second());
                sys.save_db_file();

                // queue items whose file vanished go away with it
                let stale: Vec<Utf8PathBuf> = sys
                    .playlist
                    .queue
                    .items()
                    .iter()
                    .filter(|item| {
                        item.song.in_database && sys.db.get_song(&item.song.uri).is_none()
                    })
                    .map(|item| item.song.uri.clone())
                    .collect();
                for uri in &stale {
                    sys.playlist.delete_song_by_uri(uri);
                }
                sys.playlist.version_change_all();
                sys.idle.emit(SubSystem::Database);
            }
            info!(
                "update job {} finished ({}, {} songs)",
                job.id,
                if modified { "modified" } else { "unchanged" },
                sys.db.song_count()
            );
        }
    }
}

/// Translate filesystem events into update jobs.
async fn watch_loop(
    system: Arc<Mutex<System>>,
    mut changes: UnboundedReceiver<watch::FsChange>,
) {
    while let Some(change) = changes.recv().await {
        let mut sys = system.lock().await;
        sys.enqueue_update(change.uri, false);
    }
}
