//! The playlist controller: drives the queue through playback. It decides
//! which song the player gets next, reacts to player events (song started,
//! stopped, errored) and keeps `current`/`queued` consistent across queue
//! edits.

pub mod stored;

use std::sync::Arc;

use camino::Utf8Path;
use tracing::debug;

use crate::db::Database;
use crate::idle::{IdleBus, SubSystem};
use crate::player::{PlayerControl, PlayerError, PlayerState};
use crate::protocol::{AckError, AckResult};
use crate::queue::Queue;
use crate::song::{Song, SongHandle, uri_has_scheme};

/// `previous` restarts the current song once this many seconds have
/// elapsed, instead of going back.
const PREV_UNLESS_ELAPSED: f32 = 10.0;

pub struct Playlist {
    pub queue: Queue,
    playing: bool,
    /// order number of the song being played
    current: Option<usize>,
    /// order number of the song handed to the player as "next"
    queued: Option<usize>,
    /// errors abort playback instead of skipping (after a manual seek)
    stop_on_error: bool,
    error_count: usize,

    pc: Arc<PlayerControl>,
    idle: IdleBus,
}

impl Playlist {
    pub fn new(max_length: usize, pc: Arc<PlayerControl>, idle: IdleBus) -> Self {
        Playlist {
            queue: Queue::new(max_length),
            playing: false,
            current: None,
            queued: None,
            stop_on_error: false,
            error_count: 0,
            pc,
            idle,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Position of the current song, for `status` and state saving.
    pub fn current_position(&self) -> Option<usize> {
        self.current.map(|order| self.queue.order_to_position(order))
    }

    pub fn queued_position(&self) -> Option<usize> {
        self.queued.map(|order| self.queue.order_to_position(order))
    }

    fn queued_song(&self) -> Option<SongHandle> {
        self.queued
            .map(|order| Arc::clone(self.queue.get_order(order)))
    }

    fn increment_version(&mut self) {
        self.queue.increment_version();
        self.idle.emit(SubSystem::Playlist);
    }

    /// Stamp every item; used when songs changed underneath the queue
    /// (database update).
    pub fn version_change_all(&mut self) {
        self.queue.modify_all();
        self.idle.emit(SubSystem::Playlist);
    }

    /// The current song's tag changed (stream metadata).
    pub fn tag_changed(&mut self) {
        if !self.playing {
            return;
        }
        if let Some(current) = self.current {
            self.queue.modify(current);
            self.idle.emit(SubSystem::Playlist);
        }
    }

    // ----- queued-song maintenance ------------------------------------

    fn queue_song_order(&mut self, order: usize) {
        debug_assert!(self.queue.valid_order(order));
        self.queued = Some(order);
        let song = Arc::clone(self.queue.get_order(order));
        debug!("queue song {}:\"{}\"", order, song.uri);
        self.pc.queue_song(song);
    }

    /// Make sure the player's "next song" slot matches the queue. `prev` is
    /// the song that was queued before the caller's edit.
    fn update_queued_song(&mut self, prev: Option<SongHandle>) {
        if !self.playing {
            return;
        }
        if prev.is_none() && self.queue.is_empty() {
            return;
        }

        let next_order = match self.current {
            Some(current) => self.queue.next_order(current),
            None => Some(0),
        };

        if let Some(next_order) = next_order
            && next_order == 0
            && self.queue.random
            && !self.queue.single
            && let Some(current) = self.current
        {
            // wrapping around: shuffle again so every pass through the
            // queue has a fresh order
            let current_position = self.queue.order_to_position(current);
            self.queue.shuffle_order();
            self.current = Some(self.queue.position_to_order(current_position));
        }

        let next_song = next_order.map(|order| Arc::clone(self.queue.get_order(order)));

        if let Some(prev) = &prev
            && !next_song
                .as_ref()
                .is_some_and(|next| Arc::ptr_eq(next, prev))
        {
            // the song queued at the player is no longer the right one
            self.pc.cancel();
            self.queued = None;
        }

        if let Some(next_order) = next_order {
            let changed = match (&prev, &next_song) {
                (Some(p), Some(n)) => !Arc::ptr_eq(p, n),
                (None, Some(_)) => true,
                _ => false,
            };
            if changed {
                self.queue_song_order(next_order);
            } else {
                self.queued = Some(next_order);
            }
        }
    }

    // ----- reactions to player events ---------------------------------

    /// The player has begun the queued song.
    fn song_started(&mut self) {
        let finished = self.current;
        self.current = self.queued;
        self.queued = None;

        // single mode: hold after every song
        if self.queue.single && !self.queue.repeat {
            self.pc.set_pause(true);
        }

        if self.queue.consume
            && let Some(finished) = finished
        {
            let position = self.queue.order_to_position(finished);
            let _ = self.delete(position);
        }

        self.idle.emit(SubSystem::Player);
    }

    /// The player stopped; decide whether to restart with the next song.
    fn resume_playback(&mut self) {
        debug_assert!(self.playing);

        let error = self.pc.error();
        match error {
            None => self.error_count = 0,
            Some(_) => self.error_count += 1,
        }

        if (self.stop_on_error && error.is_some())
            || matches!(error, Some(PlayerError::Audio | PlayerError::System))
            || self.error_count >= self.queue.len()
        {
            // critical error, or everything in the queue failed
            self.stop();
        } else {
            self.next();
        }
    }

    /// Player-event handler; called from the main loop whenever the player
    /// requests a new queued song or exits its play loop.
    pub fn sync_with_player(&mut self) {
        if !self.playing {
            // stale event from before a stop command
            return;
        }

        if self.pc.state() == PlayerState::Stop {
            self.resume_playback();
        } else {
            let slot_empty = self.pc.lock().next_song.is_none();
            if slot_empty && self.queued.is_some() {
                self.song_started();
            }
            if self.pc.lock().next_song.is_none() && self.queued.is_none() {
                self.update_queued_song(None);
            }
        }
    }

    // ----- playback control -------------------------------------------

    fn play_order(&mut self, order: usize) {
        self.playing = true;
        self.queued = None;
        let song = Arc::clone(self.queue.get_order(order));
        debug!("play {}:\"{}\"", order, song.uri);
        self.pc.play(song);
        self.current = Some(order);
        self.idle.emit(SubSystem::Player);
    }

    /// `play` / `play <position>`.
    pub fn play(&mut self, position: Option<usize>) -> AckResult<()> {
        self.pc.clear_error();

        let order = match position {
            None => {
                if self.queue.is_empty() {
                    return Ok(());
                }
                if self.playing {
                    // just unpause
                    self.pc.set_pause(false);
                    return Ok(());
                }
                self.current.unwrap_or(0)
            }
            Some(position) => {
                if !self.queue.valid_position(position) {
                    return Err(AckError::bad_range());
                }
                if self.queue.random {
                    let order = self.queue.position_to_order(position);
                    if !self.playing {
                        self.current = Some(0);
                    }
                    // swap the chosen song into the current order slot so
                    // playback continues as planned afterwards
                    let current = self.current.unwrap_or(0);
                    self.queue.swap_order(order, current);
                    current
                } else {
                    position
                }
            }
        };

        self.stop_on_error = false;
        self.error_count = 0;
        self.play_order(order);
        Ok(())
    }

    pub fn play_id(&mut self, id: Option<u32>) -> AckResult<()> {
        match id {
            None => self.play(None),
            Some(id) => {
                let position = self
                    .queue
                    .id_to_position(id)
                    .ok_or_else(AckError::no_such_song)?;
                self.play(Some(position))
            }
        }
    }

    pub fn stop(&mut self) {
        if !self.playing {
            return;
        }
        debug!("stop");
        self.pc.stop();
        self.queued = None;
        self.playing = false;

        if self.queue.random
            && let Some(current) = self.current
        {
            // shuffle, so the next playback starts in a fresh order; keep
            // "current" pointing at the same song for a later "play"
            let current_position = self.queue.order_to_position(current);
            self.queue.shuffle_order();
            self.current = Some(self.queue.position_to_order(current_position));
        }
        self.idle.emit(SubSystem::Player);
    }

    pub fn next(&mut self) {
        if !self.playing {
            return;
        }
        debug_assert!(!self.queue.is_empty());

        let current = self.current.expect("playing implies a current song");
        self.stop_on_error = false;

        match self.queue.next_order(current) {
            None => {
                self.stop();
                self.current = None;
            }
            Some(next_order) => {
                if next_order == 0 && self.queue.random {
                    // wrapped in repeat mode: reshuffle for variety
                    let current_position = self.queue.order_to_position(current);
                    self.queue.shuffle_order();
                    self.current = Some(self.queue.position_to_order(current_position));
                }
                self.play_order(next_order);
            }
        }

        // consume mode removes every played song
        if self.queue.consume {
            let position = self.queue.order_to_position(current);
            let _ = self.delete(position);
        }
    }

    pub fn previous(&mut self) {
        if !self.playing {
            return;
        }
        let current = self.current.expect("playing implies a current song");

        if self.pc.elapsed_time() > PREV_UNLESS_ELAPSED {
            // rewind, like the prev button of a CD player
            self.play_order(current);
        } else if current > 0 {
            self.play_order(current - 1);
        } else if self.queue.repeat {
            self.play_order(self.queue.len() - 1);
        } else {
            self.play_order(current);
        }
    }

    pub fn seek(&mut self, position: usize, seconds: f64) -> AckResult<()> {
        if !self.queue.valid_position(position) {
            return Err(AckError::bad_range());
        }
        let order = if self.queue.random {
            self.queue.position_to_order(position)
        } else {
            position
        };

        self.pc.clear_error();
        self.stop_on_error = true;
        self.error_count = 0;

        if self.playing {
            if self.queued.is_some() {
                self.pc.cancel();
                self.queued = None;
            }
        } else {
            self.play_order(order);
        }
        if self.current != Some(order) {
            self.play_order(order);
        }

        let song = Arc::clone(self.queue.get_order(order));
        if !self.pc.seek(song, seconds) {
            return Err(AckError::not_playing());
        }
        self.idle.emit(SubSystem::Player);
        Ok(())
    }

    pub fn seek_id(&mut self, id: u32, seconds: f64) -> AckResult<()> {
        let position = self
            .queue
            .id_to_position(id)
            .ok_or_else(AckError::no_such_song)?;
        self.seek(position, seconds)
    }

    /// `seekcur`: seek within the current song.
    pub fn seek_current(&mut self, seconds: f64) -> AckResult<()> {
        let Some(current) = self.current else {
            return Err(AckError::not_playing());
        };
        let position = self.queue.order_to_position(current);
        self.seek(position, seconds.max(0.0))
    }

    // ----- mode switches ----------------------------------------------

    pub fn set_repeat(&mut self, repeat: bool) {
        if repeat == self.queue.repeat {
            return;
        }
        self.queue.repeat = repeat;
        // the queued song may be the wrap-around one
        let prev = self.queued_song();
        self.update_queued_song(prev);
        self.idle.emit(SubSystem::Options);
    }

    pub fn set_single(&mut self, single: bool) {
        if single == self.queue.single {
            return;
        }
        self.queue.single = single;
        let prev = self.queued_song();
        self.update_queued_song(prev);
        self.idle.emit(SubSystem::Options);
    }

    pub fn set_consume(&mut self, consume: bool) {
        if consume == self.queue.consume {
            return;
        }
        self.queue.consume = consume;
        let prev = self.queued_song();
        self.update_queued_song(prev);
        self.idle.emit(SubSystem::Options);
    }

    pub fn set_random(&mut self, random: bool) {
        if random == self.queue.random {
            return;
        }

        let prev = self.queued_song();
        self.queue.random = random;

        if self.queue.random {
            // shuffle, but keep the current song first in the new order
            let current_position = self.current.map(|o| self.queue.order_to_position(o));
            self.queue.shuffle_order();
            if let Some(position) = current_position {
                let order = self.queue.position_to_order(position);
                self.queue.swap_order(0, order);
                self.current = Some(0);
            }
        } else {
            // back to list order
            if let Some(current) = self.current {
                self.current = Some(self.queue.order_to_position(current));
            }
            self.queue.restore_order();
        }

        self.update_queued_song(prev);
        self.idle.emit(SubSystem::Options);
    }

    // ----- queue edits ------------------------------------------------

    fn resolve_song(db: &Database, uri: &Utf8Path) -> AckResult<SongHandle> {
        if let Some(song) = db.get_song(uri) {
            return Ok(song);
        }
        if uri_has_scheme(uri.as_str()) {
            return Ok(Arc::new(Song::detached(uri)));
        }
        Err(AckError::no_such_song())
    }

    /// `add`/`addid`: returns the new item's id.
    pub fn append_uri(&mut self, db: &Database, uri: &Utf8Path) -> AckResult<u32> {
        debug!("add to playlist: {uri}");
        let song = Self::resolve_song(db, uri)?;
        self.append_song(song)
    }

    pub fn append_song(&mut self, song: SongHandle) -> AckResult<u32> {
        if self.queue.is_full() {
            return Err(AckError::playlist_too_large());
        }

        let prev = self.queued_song();
        let id = self.queue.append(song, 0);

        if self.queue.random {
            // shuffle the new song into the part not yet played
            let start = match self.queued.or(self.current) {
                Some(order) => order + 1,
                None => 0,
            };
            if start < self.queue.len() {
                self.queue.shuffle_order_last(start, self.queue.len());
            }
        }

        self.increment_version();
        self.update_queued_song(prev);
        Ok(id)
    }

    pub fn delete(&mut self, position: usize) -> AckResult<()> {
        if !self.queue.valid_position(position) {
            return Err(AckError::bad_range());
        }
        let prev = self.queued_song();
        self.delete_internal(position);
        self.increment_version();
        self.update_queued_song(prev);
        Ok(())
    }

    fn delete_internal(&mut self, position: usize) {
        let order = self.queue.position_to_order(position);

        if self.playing && self.current == Some(order) {
            let paused = self.pc.state() == PlayerState::Pause;

            // deleting the current song: stop the player first
            self.pc.stop();
            self.playing = false;
            self.queued = None;

            // and decide what plays instead
            let next = self.queue.next_order(order).filter(|&next| next != order);
            let resume = match next {
                Some(next) if !paused => Some(next),
                _ => None,
            };
            self.current = None;

            let item = self.queue.delete(position);
            self.pc.song_deleted(&item.song);

            if let Some(mut resume) = resume {
                if resume > order {
                    resume -= 1;
                }
                if self.queue.valid_order(resume) {
                    self.play_order(resume);
                    return;
                }
            }
            self.idle.emit(SubSystem::Player);
            return;
        }

        if self.current == Some(order) {
            // a "current song" while stopped
            self.current = None;
        }

        let item = self.queue.delete(position);
        self.pc.song_deleted(&item.song);

        // deleting before the current song shifts its order number
        if let Some(current) = self.current
            && current > order
        {
            self.current = Some(current - 1);
        }
        if let Some(queued) = self.queued
            && queued > order
        {
            self.queued = Some(queued - 1);
        }
    }

    pub fn delete_id(&mut self, id: u32) -> AckResult<()> {
        let position = self
            .queue
            .id_to_position(id)
            .ok_or_else(AckError::no_such_song)?;
        self.delete(position)
    }

    pub fn delete_range(&mut self, start: usize, end: usize) -> AckResult<()> {
        if start >= self.queue.len() || end > self.queue.len() || start >= end {
            return Err(AckError::bad_range());
        }
        let prev = self.queued_song();
        for position in (start..end).rev() {
            self.delete_internal(position);
        }
        self.increment_version();
        self.update_queued_song(prev);
        Ok(())
    }

    /// Remove every queue item whose song disappeared from the database.
    pub fn delete_song_by_uri(&mut self, uri: &Utf8Path) {
        let positions: Vec<usize> = self
            .queue
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| item.song.uri == uri)
            .map(|(position, _)| position)
            .collect();
        for position in positions.into_iter().rev() {
            let _ = self.delete(position);
        }
    }

    pub fn clear(&mut self) {
        self.stop();
        for item in self.queue.clear() {
            self.pc.song_deleted(&item.song);
        }
        self.current = None;
        self.queued = None;
        self.increment_version();
    }

    pub fn swap(&mut self, position1: usize, position2: usize) -> AckResult<()> {
        if !self.queue.valid_position(position1) || !self.queue.valid_position(position2) {
            return Err(AckError::bad_range());
        }
        let prev = self.queued_song();
        self.queue.swap(position1, position2);

        if self.queue.random {
            // keep the order list pointing at the same songs
            self.queue.swap_order(
                self.queue.position_to_order(position1),
                self.queue.position_to_order(position2),
            );
        } else if self.current == Some(position1) {
            self.current = Some(position2);
        } else if self.current == Some(position2) {
            self.current = Some(position1);
        }

        self.increment_version();
        self.update_queued_song(prev);
        Ok(())
    }

    pub fn swap_id(&mut self, id1: u32, id2: u32) -> AckResult<()> {
        let position1 = self
            .queue
            .id_to_position(id1)
            .ok_or_else(AckError::no_such_song)?;
        let position2 = self
            .queue
            .id_to_position(id2)
            .ok_or_else(AckError::no_such_song)?;
        self.swap(position1, position2)
    }

    /// `move FROM TO` / `move START:END TO`. `to < 0` addresses positions
    /// relative to the current song (-1 = right after it).
    pub fn move_range(&mut self, start: usize, end: usize, to: i64) -> AckResult<()> {
        if start >= self.queue.len() || end > self.queue.len() || start >= end {
            return Err(AckError::bad_range());
        }
        let count = end - start;

        let to = if to < 0 {
            let Some(current) = self.current_position() else {
                return Err(AckError::bad_range());
            };
            if (start..end).contains(&current) {
                // the range contains the current song: nothing to do
                return Ok(());
            }
            let mut target = current as i64 + to.abs();
            if start < current {
                target -= count as i64;
            }
            if target + count as i64 > self.queue.len() as i64 {
                return Err(AckError::bad_range());
            }
            target.max(0) as usize
        } else {
            let to = to as usize;
            if to + count > self.queue.len() {
                return Err(AckError::bad_range());
            }
            to
        };

        if to == start {
            return Ok(());
        }

        let prev = self.queued_song();

        // track the playing song through the move by position
        let current_position = self.current_position();

        self.queue.move_range(start, end, to);

        if !self.queue.random
            && let Some(position) = current_position
        {
            let new_position = if (start..end).contains(&position) {
                position + to - start
            } else if position >= end && position < to + count {
                position - count
            } else if position < start && position >= to {
                position + count
            } else {
                position
            };
            self.current = Some(new_position);
        }

        self.increment_version();
        self.update_queued_song(prev);
        Ok(())
    }

    pub fn move_id(&mut self, id: u32, to: i64) -> AckResult<()> {
        let position = self
            .queue
            .id_to_position(id)
            .ok_or_else(AckError::no_such_song)?;
        self.move_range(position, position + 1, to)
    }

    pub fn shuffle(&mut self, start: usize, end: usize) -> AckResult<()> {
        if start >= self.queue.len() || end > self.queue.len() || start >= end {
            return Err(AckError::bad_range());
        }
        if self.queue.len() <= 1 {
            return Ok(());
        }

        let prev = self.queued_song();
        let mut start = start;

        if self.playing
            && let Some(current) = self.current
        {
            let current_position = self.queue.order_to_position(current);
            if (start..end).contains(&current_position) {
                // keep the playing song at the head of the shuffled range
                self.queue.swap(start, current_position);
                if self.queue.random {
                    self.current = Some(self.queue.position_to_order(start));
                } else {
                    self.current = Some(start);
                }
                start += 1;
            }
        }

        self.queue.shuffle_range(start, end);
        self.increment_version();
        self.update_queued_song(prev);
        Ok(())
    }

    /// `prio`: bias the random order of a position range.
    pub fn set_priority(&mut self, start: usize, end: usize, priority: u8) -> AckResult<()> {
        if start >= self.queue.len() || end > self.queue.len() || start >= end {
            return Err(AckError::bad_range());
        }

        let prev = self.queued_song();
        let after_order = if self.playing { self.current } else { None };
        let modified = self
            .queue
            .set_priority_range(start, end, priority, after_order);

        if modified {
            self.increment_version();
            self.update_queued_song(prev);
        }
        Ok(())
    }

    pub fn set_priority_id(&mut self, id: u32, priority: u8) -> AckResult<()> {
        let position = self
            .queue
            .id_to_position(id)
            .ok_or_else(AckError::no_such_song)?;
        self.set_priority(position, position + 1, priority)
    }

    /// Current song for `currentsong`, with its position and id.
    pub fn current_song(&self) -> Option<(usize, u32, SongHandle)> {
        let position = self.current_position()?;
        let id = self.queue.position_to_id(position);
        Some((position, id, Arc::clone(self.queue.get(position))))
    }

    /// Restore playback state from the state file.
    pub fn restore(&mut self, position: usize, playing: bool) {
        if !self.queue.valid_position(position) {
            return;
        }
        if playing {
            let _ = self.play(Some(position));
        } else {
            let order = if self.queue.random {
                self.queue.position_to_order(position)
            } else {
                position
            };
            self.current = Some(order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn playlist() -> Playlist {
        let (tx, _rx) = unbounded_channel();
        let pc = PlayerControl::new(4, tx);
        Playlist::new(32, pc, IdleBus::new())
    }

    fn fill(playlist: &mut Playlist, n: usize) {
        for i in 0..n {
            playlist
                .append_song(Arc::new(Song::detached(format!("song-{i}.wav"))))
                .unwrap();
        }
    }

    #[test]
    fn append_rejects_overflow() {
        let (tx, _rx) = unbounded_channel();
        let pc = PlayerControl::new(4, tx);
        let mut playlist = Playlist::new(2, pc, IdleBus::new());
        fill(&mut playlist, 2);
        let error = playlist
            .append_song(Arc::new(Song::detached("extra.wav")))
            .unwrap_err();
        assert_eq!(error.code, crate::protocol::Ack::PlaylistMax);
    }

    #[test]
    fn version_bumps_on_edits() {
        let mut playlist = playlist();
        let v0 = playlist.queue.version();
        fill(&mut playlist, 3);
        assert!(playlist.queue.version() > v0);

        let v1 = playlist.queue.version();
        playlist.delete(1).unwrap();
        assert!(playlist.queue.version() > v1);
        assert_eq!(playlist.queue.len(), 2);
    }

    #[test]
    fn delete_adjusts_current_while_stopped() {
        let mut playlist = playlist();
        fill(&mut playlist, 4);
        playlist.current = Some(2);

        playlist.delete(0).unwrap();
        assert_eq!(playlist.current, Some(1));

        // deleting the "current" song clears it
        playlist.delete(1).unwrap();
        assert_eq!(playlist.current, None);
    }

    #[test]
    fn move_tracks_current_position() {
        let mut playlist = playlist();
        fill(&mut playlist, 5);
        playlist.current = Some(1);
        let current_uri = playlist.queue.get(1).uri.clone();

        playlist.move_range(0, 2, 3).unwrap();
        let position = playlist.current_position().unwrap();
        assert_eq!(playlist.queue.get(position).uri, current_uri);
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let mut playlist = playlist();
        fill(&mut playlist, 3);
        assert!(playlist.delete(3).is_err());
        assert!(playlist.move_range(0, 4, 0).is_err());
        assert!(playlist.swap(0, 9).is_err());
        assert!(playlist.shuffle(2, 1).is_err());
        assert!(playlist.delete_id(999).is_err());
    }

    #[test]
    fn clear_resets_state() {
        let mut playlist = playlist();
        fill(&mut playlist, 3);
        playlist.current = Some(1);
        playlist.clear();
        assert!(playlist.queue.is_empty());
        assert_eq!(playlist.current, None);
        assert!(playlist.current_song().is_none());
    }
}
