//! The play queue: an ordered list of songs with three address spaces that
//! all stay bijective with the live item set.
//!
//! - **position**: dense `0..len` index in list order
//! - **id**: stable small integer that survives moves
//! - **order**: playback index; equals position in sequential mode, a
//!   priority-aware permutation in random mode

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::song::SongHandle;

/// The id space holds `max_length * ID_SPACE_MULT` slots, so the linear
/// scan in [`Queue::generate_id`] always terminates.
const ID_SPACE_MULT: usize = 4;

/// Version numbers are 31-bit; on overflow every item is reset to 0 and the
/// counter restarts at 1.
const VERSION_MAX: u32 = (1 << 31) - 1;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub song: SongHandle,
    pub id: u32,
    /// version of the last change to this item's song or priority
    pub version: u32,
    pub priority: u8,
}

#[derive(Debug)]
pub struct Queue {
    max_length: usize,
    /// all items in "position" order
    items: Vec<QueueItem>,
    /// map order numbers to positions
    order: Vec<usize>,
    /// map song ids to positions; -1 = unused
    id_to_position: Vec<i32>,
    next_id: usize,
    version: u32,

    pub repeat: bool,
    pub single: bool,
    pub consume: bool,
    pub random: bool,

    rng: StdRng,
}

impl Queue {
    pub fn new(max_length: usize) -> Self {
        Queue::with_rng(max_length, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn with_rng(max_length: usize, rng: StdRng) -> Self {
        Queue {
            max_length,
            items: Vec::new(),
            order: Vec::new(),
            id_to_position: vec![-1; max_length * ID_SPACE_MULT],
            next_id: 0,
            version: 1,
            repeat: false,
            single: false,
            consume: false,
            random: false,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_length
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn valid_position(&self, position: usize) -> bool {
        position < self.items.len()
    }

    pub fn valid_order(&self, order: usize) -> bool {
        order < self.items.len()
    }

    pub fn id_to_position(&self, id: u32) -> Option<usize> {
        self.id_to_position
            .get(id as usize)
            .copied()
            .filter(|&p| p >= 0)
            .map(|p| p as usize)
    }

    pub fn position_to_id(&self, position: usize) -> u32 {
        self.items[position].id
    }

    pub fn order_to_position(&self, order: usize) -> usize {
        self.order[order]
    }

    pub fn position_to_order(&self, position: usize) -> usize {
        self.order
            .iter()
            .position(|&p| p == position)
            .expect("order is a permutation of positions")
    }

    pub fn get(&self, position: usize) -> &SongHandle {
        &self.items[position].song
    }

    pub fn get_order(&self, order: usize) -> &SongHandle {
        self.get(self.order[order])
    }

    pub fn item(&self, position: usize) -> &QueueItem {
        &self.items[position]
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Was the item at this position changed after `version`? Items with a
    /// zero stamp survived a version-counter wrap and always count as
    /// changed.
    pub fn song_newer(&self, position: usize, version: u32) -> bool {
        version > self.version
            || self.items[position].version >= version
            || self.items[position].version == 0
    }

    fn generate_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_id;
            self.next_id = (self.next_id + 1) % self.id_to_position.len();
            if self.id_to_position[candidate] == -1 {
                return candidate as u32;
            }
        }
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
        if self.version >= VERSION_MAX {
            for item in &mut self.items {
                item.version = 0;
            }
            self.version = 1;
        }
    }

    /// Stamp one item (addressed by order) and bump the version.
    pub fn modify(&mut self, order: usize) {
        let position = self.order[order];
        self.items[position].version = self.version;
        self.increment_version();
    }

    pub fn modify_all(&mut self) {
        for item in &mut self.items {
            item.version = self.version;
        }
        self.increment_version();
    }

    /// Append a song; the caller must have checked [`Queue::is_full`].
    /// Returns the new item's id.
    pub fn append(&mut self, song: SongHandle, priority: u8) -> u32 {
        assert!(!self.is_full());

        let id = self.generate_id();
        let position = self.items.len();
        self.items.push(QueueItem {
            song,
            id,
            version: self.version,
            priority,
        });
        self.order.push(position);
        self.id_to_position[id as usize] = position as i32;
        id
    }

    pub fn swap(&mut self, position1: usize, position2: usize) {
        let id1 = self.items[position1].id;
        let id2 = self.items[position2].id;

        self.items.swap(position1, position2);
        self.items[position1].version = self.version;
        self.items[position2].version = self.version;

        self.id_to_position[id1 as usize] = position2 as i32;
        self.id_to_position[id2 as usize] = position1 as i32;
    }

    pub fn swap_order(&mut self, order1: usize, order2: usize) {
        self.order.swap(order1, order2);
    }

    fn move_song_to(&mut self, from: usize, to: usize) {
        let id = self.items[from].id;
        self.items[to] = self.items[from].clone();
        self.items[to].version = self.version;
        self.id_to_position[id as usize] = to as i32;
    }

    /// Move one song to a new position. In random mode the order
    /// permutation is re-indexed so every order entry keeps pointing at the
    /// same song.
    pub fn move_song(&mut self, from: usize, to: usize) {
        let item = self.items[from].clone();

        if from < to {
            for i in from..to {
                self.move_song_to(i + 1, i);
            }
        } else {
            for i in (to + 1..=from).rev() {
                self.move_song_to(i - 1, i);
            }
        }

        self.id_to_position[item.id as usize] = to as i32;
        self.items[to] = item;
        self.items[to].version = self.version;

        if self.random {
            for entry in &mut self.order {
                if *entry > from && *entry <= to {
                    *entry -= 1;
                } else if *entry < from && *entry >= to {
                    *entry += 1;
                } else if *entry == from {
                    *entry = to;
                }
            }
        }
    }

    /// Move the block `start..end` so it begins at position `to`.
    pub fn move_range(&mut self, start: usize, end: usize, to: usize) {
        let block: Vec<QueueItem> = self.items[start..end].to_vec();
        let count = end - start;

        if to > start {
            // songs between the block and the target slide down
            for i in end..end + (to - start) {
                self.move_song_to(i, start + i - end);
            }
        } else {
            // songs between the target and the block slide up
            for i in (to..start).rev() {
                self.move_song_to(i, i + count);
            }
        }

        for (offset, item) in block.into_iter().enumerate() {
            self.id_to_position[item.id as usize] = (to + offset) as i32;
            self.items[to + offset] = item;
            self.items[to + offset].version = self.version;
        }

        if self.random {
            for entry in &mut self.order {
                if *entry >= end && *entry < to + count {
                    *entry -= count;
                } else if *entry < start && *entry >= to {
                    *entry += count;
                } else if *entry >= start && *entry < end {
                    *entry += to;
                    *entry -= start;
                }
            }
        }
    }

    /// Move a song to a new slot in the order list, shifting the entries in
    /// between.
    fn move_order(&mut self, from_order: usize, to_order: usize) {
        let from_position = self.order[from_order];
        if from_order < to_order {
            for i in from_order..to_order {
                self.order[i] = self.order[i + 1];
            }
        } else {
            for i in (to_order + 1..=from_order).rev() {
                self.order[i] = self.order[i - 1];
            }
        }
        self.order[to_order] = from_position;
    }

    /// Remove the song at `position`. Returns the removed item; the caller
    /// decides what a released detached song means.
    pub fn delete(&mut self, position: usize) -> QueueItem {
        let id = self.items[position].id;
        let order = self.position_to_order(position);
        let removed = self.items[position].clone();

        self.id_to_position[id as usize] = -1;

        let new_length = self.items.len() - 1;
        for i in position..new_length {
            self.move_song_to(i + 1, i);
        }
        self.items.truncate(new_length);

        self.order.remove(order);
        for entry in &mut self.order {
            if *entry > position {
                *entry -= 1;
            }
        }

        removed
    }

    pub fn clear(&mut self) -> Vec<QueueItem> {
        for item in &self.items {
            self.id_to_position[item.id as usize] = -1;
        }
        self.order.clear();
        std::mem::take(&mut self.items)
    }

    /// Reset the order permutation to the identity.
    pub fn restore_order(&mut self) {
        for (i, entry) in self.order.iter_mut().enumerate() {
            *entry = i;
        }
    }

    /// The order number to play after `order`, honoring single/repeat/
    /// consume; `None` means end of playback.
    pub fn next_order(&self, order: usize) -> Option<usize> {
        if self.single && self.repeat && !self.consume {
            Some(order)
        } else if order + 1 < self.items.len() {
            Some(order + 1)
        } else if self.repeat && (order > 0 || !self.consume) {
            // restart at the first song
            Some(0)
        } else {
            None
        }
    }

    fn priority_at_order(&self, order: usize) -> u8 {
        self.items[self.order[order]].priority
    }

    /// Shuffle `start..end` of the order list, ignoring priorities.
    fn shuffle_order_range(&mut self, start: usize, end: usize) {
        for i in start..end {
            let j = self.rng.gen_range(i..end);
            self.order.swap(i, j);
        }
    }

    /// Sort the order range by priority (descending, stable), then shuffle
    /// within each priority group.
    pub fn shuffle_order_range_with_priority(&mut self, start: usize, end: usize) {
        if start == end {
            return;
        }

        let items = &self.items;
        self.order[start..end].sort_by_key(|&position| std::cmp::Reverse(items[position].priority));

        let mut group_start = start;
        let mut group_priority = self.priority_at_order(start);
        for i in start + 1..end {
            let priority = self.priority_at_order(i);
            if priority != group_priority {
                self.shuffle_order_range(group_start, i);
                group_start = i;
                group_priority = priority;
            }
        }
        self.shuffle_order_range(group_start, end);
    }

    pub fn shuffle_order(&mut self) {
        self.shuffle_order_range_with_priority(0, self.items.len());
    }

    /// Swap the first slot of an order range with a random one, used when
    /// re-placing a reprioritized song inside its group.
    fn shuffle_order_first(&mut self, start: usize, end: usize) {
        let j = self.rng.gen_range(start..end);
        self.order.swap(start, j);
    }

    /// Shuffle the last order slot into `start..end`, used after appending
    /// while random mode is on.
    pub fn shuffle_order_last(&mut self, start: usize, end: usize) {
        let j = self.rng.gen_range(start..end);
        self.order.swap(end - 1, j);
    }

    /// Physically shuffle a position range (the order permutation of random
    /// mode is untouched beyond the implied swaps).
    pub fn shuffle_range(&mut self, start: usize, end: usize) {
        for i in start..end {
            let j = self.rng.gen_range(i..end);
            self.swap(i, j);
        }
    }

    /// First order slot at or after `start_order` whose priority is at most
    /// `priority`, skipping `exclude_order`.
    fn find_priority_order(
        &self,
        start_order: usize,
        priority: u8,
        exclude_order: usize,
    ) -> usize {
        for order in start_order..self.items.len() {
            if order != exclude_order && self.priority_at_order(order) <= priority {
                return order;
            }
        }
        self.items.len()
    }

    fn count_same_priority(&self, start_order: usize, priority: u8) -> usize {
        for order in start_order..self.items.len() {
            if self.priority_at_order(order) != priority {
                return order - start_order;
            }
        }
        self.items.len() - start_order
    }

    /// Change one item's priority and, in random mode, re-place it in the
    /// order list relative to `after_order` (the currently playing order
    /// slot, or `None` when stopped). Returns whether anything changed.
    pub fn set_priority(
        &mut self,
        position: usize,
        priority: u8,
        after_order: Option<usize>,
    ) -> bool {
        let old_priority = self.items[position].priority;
        if old_priority == priority {
            return false;
        }

        self.items[position].version = self.version;
        self.items[position].priority = priority;

        if !self.random {
            // order only matters in random mode
            return true;
        }

        let order = self.position_to_order(position);
        if let Some(after_order) = after_order {
            if order == after_order {
                // never move the current song
                return true;
            }

            if order < after_order {
                // the song was already played; re-enqueue it only if its
                // priority has just risen above the current song's
                let after_item = &self.items[self.order[after_order]];
                if old_priority > after_item.priority || priority <= after_item.priority {
                    return true;
                }
            }
        }

        // move to the start of its (possibly new) priority group
        let start = after_order.map_or(0, |o| o + 1);
        let before_order = self.find_priority_order(start, priority, order);
        let new_order = if before_order > order {
            before_order - 1
        } else {
            before_order
        };
        self.move_order(order, new_order);

        // and shuffle within that group
        let group_len = self.count_same_priority(new_order, priority);
        self.shuffle_order_first(new_order, new_order + group_len);

        true
    }

    pub fn set_priority_range(
        &mut self,
        start_position: usize,
        end_position: usize,
        priority: u8,
        after_order: Option<usize>,
    ) -> bool {
        let mut modified = false;
        let after_position = after_order.map(|o| self.order[o]);
        for position in start_position..end_position {
            // the permutation moves underneath us, re-derive the order slot
            let after_order = after_position.map(|p| self.position_to_order(p));
            modified |= self.set_priority(position, priority, after_order);
        }
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use std::sync::Arc;

    fn song(i: usize) -> SongHandle {
        Arc::new(Song::file(format!("song-{i}.wav")))
    }

    fn filled(n: usize) -> Queue {
        let mut queue = Queue::with_rng(32, StdRng::seed_from_u64(0x5eed));
        for i in 0..n {
            queue.append(song(i), 0);
        }
        queue
    }

    fn check_bijection(queue: &Queue) {
        for position in 0..queue.len() {
            let id = queue.position_to_id(position);
            assert_eq!(queue.id_to_position(id), Some(position));
        }
        let mut seen = vec![false; queue.len()];
        for order in 0..queue.len() {
            seen[queue.order_to_position(order)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    fn check_descending_priority(queue: &Queue, start_order: usize) {
        let mut last = u8::MAX;
        for order in start_order..queue.len() {
            let priority = queue.item(queue.order_to_position(order)).priority;
            assert!(priority <= last);
            last = priority;
        }
    }

    #[test]
    fn append_assigns_distinct_ids() {
        let queue = filled(8);
        check_bijection(&queue);
        let mut ids: Vec<u32> = (0..8).map(|p| queue.position_to_id(p)).collect();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn ids_survive_delete_and_move() {
        let mut queue = filled(6);
        let id3 = queue.position_to_id(3);
        queue.delete(1);
        check_bijection(&queue);
        assert_eq!(queue.id_to_position(id3), Some(2));

        queue.move_song(2, 0);
        check_bijection(&queue);
        assert_eq!(queue.id_to_position(id3), Some(0));

        queue.swap(0, 3);
        check_bijection(&queue);
        assert_eq!(queue.id_to_position(id3), Some(3));
    }

    #[test]
    fn deleted_ids_are_reused_after_wrap() {
        let mut queue = filled(32);
        assert!(queue.is_full());
        for _ in 0..32 {
            queue.delete(0);
        }
        // refill several times; the id scan must keep finding free slots
        for round in 0..5 {
            for i in 0..32 {
                queue.append(song(round * 32 + i), 0);
            }
            check_bijection(&queue);
            queue.clear();
        }
    }

    #[test]
    fn move_range_keeps_invariants() {
        let mut queue = filled(8);
        queue.random = true;
        queue.shuffle_order();
        let uris: Vec<_> = (0..8).map(|p| queue.get(p).uri.clone()).collect();

        queue.move_range(1, 3, 5);
        check_bijection(&queue);
        assert_eq!(queue.get(5).uri, uris[1]);
        assert_eq!(queue.get(6).uri, uris[2]);
        assert_eq!(queue.get(1).uri, uris[3]);

        queue.move_range(4, 7, 0);
        check_bijection(&queue);
    }

    #[test]
    fn next_order_mode_matrix() {
        let mut queue = filled(3);
        assert_eq!(queue.next_order(1), Some(2));
        assert_eq!(queue.next_order(2), None);

        queue.repeat = true;
        assert_eq!(queue.next_order(2), Some(0));

        queue.single = true;
        assert_eq!(queue.next_order(1), Some(1));

        queue.consume = true;
        // single+repeat+consume plays on instead of looping
        assert_eq!(queue.next_order(1), Some(2));
        // wrap is refused from position 0 in consume mode
        let mut short = filled(1);
        short.repeat = true;
        short.consume = true;
        assert_eq!(short.next_order(0), None);
    }

    #[test]
    fn version_wrap_resets_stamps() {
        let mut queue = filled(2);
        queue.version = VERSION_MAX - 1;
        queue.modify(0);
        assert_eq!(queue.version(), 1);
        assert_eq!(queue.item(0).version, 0);
        assert!(queue.song_newer(0, 1));
    }

    #[test]
    fn shuffle_respects_priority_bands() {
        let mut queue = filled(16);
        queue.set_priority_range(4, 8, 10, None);
        queue.random = true;
        queue.shuffle_order();
        check_descending_priority(&queue, 0);
        check_bijection(&queue);

        for position in 4..8 {
            assert!(queue.position_to_order(position) < 4);
        }
        for position in (0..4).chain(8..16) {
            assert!(queue.position_to_order(position) >= 4);
        }
    }

    /// The reprioritization scenarios of the original daemon's priority
    /// test, including the `after_order` edge cases.
    #[test]
    fn set_priority_relative_to_current() {
        let mut queue = filled(16);
        queue.set_priority_range(4, 8, 10, None);
        queue.random = true;
        queue.shuffle_order();

        // a single high-priority item jumps to the front
        queue.set_priority_range(15, 16, 50, None);
        check_descending_priority(&queue, 0);
        assert_eq!(queue.position_to_order(15), 0);

        // upgrade one of the prio-10 items
        queue.set_priority_range(3, 4, 20, None);
        check_descending_priority(&queue, 0);
        assert_eq!(queue.position_to_order(3), 1);
        assert_eq!(queue.position_to_order(15), 0);

        // "currently playing" is order 4; a prio-10 item bumped to 20 moves
        // right after it
        let current_order = 4;
        let current_position = queue.order_to_position(current_order);
        let a_position = queue.order_to_position(3);
        assert_eq!(queue.item(a_position).priority, 10);
        queue.set_priority(a_position, 20, Some(current_order));
        assert_eq!(queue.position_to_order(current_position), 3);
        assert_eq!(queue.position_to_order(a_position), 4);
        check_descending_priority(&queue, 4);

        // a fresh prio-70 item is inserted right after the current song
        let b_position = queue.order_to_position(10);
        assert_eq!(queue.item(b_position).priority, 0);
        queue.set_priority(b_position, 70, Some(3));
        assert_eq!(queue.position_to_order(current_position), 3);
        assert_eq!(queue.position_to_order(b_position), 4);

        // an already-played item whose priority was higher all along stays
        // in history
        let c_position = queue.order_to_position(0);
        assert_eq!(queue.item(c_position).priority, 50);
        queue.set_priority(c_position, 60, Some(3));
        assert_eq!(queue.position_to_order(c_position), 0);

        // lowering a priority moves the item behind its old group
        let a_order = queue.position_to_order(a_position);
        assert_eq!(a_order, 5);
        queue.set_priority(a_position, 5, Some(3));
        assert_eq!(queue.position_to_order(current_position), 3);
        assert_eq!(queue.position_to_order(a_position), 6);
    }

    #[test]
    fn set_priority_is_idempotent() {
        let mut queue = filled(12);
        queue.random = true;
        queue.shuffle_order();
        queue.set_priority_range(2, 6, 7, None);
        let order_before: Vec<_> = (0..12).map(|p| queue.position_to_order(p)).collect();
        // same arguments again: no priority differs, nothing may move
        assert!(!queue.set_priority_range(2, 6, 7, None));
        let order_after: Vec<_> = (0..12).map(|p| queue.position_to_order(p)).collect();
        assert_eq!(order_before, order_after);
    }

    #[test]
    fn priority_on_current_song_with_self_after_order() {
        let mut queue = filled(4);
        queue.random = true;
        queue.shuffle_order();
        let current_order = 2;
        let position = queue.order_to_position(current_order);
        assert!(queue.set_priority(position, 30, Some(current_order)));
        // value updated, slot untouched
        assert_eq!(queue.item(position).priority, 30);
        assert_eq!(queue.position_to_order(position), current_order);
    }
}
