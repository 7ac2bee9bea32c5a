//! The music pipe: a ring of fixed-size PCM chunks. The decoder appends at
//! the end, the player consumes from the beginning. `begin == end` means
//! empty, so one slot always stays unused and the usable capacity is
//! `size - 1` chunks.

use std::sync::{Arc, Mutex};

use crate::audio::AudioFormat;
use crate::notify::Notify;
use crate::tag::Tag;

/// Payload bytes per chunk.
pub const CHUNK_SIZE: usize = 4096;

/// One ring slot: raw PCM plus the metadata the player needs when the
/// chunk reaches the speakers.
#[derive(Clone)]
pub struct Chunk {
    pub data: Box<[u8; CHUNK_SIZE]>,
    pub len: usize,
    /// seconds since the start of the current song
    pub time: f32,
    /// kbit/s snapshot at decode time
    pub bit_rate: u16,
    /// tag received mid-stream, to publish when the chunk plays
    pub tag: Option<Tag>,
}

impl Chunk {
    pub(crate) fn empty() -> Self {
        Chunk {
            data: Box::new([0; CHUNK_SIZE]),
            len: 0,
            time: 0.0,
            bit_rate: 0,
            tag: None,
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.tag = None;
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("time", &self.time)
            .field("bit_rate", &self.bit_rate)
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    chunks: Vec<Chunk>,
    /// index of the first decoded chunk
    begin: usize,
    /// index after the last decoded chunk
    end: usize,
    /// in lazy mode the player is only woken when the ring transitions
    /// from empty to non-empty
    lazy: bool,
}

impl Inner {
    fn successor(&self, i: usize) -> usize {
        let next = i + 1;
        if next == self.chunks.len() { 0 } else { next }
    }

    fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    fn relative(&self, i: usize) -> usize {
        if i >= self.begin {
            i - self.begin
        } else {
            i + self.chunks.len() - self.begin
        }
    }

    fn absolute(&self, relative: usize) -> Option<usize> {
        let mut max = self.end;
        if max < self.begin {
            max += self.chunks.len();
        }
        let mut i = self.begin + relative;
        if i >= max {
            return None;
        }
        if i >= self.chunks.len() {
            i -= self.chunks.len();
        }
        Some(i)
    }
}

/// Single producer (the decoder), single consumer (the player); all ring
/// state changes happen in short critical sections, PCM is copied in and
/// out under the lock.
#[derive(Debug)]
pub struct MusicPipe {
    inner: Mutex<Inner>,
    /// the player's notifier; signalled when decoded data becomes available
    notify: Arc<Notify>,
    size: usize,
}

/// Copy of the head chunk handed to the player for output.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub data: Vec<u8>,
    pub time: f32,
    pub bit_rate: u16,
    pub tag: Option<Tag>,
}

impl MusicPipe {
    pub fn new(size: usize, notify: Arc<Notify>) -> Self {
        assert!(size > 1);
        MusicPipe {
            inner: Mutex::new(Inner {
                chunks: std::iter::repeat_with(Chunk::empty).take(size).collect(),
                begin: 0,
                end: 0,
                lazy: false,
            }),
            notify,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let end = inner.end;
        inner.begin = end;
        inner.chunks[end].reset();
    }

    pub fn set_lazy(&self, lazy: bool) {
        self.inner.lock().unwrap().lazy = lazy;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Is the head chunk exactly index `i`? (`i < 0` never matches.)
    pub fn head_is(&self, i: i64) -> bool {
        if i < 0 {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        !inner.is_empty() && inner.begin == i as usize
    }

    pub fn tail_index(&self) -> usize {
        self.inner.lock().unwrap().end
    }

    /// Number of decoded chunks.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.relative(inner.end)
    }

    /// Position of chunk `i` relative to the head.
    pub fn relative(&self, i: usize) -> usize {
        self.inner.lock().unwrap().relative(i)
    }

    /// Absolute index of the nth used chunk, if that many are decoded.
    pub fn absolute(&self, relative: usize) -> Option<usize> {
        self.inner.lock().unwrap().absolute(relative)
    }

    /// Release the head chunk for reuse.
    pub fn shift(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.is_empty());
        let begin = inner.begin;
        inner.chunks[begin].reset();
        inner.begin = inner.successor(inner.begin);
    }

    /// Drop `num` chunks from the head (already played via cross-fade
    /// mixing).
    pub fn skip(&self, num: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(i) = inner.absolute(num) {
            inner.begin = i;
        }
    }

    /// Truncate the ring from chunk index `first` onward; used to cancel a
    /// queued song whose decoding already started.
    pub fn chop(&self, first: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.end = first;
        inner.chunks[first].reset();
    }

    /// Append whole PCM frames. Returns the number of bytes actually
    /// written; less than `data.len()` means the ring is full. The player
    /// is woken on the empty→non-empty transition (always, when lazy mode
    /// is off).
    pub fn append(
        &self,
        data: &[u8],
        format: &AudioFormat,
        time: f32,
        bit_rate: u16,
    ) -> usize {
        let frame_size = format.frame_size();
        debug_assert_eq!(data.len() % frame_size, 0, "no partial frames");

        let mut inner = self.inner.lock().unwrap();
        let mut wake = false;
        let mut written = 0;

        while written < data.len() {
            let mut index = inner.end;
            if inner.chunks[index].len + frame_size > CHUNK_SIZE {
                // tail chunk is full, move to the next one
                let next = inner.successor(index);
                if next == inner.begin {
                    break;
                }
                wake |= !inner.lazy || inner.is_empty();
                inner.end = next;
                inner.chunks[next].reset();
                index = next;
            }

            let chunk = &mut inner.chunks[index];
            if chunk.len == 0 {
                chunk.time = time;
                chunk.bit_rate = bit_rate;
            }

            let mut room = CHUNK_SIZE - chunk.len;
            room = (room / frame_size) * frame_size;
            let take = room.min(data.len() - written);
            chunk.data[chunk.len..chunk.len + take]
                .copy_from_slice(&data[written..written + take]);
            chunk.len += take;
            written += take;

            if take == 0 {
                break;
            }
        }

        // commit a tail chunk that has no room for another frame, like the
        // explicit flush does
        let end = inner.end;
        if inner.chunks[end].len + frame_size > CHUNK_SIZE {
            let next = inner.successor(end);
            if next != inner.begin {
                wake |= !inner.lazy || inner.is_empty();
                inner.end = next;
                inner.chunks[next].reset();
            }
        }

        drop(inner);
        if wake {
            self.notify.signal();
        }
        written
    }

    /// Commit a partially filled tail chunk so the player can reach it.
    /// Does nothing when the tail is empty or the ring is full.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let end = inner.end;
        if inner.chunks[end].len == 0 {
            return;
        }
        let next = inner.successor(end);
        if next == inner.begin {
            return;
        }
        let wake = !inner.lazy || inner.is_empty();
        inner.end = next;
        inner.chunks[next].reset();
        drop(inner);
        if wake {
            self.notify.signal();
        }
    }

    /// Attach a tag to the stream: it rides on the next chunk the decoder
    /// produces (stored on the current tail).
    pub fn tag(&self, tag: Tag) {
        let mut inner = self.inner.lock().unwrap();
        let end = inner.end;
        inner.chunks[end].tag = Some(tag);
    }

    /// Copy the head chunk out for playback.
    pub fn head_snapshot(&self) -> Option<ChunkData> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_empty() {
            return None;
        }
        let begin = inner.begin;
        let chunk = &mut inner.chunks[begin];
        Some(ChunkData {
            data: chunk.data[..chunk.len].to_vec(),
            time: chunk.time,
            bit_rate: chunk.bit_rate,
            tag: chunk.tag.take(),
        })
    }

    /// Run `f` over the head chunk and the chunk at absolute index `other`,
    /// for cross-fade mixing into the head.
    pub fn mix_head_with<R>(
        &self,
        other: usize,
        f: impl FnOnce(&mut Chunk, &Chunk) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.is_empty());
        let begin = inner.begin;
        assert_ne!(begin, other);

        let (head, other_chunk) = if begin < other {
            let (left, right) = inner.chunks.split_at_mut(other);
            (&mut left[begin], &right[0])
        } else {
            let (left, right) = inner.chunks.split_at_mut(begin);
            (&mut right[0], &left[other])
        };
        f(head, other_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe(size: usize) -> MusicPipe {
        MusicPipe::new(size, Arc::new(Notify::new()))
    }

    fn fmt() -> AudioFormat {
        AudioFormat::default()
    }

    /// frames numbered so ordering is visible in the payload
    fn frames(count: usize, seed: u8) -> Vec<u8> {
        (0..count * 4).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn fifo_order_and_exactly_once() {
        let pipe = pipe(4);
        let mut sent = Vec::new();
        let mut received = Vec::new();

        for round in 0..8u8 {
            let data = frames(CHUNK_SIZE / 4, round);
            let written = pipe.append(&data, &fmt(), 0.0, 0);
            sent.extend_from_slice(&data[..written]);
            pipe.flush();
            while let Some(chunk) = pipe.head_snapshot() {
                received.extend_from_slice(&chunk.data);
                pipe.shift();
            }
        }

        assert_eq!(sent, received);
    }

    #[test]
    fn capacity_is_size_minus_one() {
        let pipe = pipe(4);
        let chunk_frames = CHUNK_SIZE / 4;
        let data = frames(chunk_frames, 0);
        // 3 chunks can be committed; one more fills the spare tail slot
        for _ in 0..3 {
            assert_eq!(pipe.append(&data, &fmt(), 0.0, 0), data.len());
        }
        assert_eq!(pipe.available(), 3);
        assert_eq!(pipe.append(&data, &fmt(), 0.0, 0), data.len());
        assert_eq!(pipe.available(), 3);
        // now the ring is really full
        assert_eq!(pipe.append(&data, &fmt(), 0.0, 0), 0);

        pipe.shift();
        assert_eq!(pipe.append(&data, &fmt(), 0.0, 0), data.len());
    }

    #[test]
    fn append_never_splits_frames() {
        let format = AudioFormat::new(44_100, 16, 3); // 6-byte frames
        let pipe = pipe(3);
        let data = vec![7u8; 6 * 100];
        let written = pipe.append(&data, &format, 0.0, 0);
        assert_eq!(written % 6, 0);
        pipe.flush();
        let chunk = pipe.head_snapshot().unwrap();
        assert_eq!(chunk.data.len() % 6, 0);
    }

    #[test]
    fn addressing_wraps_around() {
        let pipe = pipe(4);
        let chunk = frames(CHUNK_SIZE / 4, 1);
        pipe.append(&chunk, &fmt(), 0.0, 0);
        pipe.append(&chunk, &fmt(), 0.0, 0);
        pipe.shift();
        pipe.append(&chunk, &fmt(), 0.0, 0);
        pipe.append(&chunk, &fmt(), 0.0, 0);

        // begin = 1, end = 0 (wrapped)
        assert_eq!(pipe.available(), 3);
        assert_eq!(pipe.absolute(0), Some(1));
        assert_eq!(pipe.absolute(2), Some(3));
        assert_eq!(pipe.absolute(3), None);
        assert_eq!(pipe.relative(3), 2);
        assert!(pipe.head_is(1));
        assert!(!pipe.head_is(0));
    }

    #[test]
    fn chop_discards_queued_tail() {
        let pipe = pipe(8);
        let chunk = frames(CHUNK_SIZE / 4, 1);
        for _ in 0..3 {
            pipe.append(&chunk, &fmt(), 0.0, 0);
        }
        let boundary = pipe.tail_index();
        for _ in 0..2 {
            pipe.append(&chunk, &fmt(), 0.0, 0);
        }
        assert_eq!(pipe.available(), 5);
        pipe.chop(boundary);
        assert_eq!(pipe.available(), 3);
    }

    #[test]
    fn skip_drops_head_chunks() {
        let pipe = pipe(8);
        let chunk = frames(CHUNK_SIZE / 4, 1);
        for _ in 0..5 {
            pipe.append(&chunk, &fmt(), 0.0, 0);
        }
        pipe.skip(3);
        assert_eq!(pipe.available(), 2);
    }

    #[test]
    fn stream_tags_ride_on_chunks() {
        let pipe = pipe(4);
        let mut tag = Tag::new();
        tag.add_item(crate::tag::TagType::Name, "live stream");
        pipe.tag(tag);

        pipe.append(&frames(CHUNK_SIZE / 4, 0), &fmt(), 0.0, 0);
        let chunk = pipe.head_snapshot().unwrap();
        let tag = chunk.tag.expect("tag travels with the chunk");
        assert_eq!(tag.first(crate::tag::TagType::Name), Some("live stream"));

        // taken exactly once
        assert!(pipe.head_snapshot().unwrap().tag.is_none());
    }

    #[test]
    fn lazy_mode_wakes_only_from_empty() {
        let notify = Arc::new(Notify::new());
        let pipe = MusicPipe::new(4, Arc::clone(&notify));
        pipe.set_lazy(true);
        let chunk = frames(CHUNK_SIZE / 4, 1);

        // empty → non-empty: first completed chunk signals
        pipe.append(&chunk, &fmt(), 0.0, 0);
        pipe.append(&chunk, &fmt(), 0.0, 0);
        assert!(notify.wait_timeout(std::time::Duration::from_millis(0)));
        // ring no longer empty: further appends stay silent
        assert!(!notify.wait_timeout(std::time::Duration::from_millis(0)));
    }
}
