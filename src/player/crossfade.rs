//! Cross-fade: how many chunks to overlap, and the linear mix itself.

use crate::audio::AudioFormat;
use crate::pipe::{CHUNK_SIZE, Chunk};

/// Number of chunks the cross-fade window needs. Zero disables the fade:
/// no time configured, mismatched formats, a next song shorter than the
/// window, or a window that would not fit in the pipe alongside the
/// pre-buffer reserve (`max_chunks`).
pub fn calc(
    duration_secs: f32,
    next_total_time: f32,
    next_format: &AudioFormat,
    current_format: &AudioFormat,
    max_chunks: usize,
) -> usize {
    if duration_secs <= 0.0 || !next_format.mixable_with(current_format) {
        return 0;
    }
    if next_total_time > 0.0 && next_total_time <= duration_secs {
        return 0;
    }

    let bytes = f64::from(duration_secs) * current_format.byte_rate() as f64;
    let chunks = (bytes / CHUNK_SIZE as f64) as usize;
    chunks.min(max_chunks)
}

/// Mix the incoming chunk `b` into the outgoing head chunk `a`.
///
/// At relative position `position` of a `num_chunks` window, outgoing
/// samples keep `(num_chunks - position) / num_chunks` of their level and
/// incoming samples contribute `position / num_chunks`. When `b` carries
/// more bytes than `a`, the spill is appended so no audio of the incoming
/// song is lost.
pub fn apply(a: &mut Chunk, b: &Chunk, position: usize, num_chunks: usize) {
    debug_assert!(num_chunks > 0);
    debug_assert!(position <= num_chunks);

    let mix_in = position as f32 / num_chunks as f32;
    let mix_out = 1.0 - mix_in;

    let common = a.len.min(b.len);
    for i in (0..common).step_by(2) {
        let out = i16::from_le_bytes([a.data[i], a.data[i + 1]]);
        let inc = i16::from_le_bytes([b.data[i], b.data[i + 1]]);
        let mixed = (f32::from(out) * mix_out + f32::from(inc) * mix_in)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        a.data[i..i + 2].copy_from_slice(&mixed.to_le_bytes());
    }

    if b.len > a.len {
        let extra = (b.len - a.len).min(CHUNK_SIZE - a.len);
        let start = a.len;
        a.data[start..start + extra].copy_from_slice(&b.data[start..start + extra]);
        a.len += extra;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> AudioFormat {
        AudioFormat::default() // 176400 B/s
    }

    #[test]
    fn chunk_count_formula() {
        // 2 s at 44.1 kHz 16/2 = 352800 bytes = 86 chunks
        assert_eq!(calc(2.0, 100.0, &fmt(), &fmt(), 1000), 86);
        // capped by the pipe reserve
        assert_eq!(calc(2.0, 100.0, &fmt(), &fmt(), 40), 40);
    }

    #[test]
    fn disabled_cases() {
        assert_eq!(calc(0.0, 100.0, &fmt(), &fmt(), 1000), 0);
        // the next song is shorter than the fade itself
        assert_eq!(calc(10.0, 5.0, &fmt(), &fmt(), 1000), 0);
        // sample-rate mismatch
        let other = AudioFormat::new(48_000, 16, 2);
        assert_eq!(calc(2.0, 100.0, &other, &fmt(), 1000), 0);
        // channel mismatch
        let mono = AudioFormat::new(44_100, 16, 1);
        assert_eq!(calc(2.0, 100.0, &mono, &fmt(), 1000), 0);
    }

    fn chunk_of(value: i16, len: usize) -> Chunk {
        let mut chunk = Chunk::empty();
        for i in (0..len).step_by(2) {
            chunk.data[i..i + 2].copy_from_slice(&value.to_le_bytes());
        }
        chunk.len = len;
        chunk
    }

    fn sample_at(chunk: &Chunk, i: usize) -> i16 {
        i16::from_le_bytes([chunk.data[i], chunk.data[i + 1]])
    }

    #[test]
    fn linear_gains() {
        // position 1 of 4: 75 % outgoing, 25 % incoming
        let mut a = chunk_of(1000, 64);
        let b = chunk_of(-1000, 64);
        apply(&mut a, &b, 1, 4);
        assert_eq!(sample_at(&a, 0), 500);

        // position == num_chunks: fully the incoming song
        let mut a = chunk_of(1000, 64);
        apply(&mut a, &b, 4, 4);
        assert_eq!(sample_at(&a, 0), -1000);
    }

    #[test]
    fn incoming_overhang_is_kept() {
        let mut a = chunk_of(1000, 32);
        let b = chunk_of(-1000, 64);
        apply(&mut a, &b, 2, 4);
        assert_eq!(a.len, 64);
        // the overhang is copied untouched
        assert_eq!(sample_at(&a, 32), -1000);
    }
}
