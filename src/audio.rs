use std::fmt;

use serde::Serialize;

/// PCM stream parameters, printed as `samplerate:bits:channels` in status
/// lines. Only 16-bit signed samples flow through the playback core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits: u8,
    pub channels: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat {
            sample_rate: 44_100,
            bits: 16,
            channels: 2,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, bits: u8, channels: u8) -> Self {
        AudioFormat {
            sample_rate,
            bits,
            channels,
        }
    }

    /// bytes per frame (one sample per channel)
    pub fn frame_size(&self) -> usize {
        usize::from(self.bits / 8) * usize::from(self.channels)
    }

    /// bytes per second of audio
    pub fn byte_rate(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }

    /// seconds of playback represented by one byte
    pub fn size_to_time(&self) -> f64 {
        1.0 / self.byte_rate() as f64
    }

    /// Cross-fading requires both songs to agree on rate and channel
    /// layout; bit depth always matches (the pipe carries 16-bit PCM).
    pub fn mixable_with(&self, other: &AudioFormat) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sample_rate, self.bits, self.channels)
    }
}

impl From<AudioFormat> for String {
    fn from(value: AudioFormat) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_math() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.frame_size(), 4);
        assert_eq!(fmt.byte_rate(), 176_400);
        assert_eq!(fmt.to_string(), "44100:16:2");
    }
}
