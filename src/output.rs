//! Audio output seam. Real backends (ALSA & friends) are collaborators
//! outside this crate; what lives here is the trait the player drives, a
//! registry with enable/disable bookkeeping, and the built-in null output
//! used for headless operation and tests.

use std::time::{Duration, Instant};

use color_eyre::Result;
use serde::Serialize;
use tracing::debug;

use crate::audio::AudioFormat;

/// A sink for PCM. Opened and closed only by the player thread; `play`
/// blocks until the device accepted the data.
pub trait AudioOutput: Send {
    fn plugin(&self) -> &'static str;

    fn open(&mut self, format: &AudioFormat) -> Result<()>;

    fn play(&mut self, data: &[u8]) -> Result<()>;

    fn pause(&mut self) {}

    /// Drop locally buffered but unplayed audio (seek, stop).
    fn drop_buffered(&mut self) {}

    fn close(&mut self) {}
}

/// Discards samples; with `sync` it sleeps so playback advances in real
/// time, without it a whole song "plays" instantly (handy in tests).
pub struct NullOutput {
    sync: bool,
    format: Option<AudioFormat>,
    /// when already-played audio ends, for pacing
    ahead_until: Option<Instant>,
}

impl NullOutput {
    pub fn new(sync: bool) -> Self {
        NullOutput {
            sync,
            format: None,
            ahead_until: None,
        }
    }
}

impl AudioOutput for NullOutput {
    fn plugin(&self) -> &'static str {
        "null"
    }

    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        self.format = Some(*format);
        self.ahead_until = None;
        Ok(())
    }

    fn play(&mut self, data: &[u8]) -> Result<()> {
        if !self.sync {
            return Ok(());
        }
        let format = self.format.unwrap_or_default();
        let seconds = data.len() as f64 / format.byte_rate() as f64;
        let now = Instant::now();
        let start = self.ahead_until.filter(|&t| t > now).unwrap_or(now);
        let end = start + Duration::from_secs_f64(seconds);
        self.ahead_until = Some(end);
        if end > now {
            std::thread::sleep(end - now);
        }
        Ok(())
    }

    fn drop_buffered(&mut self) {
        self.ahead_until = None;
    }

    fn close(&mut self) {
        self.format = None;
        self.ahead_until = None;
    }
}

/// `outputs` command reply for one device.
#[derive(Debug, Serialize)]
pub struct OutputInfo {
    pub outputid: usize,
    pub outputname: String,
    pub outputenabled: bool,
}

struct Entry {
    name: String,
    output: Box<dyn AudioOutput>,
    enabled: bool,
    open: bool,
}

/// All configured outputs. The player opens and plays them as one unit; a
/// song can start as long as at least one device opens.
pub struct OutputSet {
    entries: Vec<Entry>,
}

impl OutputSet {
    pub fn new() -> Self {
        OutputSet {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, output: Box<dyn AudioOutput>) {
        self.entries.push(Entry {
            name: name.into(),
            output,
            enabled: true,
            open: false,
        });
    }

    pub fn list(&self) -> Vec<OutputInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, entry)| OutputInfo {
                outputid: id,
                outputname: entry.name.clone(),
                outputenabled: entry.enabled,
            })
            .collect()
    }

    /// Returns false for an unknown id.
    pub fn set_enabled(&mut self, id: usize, enabled: bool) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.enabled = enabled;
        if !enabled && entry.open {
            entry.output.close();
            entry.open = false;
        }
        true
    }

    /// Open every enabled output; succeeds when at least one device is
    /// playing.
    pub fn open_all(&mut self, format: &AudioFormat) -> Result<()> {
        let mut opened = 0;
        let mut last_error = None;
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            if entry.open {
                opened += 1;
                continue;
            }
            match entry.output.open(format) {
                Ok(()) => {
                    entry.open = true;
                    opened += 1;
                }
                Err(error) => {
                    debug!("failed to open output {:?}: {error:#}", entry.name);
                    last_error = Some(error);
                }
            }
        }
        if opened > 0 {
            Ok(())
        } else {
            Err(last_error
                .unwrap_or_else(|| color_eyre::eyre::eyre!("no enabled audio outputs")))
        }
    }

    pub fn play_all(&mut self, data: &[u8]) -> Result<()> {
        let mut played = 0;
        for entry in &mut self.entries {
            if !entry.open {
                continue;
            }
            match entry.output.play(data) {
                Ok(()) => played += 1,
                Err(error) => {
                    debug!("output {:?} failed: {error:#}", entry.name);
                    entry.output.close();
                    entry.open = false;
                }
            }
        }
        if played > 0 {
            Ok(())
        } else {
            Err(color_eyre::eyre::eyre!("all audio outputs failed"))
        }
    }

    pub fn pause_all(&mut self) {
        for entry in &mut self.entries {
            if entry.open {
                entry.output.pause();
            }
        }
    }

    pub fn drop_buffered_all(&mut self) {
        for entry in &mut self.entries {
            if entry.open {
                entry.output.drop_buffered();
            }
        }
    }

    pub fn close_all(&mut self) {
        for entry in &mut self.entries {
            if entry.open {
                entry.output.close();
                entry.open = false;
            }
        }
    }

    pub fn any_open(&self) -> bool {
        self.entries.iter().any(|e| e.open)
    }
}

impl Default for OutputSet {
    fn default() -> Self {
        Self::new()
    }
}
