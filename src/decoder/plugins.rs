//! Decoder plugins. The built-in `pcm` plugin decodes RIFF/WAVE files
//! (including cue-point containers); the `lofty` plugin cannot produce PCM
//! but claims the common compressed suffixes so their tags reach the
//! database.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use camino::Utf8Path;
use color_eyre::Result;
use color_eyre::eyre::{Context, bail, eyre};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::read_from_path;
use lofty::tag::Accessor;
use tracing::debug;

use crate::audio::AudioFormat;
use crate::decoder::{DecodeSession, DecoderCommand};
use crate::song::SongRange;
use crate::tag::{Tag, TagType};

/// One virtual track discovered inside a container file.
#[derive(Debug, Clone)]
pub struct VirtualTrack {
    pub name: String,
    pub tag: Option<Tag>,
    pub range: SongRange,
}

pub trait DecoderPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn suffixes(&self) -> &'static [&'static str];

    fn mime_types(&self) -> &'static [&'static str] {
        &[]
    }

    /// Read the song's tag (including duration) for the database walk.
    /// `None` means the plugin does not actually claim this file.
    fn scan_tags(&self, path: &Utf8Path) -> Option<Tag>;

    /// Produce PCM for the whole file (or the session's sub-range).
    fn decode(&self, session: &mut DecodeSession<'_>, path: &Utf8Path) -> Result<()>;

    /// Probe for virtual tracks; more than one means the file is shown as a
    /// container directory.
    fn container_scan(&self, _path: &Utf8Path) -> Vec<VirtualTrack> {
        Vec::new()
    }
}

const PLUGINS: &[&dyn DecoderPlugin] = &[&PcmPlugin::new(), &LoftyPlugin::new()];

pub fn all() -> &'static [&'static dyn DecoderPlugin] {
    PLUGINS
}

pub fn from_suffix(suffix: &str) -> Option<&'static dyn DecoderPlugin> {
    PLUGINS
        .iter()
        .find(|p| p.suffixes().iter().any(|s| s.eq_ignore_ascii_case(suffix)))
        .copied()
}

pub fn from_name(name: &str) -> Option<&'static dyn DecoderPlugin> {
    PLUGINS.iter().find(|p| p.name() == name).copied()
}

pub fn supports_suffix(suffix: &str) -> bool {
    from_suffix(suffix).is_some()
}

pub fn scan_tags(suffix: &str, path: &Utf8Path) -> Option<Tag> {
    from_suffix(suffix)?.scan_tags(path)
}

pub fn container_scan(path: &Utf8Path) -> Vec<VirtualTrack> {
    let Some(suffix) = crate::song::uri_suffix(path) else {
        return Vec::new();
    };
    match from_suffix(&suffix) {
        Some(plugin) => plugin.container_scan(path),
        None => Vec::new(),
    }
}

// ---------------------------------------------------------------------------

/// 16-bit PCM RIFF/WAVE reader.
pub struct PcmPlugin;

impl PcmPlugin {
    pub const fn new() -> Self {
        PcmPlugin
    }
}

struct WavInfo {
    format: AudioFormat,
    data_offset: u64,
    data_len: u64,
    /// sample offsets of embedded cue points
    cue_samples: Vec<u32>,
}

impl WavInfo {
    fn duration_secs(&self) -> f64 {
        self.data_len as f64 / self.format.byte_rate() as f64
    }
}

fn read_wav_info(file: &mut File) -> Result<WavInfo> {
    fn read_exact(file: &mut File, buf: &mut [u8]) -> Result<()> {
        file.read_exact(buf).wrap_err("short read in WAVE header")
    }
    fn u16_le(b: &[u8]) -> u16 {
        u16::from_le_bytes([b[0], b[1]])
    }
    fn u32_le(b: &[u8]) -> u32 {
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    let mut header = [0u8; 12];
    read_exact(file, &mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        bail!("not a RIFF/WAVE file");
    }

    let mut format = None;
    let mut data = None;
    let mut cue_samples = Vec::new();

    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            break;
        }
        let id = &chunk_header[0..4];
        let size = u64::from(u32_le(&chunk_header[4..8]));
        let body_start = file.stream_position()?;

        match id {
            b"fmt " => {
                let mut body = [0u8; 16];
                read_exact(file, &mut body)?;
                let audio_format = u16_le(&body[0..2]);
                if audio_format != 1 {
                    bail!("only PCM WAVE data is supported");
                }
                let channels = u16_le(&body[2..4]);
                let sample_rate = u32_le(&body[4..8]);
                let bits = u16_le(&body[14..16]);
                if bits != 16 || channels == 0 || channels > 8 {
                    bail!("unsupported WAVE parameters ({bits} bit, {channels} ch)");
                }
                format = Some(AudioFormat::new(sample_rate, 16, channels as u8));
            }
            b"data" => {
                data = Some((body_start, size));
            }
            b"cue " => {
                let mut count_buf = [0u8; 4];
                read_exact(file, &mut count_buf)?;
                let count = u32_le(&count_buf).min(1024);
                for _ in 0..count {
                    let mut point = [0u8; 24];
                    read_exact(file, &mut point)?;
                    cue_samples.push(u32_le(&point[20..24]));
                }
            }
            _ => {}
        }

        // chunks are word-aligned
        let skip = size + (size & 1);
        file.seek(SeekFrom::Start(body_start + skip))?;
    }

    let format = format.ok_or_else(|| eyre!("missing fmt chunk"))?;
    let (data_offset, data_len) = data.ok_or_else(|| eyre!("missing data chunk"))?;
    cue_samples.sort_unstable();
    cue_samples.dedup();

    Ok(WavInfo {
        format,
        data_offset,
        data_len,
        cue_samples,
    })
}

impl DecoderPlugin for PcmPlugin {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn suffixes(&self) -> &'static [&'static str] {
        &["wav", "wave"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["audio/wav", "audio/x-wav"]
    }

    fn scan_tags(&self, path: &Utf8Path) -> Option<Tag> {
        let mut file = File::open(path.as_std_path()).ok()?;
        let info = read_wav_info(&mut file).ok()?;

        // RIFF INFO / ID3 tags, when present
        let mut tag = read_lofty_tag(path).unwrap_or_default();
        tag.time = Some(info.duration_secs() as u32);
        Some(tag)
    }

    fn decode(&self, session: &mut DecodeSession<'_>, path: &Utf8Path) -> Result<()> {
        let mut file = File::open(path.as_std_path())
            .wrap_err("Could not open song file")
            .wrap_err_with(|| format!("path: {path}"))?;
        let info = read_wav_info(&mut file)?;
        let format = info.format;
        let frame_size = format.frame_size() as u64;
        let byte_rate = format.byte_rate() as f64;
        let bit_rate = (format.byte_rate() * 8 / 1000) as u16;

        let start_byte = align_frame((session.start_time() * byte_rate) as u64, frame_size)
            .min(info.data_len);
        let end_byte = session
            .end_time()
            .map_or(info.data_len, |end| {
                align_frame((end * byte_rate) as u64, frame_size).min(info.data_len)
            })
            .max(start_byte);

        let total_time = (end_byte - start_byte) as f64 / byte_rate;
        session.ready(format, true, total_time as f32);

        let mut position = start_byte;
        file.seek(SeekFrom::Start(info.data_offset + position))?;

        // read in whole-frame blocks of several chunks
        let block_len = (16 * 1024 / frame_size as usize) * frame_size as usize;
        let mut buffer = vec![0u8; block_len];

        loop {
            match session.pending_command() {
                DecoderCommand::Stop => return Ok(()),
                DecoderCommand::Seek => {
                    let target = session.seek_target() + session.start_time();
                    let byte = align_frame((target * byte_rate) as u64, frame_size)
                        .clamp(start_byte, end_byte);
                    match file.seek(SeekFrom::Start(info.data_offset + byte)) {
                        Ok(_) => {
                            position = byte;
                            session.seek_done(true);
                        }
                        Err(_) => session.seek_done(false),
                    }
                    continue;
                }
                DecoderCommand::Start | DecoderCommand::None => {}
            }

            if position >= end_byte {
                return Ok(());
            }

            let want = block_len.min((end_byte - position) as usize);
            let got = file.read(&mut buffer[..want])?;
            if got == 0 {
                return Ok(());
            }
            let whole = (got / frame_size as usize) * frame_size as usize;

            let time = (position - start_byte) as f64 / byte_rate;
            let interrupt = session.submit(&buffer[..whole], time as f32, bit_rate);
            position += whole as u64;
            if interrupt != DecoderCommand::None {
                // handled at the top of the loop
                continue;
            }
        }
    }

    /// A WAVE file with several cue points is a container of one virtual
    /// track per cue span.
    fn container_scan(&self, path: &Utf8Path) -> Vec<VirtualTrack> {
        let Ok(mut file) = File::open(path.as_std_path()) else {
            return Vec::new();
        };
        let Ok(info) = read_wav_info(&mut file) else {
            return Vec::new();
        };
        if info.cue_samples.len() < 2 {
            return Vec::new();
        }

        let mut starts = info.cue_samples.clone();
        if starts.first() != Some(&0) {
            starts.insert(0, 0);
        }

        let rate = info.format.sample_rate;
        let to_ms = |samples: u32| (u64::from(samples) * 1000 / u64::from(rate)) as u32;
        let total_frames =
            (info.data_len / info.format.frame_size() as u64) as u32;

        let mut tracks = Vec::new();
        for (i, window) in starts.windows(2).enumerate() {
            tracks.push(VirtualTrack {
                name: format!("track-{:03}", i + 1),
                tag: track_tag(to_ms(window[1]) - to_ms(window[0])),
                range: SongRange {
                    start_ms: to_ms(window[0]),
                    end_ms: Some(to_ms(window[1])),
                },
            });
        }
        let last = *starts.last().unwrap();
        if last < total_frames {
            tracks.push(VirtualTrack {
                name: format!("track-{:03}", starts.len()),
                tag: track_tag(to_ms(total_frames) - to_ms(last)),
                range: SongRange {
                    start_ms: to_ms(last),
                    end_ms: None,
                },
            });
        }
        debug!("{path}: {} cue tracks", tracks.len());
        tracks
    }
}

fn track_tag(duration_ms: u32) -> Option<Tag> {
    let mut tag = Tag::new();
    tag.time = Some(duration_ms.div_ceil(1000));
    Some(tag)
}

fn align_frame(byte: u64, frame_size: u64) -> u64 {
    byte - byte % frame_size
}

// ---------------------------------------------------------------------------

/// Tag-only plugin for the common compressed formats; playback of these
/// would need real codec plugins, which are out of scope here.
pub struct LoftyPlugin;

impl LoftyPlugin {
    pub const fn new() -> Self {
        LoftyPlugin
    }
}

fn read_lofty_tag(path: &Utf8Path) -> Option<Tag> {
    let tagged_file = read_from_path(path.as_std_path()).ok()?;

    let mut tag = Tag::new();
    tag.time = Some(tagged_file.properties().duration().as_secs() as u32);

    if let Some(file_tag) = tagged_file.primary_tag() {
        if let Some(value) = file_tag.title() {
            tag.add_item(TagType::Title, value.as_ref());
        }
        if let Some(value) = file_tag.artist() {
            tag.add_item(TagType::Artist, value.as_ref());
        }
        if let Some(value) = file_tag.album() {
            tag.add_item(TagType::Album, value.as_ref());
        }
        if let Some(value) = file_tag.genre() {
            tag.add_item(TagType::Genre, value.as_ref());
        }
        if let Some(value) = file_tag.comment() {
            tag.add_item(TagType::Comment, value.as_ref());
        }
        if let Some(value) = file_tag.track() {
            tag.add_item(TagType::Track, value.to_string());
        }
        if let Some(value) = file_tag.disk() {
            tag.add_item(TagType::Disc, value.to_string());
        }
        if let Some(value) = file_tag.year() {
            tag.add_item(TagType::Date, value.to_string());
        }
    }
    Some(tag)
}

impl DecoderPlugin for LoftyPlugin {
    fn name(&self) -> &'static str {
        "lofty"
    }

    fn suffixes(&self) -> &'static [&'static str] {
        &["mp3", "flac", "ogg", "opus", "m4a", "aac"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["audio/mpeg", "audio/flac", "audio/ogg"]
    }

    fn scan_tags(&self, path: &Utf8Path) -> Option<Tag> {
        read_lofty_tag(path)
    }

    fn decode(&self, _session: &mut DecodeSession<'_>, path: &Utf8Path) -> Result<()> {
        bail!("no codec support for {path}")
    }
}

#[cfg(test)]
pub mod test_wav {
    /// Build a minimal 16-bit PCM WAVE file in memory.
    pub fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        wav_bytes_with_cues(sample_rate, channels, frames, &[])
    }

    pub fn wav_bytes_with_cues(
        sample_rate: u32,
        channels: u16,
        frames: usize,
        cue_samples: &[u32],
    ) -> Vec<u8> {
        let data_len = frames * 2 * channels as usize;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below
        out.extend_from_slice(b"WAVE");

        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * 2 * u32::from(channels);
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&(2 * channels).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());

        if !cue_samples.is_empty() {
            out.extend_from_slice(b"cue ");
            out.extend_from_slice(&((4 + 24 * cue_samples.len()) as u32).to_le_bytes());
            out.extend_from_slice(&(cue_samples.len() as u32).to_le_bytes());
            for (i, &sample) in cue_samples.iter().enumerate() {
                out.extend_from_slice(&(i as u32).to_le_bytes());
                out.extend_from_slice(&sample.to_le_bytes());
                out.extend_from_slice(b"data");
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }

        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..frames * channels as usize {
            out.extend_from_slice(&((i % 977) as i16).to_le_bytes());
        }

        let riff_len = (out.len() - 8) as u32;
        out[4..8].copy_from_slice(&riff_len.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_wav(bytes: &[u8]) -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("test.wav")).unwrap();
        let mut file = File::create(path.as_std_path()).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn registry_lookup() {
        assert_eq!(from_suffix("WAV").unwrap().name(), "pcm");
        assert_eq!(from_suffix("mp3").unwrap().name(), "lofty");
        assert!(from_suffix("txt").is_none());
        assert!(supports_suffix("flac"));
    }

    #[test]
    fn wav_header_parsing() {
        let (_dir, path) = temp_wav(&test_wav::wav_bytes(8000, 2, 8000));
        let mut file = File::open(path.as_std_path()).unwrap();
        let info = read_wav_info(&mut file).unwrap();
        assert_eq!(info.format, AudioFormat::new(8000, 16, 2));
        assert_eq!(info.data_len, 8000 * 4);
        assert!((info.duration_secs() - 1.0).abs() < 0.001);
    }

    #[test]
    fn wav_scan_reports_duration() {
        let (_dir, path) = temp_wav(&test_wav::wav_bytes(8000, 1, 16000));
        let tag = PcmPlugin::new().scan_tags(&path).unwrap();
        assert_eq!(tag.time, Some(2));
    }

    #[test]
    fn cue_points_become_tracks() {
        // 4 seconds at 8 kHz with cues at 0 s and 2 s
        let bytes = test_wav::wav_bytes_with_cues(8000, 1, 32_000, &[0, 16_000]);
        let (_dir, path) = temp_wav(&bytes);
        let tracks = PcmPlugin::new().container_scan(&path);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].range.start_ms, 0);
        assert_eq!(tracks[0].range.end_ms, Some(2000));
        assert_eq!(tracks[1].range.start_ms, 2000);
        assert_eq!(tracks[1].range.end_ms, None);

        // a single cue point is not a container
        let bytes = test_wav::wav_bytes_with_cues(8000, 1, 32_000, &[0]);
        let (_dir, path) = temp_wav(&bytes);
        assert!(PcmPlugin::new().container_scan(&path).is_empty());
    }

    #[test]
    fn malformed_wav_is_rejected() {
        let (_dir, path) = temp_wav(b"RIFFxxxxJUNK");
        let mut file = File::open(path.as_std_path()).unwrap();
        assert!(read_wav_info(&mut file).is_err());
        assert!(PcmPlugin::new().scan_tags(&path).is_none());
    }
}
