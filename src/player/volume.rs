//! PCM scaling applied right before output: software volume and replay
//! gain, as one multiply per sample with clipping.

use crate::tag::Tag;

/// Full scale for the software mixer; `setvol 0..=100` maps to
/// `0..=VOLUME_FULL`.
pub const VOLUME_FULL: u16 = 1000;

/// Replay-gain scales are capped here no matter what the tags claim.
const REPLAY_GAIN_MAX_SCALE: f32 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReplayGainInfo {
    pub track_gain_db: Option<f32>,
    pub track_peak: Option<f32>,
    pub album_gain_db: Option<f32>,
    pub album_peak: Option<f32>,
}

impl ReplayGainInfo {
    /// Gain values travel as ordinary comment-style tag items written by
    /// scanners (`replaygain_track_gain=-3.21 dB`).
    pub fn from_tag(tag: &Tag) -> Self {
        let mut info = ReplayGainInfo::default();
        for item in &tag.items {
            let value = item.value.as_str();
            let Some((key, raw)) = value.split_once('=') else {
                continue;
            };
            let number = raw
                .trim()
                .trim_end_matches("dB")
                .trim()
                .parse::<f32>()
                .ok();
            match key.to_ascii_lowercase().as_str() {
                "replaygain_track_gain" => info.track_gain_db = number,
                "replaygain_track_peak" => info.track_peak = number,
                "replaygain_album_gain" => info.album_gain_db = number,
                "replaygain_album_peak" => info.album_peak = number,
                _ => {}
            }
        }
        info
    }

    pub fn is_empty(&self) -> bool {
        self.track_gain_db.is_none() && self.album_gain_db.is_none()
    }
}

/// The scale factor for one song: `10^((gain + preamp) / 20)`, limited so
/// the declared peak cannot clip, and hard-capped.
pub fn replay_gain_scale(info: &ReplayGainInfo, album: bool, preamp_db: f32) -> f32 {
    let (gain, peak) = if album {
        (
            info.album_gain_db.or(info.track_gain_db),
            info.album_peak.or(info.track_peak),
        )
    } else {
        (
            info.track_gain_db.or(info.album_gain_db),
            info.track_peak.or(info.album_peak),
        )
    };

    let Some(gain) = gain else {
        return 1.0;
    };

    let mut scale = 10f32.powf((gain + preamp_db) / 20.0);
    if scale > REPLAY_GAIN_MAX_SCALE {
        scale = REPLAY_GAIN_MAX_SCALE;
    }
    if let Some(peak) = peak
        && peak > 0.0
        && scale * peak > 1.0
    {
        scale = 1.0 / peak;
    }
    scale
}

/// Scale interleaved 16-bit samples in place. `volume` is in thousandths
/// (see [`VOLUME_FULL`]); the extra `scale` carries the replay-gain factor.
pub fn apply_volume(data: &mut [u8], volume: u16, scale: f32) {
    let factor = f32::from(volume) / f32::from(VOLUME_FULL) * scale;
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }

    for sample in data.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (f32::from(value) * factor)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagType;

    fn samples(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn values(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn half_volume_halves_samples() {
        let mut data = samples(&[1000, -1000, 0]);
        apply_volume(&mut data, 500, 1.0);
        assert_eq!(values(&data), [500, -500, 0]);
    }

    #[test]
    fn scaling_clips_at_sample_range() {
        let mut data = samples(&[30_000, -30_000]);
        apply_volume(&mut data, VOLUME_FULL, 4.0);
        assert_eq!(values(&data), [i16::MAX, i16::MIN]);
    }

    #[test]
    fn full_volume_is_untouched() {
        let mut data = samples(&[1234, -1234]);
        let original = data.clone();
        apply_volume(&mut data, VOLUME_FULL, 1.0);
        assert_eq!(data, original);
    }

    #[test]
    fn gain_parsing_from_tag_items() {
        let mut tag = Tag::new();
        tag.add_item(TagType::Comment, "replaygain_track_gain=-6.0 dB");
        tag.add_item(TagType::Comment, "replaygain_track_peak=0.5");
        let info = ReplayGainInfo::from_tag(&tag);
        assert_eq!(info.track_gain_db, Some(-6.0));
        assert_eq!(info.track_peak, Some(0.5));
    }

    #[test]
    fn replay_gain_scale_rules() {
        let info = ReplayGainInfo {
            track_gain_db: Some(-6.0),
            ..Default::default()
        };
        let scale = replay_gain_scale(&info, false, 0.0);
        assert!((scale - 0.501).abs() < 0.01);

        // preamp shifts the gain
        let boosted = replay_gain_scale(&info, false, 6.0);
        assert!((boosted - 1.0).abs() < 0.01);

        // the hard ceiling applies before peak limiting
        let hot = ReplayGainInfo {
            track_gain_db: Some(60.0),
            ..Default::default()
        };
        assert_eq!(replay_gain_scale(&hot, false, 0.0), REPLAY_GAIN_MAX_SCALE);

        // a declared peak prevents clipping
        let peaky = ReplayGainInfo {
            track_gain_db: Some(12.0),
            track_peak: Some(1.0),
            ..Default::default()
        };
        assert_eq!(replay_gain_scale(&peaky, false, 0.0), 1.0);

        // album mode prefers album values
        let both = ReplayGainInfo {
            track_gain_db: Some(-6.0),
            album_gain_db: Some(0.0),
            ..Default::default()
        };
        assert_eq!(replay_gain_scale(&both, true, 0.0), 1.0);

        // no gain data: unity
        assert_eq!(replay_gain_scale(&ReplayGainInfo::default(), false, 0.0), 1.0);
    }
}
