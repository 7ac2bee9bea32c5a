use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, bail};
use color_eyre::Result;
use etcetera::BaseStrategy;
use serde::Deserialize;

pub mod permission {
    pub const READ: u8 = 0x1;
    pub const ADD: u8 = 0x2;
    pub const CONTROL: u8 = 0x4;
    pub const ADMIN: u8 = 0x8;
    pub const ALL: u8 = READ | ADD | CONTROL | ADMIN;
}

/// Parse a comma-separated permission list ("read,add,control,admin").
pub fn parse_permissions(input: &str) -> Result<u8> {
    let mut mask = 0;
    for word in input.split(',').map(str::trim).filter(|w| !w.is_empty()) {
        mask |= match word {
            "read" => permission::READ,
            "add" => permission::ADD,
            "control" => permission::CONTROL,
            "admin" => permission::ADMIN,
            other => bail!("unknown permission {other:?}"),
        };
    }
    Ok(mask)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixerType {
    /// no volume control; `status` reports `volume: -1`
    #[default]
    None,
    /// scale PCM samples in the player before output
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayGainMode {
    #[default]
    Off,
    Track,
    Album,
}

/// Daemon configuration, deserialized from a TOML file. Every field has a
/// default so a bare `music_directory` entry is a complete config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub music_directory: Utf8PathBuf,
    pub playlist_directory: Utf8PathBuf,
    pub db_file: Utf8PathBuf,
    pub state_file: Option<Utf8PathBuf>,
    pub pid_file: Option<Utf8PathBuf>,

    pub bind_address: String,
    pub port: u16,

    pub max_playlist_length: usize,
    /// total decoded-audio buffer, KiB; divided by the chunk size to get the
    /// ring capacity
    pub audio_buffer_size: usize,
    /// percentage of the ring that must be decoded before playback starts
    pub buffered_before_play_percent: u8,

    pub connection_timeout: u64,
    pub max_command_list_size: usize,
    pub max_output_buffer_size: usize,

    pub follow_inside_symlinks: bool,
    pub follow_outside_symlinks: bool,

    pub mixer: MixerType,
    pub replaygain: ReplayGainMode,
    /// dB applied on top of the song's replay gain
    pub replaygain_preamp: f32,

    /// entries of the form `"secret@read,add"`
    pub passwords: Vec<String>,
    pub default_permissions: String,

    /// watch the music directory and enqueue updates on changes
    pub auto_update: bool,

    /// audio outputs; defaults to one real-time null device
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub name: String,
    pub plugin: String,
    /// for the null plugin: pace playback in real time
    pub sync: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            name: "default".to_string(),
            plugin: "null".to_string(),
            sync: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let dirs = etcetera::choose_base_strategy().ok();
        let cache = dirs
            .map(|d| Utf8PathBuf::from_path_buf(d.cache_dir().join("spela")).unwrap_or_default())
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Config {
            music_directory: Utf8PathBuf::from("music"),
            playlist_directory: Utf8PathBuf::from("playlists"),
            db_file: cache.join("database"),
            state_file: None,
            pid_file: None,
            bind_address: "0.0.0.0".to_string(),
            port: 6600,
            max_playlist_length: 16_384,
            audio_buffer_size: 8192,
            buffered_before_play_percent: 10,
            connection_timeout: 60,
            max_command_list_size: 2048 * 1024,
            max_output_buffer_size: 8192 * 1024,
            follow_inside_symlinks: true,
            follow_outside_symlinks: true,
            mixer: MixerType::None,
            replaygain: ReplayGainMode::Off,
            replaygain_preamp: 0.0,
            passwords: Vec::new(),
            default_permissions: "read,add,control,admin".to_string(),
            auto_update: false,
            outputs: vec![OutputConfig::default()],
        }
    }
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err("Could not read configuration file")
            .wrap_err_with(|| format!("path: {path}"))?;
        let config: Config = toml::from_str(&text).wrap_err("Could not parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.buffered_before_play_percent > 100 {
            bail!("buffered_before_play_percent must be 0..=100");
        }
        if self.max_playlist_length == 0 {
            bail!("max_playlist_length must be positive");
        }
        self.password_table()?;
        parse_permissions(&self.default_permissions)?;
        Ok(())
    }

    /// `password → permission bits` lookup for the `password` command.
    pub fn password_table(&self) -> Result<HashMap<String, u8>> {
        let mut table = HashMap::new();
        for entry in &self.passwords {
            let Some((password, perms)) = entry.split_once('@') else {
                bail!("password entry {entry:?} is missing \"@permissions\"");
            };
            table.insert(password.to_string(), parse_permissions(perms)?);
        }
        Ok(table)
    }

    pub fn default_permission_mask(&self) -> u8 {
        // validated at load time
        parse_permissions(&self.default_permissions).unwrap_or(permission::ALL)
    }

    /// Ring capacity in chunks, derived from the audio buffer size.
    pub fn pipe_chunks(&self) -> usize {
        (self.audio_buffer_size * 1024 / crate::pipe::CHUNK_SIZE).max(4)
    }

    pub fn buffered_before_play(&self) -> usize {
        self.pipe_chunks() * usize::from(self.buffered_before_play_percent) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_parsing() {
        assert_eq!(parse_permissions("read,add").unwrap(), 0x3);
        assert_eq!(parse_permissions("").unwrap(), 0);
        assert!(parse_permissions("root").is_err());
    }

    #[test]
    fn password_table() {
        let config = Config {
            passwords: vec!["hunter2@read,add,control".to_string()],
            ..Config::default()
        };
        let table = config.password_table().unwrap();
        assert_eq!(table["hunter2"], 0x7);
    }

    #[test]
    fn parses_minimal_file() {
        let config: Config = toml::from_str("music_directory = \"/srv/music\"").unwrap();
        assert_eq!(config.music_directory, "/srv/music");
        assert_eq!(config.port, 6600);
        assert!(config.pipe_chunks() > config.buffered_before_play());
    }
}
