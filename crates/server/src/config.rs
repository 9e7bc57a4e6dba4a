use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

/// One external encoder profile. Profiles are tried in list order at
/// dispatch time; the first one matching the requested output format whose
/// blacklist does not contain the input extension wins.
///
/// Command placeholders: `%i` input file, `%s` seek offset as `H:MM:SS`,
/// `%b` bitrate, `%n` loudness-normalization flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderProfile {
    pub name: String,
    pub command: String,
    pub bitrate: u32,
    pub output_format: String,
    pub mime_type: String,
    pub black_formats: Vec<String>,
    pub buffer_kb: usize,
}

impl Default for TranscoderProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            bitrate: 0,
            output_format: String::new(),
            mime_type: "application/octet-stream".to_string(),
            black_formats: Vec::new(),
            buffer_kb: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub catalog_path: String,
    pub port: u16,
    /// User all HTTP requests act as; session handling sits in front of
    /// this server, not inside it.
    pub default_user: String,
    pub allowed_extensions: Vec<String>,
    pub scan_commit_batch: usize,
    pub lock_timeout_secs: u64,
    /// Zero disables the scheduled sweep.
    pub autoscan_interval_secs: u64,
    pub watch_folders: bool,
    pub watch_debounce_secs: u64,
    pub transcoders: Vec<TranscoderProfile>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            catalog_path: "catalog.redb".to_string(),
            port: 3000,
            default_user: "admin".to_string(),
            allowed_extensions: sorted_extensions(),
            scan_commit_batch: 1000,
            lock_timeout_secs: 3600,
            autoscan_interval_secs: 0,
            watch_folders: true,
            watch_debounce_secs: 2,
            transcoders: default_transcoders(),
        }
    }
}

fn sorted_extensions() -> Vec<String> {
    let mut extensions: Vec<String> = catalog::scan::default_extensions().into_iter().collect();
    extensions.sort();
    extensions
}

pub fn default_transcoders() -> Vec<TranscoderProfile> {
    vec![
        TranscoderProfile {
            name: "ffmpeg-mp3".to_string(),
            command: "ffmpeg -loglevel quiet -ss %s -i %i -map 0:a -b:a %bk %n -f mp3 -"
                .to_string(),
            bitrate: 192,
            output_format: "mp3".to_string(),
            mime_type: "audio/mpeg".to_string(),
            black_formats: Vec::new(),
            buffer_kb: 200,
        },
        TranscoderProfile {
            name: "ffmpeg-ogg".to_string(),
            command: "ffmpeg -loglevel quiet -ss %s -i %i -map 0:a -b:a %bk %n -f ogg -"
                .to_string(),
            bitrate: 160,
            output_format: "ogg".to_string(),
            mime_type: "audio/ogg".to_string(),
            black_formats: Vec::new(),
            buffer_kb: 200,
        },
        TranscoderProfile {
            name: "ffmpeg-opus".to_string(),
            command: "ffmpeg -loglevel quiet -ss %s -i %i -map 0:a -b:a %bk %n -f opus -"
                .to_string(),
            bitrate: 128,
            output_format: "opus".to_string(),
            mime_type: "audio/opus".to_string(),
            black_formats: Vec::new(),
            buffer_kb: 200,
        },
    ]
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CANTATA_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.default_user.trim().is_empty() {
            config.default_user = "admin".to_string();
        }
        if config.scan_commit_batch == 0 {
            config.scan_commit_batch = 1000;
        }
        if config.allowed_extensions.is_empty() {
            config.allowed_extensions = sorted_extensions();
        }
        if config.transcoders.is_empty() {
            config.transcoders = default_transcoders();
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let config = ServerConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: ServerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.port, config.port);
        assert_eq!(back.transcoders.len(), 3);
        assert_eq!(back.transcoders[0].output_format, "mp3");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: ServerConfig = serde_yaml::from_str("port: 8080\n").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_user, "admin");
        assert!(!config.transcoders.is_empty());
    }
}
