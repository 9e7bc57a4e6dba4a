use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub user: String,
    pub path: String,
    pub root: bool,
    pub parent_id: Option<String>,
    pub last_modification: u64,
    pub locked: bool,
    pub locked_at: u64,
    pub last_scan: Option<u64>,
    pub last_scan_duration: u64,
    #[serde(default)]
    pub tag_backend: TagBackend,
    #[serde(default)]
    pub exclude_autoscan: bool,
}

/// Tag extraction strategy for a folder. The lofty backend is the default;
/// the symphonia backend is the fallback for trees where lofty misbehaves
/// (typically remote mounts).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagBackend {
    #[default]
    Lofty,
    Symphonia,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub user: String,
    pub path: String,
    pub title: String,
    pub artist_id: Option<String>,
    pub album_artist_id: Option<String>,
    pub performer_id: Option<String>,
    pub album_id: Option<String>,
    pub genre_id: Option<String>,
    pub disc: String,
    pub year: String,
    pub track_number: String,
    pub track_number_int: u32,
    pub track_total: String,
    pub composer: String,
    pub description: String,
    pub copyright: String,
    pub contact: String,
    pub encoded_by: String,
    pub duration_secs: u32,
    pub bitrate_kbps: u32,
    pub size: u64,
    pub last_modification: u64,
    pub folder_id: String,
    pub root_folder_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub user: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub user: String,
    pub name: String,
    pub folder_id: String,
    pub year: String,
    pub artist_id: Option<String>,
    pub genre_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub user: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConverterJob {
    pub id: String,
    pub user: String,
    pub name: String,
    pub comment: String,
    pub state: JobState,
    pub transcoder: String,
    pub bitrate: u32,
    pub dest_folder: String,
    pub max_threads: u32,
    pub norm: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Draft,
    Running,
    Done,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConverterLine {
    pub job_id: String,
    pub seq: u64,
    pub track_id: String,
    pub state: LineState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    Draft,
    Waiting,
    Done,
    Cancelled,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Lexically normalize a path: resolve `.` and `..` components and collapse
/// redundant separators, without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn path_string(path: &Path) -> String {
    normalize_path(path).to_string_lossy().to_string()
}

/// Extension of a file path, lowercased, without the dot.
pub fn path_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{normalize_path, path_extension, stable_id};
    use std::path::{Path, PathBuf};

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("admin\u{1f}/music/Artist1");
        let second = stable_id("admin\u{1f}/music/Artist1");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("admin\u{1f}/music/Artist2"));
    }

    #[test]
    fn normalizes_dot_components() {
        assert_eq!(
            normalize_path(Path::new("/music/./Artist/../Artist/Album")),
            PathBuf::from("/music/Artist/Album")
        );
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(
            path_extension(Path::new("/music/a/b/Song.MP3")),
            Some("mp3".to_string())
        );
        assert_eq!(path_extension(Path::new("/music/a/b/noext")), None);
    }
}
