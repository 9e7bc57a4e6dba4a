use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use catalog::Catalog;
use common::{ConverterJob, ConverterLine, Folder};
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub config: Arc<RwLock<ServerConfig>>,
    pub config_path: PathBuf,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
    /// Converter jobs with a live worker pool; guards double launches and
    /// reset-to-draft while workers are active.
    pub active_jobs: Arc<Mutex<HashSet<String>>>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub status: String,
}

#[derive(Deserialize)]
pub struct CreateFolderRequest {
    pub path: String,
    #[serde(default)]
    pub tag_backend: Option<String>,
}

#[derive(Serialize)]
pub struct FolderResponse {
    pub id: String,
    pub path: String,
    pub root: bool,
    pub locked: bool,
    pub last_scan: Option<u64>,
    pub last_scan_duration: u64,
}

impl From<Folder> for FolderResponse {
    fn from(folder: Folder) -> Self {
        Self {
            id: folder.id,
            path: folder.path,
            root: folder.root,
            locked: folder.locked,
            last_scan: folder.last_scan,
            last_scan_duration: folder.last_scan_duration,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateConverterRequest {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /// Profile name from the configured transcoder list.
    pub transcoder: String,
    #[serde(default)]
    pub bitrate: u32,
    pub dest_folder: String,
    #[serde(default)]
    pub max_threads: u32,
    #[serde(default)]
    pub norm: bool,
}

#[derive(Serialize)]
pub struct ConverterResponse {
    pub id: String,
    pub name: String,
    pub state: String,
    pub transcoder: String,
    pub bitrate: u32,
    pub dest_folder: String,
    pub max_threads: u32,
    pub norm: bool,
    pub progress: f64,
    pub lines: Vec<ConverterLineResponse>,
}

#[derive(Serialize)]
pub struct ConverterLineResponse {
    pub seq: u64,
    pub track_id: String,
    pub state: String,
}

impl ConverterResponse {
    pub fn build(job: ConverterJob, lines: Vec<ConverterLine>) -> Self {
        let done = lines
            .iter()
            .filter(|line| line.state == common::LineState::Done)
            .count();
        let progress = if lines.is_empty() {
            0.0
        } else {
            done as f64 / lines.len() as f64 * 100.0
        };
        Self {
            id: job.id,
            name: job.name,
            state: format!("{:?}", job.state).to_lowercase(),
            transcoder: job.transcoder,
            bitrate: job.bitrate,
            dest_folder: job.dest_folder,
            max_threads: job.max_threads,
            norm: job.norm,
            progress,
            lines: lines
                .into_iter()
                .map(|line| ConverterLineResponse {
                    seq: line.seq,
                    track_id: line.track_id,
                    state: format!("{:?}", line.state).to_lowercase(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub seek: Option<u64>,
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub norm: Option<bool>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
