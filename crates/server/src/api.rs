use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use common::{path_extension, ConverterJob, JobState, TagBackend};
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

use crate::convert;
use crate::scan::start_scan;
use crate::state::{
    AppState, ConverterResponse, CreateConverterRequest, CreateFolderRequest, FolderResponse,
    HealthResponse, JsonResult, MessageResponse, StreamQuery,
};
use crate::transcode;
use crate::utils::{catalog_error, json_error, json_error_response};
use crate::watch::configure_watcher;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/folders", get(list_folders).post(create_folder))
        .route("/folders/:folder_id", delete(remove_folder))
        .route("/folders/:folder_id/scan", post(trigger_scan))
        .route("/folders/:folder_id/scan-full", post(trigger_scan_full))
        .route("/folders/:folder_id/unlock", post(unlock_folder))
        .route("/tracks/:track_id/stream", get(stream_track))
        .route("/tracks/:track_id/download", get(download_track))
        .route("/converters", get(list_converters).post(create_converter))
        .route(
            "/converters/:job_id",
            get(get_converter).delete(remove_converter),
        )
        .route("/converters/:job_id/add-album/:album_id", post(add_album_tracks))
        .route(
            "/converters/:job_id/add-artist/:artist_id",
            post(add_artist_tracks),
        )
        .route(
            "/converters/:job_id/add-folder/:folder_id",
            post(add_folder_tracks),
        )
        .route("/converters/:job_id/run", post(run_converter))
        .route("/converters/:job_id/cancel", post(cancel_converter))
        .route("/converters/:job_id/draft", post(draft_converter))
        .route("/converters/:job_id/purge", post(purge_converter))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

fn current_user(state: &AppState) -> String {
    state.config.read().default_user.clone()
}

// --- folders ---------------------------------------------------------------

async fn list_folders(State(state): State<AppState>) -> JsonResult<Vec<FolderResponse>> {
    let user = current_user(&state);
    let folders = state.catalog.list_root_folders(&user).map_err(catalog_error)?;
    Ok(Json(folders.into_iter().map(FolderResponse::from).collect()))
}

async fn create_folder(
    State(state): State<AppState>,
    Json(payload): Json<CreateFolderRequest>,
) -> JsonResult<FolderResponse> {
    let user = current_user(&state);
    let backend = match payload.tag_backend.as_deref() {
        None | Some("lofty") => TagBackend::Lofty,
        Some("symphonia") => TagBackend::Symphonia,
        Some(other) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                format!("unknown tag backend: {}", other),
            ))
        }
    };
    let folder = state
        .catalog
        .create_root_folder(&user, std::path::Path::new(&payload.path), backend)
        .map_err(catalog_error)?;
    configure_watcher(&state);
    Ok(Json(FolderResponse::from(folder)))
}

async fn remove_folder(
    State(state): State<AppState>,
    AxumPath(folder_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let user = current_user(&state);
    match state.catalog.get_folder(&folder_id).map_err(catalog_error)? {
        Some(folder) if folder.user == user => {}
        _ => return Err(json_error(StatusCode::NOT_FOUND, "folder not found")),
    }
    state.catalog.delete_folder(&folder_id).map_err(catalog_error)?;
    configure_watcher(&state);
    Ok(Json(MessageResponse {
        status: "deleted".to_string(),
    }))
}

async fn trigger_scan(
    State(state): State<AppState>,
    AxumPath(folder_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    trigger(state, folder_id, false)
}

async fn trigger_scan_full(
    State(state): State<AppState>,
    AxumPath(folder_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    trigger(state, folder_id, true)
}

fn trigger(state: AppState, folder_id: String, full: bool) -> JsonResult<MessageResponse> {
    let user = current_user(&state);
    match state.catalog.get_folder(&folder_id).map_err(catalog_error)? {
        Some(folder) if folder.user == user => {}
        _ => return Err(json_error(StatusCode::NOT_FOUND, "folder not found")),
    }
    start_scan(state, folder_id, full);
    Ok(Json(MessageResponse {
        status: "scanning started".to_string(),
    }))
}

async fn unlock_folder(
    State(state): State<AppState>,
    AxumPath(folder_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let user = current_user(&state);
    match state.catalog.get_folder(&folder_id).map_err(catalog_error)? {
        Some(folder) if folder.user == user => {}
        _ => return Err(json_error(StatusCode::NOT_FOUND, "folder not found")),
    }
    state.catalog.unlock_folder(&folder_id).map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: "unlocked".to_string(),
    }))
}

// --- streaming -------------------------------------------------------------

async fn stream_track(
    State(state): State<AppState>,
    AxumPath(track_id): AxumPath<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let user = current_user(&state);
    let track = match state.catalog.get_track(&track_id) {
        Ok(Some(track)) if track.user == user => track,
        Ok(_) => return json_error_response(StatusCode::NOT_FOUND, "track not found"),
        Err(err) => {
            return json_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    };

    let input_ext = path_extension(std::path::Path::new(&track.path)).unwrap_or_default();
    let output_format = query
        .format
        .as_deref()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| input_ext.clone());
    let seek = query.seek.unwrap_or(0);
    let bitrate = query.bitrate.unwrap_or(0);
    let norm = query.norm.unwrap_or(false);

    // Same format, no seek, no downsampling, no normalization: the encoder
    // would only burn CPU, so the raw file is served directly.
    if output_format == input_ext
        && seek == 0
        && !norm
        && (bitrate == 0 || bitrate >= track.bitrate_kbps)
    {
        return serve_file(&track.path, false).await;
    }

    let profile = {
        let config = state.config.read();
        transcode::select_profile(&config.transcoders, &output_format, &input_ext).cloned()
    };
    let profile = match profile {
        Some(profile) => profile,
        None => {
            warn!(
                "Could not find converter from '{}' to '{}'",
                input_ext, output_format
            );
            return serve_file(&track.path, false).await;
        }
    };

    match transcode::spawn_transcoder(&profile, &track.path, seek, bitrate, norm) {
        Ok(stdout) => {
            let stream = ReaderStream::with_capacity(stdout, profile.buffer_kb.max(1) * 1024);
            let mut response = Response::new(Body::from_stream(stream));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&profile.mime_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            response
        }
        Err(err) => {
            warn!(
                "Transcoder from '{}' to '{}' failed to start: {}",
                input_ext, output_format, err
            );
            serve_file(&track.path, false).await
        }
    }
}

async fn download_track(
    State(state): State<AppState>,
    AxumPath(track_id): AxumPath<String>,
) -> Response {
    let user = current_user(&state);
    match state.catalog.get_track(&track_id) {
        Ok(Some(track)) if track.user == user => serve_file(&track.path, true).await,
        Ok(_) => json_error_response(StatusCode::NOT_FOUND, "track not found"),
        Err(err) => json_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn serve_file(path: &str, attachment: bool) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return json_error_response(
                StatusCode::NOT_FOUND,
                format!("cannot open file: {}", err),
            )
        }
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if attachment {
        let filename = common::file_name(std::path::Path::new(path));
        let value = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&value)
                .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
        );
    }
    response
}

// --- converters ------------------------------------------------------------

async fn list_converters(State(state): State<AppState>) -> JsonResult<Vec<ConverterResponse>> {
    let user = current_user(&state);
    let jobs = state.catalog.list_jobs(&user).map_err(catalog_error)?;
    let mut out = Vec::with_capacity(jobs.len());
    for job in jobs {
        let lines = state.catalog.job_lines(&job.id).map_err(catalog_error)?;
        out.push(ConverterResponse::build(job, lines));
    }
    Ok(Json(out))
}

async fn create_converter(
    State(state): State<AppState>,
    Json(payload): Json<CreateConverterRequest>,
) -> JsonResult<ConverterResponse> {
    let user = current_user(&state);
    {
        let config = state.config.read();
        if !config
            .transcoders
            .iter()
            .any(|profile| profile.name == payload.transcoder)
        {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                format!("unknown transcoder profile: {}", payload.transcoder),
            ));
        }
    }
    let max_threads = if payload.max_threads == 0 {
        std::thread::available_parallelism()
            .map(|value| value.get() as u32)
            .unwrap_or(1)
    } else {
        payload.max_threads
    };
    let job = ConverterJob {
        id: Uuid::new_v4().to_string(),
        user,
        name: payload.name,
        comment: payload.comment,
        state: JobState::Draft,
        transcoder: payload.transcoder,
        bitrate: payload.bitrate,
        dest_folder: payload.dest_folder,
        max_threads,
        norm: payload.norm,
    };
    state.catalog.insert_job(&job).map_err(catalog_error)?;
    Ok(Json(ConverterResponse::build(job, Vec::new())))
}

async fn get_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<ConverterResponse> {
    let job = owned_job(&state, &job_id)?;
    let lines = state.catalog.job_lines(&job.id).map_err(catalog_error)?;
    Ok(Json(ConverterResponse::build(job, lines)))
}

async fn remove_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    if state.active_jobs.lock().contains(&job.id) {
        return Err(json_error(
            StatusCode::CONFLICT,
            "converter has active workers",
        ));
    }
    state.catalog.delete_job(&job.id).map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: "deleted".to_string(),
    }))
}

async fn add_album_tracks(
    State(state): State<AppState>,
    AxumPath((job_id, album_id)): AxumPath<(String, String)>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    let tracks = state
        .catalog
        .tracks_by_album(&job.user, &album_id)
        .map_err(catalog_error)?;
    add_tracks(&state, &job.id, tracks)
}

async fn add_artist_tracks(
    State(state): State<AppState>,
    AxumPath((job_id, artist_id)): AxumPath<(String, String)>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    let tracks = state
        .catalog
        .tracks_by_artist(&job.user, &artist_id)
        .map_err(catalog_error)?;
    add_tracks(&state, &job.id, tracks)
}

async fn add_folder_tracks(
    State(state): State<AppState>,
    AxumPath((job_id, folder_id)): AxumPath<(String, String)>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    let tracks = state
        .catalog
        .tracks_by_folder(&job.user, &folder_id)
        .map_err(catalog_error)?;
    add_tracks(&state, &job.id, tracks)
}

fn add_tracks(
    state: &AppState,
    job_id: &str,
    tracks: Vec<common::Track>,
) -> JsonResult<MessageResponse> {
    let track_ids: Vec<String> = tracks.into_iter().map(|track| track.id).collect();
    let added = state
        .catalog
        .add_job_tracks(job_id, &track_ids)
        .map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: format!("{} track(s) added", added),
    }))
}

async fn run_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    state.catalog.job_run(&job.id).map_err(catalog_error)?;
    convert::start_job(state.clone(), job.id);
    Ok(Json(MessageResponse {
        status: "conversion started".to_string(),
    }))
}

async fn cancel_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    state.catalog.job_cancel(&job.id).map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: "cancelled".to_string(),
    }))
}

async fn draft_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    if state.active_jobs.lock().contains(&job.id) {
        return Err(json_error(
            StatusCode::CONFLICT,
            "converter has active workers",
        ));
    }
    state.catalog.job_reset_draft(&job.id).map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: "reset to draft".to_string(),
    }))
}

async fn purge_converter(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> JsonResult<MessageResponse> {
    let job = owned_job(&state, &job_id)?;
    state.catalog.purge_job_lines(&job.id).map_err(catalog_error)?;
    Ok(Json(MessageResponse {
        status: "purged".to_string(),
    }))
}

fn owned_job(
    state: &AppState,
    job_id: &str,
) -> Result<ConverterJob, (StatusCode, Json<crate::state::ErrorResponse>)> {
    let user = current_user(state);
    match state.catalog.get_job(job_id).map_err(catalog_error)? {
        Some(job) if job.user == user => Ok(job),
        _ => Err(json_error(StatusCode::NOT_FOUND, "converter not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use catalog::Catalog;
    use common::{stable_id, Track};
    use parking_lot::{Mutex, RwLock};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn state_with_track(dir: &tempfile::TempDir) -> (AppState, String) {
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        let song = music.join("song1.mp3");
        std::fs::write(&song, b"raw-mp3-bytes").unwrap();

        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let root = catalog
            .create_root_folder("admin", &music, TagBackend::Lofty)
            .unwrap();
        let track = Track {
            id: stable_id("song1"),
            user: "admin".to_string(),
            path: song.to_string_lossy().to_string(),
            title: "Song1".to_string(),
            bitrate_kbps: 192,
            folder_id: root.id.clone(),
            root_folder_id: root.id.clone(),
            ..Track::default()
        };
        catalog.upsert_track(&track).unwrap();

        let state = AppState {
            catalog,
            config: Arc::new(RwLock::new(ServerConfig::default())),
            config_path: std::path::PathBuf::from("config.yaml"),
            watcher: Arc::new(RwLock::new(None)),
            active_jobs: Arc::new(Mutex::new(HashSet::new())),
        };
        (state, track.id)
    }

    fn query(format: Option<&str>) -> StreamQuery {
        StreamQuery {
            format: format.map(|value| value.to_string()),
            seek: None,
            bitrate: None,
            norm: None,
        }
    }

    #[tokio::test]
    async fn unmatched_output_format_falls_back_to_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (state, track_id) = state_with_track(&dir);

        // No profile outputs aiff, so the source bytes come back with the
        // source file's native MIME type.
        let response =
            stream_track(State(state), AxumPath(track_id), Query(query(Some("aiff")))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"raw-mp3-bytes");
    }

    #[tokio::test]
    async fn same_format_request_streams_the_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let (state, track_id) = state_with_track(&dir);

        let response =
            stream_track(State(state), AxumPath(track_id), Query(query(Some("mp3")))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"raw-mp3-bytes");
    }

    #[tokio::test]
    async fn unknown_track_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with_track(&dir);

        let response = stream_track(
            State(state),
            AxumPath("missing".to_string()),
            Query(query(None)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
