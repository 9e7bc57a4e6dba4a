//! Batch converter worker pool.
//!
//! A running job's waiting lines are drained by a bounded pool of workers.
//! Each worker re-checks its line is still waiting before doing any work,
//! so a concurrent cancel stops the queue without preempting in-flight
//! conversions. Output is written to a temporary file and renamed into
//! place, so a crashed worker never leaves a half-written destination.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{ConverterJob, ConverterLine, JobState, LineState};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::TranscoderProfile;
use crate::state::AppState;
use crate::transcode;

/// Launch the worker pool for a job already in the Running state. Returns
/// false when the job is unknown, not running, or already being drained.
pub fn start_job(state: AppState, job_id: String) -> bool {
    let job = match state.catalog.get_job(&job_id) {
        Ok(Some(job)) => job,
        _ => return false,
    };
    if job.state != JobState::Running {
        return false;
    }
    if !state.active_jobs.lock().insert(job_id.clone()) {
        warn!("Converter {} already has active workers", job_id);
        return false;
    }
    tokio::spawn(run_job(state, job));
    true
}

async fn run_job(state: AppState, job: ConverterJob) {
    let lines: Vec<ConverterLine> = match state.catalog.job_lines(&job.id) {
        Ok(lines) => lines
            .into_iter()
            .filter(|line| line.state == LineState::Waiting)
            .collect(),
        Err(err) => {
            warn!("Converter {} could not list lines: {}", job.id, err);
            state.active_jobs.lock().remove(&job.id);
            return;
        }
    };

    let queue: Arc<Mutex<VecDeque<ConverterLine>>> = Arc::new(Mutex::new(lines.into()));
    let workers = job.max_threads.max(1) as usize;
    info!(
        "Converter {} starting: {} line(s), {} worker(s)",
        job.id,
        queue.lock().len(),
        workers
    );

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let state = state.clone();
        let job = job.clone();
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            loop {
                // Stop claiming work once the job leaves Running.
                match state.catalog.get_job(&job.id) {
                    Ok(Some(current)) if current.state == JobState::Running => {}
                    _ => break,
                }
                let line = match queue.lock().pop_front() {
                    Some(line) => line,
                    None => break,
                };
                if let Err(err) = convert_line(&state, &job, &line).await {
                    // The line keeps its previous state; the job carries on.
                    warn!(
                        "Converter {} line {} failed: {}",
                        job.id, line.seq, err
                    );
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    if let Err(err) = state.catalog.job_finish(&job.id) {
        warn!("Converter {} could not be marked done: {}", job.id, err);
    }
    state.active_jobs.lock().remove(&job.id);
    info!("Converter {} drained", job.id);
}

async fn convert_line(
    state: &AppState,
    job: &ConverterJob,
    line: &ConverterLine,
) -> Result<(), String> {
    // Guards against a cancel racing the queue pop.
    match state.catalog.get_line(&line.job_id, line.seq) {
        Ok(Some(current)) if current.state == LineState::Waiting => {}
        Ok(_) => return Ok(()),
        Err(err) => return Err(err.to_string()),
    }

    let track = state
        .catalog
        .get_track(&line.track_id)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("track {} not found", line.track_id))?;
    let root = state
        .catalog
        .get_folder(&track.root_folder_id)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("root folder {} not found", track.root_folder_id))?;

    let dest = destination_path(&track.path, &root.path, &job.dest_folder)
        .ok_or_else(|| format!("track {} is outside its root folder", track.path))?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| err.to_string())?;
    }

    let profile = {
        let config = state.config.read();
        config
            .transcoders
            .iter()
            .find(|profile| profile.name == job.transcoder)
            .cloned()
    }
    .ok_or_else(|| format!("transcoder profile \"{}\" not configured", job.transcoder))?;

    let input_ext = common::path_extension(Path::new(&track.path)).unwrap_or_default();
    if copy_verbatim(&profile, &input_ext, job, track.bitrate_kbps) {
        tokio::fs::copy(&track.path, &dest)
            .await
            .map_err(|err| err.to_string())?;
    } else {
        let out_path = dest.with_extension(&profile.output_format);
        let tmp_path = PathBuf::from(format!("{}.tmp", out_path.display()));

        let mut stdout =
            transcode::spawn_transcoder(&profile, &track.path, 0, job.bitrate, job.norm)
                .map_err(|err| err.to_string())?;
        let mut out = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|err| err.to_string())?;
        tokio::io::copy(&mut stdout, &mut out)
            .await
            .map_err(|err| err.to_string())?;
        out.flush().await.map_err(|err| err.to_string())?;
        drop(out);
        tokio::fs::rename(&tmp_path, &out_path)
            .await
            .map_err(|err| err.to_string())?;
    }

    state
        .catalog
        .set_line_state(&line.job_id, line.seq, LineState::Done)
        .map_err(|err| err.to_string())?;
    Ok(())
}

/// Re-root a track path from its root folder into the job's destination
/// folder, preserving the relative structure.
fn destination_path(track_path: &str, root_path: &str, dest_folder: &str) -> Option<PathBuf> {
    let relative = Path::new(track_path)
        .strip_prefix(Path::new(root_path))
        .ok()?;
    Some(Path::new(dest_folder).join(relative))
}

/// Copying beats transcoding when the output format equals the input, no
/// normalization is requested, the template is not VBR, and no downsampling
/// would happen.
fn copy_verbatim(
    profile: &TranscoderProfile,
    input_ext: &str,
    job: &ConverterJob,
    track_bitrate: u32,
) -> bool {
    input_ext == profile.output_format
        && !job.norm
        && !profile.command.contains("-q:a")
        && (job.bitrate == 0 || job.bitrate >= track_bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use catalog::Catalog;
    use common::{stable_id, TagBackend, Track};
    use std::collections::HashSet;

    fn profile(output: &str, command: &str) -> TranscoderProfile {
        TranscoderProfile {
            name: "test".to_string(),
            command: command.to_string(),
            bitrate: 192,
            output_format: output.to_string(),
            mime_type: "audio/test".to_string(),
            black_formats: Vec::new(),
            buffer_kb: 200,
        }
    }

    fn job(bitrate: u32, norm: bool) -> ConverterJob {
        ConverterJob {
            id: "j1".to_string(),
            user: "admin".to_string(),
            name: "batch".to_string(),
            comment: String::new(),
            state: JobState::Running,
            transcoder: "test".to_string(),
            bitrate,
            dest_folder: "/out".to_string(),
            max_threads: 1,
            norm,
        }
    }

    fn test_state(catalog: Catalog) -> AppState {
        AppState {
            catalog,
            config: Arc::new(parking_lot::RwLock::new(ServerConfig::default())),
            config_path: PathBuf::from("config.yaml"),
            watcher: Arc::new(parking_lot::RwLock::new(None)),
            active_jobs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn seed_track(catalog: &Catalog, root: &common::Folder, path: &Path) -> Track {
        let path_str = path.to_string_lossy().to_string();
        let track = Track {
            id: stable_id(&path_str),
            user: "admin".to_string(),
            path: path_str,
            title: common::file_name(path),
            bitrate_kbps: 192,
            folder_id: root.id.clone(),
            root_folder_id: root.id.clone(),
            ..Track::default()
        };
        catalog.upsert_track(&track).unwrap();
        track
    }

    #[tokio::test]
    async fn copy_mode_job_writes_destination_tree() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        let album = music.join("Artist1").join("Album1");
        tokio::fs::create_dir_all(&album).await.unwrap();
        let song1 = album.join("song1.mp3");
        let song2 = album.join("song2.mp3");
        tokio::fs::write(&song1, b"first-audio-bytes").await.unwrap();
        tokio::fs::write(&song2, b"second-audio-bytes").await.unwrap();

        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let root = catalog
            .create_root_folder("admin", &music, TagBackend::Lofty)
            .unwrap();
        let track1 = seed_track(&catalog, &root, &song1);
        let track2 = seed_track(&catalog, &root, &song2);

        let dest = dir.path().join("out");
        let job = ConverterJob {
            id: "j1".to_string(),
            user: "admin".to_string(),
            name: "batch".to_string(),
            comment: String::new(),
            state: JobState::Draft,
            // Same output format as the input and no downsampling: pure copy.
            transcoder: "ffmpeg-mp3".to_string(),
            bitrate: 0,
            dest_folder: dest.to_string_lossy().to_string(),
            max_threads: 2,
            norm: false,
        };
        catalog.insert_job(&job).unwrap();
        catalog
            .add_job_tracks("j1", &[track1.id.clone(), track2.id.clone()])
            .unwrap();
        catalog.job_run("j1").unwrap();

        let state = test_state(catalog.clone());
        run_job(state, catalog.get_job("j1").unwrap().unwrap()).await;

        let out1 = dest.join("Artist1").join("Album1").join("song1.mp3");
        let out2 = dest.join("Artist1").join("Album1").join("song2.mp3");
        assert_eq!(tokio::fs::read(&out1).await.unwrap(), b"first-audio-bytes");
        assert_eq!(tokio::fs::read(&out2).await.unwrap(), b"second-audio-bytes");
        assert!(catalog
            .job_lines("j1")
            .unwrap()
            .iter()
            .all(|line| line.state == LineState::Done));
        assert_eq!(catalog.get_job("j1").unwrap().unwrap().state, JobState::Done);
    }

    #[tokio::test]
    async fn cancelled_job_claims_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        tokio::fs::create_dir_all(&music).await.unwrap();
        let song = music.join("song1.mp3");
        tokio::fs::write(&song, b"bytes").await.unwrap();

        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let root = catalog
            .create_root_folder("admin", &music, TagBackend::Lofty)
            .unwrap();
        let track = seed_track(&catalog, &root, &song);

        let dest = dir.path().join("out");
        let job = ConverterJob {
            id: "j1".to_string(),
            user: "admin".to_string(),
            name: "batch".to_string(),
            comment: String::new(),
            state: JobState::Draft,
            transcoder: "ffmpeg-mp3".to_string(),
            bitrate: 0,
            dest_folder: dest.to_string_lossy().to_string(),
            max_threads: 1,
            norm: false,
        };
        catalog.insert_job(&job).unwrap();
        catalog.add_job_tracks("j1", &[track.id.clone()]).unwrap();
        catalog.job_run("j1").unwrap();
        catalog.job_cancel("j1").unwrap();

        let state = test_state(catalog.clone());
        run_job(state, catalog.get_job("j1").unwrap().unwrap()).await;

        assert!(!dest.exists());
        assert_eq!(
            catalog.get_job("j1").unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert!(catalog
            .job_lines("j1")
            .unwrap()
            .iter()
            .all(|line| line.state == LineState::Cancelled));
    }

    #[test]
    fn destination_preserves_relative_structure() {
        let dest = destination_path("/music/Artist1/Album1/song1.mp3", "/music", "/out").unwrap();
        assert_eq!(dest, PathBuf::from("/out/Artist1/Album1/song1.mp3"));
        assert!(destination_path("/elsewhere/song.mp3", "/music", "/out").is_none());
    }

    #[test]
    fn same_format_without_downsampling_copies() {
        let cbr = profile("mp3", "ffmpeg -i %i -b:a %bk -f mp3 -");
        assert!(copy_verbatim(&cbr, "mp3", &job(0, false), 192));
        assert!(copy_verbatim(&cbr, "mp3", &job(192, false), 128));
    }

    #[test]
    fn transcode_wins_when_copy_would_be_wrong() {
        let cbr = profile("mp3", "ffmpeg -i %i -b:a %bk -f mp3 -");
        // Different format.
        assert!(!copy_verbatim(&cbr, "flac", &job(0, false), 900));
        // Normalization requested.
        assert!(!copy_verbatim(&cbr, "mp3", &job(0, true), 192));
        // Downsampling requested.
        assert!(!copy_verbatim(&cbr, "mp3", &job(128, false), 320));
        // VBR template always re-encodes.
        let vbr = profile("mp3", "ffmpeg -i %i -q:a 2 -f mp3 -");
        assert!(!copy_verbatim(&vbr, "mp3", &job(0, false), 192));
    }
}
