//! Converter job and line store: a queued batch-transcoding request with a
//! per-line state machine. The worker pool that drains jobs lives in the
//! server crate; this module owns the persisted states and their
//! transitions.

use std::collections::HashSet;

use common::{ConverterJob, ConverterLine, JobState, LineState};
use redb::ReadableTable;

use crate::{
    decode_value, encode_value, Catalog, CatalogError, JOBS_TABLE, JOB_LINES_TABLE, KEY_SEP,
};

fn line_key(job_id: &str, seq: u64) -> String {
    format!("{}{}{:08}", job_id, KEY_SEP, seq)
}

fn job_range(job_id: &str) -> (String, String) {
    let mut start = String::with_capacity(job_id.len() + 1);
    start.push_str(job_id);
    start.push(KEY_SEP);
    let mut end = start.clone();
    end.push('\u{10ffff}');
    (start, end)
}

impl Catalog {
    pub fn insert_job(&self, job: &ConverterJob) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut jobs = write_txn.open_table(JOBS_TABLE)?;
            let bytes = encode_value(job)?;
            jobs.insert(job.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ConverterJob>, CatalogError> {
        let read_txn = self.db().begin_read()?;
        let jobs = read_txn.open_table(JOBS_TABLE)?;
        let job = match jobs.get(job_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(job)
    }

    pub fn list_jobs(&self, user: &str) -> Result<Vec<ConverterJob>, CatalogError> {
        let read_txn = self.db().begin_read()?;
        let jobs = read_txn.open_table(JOBS_TABLE)?;
        let mut out = Vec::new();
        for entry in jobs.iter()? {
            let entry = entry?;
            let job: ConverterJob = decode_value(entry.1.value())?;
            if job.user == user {
                out.push(job);
            }
        }
        Ok(out)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut jobs = write_txn.open_table(JOBS_TABLE)?;
            jobs.remove(job_id)?;
            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let (start, end) = job_range(job_id);
            let mut keys = Vec::new();
            for entry in lines.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }
            for key in keys {
                lines.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Append tracks to a draft job, skipping ones already queued.
    pub fn add_job_tracks(&self, job_id: &str, track_ids: &[String]) -> Result<usize, CatalogError> {
        let write_txn = self.db().begin_write()?;
        let added = {
            let jobs = write_txn.open_table(JOBS_TABLE)?;
            let job: ConverterJob = match jobs.get(job_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(CatalogError::NotFound(format!("converter {}", job_id))),
            };
            if job.state != JobState::Draft {
                return Err(CatalogError::Conflict(
                    "tracks can only be added to a draft converter".to_string(),
                ));
            }

            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let (start, end) = job_range(job_id);
            let mut queued: HashSet<String> = HashSet::new();
            let mut next_seq = 0u64;
            for entry in lines.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                let line: ConverterLine = decode_value(entry.1.value())?;
                queued.insert(line.track_id.clone());
                next_seq = next_seq.max(line.seq + 1);
            }

            let mut added = 0usize;
            for track_id in track_ids {
                if !queued.insert(track_id.clone()) {
                    continue;
                }
                let line = ConverterLine {
                    job_id: job_id.to_string(),
                    seq: next_seq,
                    track_id: track_id.clone(),
                    state: LineState::Draft,
                };
                let bytes = encode_value(&line)?;
                lines.insert(line_key(job_id, next_seq).as_str(), bytes.as_slice())?;
                next_seq += 1;
                added += 1;
            }
            added
        };
        write_txn.commit()?;
        Ok(added)
    }

    pub fn job_lines(&self, job_id: &str) -> Result<Vec<ConverterLine>, CatalogError> {
        let read_txn = self.db().begin_read()?;
        let lines = read_txn.open_table(JOB_LINES_TABLE)?;
        let (start, end) = job_range(job_id);
        let mut out = Vec::new();
        for entry in lines.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            out.push(decode_value(entry.1.value())?);
        }
        Ok(out)
    }

    pub fn purge_job_lines(&self, job_id: &str) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let (start, end) = job_range(job_id);
            let mut keys = Vec::new();
            for entry in lines.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }
            for key in keys {
                lines.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Draft -> Running; every line becomes Waiting and is eligible for
    /// worker pickup.
    pub fn job_run(&self, job_id: &str) -> Result<ConverterJob, CatalogError> {
        self.transition_job(job_id, |job| {
            if job.state != JobState::Draft {
                return Err(CatalogError::Conflict(format!(
                    "cannot run a converter in state {:?}",
                    job.state
                )));
            }
            job.state = JobState::Running;
            Ok(Some(LineState::Waiting))
        })
    }

    /// Cancel the job. Only lines still Waiting are cancelled; finished
    /// lines keep their state.
    pub fn job_cancel(&self, job_id: &str) -> Result<ConverterJob, CatalogError> {
        let job = self.transition_job(job_id, |job| {
            if job.state == JobState::Done {
                return Err(CatalogError::Conflict(
                    "cannot cancel a finished converter".to_string(),
                ));
            }
            job.state = JobState::Cancelled;
            Ok(None)
        })?;
        self.cancel_waiting_lines(&job.id)?;
        Ok(job)
    }

    /// Reset to Draft; every line goes back to Draft too. The caller must
    /// ensure no workers are active on the job.
    pub fn job_reset_draft(&self, job_id: &str) -> Result<ConverterJob, CatalogError> {
        self.transition_job(job_id, |job| {
            job.state = JobState::Draft;
            Ok(Some(LineState::Draft))
        })
    }

    /// Running -> Done, used by the worker pool once the queue drains. A
    /// no-op when the job was cancelled mid-run.
    pub fn job_finish(&self, job_id: &str) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut jobs = write_txn.open_table(JOBS_TABLE)?;
            let mut job: ConverterJob = match jobs.get(job_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(()),
            };
            if job.state == JobState::Running {
                job.state = JobState::Done;
                let bytes = encode_value(&job)?;
                jobs.insert(job_id, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_line(&self, job_id: &str, seq: u64) -> Result<Option<ConverterLine>, CatalogError> {
        let read_txn = self.db().begin_read()?;
        let lines = read_txn.open_table(JOB_LINES_TABLE)?;
        let line = match lines.get(line_key(job_id, seq).as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(line)
    }

    pub fn set_line_state(
        &self,
        job_id: &str,
        seq: u64,
        state: LineState,
    ) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let key = line_key(job_id, seq);
            let mut line: ConverterLine = match lines.get(key.as_str())? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(()),
            };
            line.state = state;
            let bytes = encode_value(&line)?;
            lines.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn cancel_waiting_lines(&self, job_id: &str) -> Result<(), CatalogError> {
        let write_txn = self.db().begin_write()?;
        {
            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let (start, end) = job_range(job_id);
            let mut waiting = Vec::new();
            for entry in lines.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                let line: ConverterLine = decode_value(entry.1.value())?;
                if line.state == LineState::Waiting {
                    waiting.push(line);
                }
            }
            for mut line in waiting {
                line.state = LineState::Cancelled;
                let bytes = encode_value(&line)?;
                lines.insert(line_key(job_id, line.seq).as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn transition_job(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut ConverterJob) -> Result<Option<LineState>, CatalogError>,
    ) -> Result<ConverterJob, CatalogError> {
        let write_txn = self.db().begin_write()?;
        let job = {
            let mut jobs = write_txn.open_table(JOBS_TABLE)?;
            let mut job: ConverterJob = match jobs.get(job_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(CatalogError::NotFound(format!("converter {}", job_id))),
            };
            let line_state = apply(&mut job)?;
            let bytes = encode_value(&job)?;
            jobs.insert(job_id, bytes.as_slice())?;

            if let Some(state) = line_state {
                let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
                let (start, end) = job_range(job_id);
                let mut all = Vec::new();
                for entry in lines.range(start.as_str()..end.as_str())? {
                    let entry = entry?;
                    let line: ConverterLine = decode_value(entry.1.value())?;
                    all.push(line);
                }
                for mut line in all {
                    line.state = state;
                    let bytes = encode_value(&line)?;
                    lines.insert(line_key(job_id, line.seq).as_str(), bytes.as_slice())?;
                }
            }
            job
        };
        write_txn.commit()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TagBackend;
    use std::path::Path;

    fn job(id: &str) -> ConverterJob {
        ConverterJob {
            id: id.to_string(),
            user: "admin".to_string(),
            name: "batch".to_string(),
            comment: String::new(),
            state: JobState::Draft,
            transcoder: "mp3".to_string(),
            bitrate: 0,
            dest_folder: "/tmp/out".to_string(),
            max_threads: 2,
            norm: false,
        }
    }

    fn open_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        (dir, catalog)
    }

    #[test]
    fn add_tracks_deduplicates() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        let added = catalog
            .add_job_tracks("j1", &["t1".into(), "t2".into(), "t1".into()])
            .unwrap();
        assert_eq!(added, 2);
        let added = catalog.add_job_tracks("j1", &["t2".into(), "t3".into()]).unwrap();
        assert_eq!(added, 1);

        let lines = catalog.job_lines("j1").unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.state == LineState::Draft));
        // Sequence order is stable.
        let seqs: Vec<u64> = lines.iter().map(|line| line.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn run_marks_lines_waiting() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["t1".into(), "t2".into()]).unwrap();

        let running = catalog.job_run("j1").unwrap();
        assert_eq!(running.state, JobState::Running);
        assert!(catalog
            .job_lines("j1")
            .unwrap()
            .iter()
            .all(|line| line.state == LineState::Waiting));

        // A second run is rejected.
        assert!(matches!(
            catalog.job_run("j1").unwrap_err(),
            CatalogError::Conflict(_)
        ));
        // So is adding tracks to a non-draft job.
        assert!(matches!(
            catalog.add_job_tracks("j1", &["t3".into()]).unwrap_err(),
            CatalogError::Conflict(_)
        ));
    }

    #[test]
    fn cancel_spares_finished_lines() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["t1".into(), "t2".into()]).unwrap();
        catalog.job_run("j1").unwrap();
        catalog.set_line_state("j1", 0, LineState::Done).unwrap();

        let cancelled = catalog.job_cancel("j1").unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        let lines = catalog.job_lines("j1").unwrap();
        assert_eq!(lines[0].state, LineState::Done);
        assert_eq!(lines[1].state, LineState::Cancelled);
    }

    #[test]
    fn reset_to_draft_resets_every_line() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["t1".into(), "t2".into()]).unwrap();
        catalog.job_run("j1").unwrap();
        catalog.set_line_state("j1", 0, LineState::Done).unwrap();
        catalog.job_cancel("j1").unwrap();

        let drafted = catalog.job_reset_draft("j1").unwrap();
        assert_eq!(drafted.state, JobState::Draft);
        assert!(catalog
            .job_lines("j1")
            .unwrap()
            .iter()
            .all(|line| line.state == LineState::Draft));
    }

    #[test]
    fn finish_only_applies_to_running_jobs() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["t1".into()]).unwrap();
        catalog.job_run("j1").unwrap();
        catalog.job_finish("j1").unwrap();
        assert_eq!(catalog.get_job("j1").unwrap().unwrap().state, JobState::Done);

        catalog.insert_job(&job("j2")).unwrap();
        catalog.job_cancel("j2").unwrap();
        catalog.job_finish("j2").unwrap();
        assert_eq!(
            catalog.get_job("j2").unwrap().unwrap().state,
            JobState::Cancelled
        );
    }

    #[test]
    fn orphaned_lines_are_swept_with_tag_clean() {
        let (_dir, catalog) = open_catalog();
        catalog
            .create_root_folder("admin", Path::new("/music"), TagBackend::Lofty)
            .unwrap();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["ghost-track".into()]).unwrap();

        // No track row backs the queued line, so the sweep removes it.
        catalog.clean_tags("admin").unwrap();
        assert!(catalog.job_lines("j1").unwrap().is_empty());
    }

    #[test]
    fn purge_clears_the_queue() {
        let (_dir, catalog) = open_catalog();
        catalog.insert_job(&job("j1")).unwrap();
        catalog.add_job_tracks("j1", &["t1".into(), "t2".into()]).unwrap();
        catalog.purge_job_lines("j1").unwrap();
        assert!(catalog.job_lines("j1").unwrap().is_empty());
        // The job itself survives a purge.
        assert!(catalog.get_job("j1").unwrap().is_some());
    }
}
