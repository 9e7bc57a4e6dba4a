use std::time::Duration;

use catalog::scan::{scan_folder, scan_folder_full, ScanOptions, ScanOutcome};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::state::AppState;

pub fn scan_options(config: &ServerConfig) -> ScanOptions {
    ScanOptions {
        allowed_extensions: config.allowed_extensions.iter().cloned().collect(),
        commit_batch: config.scan_commit_batch,
    }
}

/// Fire-and-forget scan trigger. The walk runs on a blocking thread; the
/// persisted folder lock keeps overlapping triggers harmless.
pub fn start_scan(state: AppState, folder_id: String, full: bool) {
    tokio::spawn(async move {
        let options = scan_options(&state.config.read());
        let catalog = state.catalog.clone();
        let id = folder_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            if full {
                scan_folder_full(&catalog, &id, &options)
            } else {
                scan_folder(&catalog, &id, &options)
            }
        })
        .await;

        match result {
            Ok(Ok(ScanOutcome::Completed(stats))) => {
                info!(
                    "Scan finished: {} folders created, {} tracks created, {} tracks updated",
                    stats.folders_created, stats.tracks_created, stats.tracks_updated
                );
            }
            Ok(Ok(ScanOutcome::Locked)) => {
                // Already logged by the lock manager; nothing else to do.
            }
            Ok(Ok(ScanOutcome::Missing)) => {
                warn!("Scan target no longer exists; catalog records removed");
            }
            Ok(Err(err)) => warn!("Scan of folder {} failed: {}", folder_id, err),
            Err(err) => warn!("Scan join error for folder {}: {}", folder_id, err),
        }
    });
}

/// Background sweep that force-clears locks left behind by crashed scan
/// workers.
pub fn start_lock_watchdog(state: AppState) {
    tokio::spawn(async move {
        loop {
            let timeout = state.config.read().lock_timeout_secs.max(60);
            let period = Duration::from_secs((timeout / 4).max(30));
            tokio::time::sleep(period).await;
            match state.catalog.unlock_stale(timeout) {
                Ok(0) => {}
                Ok(count) => info!("Lock watchdog cleared {} stale lock(s)", count),
                Err(err) => warn!("Lock watchdog sweep failed: {}", err),
            }
        }
    });
}

/// Scheduled scan over every root folder not excluded from autoscan.
pub fn start_autoscan(state: AppState) {
    let interval = state.config.read().autoscan_interval_secs;
    if interval == 0 {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            let roots = match state.catalog.all_root_folders() {
                Ok(roots) => roots,
                Err(err) => {
                    warn!("Autoscan could not list folders: {}", err);
                    continue;
                }
            };
            for folder in roots {
                if folder.exclude_autoscan {
                    continue;
                }
                let options = scan_options(&state.config.read());
                let catalog = state.catalog.clone();
                let folder_id = folder.id.clone();
                let result = tokio::task::spawn_blocking(move || {
                    scan_folder(&catalog, &folder_id, &options)
                })
                .await;
                if let Ok(Err(err)) = result {
                    warn!("Autoscan of \"{}\" failed: {}", folder.path, err);
                }
            }
        }
    });
}
