use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::scan::scan_options;
use crate::state::AppState;

/// (Re)arm the filesystem watcher over every registered root folder.
/// Relevant events trigger an incremental scan after a debounce window.
pub fn configure_watcher(state: &AppState) {
    let config = state.config.read().clone();
    if !config.watch_folders {
        info!("Watcher disabled (watch_folders=false)");
        *state.watcher.write() = None;
        return;
    }

    let debounce_secs = if config.watch_debounce_secs == 0 {
        2
    } else {
        config.watch_debounce_secs
    };
    let debounce = Duration::from_secs(debounce_secs);

    match setup_watcher(state.clone(), debounce) {
        Ok(Some(watcher)) => {
            *state.watcher.write() = Some(watcher);
        }
        Ok(None) => {
            *state.watcher.write() = None;
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    state: AppState,
    debounce: Duration,
) -> Result<Option<RecommendedWatcher>, Box<dyn std::error::Error>> {
    let roots = state.catalog.all_root_folders()?;
    if roots.is_empty() {
        return Ok(None);
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    let mut watching = 0usize;
    for root in &roots {
        let path = std::path::Path::new(&root.path);
        match watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => watching += 1,
            Err(err) => warn!("Cannot watch \"{}\": {}", root.path, err),
        }
    }
    if watching == 0 {
        return Ok(None);
    }
    info!(
        "Watching {} root folder(s) for changes (debounce {}s)",
        watching,
        debounce.as_secs()
    );

    tokio::spawn(async move {
        watch_loop(state, rx, debounce).await;
    });

    Ok(Some(watcher))
}

async fn watch_loop(state: AppState, mut rx: UnboundedReceiver<Event>, debounce: Duration) {
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    rescan_roots(&state).await;
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(event) = maybe_event {
                        if !is_relevant_event(&event) {
                            continue;
                        }
                    } else {
                        return;
                    }
                }
            }
        }
    }
}

async fn rescan_roots(state: &AppState) {
    let roots = match state.catalog.all_root_folders() {
        Ok(roots) => roots,
        Err(err) => {
            warn!("Watcher could not list root folders: {}", err);
            return;
        }
    };
    for root in roots {
        let options = scan_options(&state.config.read());
        let catalog = state.catalog.clone();
        let folder_id = root.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            catalog::scan::scan_folder(&catalog, &folder_id, &options)
        })
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("Auto-rescan of \"{}\" failed: {}", root.path, err),
            Err(err) => warn!("Auto-rescan join error for \"{}\": {}", root.path, err),
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
