use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use common::{
    path_string, stable_id, Album, Artist, ConverterLine, Folder, Genre, TagBackend, Track,
};
use metadata::MetadataError;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod convert;
pub mod scan;

const CATALOG_VERSION: u32 = 1;
pub(crate) const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const FOLDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders");
const FOLDERS_BY_PATH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders_by_path");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
const TRACKS_BY_PATH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_path");
const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
const ARTISTS_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists_by_name");
const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
const ALBUMS_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums_by_name");
const GENRES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("genres");
const GENRES_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("genres_by_name");
const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("converter_jobs");
const JOB_LINES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("converter_lines");

const META_VERSION_KEY: &str = "version";

/// Handle to the catalog database. Cheap to clone; every operation opens its
/// own transaction, so a `Catalog` can be shared across worker threads.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    Conflict(String),
    NotFound(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Metadata(err) => write!(f, "metadata error: {:?}", err),
            CatalogError::Redb(err) => write!(f, "db error: {}", err),
            CatalogError::Bincode(err) => write!(f, "bincode error: {}", err),
            CatalogError::Conflict(msg) => write!(f, "conflict: {}", msg),
            CatalogError::NotFound(what) => write!(f, "not found: {}", what),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<MetadataError> for CatalogError {
    fn from(err: MetadataError) -> Self {
        CatalogError::Metadata(err)
    }
}

impl From<redb::Error> for CatalogError {
    fn from(err: redb::Error) -> Self {
        CatalogError::Redb(err)
    }
}

impl From<DatabaseError> for CatalogError {
    fn from(err: DatabaseError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TableError> for CatalogError {
    fn from(err: TableError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TransactionError> for CatalogError {
    fn from(err: TransactionError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<CommitError> for CatalogError {
    fn from(err: CommitError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for CatalogError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CatalogError::Bincode(err)
    }
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let catalog = Self { db: Arc::new(db) };
        catalog.init_tables()?;
        Ok(catalog)
    }

    fn init_tables(&self) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            write_txn.open_table(FOLDERS_TABLE)?;
            write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            write_txn.open_table(TRACKS_TABLE)?;
            write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
            write_txn.open_table(ARTISTS_TABLE)?;
            write_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            write_txn.open_table(ALBUMS_TABLE)?;
            write_txn.open_table(ALBUMS_BY_NAME_TABLE)?;
            write_txn.open_table(GENRES_TABLE)?;
            write_txn.open_table(GENRES_BY_NAME_TABLE)?;
            write_txn.open_table(JOBS_TABLE)?;
            write_txn.open_table(JOB_LINES_TABLE)?;
            if meta.get(META_VERSION_KEY)?.is_none() {
                let bytes = encode_value(&CATALOG_VERSION)?;
                meta.insert(META_VERSION_KEY, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    // --- folders -----------------------------------------------------------

    /// Register a new root folder for a user. The path is normalized; a
    /// second root with the same path for the same user is a conflict.
    pub fn create_root_folder(
        &self,
        user: &str,
        path: &Path,
        tag_backend: TagBackend,
    ) -> Result<Folder, CatalogError> {
        let path = path_string(path);
        let folder = Folder {
            id: stable_id(&scoped_key(user, &path)),
            user: user.to_string(),
            path: path.clone(),
            root: true,
            parent_id: None,
            last_modification: 0,
            locked: false,
            locked_at: 0,
            last_scan: None,
            last_scan_duration: 0,
            tag_backend,
            exclude_autoscan: false,
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            let key = scoped_key(user, &path);
            if by_path.get(key.as_str())?.is_some() {
                return Err(CatalogError::Conflict(format!(
                    "folder path already registered: {}",
                    path
                )));
            }
            let bytes = encode_value(&folder)?;
            folders.insert(folder.id.as_str(), bytes.as_slice())?;
            by_path.insert(key.as_str(), folder.id.as_bytes())?;
        }
        write_txn.commit()?;
        Ok(folder)
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FOLDERS_TABLE)?;
        let folder = match table.get(folder_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(folder)
    }

    pub fn folder_by_path(&self, user: &str, path: &str) -> Result<Option<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let id = match by_path.get(scoped_key(user, path).as_str())? {
            Some(value) => String::from_utf8_lossy(value.value()).to_string(),
            None => return Ok(None),
        };
        let table = read_txn.open_table(FOLDERS_TABLE)?;
        let folder = match table.get(id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(folder)
    }

    pub fn list_folders(&self, user: &str) -> Result<Vec<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        let (start, end) = user_range(user);
        let mut out = Vec::new();
        for entry in by_path.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let id = String::from_utf8_lossy(entry.1.value()).to_string();
            if let Some(value) = folders.get(id.as_str())? {
                out.push(decode_value(value.value())?);
            }
        }
        Ok(out)
    }

    pub fn list_root_folders(&self, user: &str) -> Result<Vec<Folder>, CatalogError> {
        Ok(self
            .list_folders(user)?
            .into_iter()
            .filter(|folder| folder.root)
            .collect())
    }

    /// Root folders across all users, for the scheduled scan and the lock
    /// watchdog.
    pub fn all_root_folders(&self) -> Result<Vec<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        let mut out = Vec::new();
        for entry in folders.iter()? {
            let entry = entry?;
            let folder: Folder = decode_value(entry.1.value())?;
            if folder.root {
                out.push(folder);
            }
        }
        Ok(out)
    }

    /// Delete a folder and everything under it, then sweep orphaned tag
    /// entities for the owning user.
    pub fn delete_folder(&self, folder_id: &str) -> Result<(), CatalogError> {
        let folder = self
            .get_folder(folder_id)?
            .ok_or_else(|| CatalogError::NotFound(format!("folder {}", folder_id)))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut folders_by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut tracks_by_path = write_txn.open_table(TRACKS_BY_PATH_TABLE)?;

            let folder_victims =
                collect_keys_under(&folders_by_path, &folder.user, &folder.path)?;
            for (key, id) in folder_victims {
                folders.remove(id.as_str())?;
                folders_by_path.remove(key.as_str())?;
            }
            let track_victims = collect_keys_under(&tracks_by_path, &folder.user, &folder.path)?;
            for (key, id) in track_victims {
                tracks.remove(id.as_str())?;
                tracks_by_path.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;

        self.clean_tags(&folder.user)?;
        Ok(())
    }

    pub(crate) fn put_folder(&self, folder: &Folder) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            let bytes = encode_value(folder)?;
            folders.insert(folder.id.as_str(), bytes.as_slice())?;
            by_path.insert(
                scoped_key(&folder.user, &folder.path).as_str(),
                folder.id.as_bytes(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // --- folder lock -------------------------------------------------------

    /// Acquire the persisted scan lock. The check and the set share one
    /// write transaction, so two concurrent triggers cannot both win.
    pub fn try_lock_folder(&self, folder_id: &str) -> Result<bool, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let acquired = {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut folder: Folder = match folders.get(folder_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(CatalogError::NotFound(format!("folder {}", folder_id))),
            };
            if folder.locked {
                warn!(
                    "\"{}\" is locked! It probably means that a scan is ongoing.",
                    folder.path
                );
                false
            } else {
                folder.locked = true;
                folder.locked_at = now_secs();
                let bytes = encode_value(&folder)?;
                folders.insert(folder_id, bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(acquired)
    }

    /// Clear the scan lock. A no-op when the folder row vanished mid-scan
    /// (the differ may have removed it).
    pub fn unlock_folder(&self, folder_id: &str) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let folder: Option<Folder> = match folders.get(folder_id)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(mut folder) = folder {
                if folder.locked {
                    folder.locked = false;
                    folder.locked_at = 0;
                    let bytes = encode_value(&folder)?;
                    folders.insert(folder_id, bytes.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Force-clear locks held longer than `timeout_secs` on root folders.
    /// Protects against scan workers that died without unlocking.
    pub fn unlock_stale(&self, timeout_secs: u64) -> Result<usize, CatalogError> {
        let now = now_secs();
        let stale: Vec<Folder> = self
            .all_root_folders()?
            .into_iter()
            .filter(|folder| folder.locked && now.saturating_sub(folder.locked_at) > timeout_secs)
            .collect();
        for folder in &stale {
            warn!(
                "Force-unlocking \"{}\": lock held for more than {}s",
                folder.path, timeout_secs
            );
            self.unlock_folder(&folder.id)?;
        }
        Ok(stale.len())
    }

    /// Reset watermarks on a root's folder subtree and tracks so the next
    /// scan revisits every file.
    pub fn reset_watermarks(&self, folder_id: &str) -> Result<(), CatalogError> {
        let folder = self
            .get_folder(folder_id)?
            .ok_or_else(|| CatalogError::NotFound(format!("folder {}", folder_id)))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let folders_by_path = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            let ids = collect_keys_under(&folders_by_path, &folder.user, &folder.path)?;
            for (_, id) in ids {
                let mut row: Folder = match folders.get(id.as_str())? {
                    Some(value) => decode_value(value.value())?,
                    None => continue,
                };
                row.last_modification = 0;
                let bytes = encode_value(&row)?;
                folders.insert(id.as_str(), bytes.as_slice())?;
            }

            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let tracks_by_path = write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
            let ids = collect_keys_under(&tracks_by_path, &folder.user, &folder.path)?;
            for (_, id) in ids {
                let mut row: Track = match tracks.get(id.as_str())? {
                    Some(value) => decode_value(value.value())?,
                    None => continue,
                };
                row.last_modification = 0;
                let bytes = encode_value(&row)?;
                tracks.insert(id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // --- tracks ------------------------------------------------------------

    pub fn upsert_track(&self, track: &Track) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut by_path = write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
            let bytes = encode_value(track)?;
            tracks.insert(track.id.as_str(), bytes.as_slice())?;
            by_path.insert(
                scoped_key(&track.user, &track.path).as_str(),
                track.id.as_bytes(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let track = match table.get(track_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    pub fn list_tracks(&self, user: &str) -> Result<Vec<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(TRACKS_BY_PATH_TABLE)?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let (start, end) = user_range(user);
        let mut out = Vec::new();
        for entry in by_path.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let id = String::from_utf8_lossy(entry.1.value()).to_string();
            if let Some(value) = tracks.get(id.as_str())? {
                out.push(decode_value(value.value())?);
            }
        }
        Ok(out)
    }

    pub fn tracks_by_album(&self, user: &str, album_id: &str) -> Result<Vec<Track>, CatalogError> {
        Ok(self
            .list_tracks(user)?
            .into_iter()
            .filter(|track| track.album_id.as_deref() == Some(album_id))
            .collect())
    }

    pub fn tracks_by_artist(&self, user: &str, artist_id: &str) -> Result<Vec<Track>, CatalogError> {
        Ok(self
            .list_tracks(user)?
            .into_iter()
            .filter(|track| track.artist_id.as_deref() == Some(artist_id))
            .collect())
    }

    pub fn tracks_by_folder(&self, user: &str, folder_id: &str) -> Result<Vec<Track>, CatalogError> {
        Ok(self
            .list_tracks(user)?
            .into_iter()
            .filter(|track| track.folder_id == folder_id || track.root_folder_id == folder_id)
            .collect())
    }

    // --- tag entities ------------------------------------------------------

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARTISTS_TABLE)?;
        let artist = match table.get(artist_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(artist)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ALBUMS_TABLE)?;
        let album = match table.get(album_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(album)
    }

    pub fn get_genre(&self, genre_id: &str) -> Result<Option<Genre>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GENRES_TABLE)?;
        let genre = match table.get(genre_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(genre)
    }

    pub fn list_artists(&self, user: &str) -> Result<Vec<Artist>, CatalogError> {
        self.list_named_entities(ARTISTS_BY_NAME_TABLE, ARTISTS_TABLE, user)
    }

    pub fn list_albums(&self, user: &str) -> Result<Vec<Album>, CatalogError> {
        self.list_named_entities(ALBUMS_BY_NAME_TABLE, ALBUMS_TABLE, user)
    }

    pub fn list_genres(&self, user: &str) -> Result<Vec<Genre>, CatalogError> {
        self.list_named_entities(GENRES_BY_NAME_TABLE, GENRES_TABLE, user)
    }

    fn list_named_entities<T: for<'de> Deserialize<'de>>(
        &self,
        name_table: TableDefinition<&str, &[u8]>,
        entity_table: TableDefinition<&str, &[u8]>,
        user: &str,
    ) -> Result<Vec<T>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let names = read_txn.open_table(name_table)?;
        let entities = read_txn.open_table(entity_table)?;
        let (start, end) = user_range(user);
        let mut out = Vec::new();
        for entry in names.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let id = String::from_utf8_lossy(entry.1.value()).to_string();
            if let Some(value) = entities.get(id.as_str())? {
                out.push(decode_value(value.value())?);
            }
        }
        Ok(out)
    }

    // --- tag cleaner -------------------------------------------------------

    /// Remove artists, albums and genres no longer referenced by any track
    /// of the user, plus converter lines whose track vanished.
    pub fn clean_tags(&self, user: &str) -> Result<(), CatalogError> {
        let tracks = self.list_tracks(user)?;
        let mut artist_refs: HashSet<String> = HashSet::new();
        let mut album_refs: HashSet<String> = HashSet::new();
        let mut genre_refs: HashSet<String> = HashSet::new();
        let mut track_ids: HashSet<String> = HashSet::new();
        for track in &tracks {
            for id in [&track.artist_id, &track.album_artist_id, &track.performer_id] {
                if let Some(id) = id {
                    artist_refs.insert(id.clone());
                }
            }
            if let Some(id) = &track.album_id {
                album_refs.insert(id.clone());
            }
            if let Some(id) = &track.genre_id {
                genre_refs.insert(id.clone());
            }
            track_ids.insert(track.id.clone());
        }

        let write_txn = self.db.begin_write()?;
        {
            clean_entity_table::<Artist>(
                &write_txn,
                ARTISTS_TABLE,
                ARTISTS_BY_NAME_TABLE,
                user,
                &artist_refs,
                |artist| artist_name_key(&artist.user, &artist.name),
            )?;
            clean_entity_table::<Album>(
                &write_txn,
                ALBUMS_TABLE,
                ALBUMS_BY_NAME_TABLE,
                user,
                &album_refs,
                |album| album_name_key(&album.user, &album.name, &album.folder_id),
            )?;
            clean_entity_table::<Genre>(
                &write_txn,
                GENRES_TABLE,
                GENRES_BY_NAME_TABLE,
                user,
                &genre_refs,
                |genre| genre_name_key(&genre.user, &genre.name),
            )?;

            let mut lines = write_txn.open_table(JOB_LINES_TABLE)?;
            let mut dead_lines = Vec::new();
            for entry in lines.iter()? {
                let entry = entry?;
                let line: ConverterLine = decode_value(entry.1.value())?;
                if !track_ids.contains(&line.track_id) {
                    dead_lines.push(entry.0.value().to_string());
                }
            }
            for key in dead_lines {
                lines.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn clean_entity_table<T: for<'de> Deserialize<'de>>(
    write_txn: &WriteTransaction,
    entity_table: TableDefinition<&str, &[u8]>,
    name_table: TableDefinition<&str, &[u8]>,
    user: &str,
    referenced: &HashSet<String>,
    name_key: impl Fn(&T) -> String,
) -> Result<(), CatalogError>
where
    T: HasUserAndId,
{
    let mut entities = write_txn.open_table(entity_table)?;
    let mut names = write_txn.open_table(name_table)?;
    let mut victims = Vec::new();
    for entry in entities.iter()? {
        let entry = entry?;
        let entity: T = decode_value(entry.1.value())?;
        if entity.user() == user && !referenced.contains(entity.id()) {
            victims.push((entry.0.value().to_string(), name_key(&entity)));
        }
    }
    for (id, name_key) in victims {
        entities.remove(id.as_str())?;
        names.remove(name_key.as_str())?;
    }
    Ok(())
}

pub(crate) trait HasUserAndId {
    fn user(&self) -> &str;
    fn id(&self) -> &str;
}

impl HasUserAndId for Artist {
    fn user(&self) -> &str {
        &self.user
    }
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasUserAndId for Album {
    fn user(&self) -> &str {
        &self.user
    }
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasUserAndId for Genre {
    fn user(&self) -> &str {
        &self.user
    }
    fn id(&self) -> &str {
        &self.id
    }
}

// --- key helpers -----------------------------------------------------------

pub(crate) fn scoped_key(user: &str, rest: &str) -> String {
    let mut out = String::with_capacity(user.len() + 1 + rest.len());
    out.push_str(user);
    out.push(KEY_SEP);
    out.push_str(rest);
    out
}

/// Range over every key belonging to one user.
pub(crate) fn user_range(user: &str) -> (String, String) {
    let mut start = String::with_capacity(user.len() + 1);
    start.push_str(user);
    start.push(KEY_SEP);
    let mut end = start.clone();
    end.push('\u{10ffff}');
    (start, end)
}

pub(crate) fn artist_name_key(user: &str, name: &str) -> String {
    scoped_key(user, name)
}

pub(crate) fn genre_name_key(user: &str, name: &str) -> String {
    scoped_key(user, name)
}

pub(crate) fn album_name_key(user: &str, name: &str, folder_id: &str) -> String {
    let mut out = scoped_key(user, name);
    out.push(KEY_SEP);
    out.push_str(folder_id);
    out
}

/// True when `path` equals `root` or lives inside it (separator-aware, so
/// `/music2` is not under `/music`).
pub(crate) fn path_is_under(path: &str, root: &str) -> bool {
    if path == root {
        return true;
    }
    let mut prefix = root.to_string();
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    path.starts_with(&prefix)
}

/// Collect `(index_key, id)` pairs for every record of `user` whose path
/// falls under `root_path`.
fn collect_keys_under<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    user: &str,
    root_path: &str,
) -> Result<Vec<(String, String)>, CatalogError> {
    let (start, end) = user_range(user);
    let mut out = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let entry = entry?;
        let key = entry.0.value().to_string();
        let path = key.splitn(2, KEY_SEP).nth(1).unwrap_or("");
        if path_is_under(path, root_path) {
            out.push((key.clone(), String::from_utf8_lossy(entry.1.value()).to_string()));
        }
    }
    Ok(out)
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CatalogError> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_under_is_separator_aware() {
        assert!(path_is_under("/music", "/music"));
        assert!(path_is_under("/music/Artist1/Album1", "/music"));
        assert!(!path_is_under("/music2/Artist1", "/music"));
    }

    #[test]
    fn lock_is_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let folder = catalog
            .create_root_folder("admin", Path::new("/music"), TagBackend::Lofty)
            .unwrap();

        assert!(catalog.try_lock_folder(&folder.id).unwrap());
        assert!(!catalog.try_lock_folder(&folder.id).unwrap());
        catalog.unlock_folder(&folder.id).unwrap();
        assert!(catalog.try_lock_folder(&folder.id).unwrap());
    }

    #[test]
    fn stale_locks_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let folder = catalog
            .create_root_folder("admin", Path::new("/music"), TagBackend::Lofty)
            .unwrap();
        assert!(catalog.try_lock_folder(&folder.id).unwrap());

        // Fresh lock survives the sweep.
        assert_eq!(catalog.unlock_stale(3600).unwrap(), 0);

        // Backdate the lock past the timeout.
        let mut row = catalog.get_folder(&folder.id).unwrap().unwrap();
        row.locked_at = now_secs() - 7200;
        catalog.put_folder(&row).unwrap();
        assert_eq!(catalog.unlock_stale(3600).unwrap(), 1);
        assert!(!catalog.get_folder(&folder.id).unwrap().unwrap().locked);
    }

    #[test]
    fn duplicate_root_folder_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        catalog
            .create_root_folder("admin", Path::new("/music"), TagBackend::Lofty)
            .unwrap();
        let err = catalog
            .create_root_folder("admin", Path::new("/music"), TagBackend::Lofty)
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        // A different user may register the same path.
        catalog
            .create_root_folder("other", Path::new("/music"), TagBackend::Lofty)
            .unwrap();
    }
}
