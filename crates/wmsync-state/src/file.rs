//! JSON-file [`BookmarkStore`].
//!
//! The file holds a mapping `entity -> {replication_key_value, updated_at}`
//! and is always rewritten whole: the new content goes to a temporary file in
//! the same directory, is fsynced, then renamed over the old file. A reader
//! therefore sees either the previous or the next mapping, never a partial one.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wmsync_types::state::{Bookmark, CursorValue, EntityName};

use crate::backend::BookmarkStore;
use crate::error::{self, StateError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    replication_key_value: CursorValue,
    updated_at: DateTime<Utc>,
}

type FileMap = BTreeMap<EntityName, FileEntry>;

/// Bookmark store backed by one JSON file.
pub struct JsonFileBookmarkStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileBookmarkStore {
    /// Use `path` as the bookmark file, creating its directory if needed.
    /// The file itself is created on first write.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created.
    pub fn open(path: impl Into<PathBuf>) -> error::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read_map(&self) -> error::Result<FileMap> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(FileMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &FileMap) -> error::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, map)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }
}

impl BookmarkStore for JsonFileBookmarkStore {
    fn get_bookmark(&self, entity: &EntityName) -> error::Result<Option<Bookmark>> {
        let _guard = self.lock()?;
        let map = self.read_map()?;
        Ok(map.get(entity).map(|e| Bookmark {
            entity: entity.clone(),
            replication_key_value: e.replication_key_value.clone(),
            updated_at: e.updated_at,
        }))
    }

    fn set_bookmark(&self, bookmark: &Bookmark) -> error::Result<()> {
        let _guard = self.lock()?;
        let mut map = self.read_map()?;
        map.insert(
            bookmark.entity.clone(),
            FileEntry {
                replication_key_value: bookmark.replication_key_value.clone(),
                updated_at: bookmark.updated_at,
            },
        );
        self.write_map(&map)
    }

    fn list_bookmarks(&self) -> error::Result<Vec<Bookmark>> {
        let _guard = self.lock()?;
        Ok(self
            .read_map()?
            .into_iter()
            .map(|(entity, e)| Bookmark {
                entity,
                replication_key_value: e.replication_key_value,
                updated_at: e.updated_at,
            })
            .collect())
    }

    fn delete_bookmark(&self, entity: &EntityName) -> error::Result<bool> {
        let _guard = self.lock()?;
        let mut map = self.read_map()?;
        if map.remove(entity).is_none() {
            return Ok(false);
        }
        self.write_map(&map)?;
        Ok(true)
    }
}
