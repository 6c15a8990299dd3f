//! One-file-per-record backing store.

use crate::store::{BackingStore, RecordStream};
use betula_common::{BetulaError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Name of the file holding the root record pointer.
const ROOT_FILE: &str = "root";

/// Configuration for the file store.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Base directory for record files.
    pub dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Backing store keeping each record in its own file.
///
/// Record `n` lives in `<dir>/<n:08>.obj`; the designated root id lives in
/// `<dir>/root`. The next record id is recovered by scanning the directory
/// on open, so a store can be closed and reopened freely.
pub struct FileStore {
    config: FileStoreConfig,
    next_id: u64,
}

impl FileStore {
    /// Opens (creating if necessary) a file store rooted at the configured
    /// directory.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let mut max_id = 0;
        for entry in std::fs::read_dir(&config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".obj") {
                if let Ok(id) = stem.parse::<u64>() {
                    max_id = max_id.max(id);
                }
            }
        }

        Ok(Self {
            config,
            next_id: max_id + 1,
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.config.dir.join(format!("{:08}.obj", id))
    }
}

impl BackingStore for FileStore {
    fn allocate(&mut self, _len: usize) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let file = File::create(self.record_path(id))?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(id)
    }

    fn deallocate(&mut self, id: u64) -> Result<()> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(BetulaError::RecordNotFound(id));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn get(&mut self, id: u64) -> Result<Box<dyn RecordStream>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(BetulaError::RecordNotFound(id));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Box::new(FileRecord {
            file,
            fsync: self.config.fsync_enabled,
        }))
    }

    fn set_root(&mut self, id: u64) -> Result<()> {
        let path = self.config.dir.join(ROOT_FILE);
        let mut file = File::create(path)?;
        file.write_all(&id.to_le_bytes())?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    fn get_root(&mut self) -> Result<u64> {
        let path = self.config.dir.join(ROOT_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let mut buf = [0u8; 8];
        let mut file = File::open(path)?;
        file.read_exact(&mut buf)
            .map_err(|_| BetulaError::CorruptRoot)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// An open record file.
struct FileRecord {
    file: File,
    fsync: bool,
}

impl Read for FileRecord {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileRecord {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl std::io::Seek for FileRecord {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RecordStream for FileRecord {
    fn complete(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        if self.fsync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
