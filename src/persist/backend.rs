//! File access trait seam for the persistence store.
//!
//! Mirrors this codebase's own trait-abstracted virtual filesystem: production code
//! talks to `std::fs::File` through [`StdFileBackend`] (OS advisory locking via
//! `fs2`), tests substitute [`MemoryBackend`] so crash-recovery scenarios don't need a
//! real filesystem.

use crate::error::PersistenceError;
use std::io::{Read, Seek, SeekFrom, Write};

pub trait FileBackend: Send {
    fn len(&mut self) -> Result<u64, PersistenceError>;
    fn set_len(&mut self, len: u64) -> Result<(), PersistenceError>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PersistenceError>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), PersistenceError>;
    fn sync_data(&mut self) -> Result<(), PersistenceError>;
    fn try_lock_exclusive(&mut self) -> Result<(), PersistenceError>;
}

pub struct StdFileBackend {
    file: std::fs::File,
}

impl StdFileBackend {
    pub fn open(path: &std::path::Path) -> Result<Self, PersistenceError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| PersistenceError::io("open", e))?;
        Ok(StdFileBackend { file })
    }
}

impl FileBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64, PersistenceError> {
        self.file.metadata().map(|m| m.len()).map_err(|e| PersistenceError::io("metadata", e))
    }

    fn set_len(&mut self, len: u64) -> Result<(), PersistenceError> {
        self.file.set_len(len).map_err(|e| PersistenceError::io("set_len", e))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PersistenceError> {
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| PersistenceError::io("seek", e))?;
        self.file.read_exact(buf).map_err(|e| PersistenceError::io("read", e))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), PersistenceError> {
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| PersistenceError::io("seek", e))?;
        self.file.write_all(buf).map_err(|e| PersistenceError::io("write", e))
    }

    fn sync_data(&mut self) -> Result<(), PersistenceError> {
        self.file.sync_data().map_err(|e| PersistenceError::io("sync_data", e))
    }

    fn try_lock_exclusive(&mut self) -> Result<(), PersistenceError> {
        use fs2::FileExt;
        self.file.try_lock_exclusive().map_err(|_| PersistenceError::AlreadyLocked)
    }
}

/// In-memory backend for deterministic tests: no real file, no real OS lock.
pub struct MemoryBackend {
    data: Vec<u8>,
    locked: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend { data: Vec::new(), locked: false }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FileBackend for MemoryBackend {
    fn len(&mut self) -> Result<u64, PersistenceError> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<(), PersistenceError> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PersistenceError> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(PersistenceError::io(
                "read",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
            ));
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), PersistenceError> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            self.data.resize(offset + buf.len(), 0);
        }
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync_data(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn try_lock_exclusive(&mut self) -> Result<(), PersistenceError> {
        if self.locked {
            return Err(PersistenceError::AlreadyLocked);
        }
        self.locked = true;
        Ok(())
    }
}
