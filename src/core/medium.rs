//! Backing media for containers
//!
//! The engine only needs positioned reads and writes plus the ability to
//! grow or shrink the medium. [`DiskMedium`] keeps the container in a file,
//! [`MemoryMedium`] in a byte vector with the same layout, so a memory
//! image can be written to disk verbatim and reopened.

use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage underneath a container
pub trait Medium {
    /// Fill `buf` from `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;

    /// Write `data` at `offset`; the medium must already be long enough
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;

    /// Current length in bytes
    fn len(&self) -> std::io::Result<u64>;

    /// Grow (zero-filled) or shrink the medium
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Push buffered writes to durable storage
    fn sync(&mut self) -> std::io::Result<()>;

    /// Path of the backing file, if any
    fn path(&self) -> Option<&Path>;

    fn is_writable(&self) -> bool;
}

/// Disk-backed container storage
#[derive(Debug)]
pub struct DiskMedium {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl DiskMedium {
    /// Create (or replace) a container file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| StoreError::CantCreateStore {
                path: path.as_ref().to_path_buf(),
                source,
            })?;

        Ok(DiskMedium {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
        })
    }

    /// Open an existing container file
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|source| StoreError::CantOpenStore {
                path: path.as_ref().to_path_buf(),
                source,
            })?;

        Ok(DiskMedium {
            file,
            path: path.as_ref().to_path_buf(),
            writable,
        })
    }
}

impl Medium for DiskMedium {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|source| StoreError::ClusterWrite {
            location: len,
            source,
        })
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// In-memory container image
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    bytes: Vec<u8>,
    writable: bool,
}

impl MemoryMedium {
    pub fn new() -> Self {
        MemoryMedium {
            bytes: Vec::new(),
            writable: true,
        }
    }

    /// Wrap an existing container image
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryMedium {
            bytes,
            writable: true,
        }
    }

    /// Wrap an image that must not be modified
    pub fn read_only(bytes: Vec<u8>) -> Self {
        MemoryMedium {
            bytes,
            writable: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn range(&self, offset: u64, len: usize) -> std::io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset exceeds address space")
        })?;
        let end = start.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range {}+{} outside image of {} bytes",
                    offset,
                    len,
                    self.bytes.len()
                ),
            )),
        }
    }
}

impl Medium for MemoryMedium {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        if !self.writable {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "memory image is read-only",
            ));
        }
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| StoreError::Underflow64To32 {
            value: len,
            width: usize::BITS as u8,
        })?;
        if len > self.bytes.len() {
            self.bytes
                .try_reserve(len - self.bytes.len())
                .map_err(|e| {
                    StoreError::OutOfMemory(format!("cannot grow image to {} bytes: {}", len, e))
                })?;
        }
        self.bytes.resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Either medium, for callers that pick one at runtime
#[derive(Debug)]
pub enum Backing {
    Disk(DiskMedium),
    Memory(MemoryMedium),
}

impl Medium for Backing {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Backing::Disk(m) => m.read_at(offset, buf),
            Backing::Memory(m) => m.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        match self {
            Backing::Disk(m) => m.write_at(offset, data),
            Backing::Memory(m) => m.write_at(offset, data),
        }
    }

    fn len(&self) -> std::io::Result<u64> {
        match self {
            Backing::Disk(m) => m.len(),
            Backing::Memory(m) => m.len(),
        }
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        match self {
            Backing::Disk(m) => m.set_len(len),
            Backing::Memory(m) => m.set_len(len),
        }
    }

    fn sync(&mut self) -> std::io::Result<()> {
        match self {
            Backing::Disk(m) => m.sync(),
            Backing::Memory(m) => m.sync(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Backing::Disk(m) => m.path(),
            Backing::Memory(m) => m.path(),
        }
    }

    fn is_writable(&self) -> bool {
        match self {
            Backing::Disk(m) => m.is_writable(),
            Backing::Memory(m) => m.is_writable(),
        }
    }
}
