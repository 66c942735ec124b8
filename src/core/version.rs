//! Storage and stream versioning
//!
//! A container records one storage version. Each stream additionally
//! records the [`VersionContainer`] it was written under, so streams
//! written by older code keep their own layout inside a newer container.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// 16-bit counts, 32-bit cluster indices
pub const STORAGE_V1: u16 = 1;
/// 32-bit counts, 32-bit cluster indices
pub const STORAGE_V2: u16 = 2;
/// 64-bit counts, 64-bit cluster indices
pub const STORAGE_V3: u16 = 3;
/// Newest storage version this crate reads and writes
pub const STORAGE_VERSION_CURRENT: u16 = STORAGE_V3;
/// Most versions one container can hold (the count is stored as a u8)
pub const MAX_VERSIONS: usize = u8::MAX as usize;

/// Width of an element count on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountWidth {
    U16,
    U32,
    U64,
}

impl CountWidth {
    pub fn bytes(self) -> usize {
        match self {
            CountWidth::U16 => 2,
            CountWidth::U32 => 4,
            CountWidth::U64 => 8,
        }
    }

    pub fn bits(self) -> u8 {
        (self.bytes() * 8) as u8
    }

    /// Largest value representable in this width
    pub fn max_value(self) -> u64 {
        match self {
            CountWidth::U16 => u16::MAX as u64,
            CountWidth::U32 => u32::MAX as u64,
            CountWidth::U64 => u64::MAX,
        }
    }
}

/// Integer widths used to serialize counts and cluster indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceLayout {
    pub count: CountWidth,
    pub index: CountWidth,
}

impl SpaceLayout {
    /// Layout rules of a storage version
    pub fn for_version(version: u16) -> Result<Self> {
        match version {
            STORAGE_V1 => Ok(SpaceLayout {
                count: CountWidth::U16,
                index: CountWidth::U32,
            }),
            STORAGE_V2 => Ok(SpaceLayout {
                count: CountWidth::U32,
                index: CountWidth::U32,
            }),
            STORAGE_V3 => Ok(SpaceLayout {
                count: CountWidth::U64,
                index: CountWidth::U64,
            }),
            other => Err(StoreError::UnsupportedStorageVersion {
                found: other,
                supported: STORAGE_VERSION_CURRENT,
            }),
        }
    }
}

/// Versions a stream was written under
///
/// The first entry is the engine (main) version, any further entries are
/// application-defined versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionContainer {
    versions: Vec<u16>,
}

impl VersionContainer {
    pub fn new(main: u16) -> Self {
        VersionContainer {
            versions: vec![main],
        }
    }

    /// Versions of the current engine with no application versions
    pub fn current() -> Self {
        Self::new(STORAGE_VERSION_CURRENT)
    }

    /// Add an application version
    pub fn with_app(mut self, version: u16) -> Self {
        self.versions.push(version);
        self
    }

    pub fn main(&self) -> u16 {
        self.versions[0]
    }

    /// Application version `i` (0-based, not counting the main version)
    pub fn app(&self, i: usize) -> Option<u16> {
        self.versions.get(i + 1).copied()
    }

    pub fn app_count(&self) -> usize {
        self.versions.len() - 1
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.versions
    }

    /// Can code understanding `self` interpret data written under `written`?
    pub fn covers(&self, written: &VersionContainer) -> bool {
        if written.main() > self.main() {
            return false;
        }
        (0..written.app_count()).all(|i| match (written.app(i), self.app(i)) {
            (Some(w), Some(r)) => w <= r,
            _ => false,
        })
    }

    /// Reject containers the catalog cannot store and main versions this
    /// engine has no layout for
    pub fn validate(&self) -> Result<()> {
        check_len(self.versions.len())?;
        SpaceLayout::for_version(self.main()).map(|_| ())
    }

    pub fn layout(&self) -> Result<SpaceLayout> {
        SpaceLayout::for_version(self.main())
    }

    /// Wire form: u8 count followed by one u16 per version
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_len(self.versions.len())?;
        let mut bytes = Vec::with_capacity(1 + self.versions.len() * 2);
        bytes.push(self.versions.len() as u8);
        for v in &self.versions {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Ok(bytes)
    }

    pub fn from_slice(versions: &[u16]) -> Result<Self> {
        check_len(versions.len())?;
        Ok(VersionContainer {
            versions: versions.to_vec(),
        })
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_VERSIONS {
        return Err(StoreError::BadData(format!(
            "version container with {} entries",
            len
        )));
    }
    Ok(())
}

impl Default for VersionContainer {
    fn default() -> Self {
        Self::current()
    }
}
