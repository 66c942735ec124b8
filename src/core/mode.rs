//! Open modes for streams and buffer modes for containers

use crate::error::{Result, StoreError};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Stream open flags, composable
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u16 {
        /// Open for reading
        const IN             = 1 << 0;
        /// Open for writing
        const OUT            = 1 << 1;
        /// Discard existing contents
        const TRUNC          = 1 << 2;
        /// Fail if the stream exists
        const CREATE_NEW     = 1 << 3;
        /// Overwrite the stream if it exists
        const CREATE_ALWAYS  = 1 << 4;
        /// Fail if the stream does not exist
        const OPEN_EXISTING  = 1 << 5;
        /// Create the stream if it does not exist
        const OPEN_ALWAYS    = 1 << 6;
        /// Remove the stream on close if nothing was ever written
        const DEL_IF_EMPTY   = 1 << 7;
        /// Remove the stream on close
        const DEL_ON_CLOSE   = 1 << 8;
        /// Continue past recoverable corruption
        const RECOVERY       = 1 << 9;
        /// Defragment the stream's clusters into offset order on close
        const SPEED_ON_CLOSE = 1 << 10;
    }
}

impl OpenMode {
    /// Flags that require a writable container even for an existing stream
    const MUTATING: OpenMode = OpenMode::OUT
        .union(OpenMode::TRUNC)
        .union(OpenMode::CREATE_ALWAYS)
        .union(OpenMode::DEL_IF_EMPTY)
        .union(OpenMode::DEL_ON_CLOSE)
        .union(OpenMode::SPEED_ON_CLOSE);

    /// Flags allowed to create a missing stream
    const CREATING: OpenMode = OpenMode::OUT
        .union(OpenMode::CREATE_NEW)
        .union(OpenMode::CREATE_ALWAYS)
        .union(OpenMode::OPEN_ALWAYS);

    /// Plain read
    pub fn read() -> Self {
        OpenMode::IN | OpenMode::OPEN_EXISTING
    }

    /// Replace contents, creating the stream if needed
    pub fn write() -> Self {
        OpenMode::OUT | OpenMode::TRUNC | OpenMode::OPEN_ALWAYS
    }

    pub fn is_write(&self) -> bool {
        self.contains(OpenMode::OUT)
    }

    pub fn mutates(&self) -> bool {
        self.intersects(Self::MUTATING)
    }

    pub fn may_create(&self) -> bool {
        self.intersects(Self::CREATING) && !self.contains(OpenMode::OPEN_EXISTING)
    }

    pub fn discards_contents(&self) -> bool {
        self.intersects(OpenMode::TRUNC | OpenMode::CREATE_ALWAYS)
    }

    /// Reject contradictory combinations
    pub fn validate(&self) -> Result<()> {
        if !self.intersects(OpenMode::IN | OpenMode::OUT) {
            return Err(StoreError::InvalidMode(
                "neither IN nor OUT requested".to_string(),
            ));
        }
        if self.contains(OpenMode::CREATE_NEW | OpenMode::OPEN_EXISTING) {
            return Err(StoreError::InvalidMode(
                "CREATE_NEW conflicts with OPEN_EXISTING".to_string(),
            ));
        }
        if self.contains(OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS) {
            return Err(StoreError::InvalidMode(
                "CREATE_NEW conflicts with CREATE_ALWAYS".to_string(),
            ));
        }
        if !self.is_write() && self.discards_contents() {
            return Err(StoreError::InvalidMode(
                "TRUNC/CREATE_ALWAYS require OUT".to_string(),
            ));
        }
        Ok(())
    }
}

/// Container-level access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl BufferMode {
    pub fn is_writable(&self) -> bool {
        *self == BufferMode::ReadWrite
    }
}
