use crate::state::IoState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid magic number in container header")]
    BadSignature,

    #[error("Header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderChecksum { stored: u32, computed: u32 },

    #[error("Unsupported storage version: {found} (supported up to {supported})")]
    UnsupportedStorageVersion { found: u16, supported: u16 },

    #[error("Stream '{stream}' was written with versions {found:?}, reader understands {supported:?}")]
    StreamVersion {
        stream: String,
        found: Vec<u16>,
        supported: Vec<u16>,
    },

    #[error("Value {value} does not fit a {width}-bit field")]
    Underflow64To32 { value: u64, width: u8 },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Corrupted data: {0}")]
    BadData(String),

    #[error("Cluster index {index} outside master table of {len} clusters")]
    ClusterOutOfRange { index: u64, len: usize },

    #[error("Cluster {0} released twice")]
    DoubleFree(u64),

    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream already exists: {0}")]
    StreamExists(String),

    #[error("Invalid stream name: {0:?}")]
    InvalidName(String),

    #[error("Invalid open mode: {0}")]
    InvalidMode(String),

    #[error("Seek to {pos} beyond end of stream ({size} bytes)")]
    SeekOutOfRange { pos: u64, size: u64 },

    #[error("Container is read-only")]
    WriteProtected,

    #[error("Access violation: {0}")]
    AccessViolation(String),

    #[error("No stream is open")]
    Closed,

    #[error("Read past end of stream: needed {needed} bytes, got {got}")]
    OutOfRead { needed: usize, got: usize },

    #[error("Cannot read catalog: {0}")]
    CantReadCatalog(String),

    #[error("Cannot write catalog: {0}")]
    CantWriteCatalog(String),

    #[error("Cannot open container {path:?}: {source}")]
    CantOpenStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create container {path:?}: {source}")]
    CantCreateStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read cluster at offset {location}: {source}")]
    ClusterRead {
        location: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write cluster at offset {location}: {source}")]
    ClusterWrite {
        location: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TOML configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON configuration error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// The state bit this error sets on the engine that reported it
    pub fn state_flag(&self) -> IoState {
        match self {
            StoreError::BadSignature => IoState::BAD_SIG,
            StoreError::HeaderChecksum { .. } => IoState::BAD_DATA,
            StoreError::UnsupportedStorageVersion { .. } => IoState::VER_VIOLATION,
            StoreError::StreamVersion { .. } => IoState::VER_VIOLATION,
            StoreError::Underflow64To32 { .. } => IoState::UNDERFLOW_64_TO_32,
            StoreError::OutOfMemory(_) => IoState::OUT_OF_MEMORY,
            StoreError::BadData(_) => IoState::BAD_DATA,
            StoreError::ClusterOutOfRange { .. } => IoState::CANT_FIND,
            StoreError::DoubleFree(_) => IoState::BAD_DATA,
            StoreError::NotFound(_) => IoState::NOT_FOUND,
            StoreError::StreamExists(_) => IoState::FAIL,
            StoreError::InvalidName(_) => IoState::FAIL,
            StoreError::InvalidMode(_) => IoState::FAIL,
            StoreError::SeekOutOfRange { .. } => IoState::FAIL,
            StoreError::WriteProtected => IoState::WRITE_PROTECT,
            StoreError::AccessViolation(_) => IoState::ACCESS_VIOLATION,
            StoreError::Closed => IoState::CLOSED,
            StoreError::OutOfRead { .. } => IoState::OUT_OF_READ,
            StoreError::CantReadCatalog(_) => IoState::CANT_READ_CATALOG,
            StoreError::CantWriteCatalog(_) => IoState::CANT_WRITE_CATALOG,
            StoreError::CantOpenStore { .. } => IoState::CANT_OPEN_STORE,
            StoreError::CantCreateStore { .. } => IoState::CANT_CREATE_STORE,
            StoreError::ClusterRead { .. } => IoState::CANT_READ,
            StoreError::ClusterWrite { .. } => IoState::CANT_WRITE,
            StoreError::Io(_) => IoState::HARD_FAIL,
            StoreError::InvalidConfig(_) => IoState::FAIL,
            StoreError::Toml(_) => IoState::FAIL,
            StoreError::Json(_) => IoState::FAIL,
        }
    }
}

impl From<StoreError> for std::io::Error {
    fn from(err: StoreError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            StoreError::Io(e) => e.kind(),
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::StreamExists(_) => ErrorKind::AlreadyExists,
            StoreError::WriteProtected | StoreError::AccessViolation(_) => {
                ErrorKind::PermissionDenied
            }
            StoreError::OutOfRead { .. } => ErrorKind::UnexpectedEof,
            StoreError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            StoreError::SeekOutOfRange { .. }
            | StoreError::InvalidName(_)
            | StoreError::InvalidMode(_)
            | StoreError::InvalidConfig(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_flags_for_medium_errors() {
        let err = StoreError::ClusterRead {
            location: 4096,
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short"),
        };
        assert_eq!(err.state_flag(), IoState::CANT_READ);
        assert_eq!(StoreError::BadSignature.state_flag(), IoState::BAD_SIG);
        assert_eq!(
            StoreError::ClusterOutOfRange { index: 9, len: 3 }.state_flag(),
            IoState::CANT_FIND
        );
    }

    #[test]
    fn test_into_io_error_keeps_kind() {
        let io: std::io::Error = StoreError::NotFound("a".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);

        let io: std::io::Error = StoreError::OutOfRead { needed: 4, got: 1 }.into();
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_double_free_message() {
        let err = StoreError::DoubleFree(7);
        assert_eq!(err.to_string(), "Cluster 7 released twice");
        assert_eq!(err.state_flag(), IoState::BAD_DATA);
    }
}
