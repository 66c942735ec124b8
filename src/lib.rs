//! # Cluster Store - Paged Multi-Stream Container Storage
//!
//! `cluster-store` keeps many named, independently versioned byte streams in
//! a single file (or memory image). The file is divided into fixed-capacity
//! clusters; each stream is an ordered list of clusters, and a catalog
//! stream inside the same file records every stream's name, versions and
//! cluster list.
//!
//! - **Sequential buffering engine** with one active stream and a
//!   one-cluster window ([`StreamBuffer`])
//! - **Free-cluster pool** with delete, truncate, rename and compaction
//!   ([`PooledBuffer`])
//! - **Per-stream versions**: counts and cluster indices are written at the
//!   width of the version a stream was written under, so old streams stay
//!   readable after the container format moves on
//! - **Cumulative state bits** ([`IoState`]) alongside typed errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cluster_store::{Container, Result};
//!
//! # fn main() -> Result<()> {
//! let mut store = Container::create("drawing.store")?;
//!
//! store.write("geometry", b"solid #1")?;
//! store.append("geometry", b", solid #2")?;
//!
//! let bytes = store.read("geometry")?;
//! assert_eq!(bytes, b"solid #1, solid #2");
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Streaming Access
//!
//! ```rust,no_run
//! use cluster_store::{Container, OpenMode, RecordIo, Result, VersionContainer};
//!
//! # fn main() -> Result<()> {
//! let mut store = Container::in_memory(Default::default())?;
//! let versions = VersionContainer::current().with_app(2);
//!
//! let engine = store.engine_mut();
//! engine.open("header", OpenMode::write(), &versions)?;
//! engine.put_str("layer 0")?;
//! engine.put_count(3)?;
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

// Core implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    allocator, buffer, catalog, cluster, config, error, file_space, header, medium, mode, record,
    state, store, version,
};

// Re-export core types that users need
pub use crate::core::{
    allocator::{AppendOnly, ClusterAllocator, FreePool},
    buffer::{Direction, PooledBuffer, SeqBuffer, StreamBuffer, SEEK_END},
    catalog::{StreamEntry, StreamId},
    cluster::{Cluster, ClusterIndex, ClusterTable},
    config::StoreConfig,
    error::{Result, StoreError},
    file_space::FileSpace,
    header::{ContainerHeader, DEFAULT_CLUSTER_CAPACITY, HEADER_SIZE},
    medium::{Backing, DiskMedium, Medium, MemoryMedium},
    mode::{BufferMode, OpenMode},
    record::{ByteStream, RecordIo},
    state::IoState,
    store::DetachedStream,
    version::{SpaceLayout, VersionContainer, STORAGE_VERSION_CURRENT},
};

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Container handle shared between threads
///
/// The engine itself is single-threaded; hosts that call it from several
/// threads serialize every call through this lock.
pub type SharedContainer = Arc<Mutex<Container>>;

/// High-level container API
///
/// This is a wrapper around [`PooledBuffer`] that provides:
/// - Whole-stream read/write/append calls
/// - Delete, truncate and rename by name
/// - Disk or memory backing chosen at construction
/// - Commit on drop
///
/// # Examples
///
/// ```rust,no_run
/// use cluster_store::{Container, Result};
///
/// # fn main() -> Result<()> {
/// let mut store = Container::create("data.store")?;
/// store.write("notes", b"content")?;
/// let data = store.read("notes")?;
/// # Ok(())
/// # }
/// ```
pub struct Container {
    inner: PooledBuffer<Backing>,
    versions: VersionContainer,
    closed: bool,
}

impl Container {
    /// Create a new container file, replacing any existing one
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, StoreConfig::default())
    }

    /// Create a new container file with explicit settings
    pub fn create_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        info!("Creating container at {:?}", path.as_ref());
        let medium = DiskMedium::create(path)?;
        let inner = PooledBuffer::create(Backing::Disk(medium), config)?;
        Ok(Self::wrap(inner))
    }

    /// Open an existing container file for reading and writing
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use cluster_store::Container;
    ///
    /// let mut store = Container::open("existing.store")?;
    /// # Ok::<(), cluster_store::StoreError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    /// Open an existing container file with explicit settings
    ///
    /// A read-only buffer mode opens the file without write access.
    pub fn open_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        info!("Opening container at {:?}", path.as_ref());
        let medium = DiskMedium::open(path, config.buffer_mode.is_writable())?;
        let inner = PooledBuffer::open_container(Backing::Disk(medium), config)?;
        Ok(Self::wrap(inner))
    }

    /// Create an empty container in memory
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        debug!("Creating in-memory container");
        let inner = PooledBuffer::create(Backing::Memory(MemoryMedium::new()), config)?;
        Ok(Self::wrap(inner))
    }

    /// Open a container image held in memory
    pub fn from_bytes(bytes: Vec<u8>, config: StoreConfig) -> Result<Self> {
        let medium = if config.buffer_mode.is_writable() {
            MemoryMedium::from_bytes(bytes)
        } else {
            MemoryMedium::read_only(bytes)
        };
        let inner = PooledBuffer::open_container(Backing::Memory(medium), config)?;
        Ok(Self::wrap(inner))
    }

    fn wrap(inner: PooledBuffer<Backing>) -> Self {
        Container {
            versions: VersionContainer::new(inner.storage_version()),
            inner,
            closed: false,
        }
    }

    /// Versions recorded for streams written through this handle, and
    /// the versions it accepts when reading
    pub fn versions(&self) -> &VersionContainer {
        &self.versions
    }

    pub fn set_versions(&mut self, versions: VersionContainer) -> Result<()> {
        versions.validate()?;
        self.versions = versions;
        Ok(())
    }

    /// Commit everything and return the container image
    ///
    /// For a disk container this reads the file back.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        self.inner.commit()?;
        self.closed = true;
        match self.inner.medium() {
            Backing::Memory(m) => Ok(m.as_bytes().to_vec()),
            Backing::Disk(m) => match m.path() {
                Some(path) => Ok(std::fs::read(path)?),
                None => Err(StoreError::Closed),
            },
        }
    }

    /// Replace the contents of a stream, creating it if needed
    pub fn write<N: AsRef<str>>(&mut self, name: N, content: &[u8]) -> Result<()> {
        let name = name.as_ref();
        debug!("Writing {} bytes to '{}'", content.len(), name);
        self.inner.open(name, OpenMode::write(), &self.versions)?;
        let written = self.inner.put_block(content);
        let closed = self.inner.close();
        written?;
        closed
    }

    /// Add bytes to the end of a stream, creating it if needed
    pub fn append<N: AsRef<str>>(&mut self, name: N, content: &[u8]) -> Result<()> {
        let name = name.as_ref();
        debug!("Appending {} bytes to '{}'", content.len(), name);
        self.inner
            .open(name, OpenMode::OUT | OpenMode::OPEN_ALWAYS, &self.versions)?;
        let written = self
            .inner
            .lseek(SEEK_END)
            .and_then(|_| self.inner.put_block(content));
        let closed = self.inner.close();
        written?;
        closed
    }

    /// Read a whole stream
    pub fn read<N: AsRef<str>>(&mut self, name: N) -> Result<Vec<u8>> {
        let name = name.as_ref();
        debug!("Reading '{}'", name);
        self.inner.open(name, OpenMode::read(), &self.versions)?;
        let content = self.read_active();
        let closed = self.inner.close();
        let content = content?;
        closed?;
        Ok(content)
    }

    fn read_active(&mut self) -> Result<Vec<u8>> {
        let size = self.inner.size()?;
        let len = usize::try_from(size).map_err(|_| StoreError::Underflow64To32 {
            value: size,
            width: usize::BITS as u8,
        })?;
        let mut content = vec![0u8; len];
        let n = self.inner.get_block(&mut content)?;
        content.truncate(n);
        Ok(content)
    }

    pub fn delete<N: AsRef<str>>(&mut self, name: N) -> Result<()> {
        let name = name.as_ref();
        debug!("Deleting '{}'", name);
        self.inner.del_named(name)
    }

    /// Cut a stream down to `len` bytes
    pub fn truncate<N: AsRef<str>>(&mut self, name: N, len: u64) -> Result<()> {
        let name = name.as_ref();
        let id = self.id_of(name)?;
        self.inner.truncate(id, len)
    }

    /// Move a stream to a new name without copying its data
    pub fn rename<F: AsRef<str>, T: AsRef<str>>(&mut self, from: F, to: T) -> Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        debug!("Renaming '{}' to '{}'", from, to);
        let id = self.id_of(from)?;
        if self.inner.find(to).is_some() {
            return Err(StoreError::StreamExists(to.to_string()));
        }
        catalog::validate_name(to)?;

        let detached = self.inner.detach(id)?;
        if let Err(e) = self.inner.attach(to, detached.clone()) {
            self.inner.attach(from, detached)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn exists<N: AsRef<str>>(&self, name: N) -> bool {
        self.inner.find(name.as_ref()).is_some()
    }

    /// Stream names in creation order
    pub fn list(&self) -> Vec<String> {
        self.inner.list()
    }

    /// Length of a stream in bytes
    pub fn len_of<N: AsRef<str>>(&self, name: N) -> Result<u64> {
        let id = self.id_of(name.as_ref())?;
        self.inner.stream_size(id)
    }

    fn id_of(&self, name: &str) -> Result<StreamId> {
        self.inner
            .find(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Persist the catalog and header
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    /// Commit and close, reporting any failure the drop would swallow
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.inner.commit()
    }

    /// Get access to the underlying engine (for advanced usage)
    pub fn engine(&self) -> &PooledBuffer<Backing> {
        &self.inner
    }

    /// Get mutable access to the underlying engine (for advanced usage)
    pub fn engine_mut(&mut self) -> &mut PooledBuffer<Backing> {
        &mut self.inner
    }

    /// Wrap in a lock for use from several threads
    pub fn into_shared(self) -> SharedContainer {
        Arc::new(Mutex::new(self))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.inner.commit() {
            warn!("Failed to commit container on drop: {}", e);
        }
    }
}

/// Builder for creating or opening containers with custom settings
///
/// # Examples
///
/// ```rust,no_run
/// use cluster_store::ContainerBuilder;
///
/// # fn main() -> cluster_store::Result<()> {
/// let mut store = ContainerBuilder::new()
///     .path("/data/drawing.store")
///     .cluster_capacity(1022)
///     .format_version(7)
///     .create()?;
///
/// store.write("data", b"content")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    path: Option<PathBuf>,
    config: StoreConfig,
    versions: Option<VersionContainer>,
}

impl ContainerBuilder {
    /// Create a new builder with default settings (in memory)
    pub fn new() -> Self {
        ContainerBuilder {
            path: None,
            config: StoreConfig::default(),
            versions: None,
        }
    }

    /// Back the container with a file
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replace all settings at once
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cluster_capacity(mut self, capacity: u16) -> Self {
        self.config.cluster_capacity = capacity;
        self
    }

    pub fn storage_version(mut self, version: u16) -> Self {
        self.config.storage_version = version;
        self
    }

    pub fn format_version(mut self, version: u32) -> Self {
        self.config.format_version = version;
        self
    }

    pub fn max_clusters(mut self, max: u64) -> Self {
        self.config.max_clusters = Some(max);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.config.buffer_mode = BufferMode::ReadOnly;
        self
    }

    /// Open in best-effort recovery mode
    pub fn recovery(mut self) -> Self {
        self.config.recovery = true;
        self
    }

    /// Versions streams are written under (defaults to the storage version)
    pub fn versions(mut self, versions: VersionContainer) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Create a new container
    pub fn create(self) -> Result<Container> {
        let mut container = match &self.path {
            Some(path) => Container::create_with(path, self.config)?,
            None => Container::in_memory(self.config)?,
        };
        if let Some(versions) = self.versions {
            container.set_versions(versions)?;
        }
        Ok(container)
    }

    /// Open an existing container file
    pub fn open(self) -> Result<Container> {
        let path = self
            .path
            .ok_or_else(|| StoreError::InvalidConfig("path must be set to open".to_string()))?;
        let mut container = Container::open_with(&path, self.config)?;
        if let Some(versions) = self.versions {
            container.set_versions(versions)?;
        }
        Ok(container)
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StoreConfig {
        StoreConfig {
            cluster_capacity: 32,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_write_append_read() {
        let mut store = Container::in_memory(small()).unwrap();
        store.write("s", b"hello").unwrap();
        store.append("s", b", world").unwrap();
        assert_eq!(store.read("s").unwrap(), b"hello, world");
        assert_eq!(store.len_of("s").unwrap(), 12);

        store.append("fresh", b"x").unwrap();
        assert_eq!(store.list(), vec!["s".to_string(), "fresh".to_string()]);
    }

    #[test]
    fn test_rename() {
        let mut store = Container::in_memory(small()).unwrap();
        store.write("a", &[1u8; 100]).unwrap();
        store.write("b", b"b").unwrap();

        assert!(matches!(
            store.rename("a", "b"),
            Err(StoreError::StreamExists(_))
        ));
        assert!(matches!(
            store.rename("zzz", "c"),
            Err(StoreError::NotFound(_))
        ));

        store.rename("a", "c").unwrap();
        assert!(!store.exists("a"));
        assert_eq!(store.read("c").unwrap(), vec![1u8; 100]);
        store.engine().check_integrity().unwrap();
    }

    #[test]
    fn test_delete_and_truncate() {
        let mut store = Container::in_memory(small()).unwrap();
        store.write("a", &[7u8; 70]).unwrap();
        store.truncate("a", 33).unwrap();
        assert_eq!(store.read("a").unwrap(), vec![7u8; 33]);
        assert_eq!(store.engine().free_pool().len(), 1);

        store.delete("a").unwrap();
        assert!(!store.exists("a"));
        assert!(matches!(store.delete("a"), Err(StoreError::NotFound(_))));
        assert!(store.engine().state().contains(IoState::NOT_FOUND));
    }

    #[test]
    fn test_into_bytes_and_reopen() {
        let mut store = Container::in_memory(small()).unwrap();
        store.write("doc", b"persisted").unwrap();
        let image = store.into_bytes().unwrap();

        let mut store = Container::from_bytes(image, StoreConfig::read_only()).unwrap();
        assert_eq!(store.read("doc").unwrap(), b"persisted");
        assert!(matches!(
            store.write("doc", b"nope"),
            Err(StoreError::WriteProtected)
        ));
    }

    #[test]
    fn test_builder_versions() {
        let mut store = ContainerBuilder::new()
            .cluster_capacity(64)
            .format_version(3)
            .versions(VersionContainer::current().with_app(9))
            .create()
            .unwrap();
        store.write("s", b"v9").unwrap();

        let id = store.engine().find("s").unwrap();
        assert_eq!(store.engine().stream_versions(id).unwrap().app(0), Some(9));
        assert_eq!(store.engine().format_version(), 3);

        store
            .set_versions(VersionContainer::current().with_app(8))
            .unwrap();
        assert!(matches!(
            store.read("s"),
            Err(StoreError::StreamVersion { .. })
        ));
    }

    #[test]
    fn test_builder_open_requires_path() {
        assert!(matches!(
            ContainerBuilder::new().open(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shared_handle() {
        let shared = Container::in_memory(small()).unwrap().into_shared();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    shared
                        .lock()
                        .write(format!("stream-{}", i), &[i as u8; 50])
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut store = shared.lock();
        assert_eq!(store.list().len(), 4);
        assert_eq!(store.read("stream-2").unwrap(), vec![2u8; 50]);
    }
}
