//! Buffering engine
//!
//! [`StreamBuffer`] owns the master cluster table, the stream registry and a
//! single cursor. Exactly one stream is active at a time; bytes move through
//! a one-cluster window that is loaded lazily and written back whenever the
//! cursor leaves the cluster, seeks, or the stream is closed.
//!
//! # Medium layout
//!
//! ```text
//! 0                      container header (HEADER_SIZE bytes)
//! HEADER_SIZE + i * slot cluster i: used u16, then capacity content bytes
//! ```

use crate::allocator::{AppendOnly, ClusterAllocator, FreePool};
use crate::catalog::{
    decode_entries, decode_index_cluster, encode_index_cluster, index_entries_per_cluster,
    validate_name, Registry, StreamEntry, StreamId,
};
use crate::cluster::{Cluster, ClusterIndex, ClusterTable};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::file_space::FileSpace;
use crate::header::{CatalogRoot, ContainerHeader, CLUSTER_PREFIX, HEADER_SIZE};
use crate::medium::Medium;
use crate::mode::{BufferMode, OpenMode};
use crate::record::ByteStream;
use crate::state::IoState;
use crate::version::{SpaceLayout, VersionContainer};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// `lseek` target meaning "end of stream"
pub const SEEK_END: u64 = u64::MAX;

/// Engine that only ever appends clusters
pub type SeqBuffer<M> = StreamBuffer<M, AppendOnly>;

/// Engine with a free-cluster pool (see the `store` module)
pub type PooledBuffer<M> = StreamBuffer<M, FreePool>;

/// Which way the active cursor moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowState {
    /// Window does not hold the cursor's cluster
    Unloaded,
    /// Window matches the medium
    Clean,
    /// Window holds bytes not yet written back
    Dirty,
}

#[derive(Debug)]
struct Cursor {
    stream: StreamId,
    direction: Direction,
    mode: OpenMode,
    /// Widths for counts written through the cursor
    layout: SpaceLayout,
    /// Position of the current cluster within the stream's file space
    cluster_pos: usize,
    /// Offset of the next byte within the current cluster
    next: usize,
    window: WindowState,
    /// Logical stream length as seen through this cursor
    size: u64,
    recovery: bool,
}

impl Cursor {
    fn tell(&self, cap: u64) -> u64 {
        self.cluster_pos as u64 * cap + self.next as u64
    }
}

/// Bytes of stream cluster `pos` that lie inside a stream of `size` bytes
fn extent(size: u64, pos: usize, cap: u64) -> u64 {
    size.saturating_sub(pos as u64 * cap).min(cap)
}

/// Read the content of cluster `index` into `buf`, returning its used length
fn read_record<M: Medium>(
    medium: &mut M,
    table: &ClusterTable,
    index: ClusterIndex,
    buf: &mut [u8],
) -> Result<u16> {
    let cluster = table.resolve(index)?;
    let used = (cluster.used as usize).min(buf.len());
    medium
        .read_at(cluster.location + CLUSTER_PREFIX as u64, &mut buf[..used])
        .map_err(|source| StoreError::ClusterRead {
            location: cluster.location,
            source,
        })?;
    Ok(cluster.used)
}

/// Write `content` as the record of cluster `index` and update its used length
fn write_record<M: Medium>(
    medium: &mut M,
    table: &mut ClusterTable,
    index: ClusterIndex,
    content: &[u8],
) -> Result<()> {
    let cluster = table.resolve(index)?;
    let mut record = Vec::with_capacity(CLUSTER_PREFIX + content.len());
    record.extend_from_slice(&(content.len() as u16).to_le_bytes());
    record.extend_from_slice(content);
    medium
        .write_at(cluster.location, &record)
        .map_err(|source| StoreError::ClusterWrite {
            location: cluster.location,
            source,
        })?;
    if let Some(slot) = table.get_mut(index) {
        slot.used = content.len() as u16;
    }
    Ok(())
}

/// Sequential multi-stream buffering engine
///
/// Every fallible public operation returns a [`Result`] and also ORs the
/// failure into a cumulative [`IoState`] mask, which stays set until
/// [`StreamBuffer::clear_state`].
pub struct StreamBuffer<M: Medium, A: ClusterAllocator = AppendOnly> {
    medium: M,
    header: ContainerHeader,
    table: ClusterTable,
    registry: Registry,
    allocator: A,
    cursor: Option<Cursor>,
    window: Vec<u8>,
    state: IoState,
    mode: BufferMode,
    config: StoreConfig,
    /// Registry or header changed since the catalog was last written
    dirty: bool,
    /// A stream asked for compaction on close
    compact_pending: bool,
    /// Index clusters of the committed catalog, in chain order
    catalog_chain: Vec<ClusterIndex>,
    /// Retired catalog clusters the next catalog is written into when the
    /// allocator does not reclaim
    catalog_spare: Vec<ClusterIndex>,
}

impl<M: Medium, A: ClusterAllocator + Default> StreamBuffer<M, A> {
    /// Initialize an empty container on `medium`
    pub fn create(mut medium: M, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if !medium.is_writable() || !config.buffer_mode.is_writable() {
            return Err(StoreError::WriteProtected);
        }

        let mut header = ContainerHeader::new(config.storage_version, config.cluster_capacity);
        header.format_version = config.format_version;

        medium.set_len(HEADER_SIZE as u64)?;
        let mut table = ClusterTable::new();
        table.reserve(config.reserve_clusters)?;
        let registry = Registry::new(VersionContainer::new(header.storage_version));

        let mut buffer = Self::assemble(medium, header, table, registry, config);
        buffer.dirty = true;
        buffer.persist()?;

        info!(
            "Created container: storage v{}, {} byte clusters",
            buffer.header.storage_version, buffer.header.cluster_capacity
        );
        Ok(buffer)
    }

    /// Open an existing container, rebuilding the master table from the
    /// cluster records and the registry from the catalog stream
    pub fn open_container(mut medium: M, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let len = medium.len()?;
        if len < HEADER_SIZE as u64 {
            return Err(StoreError::BadSignature);
        }
        let mut raw = vec![0u8; HEADER_SIZE];
        medium
            .read_at(0, &mut raw)
            .map_err(|source| StoreError::ClusterRead {
                location: 0,
                source,
            })?;
        let header = ContainerHeader::from_bytes(&raw)?;

        let mut state = IoState::empty();
        let table = Self::scan_table(&mut medium, &header, &config, &mut state)?;
        let registry = Registry::new(VersionContainer::new(header.storage_version));

        let mut buffer = Self::assemble(medium, header, table, registry, config);
        buffer.state = state;
        if !buffer.medium.is_writable() {
            buffer.mode = BufferMode::ReadOnly;
        }

        buffer.load_catalog()?;
        buffer.rebuild_allocator();

        info!(
            "Opened container: {} streams, {} clusters, {} free",
            buffer.registry.len(),
            buffer.table.len(),
            buffer.allocator.free_indices().len()
        );
        Ok(buffer)
    }

    fn assemble(
        medium: M,
        header: ContainerHeader,
        table: ClusterTable,
        registry: Registry,
        config: StoreConfig,
    ) -> Self {
        StreamBuffer {
            window: vec![0u8; header.cluster_capacity as usize],
            medium,
            header,
            table,
            registry,
            allocator: A::default(),
            cursor: None,
            state: IoState::empty(),
            mode: config.buffer_mode,
            config,
            dirty: false,
            compact_pending: false,
            catalog_chain: Vec::new(),
            catalog_spare: Vec::new(),
        }
    }

    fn scan_table(
        medium: &mut M,
        header: &ContainerHeader,
        config: &StoreConfig,
        state: &mut IoState,
    ) -> Result<ClusterTable> {
        let slot = header.slot_size();
        let available = (medium.len()? - HEADER_SIZE as u64) / slot;
        let mut count = header.cluster_count;
        if count > available {
            if !config.recovery {
                return Err(StoreError::BadData(format!(
                    "header lists {} clusters, medium holds {}",
                    count, available
                )));
            }
            warn!(
                "Container truncated: header lists {} clusters, medium holds {}",
                count, available
            );
            *state |= IoState::SKIPPED_UNKNOWN;
            count = available;
        }

        let mut table = ClusterTable::new();
        let wanted = usize::try_from(count).map_err(|_| StoreError::Underflow64To32 {
            value: count,
            width: usize::BITS as u8,
        })?;
        table.reserve(wanted.saturating_add(config.reserve_clusters))?;

        let mut prefix = [0u8; CLUSTER_PREFIX];
        for index in 0..count {
            let location = header.location_of(index);
            medium
                .read_at(location, &mut prefix)
                .map_err(|source| StoreError::ClusterRead { location, source })?;
            let mut used = u16::from_le_bytes(prefix);
            if used > header.cluster_capacity {
                if !config.recovery {
                    return Err(StoreError::BadData(format!(
                        "cluster {} claims {} bytes, capacity is {}",
                        index, used, header.cluster_capacity
                    )));
                }
                warn!("Cluster {} has invalid length {}, treating as empty", index, used);
                *state |= IoState::SKIPPED_UNKNOWN;
                used = 0;
            }
            table.add_value(Cluster::new(location, used));
        }

        Ok(table)
    }

    fn load_catalog(&mut self) -> Result<()> {
        let root = self.header.catalog;
        if root.head.is_none() {
            return Ok(());
        }
        let layout = SpaceLayout::for_version(self.header.storage_version)?;
        let (catalog, chain) = self
            .read_catalog_chain(root, layout)
            .map_err(|e| StoreError::CantReadCatalog(e.to_string()))?;
        self.verify_space(&catalog)
            .map_err(|e| StoreError::CantReadCatalog(e.to_string()))?;
        self.registry.catalog_mut().space = catalog;
        self.catalog_chain = chain;

        let bytes = self
            .read_whole(self.registry.catalog_id())
            .map_err(|e| StoreError::CantReadCatalog(e.to_string()))?;
        let entries =
            decode_entries(&bytes, layout).map_err(|e| StoreError::CantReadCatalog(e.to_string()))?;

        let mut seen: HashSet<ClusterIndex> = self
            .registry
            .catalog()
            .space
            .indices()
            .iter()
            .chain(&self.catalog_chain)
            .copied()
            .collect();
        // Used lengths are checked when a stream is opened, so one damaged
        // stream does not make the whole container unreadable
        for entry in entries {
            let mut local = HashSet::with_capacity(entry.space.len());
            let check = entry.space.indices().iter().try_for_each(|&index| {
                self.table.resolve(index)?;
                if seen.contains(&index) || !local.insert(index) {
                    return Err(StoreError::BadData(format!(
                        "cluster {} is owned twice",
                        index
                    )));
                }
                Ok(())
            });
            if let Err(e) = check {
                if !self.config.recovery {
                    return Err(StoreError::CantReadCatalog(format!(
                        "stream '{}': {}",
                        entry.name, e
                    )));
                }
                warn!("Skipping unreadable stream '{}': {}", entry.name, e);
                self.state |= IoState::SKIPPED_UNKNOWN;
                continue;
            }

            seen.extend(local);
            self.registry
                .insert(entry)
                .map_err(|e| StoreError::CantReadCatalog(e.to_string()))?;
        }

        Ok(())
    }

    /// Follow the index chain from `root`, returning the catalog's file
    /// space and the index clusters in chain order
    fn read_catalog_chain(
        &mut self,
        root: CatalogRoot,
        layout: SpaceLayout,
    ) -> Result<(FileSpace, Vec<ClusterIndex>)> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut indices = Vec::new();
        let mut next = root.head;

        while let Some(index) = next {
            if !visited.insert(index) {
                return Err(StoreError::BadData(format!(
                    "catalog index chain loops at cluster {}",
                    index
                )));
            }
            let content = self.read_cluster(index)?;
            let (link, entries) = decode_index_cluster(&content, layout)?;
            if entries.is_empty() {
                return Err(StoreError::BadData(format!(
                    "catalog index cluster {} lists nothing",
                    index
                )));
            }
            indices.extend(entries);
            if indices.len() as u64 > root.clusters {
                return Err(StoreError::BadData(format!(
                    "catalog index chain lists more than {} clusters",
                    root.clusters
                )));
            }
            chain.push(index);
            next = link;
        }

        if indices.len() as u64 != root.clusters {
            return Err(StoreError::BadData(format!(
                "catalog index chain lists {} clusters, header expects {}",
                indices.len(),
                root.clusters
            )));
        }
        if let Some(index) = indices.iter().find(|&i| visited.contains(i)) {
            return Err(StoreError::BadData(format!(
                "cluster {} is both a catalog and an index cluster",
                index
            )));
        }
        Ok((FileSpace::from_parts(indices, root.last_used), chain))
    }
}

impl<M: Medium, A: ClusterAllocator> StreamBuffer<M, A> {
    // ---------------------------------------------------------------------
    // State
    // ---------------------------------------------------------------------

    /// Record the failure of `result` in the state mask
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.state |= e.state_flag();
        }
        result
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    /// No failure recorded since the last [`StreamBuffer::clear_state`]
    pub fn good(&self) -> bool {
        self.state.is_good()
    }

    pub fn eof(&self) -> bool {
        self.state.is_eof()
    }

    pub fn clear_state(&mut self) {
        self.state = IoState::empty();
    }

    /// Set state bits on behalf of a layer built on top of the engine
    pub fn raise_state(&mut self, flags: IoState) {
        self.state |= flags;
    }

    // ---------------------------------------------------------------------
    // Container
    // ---------------------------------------------------------------------

    pub fn storage_version(&self) -> u16 {
        self.header.storage_version
    }

    /// Change the layout the catalog is written with from the next flush on
    pub fn set_storage_version(&mut self, version: u16) -> Result<()> {
        let result = self.ensure_writable().and_then(|_| {
            SpaceLayout::for_version(version)?;
            self.header.storage_version = version;
            self.registry.catalog_mut().versions = VersionContainer::new(version);
            self.dirty = true;
            Ok(())
        });
        self.track(result)
    }

    pub fn format_version(&self) -> u32 {
        self.header.format_version
    }

    pub fn set_format_version(&mut self, version: u32) -> Result<()> {
        let result = self.ensure_writable().map(|_| {
            self.header.format_version = version;
            self.dirty = true;
        });
        self.track(result)
    }

    /// Length of the backing medium in bytes
    pub fn file_len(&mut self) -> Result<u64> {
        let result = self.medium.len().map_err(StoreError::from);
        self.track(result)
    }

    /// Path of the backing file, `None` for memory images
    pub fn file_name(&self) -> Option<&Path> {
        self.medium.path()
    }

    pub fn cluster_capacity(&self) -> u16 {
        self.header.cluster_capacity
    }

    pub fn cluster_count(&self) -> usize {
        self.table.len()
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.mode
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn table(&self) -> &ClusterTable {
        &self.table
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    /// Clusters held by the allocator for reuse
    pub fn free_clusters(&self) -> &[ClusterIndex] {
        self.allocator.free_indices()
    }

    /// Names of every stream, catalog excluded
    pub fn list(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn find(&self, name: &str) -> Option<StreamId> {
        self.registry.find(name)
    }

    /// Whether `id` is a live stream of this container
    pub fn owns(&self, id: StreamId) -> bool {
        !id.is_catalog() && self.registry.owns(id)
    }

    pub fn stream_name(&self, id: StreamId) -> Option<&str> {
        self.registry
            .get(id)
            .filter(|_| !id.is_catalog())
            .map(|e| e.name.as_str())
    }

    /// Index clusters that locate the committed catalog
    pub fn catalog_chain(&self) -> &[ClusterIndex] {
        &self.catalog_chain
    }

    pub fn file_space(&self, id: StreamId) -> Option<&FileSpace> {
        self.registry.get(id).map(|e| &e.space)
    }

    pub fn stream_versions(&self, id: StreamId) -> Option<&VersionContainer> {
        self.registry.get(id).map(|e| &e.versions)
    }

    /// Committed length of a stream
    ///
    /// For the active write stream this includes bytes still in the window.
    pub fn stream_size(&self, id: StreamId) -> Result<u64> {
        if let Some(c) = self.cursor.as_ref().filter(|c| c.stream == id) {
            return Ok(c.size);
        }
        self.registry
            .get(id)
            .filter(|_| !id.is_catalog())
            .map(|e| e.space.size(self.header.cluster_capacity))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Check that every cluster of a stream resolves in the master table,
    /// appears once, and holds the bytes the stream's size implies
    pub fn is_good_file(&self, id: StreamId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|e| self.verify_space(&e.space).is_ok())
    }

    pub(crate) fn verify_space(&self, space: &FileSpace) -> Result<()> {
        let cap = self.cap();
        if space.is_empty() {
            return Ok(());
        }
        if space.last_used() == 0 || space.last_used() as u64 > cap {
            return Err(StoreError::BadData(format!(
                "last cluster claims {} bytes of {}",
                space.last_used(),
                cap
            )));
        }

        let size = space.size(self.header.cluster_capacity);
        let mut seen = HashSet::with_capacity(space.len());
        for (pos, &index) in space.indices().iter().enumerate() {
            let cluster = self.table.resolve(index)?;
            if !seen.insert(index) {
                return Err(StoreError::BadData(format!(
                    "cluster {} listed twice",
                    index
                )));
            }
            if (cluster.used as u64) < extent(size, pos, cap) {
                return Err(StoreError::BadData(format!(
                    "cluster {} holds {} bytes, stream needs {}",
                    index,
                    cluster.used,
                    extent(size, pos, cap)
                )));
            }
        }
        Ok(())
    }

    /// Verify that no cluster is owned twice across every stream, the
    /// catalog with its index chain, and the free clusters
    pub fn check_integrity(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (id, space) in self.registry.spaces() {
            for &index in space.indices() {
                self.table.resolve(index)?;
                if !seen.insert(index) {
                    return Err(StoreError::BadData(format!(
                        "cluster {} of stream {} is owned twice",
                        index, id
                    )));
                }
            }
        }
        for &index in &self.catalog_chain {
            self.table.resolve(index)?;
            if !seen.insert(index) {
                return Err(StoreError::BadData(format!(
                    "catalog index cluster {} is owned twice",
                    index
                )));
            }
        }
        let unowned = self.allocator.free_indices().iter().chain(&self.catalog_spare);
        for &index in unowned {
            self.table.resolve(index)?;
            if !seen.insert(index) {
                return Err(StoreError::BadData(format!(
                    "free cluster {} is still owned",
                    index
                )));
            }
        }
        Ok(())
    }

    /// Write back the window, the catalog and the header
    pub fn flush(&mut self) -> Result<()> {
        let result = self.persist();
        self.track(result)
    }

    /// Close the active stream, run pending compaction and persist
    /// everything, leaving the container open
    pub fn commit(&mut self) -> Result<()> {
        let result = self.commit_inner();
        self.track(result)
    }

    /// [`StreamBuffer::commit`], then hand back the medium
    pub fn finish(mut self) -> Result<M> {
        self.commit_inner()?;
        info!(
            "Closed container: {} streams, {} clusters",
            self.registry.len(),
            self.table.len()
        );
        Ok(self.medium)
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.close_inner()?;
        if A::RECLAIMS && self.compact_pending && self.mode.is_writable() {
            self.compact_clusters()?;
        }
        self.persist()
    }

    // ---------------------------------------------------------------------
    // Stream open/close
    // ---------------------------------------------------------------------

    /// Open a named stream with a full integrity check
    ///
    /// `versions` are the versions the caller understands when reading and
    /// the versions recorded for the stream when it is (re)written.
    pub fn open(
        &mut self,
        name: &str,
        mode: OpenMode,
        versions: &VersionContainer,
    ) -> Result<StreamId> {
        let result = self.open_named(name, mode, versions, true);
        self.track(result)
    }

    /// Open a named stream without verifying its clusters up front
    ///
    /// Corruption is only noticed when the damaged cluster is reached, and
    /// reads before that point may return data from a corrupted stream.
    pub fn open_unchecked(
        &mut self,
        name: &str,
        mode: OpenMode,
        versions: &VersionContainer,
    ) -> Result<StreamId> {
        let result = self.open_named(name, mode, versions, false);
        self.track(result)
    }

    /// Open a stream by handle
    pub fn open_id(
        &mut self,
        id: StreamId,
        mode: OpenMode,
        versions: &VersionContainer,
    ) -> Result<()> {
        let result = self.open_stream(id, mode, versions, true);
        self.track(result)
    }

    /// Commit the window and detach the cursor
    pub fn close(&mut self) -> Result<()> {
        let result = self.close_inner();
        self.track(result)
    }

    /// Stream the cursor is attached to
    pub fn active_stream(&self) -> Option<StreamId> {
        self.cursor.as_ref().map(|c| c.stream)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.cursor.as_ref().map(|c| c.direction)
    }

    fn open_named(
        &mut self,
        name: &str,
        mode: OpenMode,
        versions: &VersionContainer,
        full_check: bool,
    ) -> Result<StreamId> {
        mode.validate()?;
        versions.validate()?;
        validate_name(name)?;
        self.close_inner()?;

        let (id, created) = match self.registry.find(name) {
            Some(_) if mode.contains(OpenMode::CREATE_NEW) => {
                return Err(StoreError::StreamExists(name.to_string()));
            }
            Some(id) => (id, false),
            None if !mode.may_create() => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            None => {
                self.ensure_writable()?;
                let id = self
                    .registry
                    .insert(StreamEntry::new(name, versions.clone()))?;
                self.dirty = true;
                debug!("Created stream '{}' as {}", name, id);
                (id, true)
            }
        };

        if let Err(e) = self.open_stream(id, mode, versions, full_check) {
            if created {
                self.registry.remove(id);
            }
            return Err(e);
        }
        Ok(id)
    }

    fn open_stream(
        &mut self,
        id: StreamId,
        mode: OpenMode,
        versions: &VersionContainer,
        full_check: bool,
    ) -> Result<()> {
        mode.validate()?;
        versions.validate()?;
        if !self.owns(id) {
            return Err(StoreError::AccessViolation(format!(
                "stream {} does not belong to this container",
                id
            )));
        }
        self.close_inner()?;
        if mode.mutates() {
            self.ensure_writable()?;
        }

        let recovery = mode.contains(OpenMode::RECOVERY) || self.config.recovery;
        let (space, written_under) = match self.registry.get(id) {
            Some(e) => (e.space.clone(), e.versions.clone()),
            None => return Err(StoreError::NotFound(id.to_string())),
        };

        if full_check {
            if let Err(e) = self.verify_space(&space) {
                if !recovery {
                    return Err(e);
                }
                warn!("Opening damaged stream {} in recovery mode: {}", id, e);
                self.state |= IoState::SKIPPED_UNKNOWN;
            }
        }

        let discard = mode.discards_contents();
        if !discard && !space.is_empty() && !versions.covers(&written_under) {
            return Err(StoreError::StreamVersion {
                stream: self.stream_name(id).unwrap_or_default().to_string(),
                found: written_under.as_slice().to_vec(),
                supported: versions.as_slice().to_vec(),
            });
        }

        let direction = if mode.is_write() {
            Direction::Write
        } else {
            Direction::Read
        };
        let cursor_versions =
            if direction == Direction::Write && (discard || space.is_empty()) {
                versions.clone()
            } else {
                written_under
            };

        if discard && !space.is_empty() {
            let released = match self.registry.get_mut(id) {
                Some(e) => e.space.clear(),
                None => Vec::new(),
            };
            for index in released {
                self.free(index)?;
            }
            self.dirty = true;
        }
        if direction == Direction::Write {
            if let Some(e) = self.registry.get_mut(id) {
                if e.versions != cursor_versions {
                    e.versions = cursor_versions.clone();
                    self.dirty = true;
                }
            }
        }

        self.start_cursor(id, direction, mode, &cursor_versions)?;
        if let Some(c) = self.cursor.as_mut() {
            c.recovery = recovery;
        }
        debug!("Opened stream {} for {:?}", id, direction);
        Ok(())
    }

    fn start_cursor(
        &mut self,
        id: StreamId,
        direction: Direction,
        mode: OpenMode,
        versions: &VersionContainer,
    ) -> Result<()> {
        let layout = versions.layout()?;
        let size = self
            .registry
            .get(id)
            .map(|e| e.space.size(self.header.cluster_capacity))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.cursor = Some(Cursor {
            stream: id,
            direction,
            mode,
            layout,
            cluster_pos: 0,
            next: 0,
            window: WindowState::Unloaded,
            size,
            recovery: self.config.recovery,
        });
        self.state.remove(IoState::EOF);
        Ok(())
    }

    pub(crate) fn close_inner(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            return Ok(());
        }
        let flushed = self.flush_window();
        let Some(c) = self.cursor.take() else {
            return flushed;
        };

        if c.direction == Direction::Write {
            let cap = self.header.cluster_capacity;
            let released = match self.registry.get_mut(c.stream) {
                Some(e) => e.space.fit_to(c.size, cap),
                None => Vec::new(),
            };
            for index in released {
                self.free(index)?;
            }
            if !c.stream.is_catalog() {
                self.dirty = true;
            }
        }

        if !c.stream.is_catalog() {
            let delete = c.mode.contains(OpenMode::DEL_ON_CLOSE)
                || (c.mode.contains(OpenMode::DEL_IF_EMPTY) && c.size == 0);
            if delete {
                self.remove_stream(c.stream)?;
                debug!("Removed stream {} on close", c.stream);
            } else if c.mode.contains(OpenMode::SPEED_ON_CLOSE) {
                self.defragment(c.stream)?;
                self.compact_pending = true;
            }
        }

        debug!("Closed stream {} ({} bytes)", c.stream, c.size);
        flushed
    }

    // ---------------------------------------------------------------------
    // Byte protocol
    // ---------------------------------------------------------------------

    /// Next byte of the active stream, `None` (and `eof`) at its end
    pub fn get_byte(&mut self) -> Result<Option<u8>> {
        let cap = self.cap();
        if let Some(c) = self.cursor.as_mut() {
            if c.direction == Direction::Read
                && c.window != WindowState::Unloaded
                && (c.next as u64) < extent(c.size, c.cluster_pos, cap)
            {
                let byte = self.window[c.next];
                c.next += 1;
                return Ok(Some(byte));
            }
        }

        let mut buf = [0u8; 1];
        let result = self.read_into(&mut buf).map(|n| (n == 1).then_some(buf[0]));
        self.track(result)
    }

    pub fn put_byte(&mut self, byte: u8) -> Result<()> {
        let cap = self.cap();
        if let Some(c) = self.cursor.as_mut() {
            if c.direction == Direction::Write
                && c.window != WindowState::Unloaded
                && (c.next as u64) < cap
            {
                self.window[c.next] = byte;
                c.next += 1;
                c.window = WindowState::Dirty;
                c.size = c.size.max(c.tell(cap));
                return Ok(());
            }
        }

        let result = self.write_from(&[byte]).map(|_| ());
        self.track(result)
    }

    /// Read up to `buf.len()` bytes; fewer only at end of stream
    pub fn get_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.read_into(buf);
        self.track(result)
    }

    pub fn put_block(&mut self, data: &[u8]) -> Result<usize> {
        let result = self.write_from(data);
        self.track(result)
    }

    /// Move to the start of the next cluster if the current one is
    /// exhausted, without transferring a byte
    pub fn advance(&mut self) -> Result<()> {
        let result = match self.cursor {
            Some(_) => self.overflow(),
            None => Err(StoreError::Closed),
        };
        self.track(result)
    }

    /// Logical offset of the cursor within the active stream
    pub fn tell(&mut self) -> Result<u64> {
        let cap = self.cap();
        let result = self.cursor_ref().map(|c| c.tell(cap));
        self.track(result)
    }

    /// Move the cursor to `pos` (or [`SEEK_END`]); returns the new offset
    pub fn lseek(&mut self, pos: u64) -> Result<u64> {
        let result = self.seek_to(pos);
        self.track(result)
    }

    /// Logical length of the active stream
    pub fn size(&mut self) -> Result<u64> {
        let result = self.cursor_ref().map(|c| c.size);
        self.track(result)
    }

    fn cap(&self) -> u64 {
        self.header.cluster_capacity as u64
    }

    fn cursor_ref(&self) -> Result<&Cursor> {
        self.cursor.as_ref().ok_or(StoreError::Closed)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if !self.mode.is_writable() || !self.medium.is_writable() {
            return Err(StoreError::WriteProtected);
        }
        Ok(())
    }

    fn seek_to(&mut self, pos: u64) -> Result<u64> {
        let cap = self.cap();
        let size = self.cursor_ref()?.size;
        let target = if pos == SEEK_END { size } else { pos };
        if target > size {
            return Err(StoreError::SeekOutOfRange { pos: target, size });
        }

        self.flush_window()?;
        let (cluster_pos, next) = if target > 0 && target % cap == 0 {
            (target / cap - 1, cap)
        } else {
            (target / cap, target % cap)
        };
        if let Some(c) = self.cursor.as_mut() {
            c.cluster_pos = cluster_pos as usize;
            c.next = next as usize;
            c.window = WindowState::Unloaded;
        }
        self.state.remove(IoState::EOF);
        Ok(target)
    }

    /// Load the cursor's cluster into the window, returning its used length
    fn load_window(&mut self) -> Result<u16> {
        let c = self.cursor.as_mut().ok_or(StoreError::Closed)?;
        let index = self
            .registry
            .get(c.stream)
            .and_then(|e| e.space.get(c.cluster_pos))
            .ok_or_else(|| {
                StoreError::BadData(format!("stream {} has no cluster {}", c.stream, c.cluster_pos))
            })?;
        self.window.fill(0);
        let used = read_record(&mut self.medium, &self.table, index, &mut self.window)?;
        c.window = WindowState::Clean;
        Ok(used)
    }

    /// Write a dirty window back to its cluster
    fn flush_window(&mut self) -> Result<()> {
        let cap = self.cap();
        let Some(c) = self.cursor.as_mut() else {
            return Ok(());
        };
        if c.window != WindowState::Dirty {
            return Ok(());
        }
        let index = self
            .registry
            .get(c.stream)
            .and_then(|e| e.space.get(c.cluster_pos))
            .ok_or_else(|| {
                StoreError::BadData(format!("stream {} has no cluster {}", c.stream, c.cluster_pos))
            })?;
        let used = extent(c.size, c.cluster_pos, cap) as usize;
        write_record(&mut self.medium, &mut self.table, index, &self.window[..used])?;
        c.window = WindowState::Clean;
        Ok(())
    }

    /// Cross to the next cluster when the window is full
    fn overflow(&mut self) -> Result<()> {
        let cap = self.cap() as usize;
        if self.cursor.as_ref().is_some_and(|c| c.next == cap) {
            self.flush_window()?;
            if let Some(c) = self.cursor.as_mut() {
                c.cluster_pos += 1;
                c.next = 0;
                c.window = WindowState::Unloaded;
            }
        }
        Ok(())
    }

    /// Point the window at the cursor's cluster, allocating it when a write
    /// stream moves past its last cluster
    fn setup_write(&mut self) -> Result<()> {
        let (stream, pos) = match self.cursor.as_ref() {
            Some(c) if c.window == WindowState::Unloaded => (c.stream, c.cluster_pos),
            Some(_) => return Ok(()),
            None => return Err(StoreError::Closed),
        };
        let len = self
            .registry
            .get(stream)
            .map(|e| e.space.len())
            .ok_or_else(|| StoreError::NotFound(stream.to_string()))?;

        if pos < len {
            self.load_window()?;
            return Ok(());
        }

        self.allocate_cluster(stream)?;
        self.window.fill(0);
        if let Some(c) = self.cursor.as_mut() {
            c.window = WindowState::Clean;
        }
        Ok(())
    }

    /// Append one cluster to `stream`, reusing a released one if the
    /// allocator has any
    fn allocate_cluster(&mut self, stream: StreamId) -> Result<ClusterIndex> {
        let after = self
            .registry
            .get(stream)
            .ok_or_else(|| StoreError::NotFound(stream.to_string()))?
            .space
            .last();
        let index = self.take_cluster(after)?;

        match self.registry.get_mut(stream) {
            Some(e) => e.space.add(index),
            None => return Err(StoreError::NotFound(stream.to_string())),
        }
        Ok(index)
    }

    /// Take an unowned cluster, preferring the slot right after `after`,
    /// and grow the table when the allocator has none
    fn take_cluster(&mut self, after: Option<ClusterIndex>) -> Result<ClusterIndex> {
        let slot = self.header.slot_size();
        let preferred = after
            .and_then(|i| self.table.get(i))
            .map(|c| c.location + slot);

        match self.allocator.take(&self.table, preferred) {
            Some(index) => {
                if let Some(cluster) = self.table.get_mut(index) {
                    cluster.used = 0;
                }
                Ok(index)
            }
            None => self.grow_table(),
        }
    }

    /// Add a brand-new cluster slot at the end of the medium
    fn grow_table(&mut self) -> Result<ClusterIndex> {
        let next = self.table.len() as u64;
        if let Some(max) = self.config.max_clusters {
            if next >= max {
                return Err(StoreError::OutOfMemory(format!(
                    "master table limit of {} clusters reached",
                    max
                )));
            }
        }
        self.table.reserve(1)?;
        let location = self.header.location_of(next);
        self.medium.set_len(location + self.header.slot_size())?;
        Ok(self.table.add_value(Cluster::new(location, 0)))
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let cap = self.cap();
        let c = self.cursor_ref()?;
        if c.direction == Direction::Write {
            return Err(StoreError::AccessViolation(format!(
                "stream {} is open for writing",
                c.stream
            )));
        }

        let mut done = 0;
        while done < buf.len() {
            let c = self.cursor.as_mut().ok_or(StoreError::Closed)?;
            if c.tell(cap) >= c.size {
                self.state |= IoState::EOF;
                break;
            }
            if c.next as u64 == cap {
                c.cluster_pos += 1;
                c.next = 0;
                c.window = WindowState::Unloaded;
            }

            if c.window == WindowState::Unloaded {
                let (pos, recovery, stream) = (c.cluster_pos, c.recovery, c.stream);
                let loaded = self.load_window();
                let c = self.cursor.as_mut().ok_or(StoreError::Closed)?;
                match loaded {
                    Ok(used) if (used as u64) < extent(c.size, pos, cap) => {
                        let err = StoreError::BadData(format!(
                            "cluster {} of stream {} holds {} bytes, stream needs {}",
                            pos,
                            stream,
                            used,
                            extent(c.size, pos, cap)
                        ));
                        if !recovery {
                            return Err(err);
                        }
                        warn!("Read aborted: {}", err);
                        c.size = pos as u64 * cap + used as u64;
                        self.state |= IoState::READ_ABORTED;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) if recovery => {
                        warn!("Read aborted at cluster {} of stream {}: {}", pos, stream, e);
                        c.size = pos as u64 * cap;
                        c.window = WindowState::Unloaded;
                        self.state |= IoState::READ_ABORTED;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let c = self.cursor.as_mut().ok_or(StoreError::Closed)?;
            let available = extent(c.size, c.cluster_pos, cap) as usize - c.next;
            let n = available.min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.window[c.next..c.next + n]);
            c.next += n;
            done += n;
        }

        Ok(done)
    }

    fn write_from(&mut self, data: &[u8]) -> Result<usize> {
        let cap = self.cap();
        let c = self.cursor_ref()?;
        if c.direction == Direction::Read {
            return Err(StoreError::AccessViolation(format!(
                "stream {} is open for reading",
                c.stream
            )));
        }

        let mut done = 0;
        while done < data.len() {
            self.overflow()?;
            self.setup_write()?;

            let c = self.cursor.as_mut().ok_or(StoreError::Closed)?;
            let n = (cap as usize - c.next).min(data.len() - done);
            self.window[c.next..c.next + n].copy_from_slice(&data[done..done + n]);
            c.next += n;
            c.window = WindowState::Dirty;
            c.size = c.size.max(c.tell(cap));
            done += n;
        }

        Ok(done)
    }

    // ---------------------------------------------------------------------
    // Cluster bookkeeping
    // ---------------------------------------------------------------------

    /// Return a cluster no stream references to the allocator
    pub(crate) fn free(&mut self, index: ClusterIndex) -> Result<()> {
        self.allocator.release(&self.table, index)
    }

    pub(crate) fn remove_stream(&mut self, id: StreamId) -> Result<StreamEntry> {
        let entry = self
            .registry
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for &index in entry.space.indices() {
            self.free(index)?;
        }
        self.dirty = true;
        Ok(entry)
    }

    pub(crate) fn registry_mut(&mut self) -> &mut Registry {
        self.dirty = true;
        &mut self.registry
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Rewrite the record of a cluster after its stream was shortened
    pub(crate) fn shrink_cluster(&mut self, index: ClusterIndex, used: u16) -> Result<()> {
        let mut content = vec![0u8; self.window.len()];
        read_record(&mut self.medium, &self.table, index, &mut content)?;
        write_record(
            &mut self.medium,
            &mut self.table,
            index,
            &content[..used as usize],
        )
    }

    fn read_cluster(&mut self, index: ClusterIndex) -> Result<Vec<u8>> {
        let mut content = vec![0u8; self.window.len()];
        let used = read_record(&mut self.medium, &self.table, index, &mut content)?;
        content.truncate(used as usize);
        Ok(content)
    }

    /// Move a stream's data so its clusters ascend in physical order
    fn defragment(&mut self, id: StreamId) -> Result<()> {
        let current = match self.registry.get(id) {
            Some(e) => e.space.indices().to_vec(),
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        let mut sorted = current.clone();
        sorted.sort_by_key(|&i| self.table.get(i).copied());
        if sorted == current {
            return Ok(());
        }

        let mut contents = Vec::with_capacity(current.len());
        for &index in &current {
            contents.push(self.read_cluster(index)?);
        }
        for (&index, content) in sorted.iter().zip(&contents) {
            write_record(&mut self.medium, &mut self.table, index, content)?;
        }
        if let Some(e) = self.registry.get_mut(id) {
            e.space.set_indices(sorted);
        }
        self.dirty = true;
        debug!("Defragmented stream {} ({} clusters)", id, current.len());
        Ok(())
    }

    /// Rewrite every live cluster contiguously in registry order, dropping
    /// all free and orphaned slots from the table and the medium
    ///
    /// Streams are first copied past the end of the table and committed
    /// there, then copied to the front and committed again, so the image on
    /// the medium stays readable if either pass fails.
    pub(crate) fn compact_clusters(&mut self) -> Result<()> {
        self.close_inner()?;
        self.ensure_writable()?;
        self.persist()?;
        let before = self.table.len();

        let mut streams = Vec::with_capacity(self.registry.len());
        for (id, space) in self.registry.spaces().filter(|(id, _)| !id.is_catalog()) {
            streams.push((id, space.indices().to_vec()));
        }
        let mut contents = Vec::with_capacity(streams.len());
        for (id, indices) in &streams {
            let mut clusters = Vec::with_capacity(indices.len());
            for &index in indices {
                clusters.push(self.read_cluster(index)?);
            }
            contents.push((*id, clusters));
        }

        self.allocator.rebuild(&self.table, Vec::new());
        self.relocate_streams(&contents)?;
        self.rebuild_allocator();
        self.relocate_streams(&contents)?;

        let end = self
            .registry
            .spaces()
            .flat_map(|(_, space)| space.indices())
            .chain(&self.catalog_chain)
            .max()
            .map_or(0, |&index| index + 1);
        let end = usize::try_from(end).map_err(|_| StoreError::Underflow64To32 {
            value: end,
            width: usize::BITS as u8,
        })?;
        self.table.truncate(end);
        self.table.adjust();
        self.rebuild_allocator();
        self.write_header()?;
        self.medium.sync()?;
        self.medium.set_len(self.header.location_of(end as u64))?;

        self.dirty = false;
        self.compact_pending = false;
        info!("Compacted container: {} -> {} clusters", before, end);
        Ok(())
    }

    /// Write `contents` into clusters handed out by the allocator and
    /// commit a catalog naming them
    ///
    /// On failure before the commit the registry goes back to the clusters
    /// the medium still describes.
    fn relocate_streams(&mut self, contents: &[(StreamId, Vec<Vec<u8>>)]) -> Result<()> {
        let root = self.header.catalog;
        let committed: Vec<(StreamId, Vec<ClusterIndex>)> = contents
            .iter()
            .filter_map(|(id, _)| {
                self.registry
                    .get(*id)
                    .map(|e| (*id, e.space.indices().to_vec()))
            })
            .collect();

        let result = self
            .place_streams(contents)
            .and_then(|()| self.write_catalog());
        if let Err(e) = result {
            if self.header.catalog == root {
                for (id, indices) in committed {
                    if let Some(entry) = self.registry.get_mut(id) {
                        entry.space.set_indices(indices);
                    }
                }
            }
            self.rebuild_allocator();
            return Err(e);
        }
        Ok(())
    }

    fn place_streams(&mut self, contents: &[(StreamId, Vec<Vec<u8>>)]) -> Result<()> {
        for (id, clusters) in contents {
            let mut indices: Vec<ClusterIndex> = Vec::with_capacity(clusters.len());
            for content in clusters {
                let index = self.take_cluster(indices.last().copied())?;
                indices.push(index);
                write_record(&mut self.medium, &mut self.table, index, content)?;
            }
            if let Some(entry) = self.registry.get_mut(*id) {
                entry.space.set_indices(indices);
            }
        }
        Ok(())
    }

    /// Hand every cluster nothing references to the allocator
    fn rebuild_allocator(&mut self) {
        let mut referenced = vec![false; self.table.len()];
        let owned = self
            .registry
            .spaces()
            .flat_map(|(_, space)| space.indices())
            .chain(&self.catalog_chain)
            .chain(&self.catalog_spare);
        for &index in owned {
            if let Some(flag) = usize::try_from(index)
                .ok()
                .and_then(|i| referenced.get_mut(i))
            {
                *flag = true;
            }
        }
        let unreferenced = referenced
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| i as ClusterIndex)
            .collect();
        self.allocator.rebuild(&self.table, unreferenced);
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    fn persist(&mut self) -> Result<()> {
        if !self.mode.is_writable() || !self.medium.is_writable() {
            return Ok(());
        }
        self.flush_window()?;
        self.sync_active_space()?;

        if self.dirty {
            self.write_catalog()?;
            self.dirty = false;
        } else {
            self.write_header()?;
        }
        self.medium.sync()?;
        Ok(())
    }

    /// Bring the active write stream's file space up to the cursor's size
    fn sync_active_space(&mut self) -> Result<()> {
        let cap = self.header.cluster_capacity;
        let Some((stream, size)) = self
            .cursor
            .as_ref()
            .filter(|c| c.direction == Direction::Write)
            .map(|c| (c.stream, c.size))
        else {
            return Ok(());
        };
        let released = match self.registry.get_mut(stream) {
            Some(e) => e.space.fit_to(size, cap),
            None => Vec::new(),
        };
        for index in released {
            self.free(index)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Write the registry as a new catalog generation and point the header
    /// at it
    ///
    /// The previous generation is only retired once the header naming the
    /// new one is on the medium, so a failed write leaves the committed
    /// catalog untouched.
    fn write_catalog(&mut self) -> Result<()> {
        let layout = SpaceLayout::for_version(self.header.storage_version)?;
        let bytes = self
            .registry
            .encode(layout)
            .map_err(|e| StoreError::CantWriteCatalog(e.to_string()))?;

        let previous = self.header.catalog;
        let mut placed = Vec::new();
        let written = self.write_generation(&bytes, layout, &mut placed);
        let (space, chain) = match written {
            Ok(generation) => generation,
            Err(e) => {
                self.header.catalog = previous;
                self.give_back(placed);
                return Err(match e {
                    StoreError::CantWriteCatalog(_) => e,
                    other => StoreError::CantWriteCatalog(other.to_string()),
                });
            }
        };

        let old_space = std::mem::replace(&mut self.registry.catalog_mut().space, space);
        let old_chain = std::mem::replace(&mut self.catalog_chain, chain);
        // Retired clusters may be reused right away
        self.medium.sync()?;
        let mut retired = old_space.indices().to_vec();
        retired.extend(old_chain);
        self.give_back(retired);

        debug!(
            "Wrote catalog: {} bytes in {} clusters",
            bytes.len(),
            self.registry.catalog().space.len()
        );
        Ok(())
    }

    /// Place `bytes` and its index chain in fresh clusters, then commit the
    /// header; every cluster taken is recorded in `placed`
    fn write_generation(
        &mut self,
        bytes: &[u8],
        layout: SpaceLayout,
        placed: &mut Vec<ClusterIndex>,
    ) -> Result<(FileSpace, Vec<ClusterIndex>)> {
        let cap = self.header.cluster_capacity;
        let per = index_entries_per_cluster(cap, layout);
        if per == 0 {
            return Err(StoreError::CantWriteCatalog(format!(
                "{} byte clusters cannot hold a catalog index",
                cap
            )));
        }

        let mut space = FileSpace::new();
        for chunk in bytes.chunks(cap as usize) {
            let index = self.take_catalog_cluster()?;
            placed.push(index);
            write_record(&mut self.medium, &mut self.table, index, chunk)?;
            space.add(index);
            space.set_last_used(chunk.len() as u16);
        }

        let links = space.len().div_ceil(per);
        let mut chain = Vec::with_capacity(links);
        for _ in 0..links {
            let index = self.take_catalog_cluster()?;
            placed.push(index);
            chain.push(index);
        }
        for (pos, entries) in space.indices().chunks(per).enumerate() {
            let content = encode_index_cluster(chain.get(pos + 1).copied(), entries, layout)?;
            write_record(&mut self.medium, &mut self.table, chain[pos], &content)?;
        }

        self.medium.sync()?;
        self.header.catalog = CatalogRoot {
            head: chain.first().copied(),
            clusters: space.len() as u64,
            last_used: space.last_used(),
        };
        self.write_header()?;
        Ok((space, chain))
    }

    fn take_catalog_cluster(&mut self) -> Result<ClusterIndex> {
        match self.catalog_spare.pop() {
            Some(index) => Ok(index),
            None => self.take_cluster(None),
        }
    }

    /// Release clusters the committed catalog no longer uses
    fn give_back(&mut self, clusters: Vec<ClusterIndex>) {
        if !A::RECLAIMS {
            self.catalog_spare.extend(clusters);
            return;
        }
        for index in clusters {
            if let Err(e) = self.free(index) {
                warn!("Could not release catalog cluster {}: {}", index, e);
            }
        }
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.cluster_count = self.table.len() as u64;
        let bytes = self.header.to_bytes()?;
        self.medium
            .write_at(0, &bytes)
            .map_err(|source| StoreError::ClusterWrite {
                location: 0,
                source,
            })
    }

    /// Read a whole stream, ignoring versions (catalog bootstrap)
    fn read_whole(&mut self, id: StreamId) -> Result<Vec<u8>> {
        let versions = self
            .registry
            .get(id)
            .map(|e| e.versions.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.start_cursor(id, Direction::Read, OpenMode::IN, &versions)?;

        let size = self.cursor_ref()?.size;
        let len = usize::try_from(size).map_err(|_| StoreError::Underflow64To32 {
            value: size,
            width: usize::BITS as u8,
        })?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|e| {
            StoreError::OutOfMemory(format!("cannot buffer {} byte stream: {}", len, e))
        })?;
        bytes.resize(len, 0);

        let result = self.read_into(&mut bytes);
        self.cursor = None;
        let n = result?;
        bytes.truncate(n);
        Ok(bytes)
    }
}

impl<M: Medium, A: ClusterAllocator> ByteStream for StreamBuffer<M, A> {
    fn get_byte(&mut self) -> Result<Option<u8>> {
        StreamBuffer::get_byte(self)
    }

    fn put_byte(&mut self, byte: u8) -> Result<()> {
        StreamBuffer::put_byte(self, byte)
    }

    fn get_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        StreamBuffer::get_block(self, buf)
    }

    fn put_block(&mut self, data: &[u8]) -> Result<usize> {
        StreamBuffer::put_block(self, data)
    }

    fn active_layout(&self) -> Result<SpaceLayout> {
        self.cursor_ref().map(|c| c.layout)
    }

    fn record_error(&mut self, err: StoreError) -> StoreError {
        self.state |= err.state_flag();
        err
    }
}

impl<M: Medium, A: ClusterAllocator> std::io::Read for StreamBuffer<M, A> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.get_block(buf)?)
    }
}

impl<M: Medium, A: ClusterAllocator> std::io::Write for StreamBuffer<M, A> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.put_block(buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(StreamBuffer::flush(self)?)
    }
}

impl<M: Medium, A: ClusterAllocator> std::fmt::Debug for StreamBuffer<M, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("storage_version", &self.header.storage_version)
            .field("cluster_capacity", &self.header.cluster_capacity)
            .field("clusters", &self.table.len())
            .field("streams", &self.registry.len())
            .field("active", &self.active_stream())
            .field("state", &self.state)
            .finish()
    }
}
