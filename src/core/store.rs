//! Allocator extension for the pooled engine
//!
//! Deleting, truncating and detaching streams hands their clusters to the
//! [`FreePool`], where later writers pick them up before the master table
//! grows. [`StreamBuffer::compact`] squeezes the remaining free clusters out
//! of the medium entirely.

use crate::allocator::{ClusterAllocator, FreePool};
use crate::buffer::StreamBuffer;
use crate::catalog::{validate_name, StreamEntry, StreamId};
use crate::cluster::ClusterIndex;
use crate::error::{Result, StoreError};
use crate::file_space::FileSpace;
use crate::medium::Medium;
use crate::version::VersionContainer;
use tracing::debug;

/// Stream content that is no longer reachable by name
///
/// The clusters stay allocated while detached; nothing else will be given
/// them until the stream is attached again or the container is reopened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedStream {
    pub space: FileSpace,
    pub versions: VersionContainer,
}

impl DetachedStream {
    pub fn size(&self, capacity: u16) -> u64 {
        self.space.size(capacity)
    }
}

impl<M: Medium> StreamBuffer<M, FreePool> {
    /// Remove a stream and return its clusters to the pool
    pub fn del(&mut self, id: StreamId) -> Result<()> {
        let result = self.del_inner(id);
        self.track(result)
    }

    pub fn del_named(&mut self, name: &str) -> Result<()> {
        let result = self
            .find(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()));
        let id = self.track(result)?;
        self.del(id)
    }

    /// Cut a stream down to `from` bytes
    pub fn truncate(&mut self, id: StreamId, from: u64) -> Result<()> {
        let result = self.truncate_inner(id, from);
        self.track(result)
    }

    /// Unlink a stream from its name, keeping its clusters
    pub fn detach(&mut self, id: StreamId) -> Result<DetachedStream> {
        let result = self.detach_inner(id);
        self.track(result)
    }

    /// Register detached content under `name`
    pub fn attach(&mut self, name: &str, detached: DetachedStream) -> Result<StreamId> {
        let result = self.attach_inner(name, detached);
        self.track(result)
    }

    /// Rewrite every live cluster contiguously and shrink the medium
    ///
    /// Needs room for a second copy of the live clusters while it runs.
    /// Detached streams are not preserved.
    pub fn compact(&mut self) -> Result<()> {
        let result = self.compact_clusters();
        self.track(result)
    }

    /// Reclaimed clusters in location order
    pub fn free_pool(&self) -> &[ClusterIndex] {
        self.allocator().free_indices()
    }

    /// A stream may be removed or reshaped only while no cursor is on it
    fn check_mutable(&self, id: StreamId) -> Result<()> {
        if !self.owns(id) {
            return Err(StoreError::AccessViolation(format!(
                "stream {} does not belong to this container",
                id
            )));
        }
        if self.active_stream() == Some(id) {
            return Err(StoreError::AccessViolation(format!(
                "stream {} is open",
                id
            )));
        }
        self.ensure_writable()
    }

    fn del_inner(&mut self, id: StreamId) -> Result<()> {
        self.check_mutable(id)?;
        let entry = self.remove_stream(id)?;
        debug!(
            "Deleted stream '{}', {} clusters to the free pool",
            entry.name,
            entry.space.len()
        );
        Ok(())
    }

    fn truncate_inner(&mut self, id: StreamId, from: u64) -> Result<()> {
        self.check_mutable(id)?;
        let cap = self.cluster_capacity();
        let mut space = self
            .file_space(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let size = space.size(cap);
        if from > size {
            return Err(StoreError::SeekOutOfRange { pos: from, size });
        }
        if from == size {
            return Ok(());
        }

        let released = space.fit_to(from, cap);
        let last = space.last().map(|index| (index, space.last_used()));
        if let Some(entry) = self.registry_mut().get_mut(id) {
            entry.space = space;
        }
        for index in released {
            self.free(index)?;
        }
        if let Some((index, used)) = last {
            self.shrink_cluster(index, used)?;
        }

        debug!("Truncated stream {} from {} to {} bytes", id, size, from);
        Ok(())
    }

    fn detach_inner(&mut self, id: StreamId) -> Result<DetachedStream> {
        self.check_mutable(id)?;
        let entry = self
            .registry_mut()
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        debug!("Detached stream '{}'", entry.name);
        Ok(DetachedStream {
            space: entry.space,
            versions: entry.versions,
        })
    }

    fn attach_inner(&mut self, name: &str, detached: DetachedStream) -> Result<StreamId> {
        self.ensure_writable()?;
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(StoreError::StreamExists(name.to_string()));
        }

        self.verify_space(&detached.space)?;
        for &index in detached.space.indices() {
            if self.allocator().contains(index) {
                return Err(StoreError::BadData(format!(
                    "cluster {} is in the free pool",
                    index
                )));
            }
            let owned = self
                .list()
                .iter()
                .filter_map(|n| self.find(n))
                .filter_map(|other| self.file_space(other))
                .any(|space| space.indices().contains(&index));
            if owned {
                return Err(StoreError::BadData(format!(
                    "cluster {} already belongs to another stream",
                    index
                )));
            }
        }

        let entry = StreamEntry {
            name: name.to_string(),
            space: detached.space,
            versions: detached.versions,
        };
        let id = self.registry_mut().insert(entry)?;
        debug!("Attached stream '{}' as {}", name, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBuffer;
    use crate::config::StoreConfig;
    use crate::header::{CLUSTER_PREFIX, HEADER_SIZE};
    use crate::medium::MemoryMedium;
    use crate::mode::OpenMode;

    const CAP: u16 = 16;

    fn fresh() -> PooledBuffer<MemoryMedium> {
        PooledBuffer::create(
            MemoryMedium::new(),
            StoreConfig {
                cluster_capacity: CAP,
                ..StoreConfig::default()
            },
        )
        .unwrap()
    }

    fn put(buf: &mut PooledBuffer<MemoryMedium>, name: &str, data: &[u8]) -> StreamId {
        let id = buf
            .open(name, OpenMode::write(), &VersionContainer::current())
            .unwrap();
        buf.put_block(data).unwrap();
        buf.close().unwrap();
        id
    }

    fn get(buf: &mut PooledBuffer<MemoryMedium>, name: &str) -> Vec<u8> {
        buf.open(name, OpenMode::read(), &VersionContainer::current())
            .unwrap();
        let mut out = vec![0u8; buf.size().unwrap() as usize];
        buf.get_block(&mut out).unwrap();
        buf.close().unwrap();
        out
    }

    #[test]
    fn test_deleted_clusters_are_reused() {
        let mut buf = fresh();
        let a = put(&mut buf, "a", &[1u8; 40]);
        put(&mut buf, "b", &[2u8; 8]);
        let freed = buf.file_space(a).unwrap().indices().to_vec();
        let count = buf.cluster_count();

        buf.del(a).unwrap();
        assert_eq!(buf.free_pool(), freed.as_slice());
        assert!(buf.find("a").is_none());

        let c = put(&mut buf, "c", &[3u8; 40]);
        assert_eq!(buf.cluster_count(), count);
        assert_eq!(buf.file_space(c).unwrap().indices(), freed.as_slice());
        assert!(buf.free_pool().is_empty());
        assert_eq!(get(&mut buf, "c"), vec![3u8; 40]);
        buf.check_integrity().unwrap();
    }

    #[test]
    fn test_del_rules() {
        let mut buf = fresh();
        let a = put(&mut buf, "a", b"x");
        buf.open("a", OpenMode::read(), &VersionContainer::current())
            .unwrap();
        assert!(matches!(buf.del(a), Err(StoreError::AccessViolation(_))));
        buf.close().unwrap();

        buf.del_named("a").unwrap();
        assert!(matches!(buf.del(a), Err(StoreError::AccessViolation(_))));
        assert!(matches!(
            buf.del_named("a"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_truncate_releases_tail() {
        let mut buf = fresh();
        let data: Vec<u8> = (0..50u8).collect();
        let id = put(&mut buf, "s", &data);
        let before = buf.file_space(id).unwrap().indices().to_vec();
        assert_eq!(before.len(), 4);

        buf.truncate(id, 20).unwrap();
        let space = buf.file_space(id).unwrap().clone();
        assert_eq!(space.indices(), &before[..2]);
        assert_eq!(space.last_used(), 4);
        assert_eq!(buf.table().get(before[1]).unwrap().used, 4);
        assert_eq!(buf.free_pool().len(), 2);
        assert_eq!(get(&mut buf, "s"), &data[..20]);
        buf.check_integrity().unwrap();

        assert!(matches!(
            buf.truncate(id, 21),
            Err(StoreError::SeekOutOfRange { pos: 21, size: 20 })
        ));

        buf.truncate(id, 0).unwrap();
        assert!(buf.file_space(id).unwrap().is_empty());
        assert_eq!(buf.stream_size(id).unwrap(), 0);
        assert_eq!(buf.free_pool().len(), 4);
        buf.check_integrity().unwrap();
    }

    #[test]
    fn test_detach_attach_renames() {
        let mut buf = fresh();
        let id = put(&mut buf, "old", b"renamed content here");
        put(&mut buf, "other", b"z");

        let detached = buf.detach(id).unwrap();
        assert_eq!(detached.size(CAP), 20);
        assert!(buf.find("old").is_none());
        assert!(buf.free_pool().is_empty());

        assert!(matches!(
            buf.attach("other", detached.clone()),
            Err(StoreError::StreamExists(_))
        ));
        let new = buf.attach("new", detached.clone()).unwrap();
        assert_ne!(new, id);
        assert_eq!(get(&mut buf, "new"), b"renamed content here");

        // The same clusters cannot be attached twice
        assert!(matches!(
            buf.attach("twice", detached),
            Err(StoreError::BadData(_))
        ));
        buf.check_integrity().unwrap();
    }

    #[test]
    fn test_attach_rejects_free_clusters() {
        let mut buf = fresh();
        let id = put(&mut buf, "s", b"abc");
        let detached = DetachedStream {
            space: buf.file_space(id).unwrap().clone(),
            versions: VersionContainer::current(),
        };
        buf.del(id).unwrap();
        assert!(matches!(
            buf.attach("s", detached),
            Err(StoreError::BadData(_))
        ));
    }

    #[test]
    fn test_compact_drops_free_clusters() {
        let mut buf = fresh();
        put(&mut buf, "a", &[1u8; 200]);
        put(&mut buf, "b", &[2u8; 20]);
        put(&mut buf, "c", &[3u8; 5]);
        buf.del_named("a").unwrap();
        let before = buf.cluster_count();

        buf.compact().unwrap();
        assert!(buf.cluster_count() < before);
        assert!(buf.free_pool().is_empty());
        let slot = CAP as u64 + CLUSTER_PREFIX as u64;
        assert_eq!(
            buf.file_len().unwrap(),
            HEADER_SIZE as u64 + buf.cluster_count() as u64 * slot
        );
        assert_eq!(get(&mut buf, "b"), vec![2u8; 20]);
        assert_eq!(get(&mut buf, "c"), vec![3u8; 5]);
        buf.check_integrity().unwrap();
    }

    #[test]
    fn test_speed_on_close_compacts_at_finish() {
        let mut buf = fresh();
        put(&mut buf, "a", &[1u8; 64]);
        put(&mut buf, "b", &[2u8; 20]);
        buf.del_named("a").unwrap();
        buf.open(
            "b",
            OpenMode::read() | OpenMode::SPEED_ON_CLOSE,
            &VersionContainer::current(),
        )
        .unwrap();
        buf.close().unwrap();

        let image = buf.finish().unwrap().into_bytes();
        let mut buf = PooledBuffer::open_container(
            MemoryMedium::from_bytes(image),
            StoreConfig::default(),
        )
        .unwrap();
        assert!(buf.free_pool().is_empty());
        assert_eq!(get(&mut buf, "b"), vec![2u8; 20]);
        buf.check_integrity().unwrap();
    }

    #[test]
    fn test_pool_rebuilt_on_reopen() {
        let mut buf = fresh();
        put(&mut buf, "a", &[1u8; 40]);
        put(&mut buf, "b", &[2u8; 4]);
        buf.del_named("a").unwrap();
        assert_eq!(buf.free_pool().len(), 3);

        // The new catalog and its index fill the three freed clusters plus
        // one more, and the first catalog's two clusters are released
        let image = buf.finish().unwrap().into_bytes();
        let buf = PooledBuffer::open_container(
            MemoryMedium::from_bytes(image),
            StoreConfig::default(),
        )
        .unwrap();
        assert_eq!(buf.free_pool().len(), 2);
        buf.check_integrity().unwrap();
    }
}
