//! Cluster reuse policies
//!
//! The plain buffering engine only ever appends clusters to the master
//! table ([`AppendOnly`]). The pooled engine keeps released clusters in a
//! [`FreePool`] sorted by physical location and hands them back out before
//! growing the table.

use crate::cluster::{ClusterIndex, ClusterTable};
use crate::error::{Result, StoreError};
use crate::file_space::FileSpace;

/// Cluster allocation trait
///
/// Decides where released clusters go and whether a writer can reuse one
/// instead of appending a new cluster to the master table.
pub trait ClusterAllocator {
    /// Whether released clusters are tracked for reuse and compaction
    const RECLAIMS: bool;

    /// Hand out a released cluster, preferring the one at `preferred`
    /// (the slot physically following the writer's previous cluster)
    fn take(&mut self, table: &ClusterTable, preferred: Option<u64>) -> Option<ClusterIndex>;

    /// Accept a cluster no stream references any more
    fn release(&mut self, table: &ClusterTable, index: ClusterIndex) -> Result<()>;

    /// Reset from the set of unreferenced clusters found at open
    fn rebuild(&mut self, table: &ClusterTable, unreferenced: Vec<ClusterIndex>);

    /// Clusters currently held for reuse, in location order
    fn free_indices(&self) -> &[ClusterIndex];
}

/// No reuse: released clusters stay orphaned in the table
#[derive(Debug, Clone, Default)]
pub struct AppendOnly {
    orphaned: usize,
}

impl AppendOnly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clusters released since open (plus those found unreferenced)
    pub fn orphaned(&self) -> usize {
        self.orphaned
    }
}

impl ClusterAllocator for AppendOnly {
    const RECLAIMS: bool = false;

    fn take(&mut self, _table: &ClusterTable, _preferred: Option<u64>) -> Option<ClusterIndex> {
        None
    }

    fn release(&mut self, _table: &ClusterTable, _index: ClusterIndex) -> Result<()> {
        self.orphaned += 1;
        Ok(())
    }

    fn rebuild(&mut self, _table: &ClusterTable, unreferenced: Vec<ClusterIndex>) {
        self.orphaned = unreferenced.len();
    }

    fn free_indices(&self) -> &[ClusterIndex] {
        &[]
    }
}

/// Free-cluster pool sorted by cluster `(location, used)`
///
/// Allocation is first-fit in location order, except that a cluster sitting
/// right after the writer's previous cluster is taken first so streams stay
/// physically contiguous where possible. Adjacent free clusters are not
/// merged into runs.
#[derive(Debug, Clone, Default)]
pub struct FreePool {
    space: FileSpace,
}

impl FreePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn contains(&self, index: ClusterIndex) -> bool {
        self.space.indices().contains(&index)
    }

    fn position_for(&self, table: &ClusterTable, index: ClusterIndex) -> Result<usize> {
        let key = table.resolve(index)?;
        Ok(self
            .space
            .indices()
            .partition_point(|&i| table.get(i).is_some_and(|c| *c < key)))
    }
}

impl ClusterAllocator for FreePool {
    const RECLAIMS: bool = true;

    fn take(&mut self, table: &ClusterTable, preferred: Option<u64>) -> Option<ClusterIndex> {
        if self.space.is_empty() {
            return None;
        }

        if let Some(location) = preferred {
            let indices = self.space.indices();
            let pos =
                indices.partition_point(|&i| table.get(i).is_some_and(|c| c.location < location));
            let hit = indices
                .get(pos)
                .and_then(|&i| table.get(i))
                .is_some_and(|c| c.location == location);
            if hit {
                return self.space.remove_ind(pos);
            }
        }

        self.space.remove_ind(0)
    }

    fn release(&mut self, table: &ClusterTable, index: ClusterIndex) -> Result<()> {
        let pos = self.position_for(table, index)?;
        if self.space.get(pos) == Some(index) {
            tracing::warn!("Double-free detected for cluster {}", index);
            return Err(StoreError::DoubleFree(index));
        }
        self.space.insert_ind(pos, index);
        Ok(())
    }

    fn rebuild(&mut self, table: &ClusterTable, mut unreferenced: Vec<ClusterIndex>) {
        unreferenced.sort_by_key(|&i| table.get(i).copied());
        unreferenced.dedup();
        self.space = FileSpace::from_parts(unreferenced, 0);
    }

    fn free_indices(&self) -> &[ClusterIndex] {
        self.space.indices()
    }
}
