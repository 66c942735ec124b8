//! Clusters and the master cluster table
//!
//! A cluster is the fixed-capacity unit of storage. Every other structure
//! refers to clusters by their index in the [`ClusterTable`], never by
//! location, so the table can be rebuilt or relocated freely.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Index of a cluster in the master table
pub type ClusterIndex = u64;

/// Storage block descriptor
///
/// Ordering is lexicographic on `(location, used)`, which sorts clusters
/// by physical position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cluster {
    /// Byte offset of the cluster record within the medium
    pub location: u64,
    /// Meaningful bytes in the cluster
    pub used: u16,
}

impl Cluster {
    pub fn new(location: u64, used: u16) -> Self {
        Cluster { location, used }
    }
}

/// The master cluster table
#[derive(Debug, Clone, Default)]
pub struct ClusterTable {
    content: Vec<Cluster>,
}

impl ClusterTable {
    pub fn new() -> Self {
        ClusterTable {
            content: Vec::new(),
        }
    }

    /// Append a zeroed cluster and return its index
    pub fn add(&mut self) -> ClusterIndex {
        self.add_value(Cluster::default())
    }

    /// Append a copy of `cluster` and return its index
    pub fn add_value(&mut self, cluster: Cluster) -> ClusterIndex {
        self.content.push(cluster);
        (self.content.len() - 1) as ClusterIndex
    }

    /// Pre-allocate room for `additional` clusters without creating them
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.content.try_reserve(additional).map_err(|e| {
            StoreError::OutOfMemory(format!(
                "cannot grow cluster table by {} entries: {}",
                additional, e
            ))
        })
    }

    /// Reset the logical count, keeping the backing memory
    pub fn flush(&mut self) {
        self.content.clear();
    }

    /// Release all backing memory
    pub fn hard_flush(&mut self) {
        self.content = Vec::new();
    }

    /// Shrink backing memory to the logical count
    pub fn adjust(&mut self) {
        self.content.shrink_to_fit();
    }

    /// Drop every cluster from `len` onwards
    pub fn truncate(&mut self, len: usize) {
        self.content.truncate(len);
    }

    pub fn get(&self, index: ClusterIndex) -> Option<&Cluster> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.content.get(i))
    }

    pub fn get_mut(&mut self, index: ClusterIndex) -> Option<&mut Cluster> {
        usize::try_from(index)
            .ok()
            .and_then(move |i| self.content.get_mut(i))
    }

    /// Look up a cluster, reporting an out-of-range index as `cantFind`
    pub fn resolve(&self, index: ClusterIndex) -> Result<Cluster> {
        self.get(index).copied().ok_or(StoreError::ClusterOutOfRange {
            index,
            len: self.content.len(),
        })
    }

    pub fn contains(&self, index: ClusterIndex) -> bool {
        self.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.content.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClusterIndex, &Cluster)> {
        self.content
            .iter()
            .enumerate()
            .map(|(i, c)| (i as ClusterIndex, c))
    }
}
