//! Stream registry and catalog stream codec
//!
//! Entry 0 of the registry is the catalog stream. It stores the name,
//! versions and extent list of every other stream. Its own extent list is
//! kept in a chain of index clusters that starts at the container header.

use crate::cluster::ClusterIndex;
use crate::error::{Result, StoreError};
use crate::file_space::{get_width, put_width, FileSpace};
use crate::version::{CountWidth, SpaceLayout, VersionContainer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest stream name in bytes (the name length is stored as a u16)
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Handle to a stream of one open container
///
/// Carries the identity of the registry that issued it, so a handle from
/// another container (or an earlier session of the same one) is rejected
/// instead of silently addressing the wrong stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    owner: u64,
    slot: usize,
}

impl StreamId {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_catalog(&self) -> bool {
        self.slot == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.slot)
    }
}

/// One registered stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub name: String,
    pub space: FileSpace,
    /// Versions the stream content was written under
    pub versions: VersionContainer,
}

impl StreamEntry {
    pub fn new(name: impl Into<String>, versions: VersionContainer) -> Self {
        StreamEntry {
            name: name.into(),
            space: FileSpace::new(),
            versions,
        }
    }
}

/// Registry of every stream in a container
///
/// Slots are never reused while the container is open, so a [`StreamId`]
/// either names the stream it was issued for or nothing at all.
#[derive(Debug, Clone)]
pub struct Registry {
    owner: u64,
    catalog: StreamEntry,
    /// Named streams; slot `n` lives at `entries[n - 1]`
    entries: Vec<Option<StreamEntry>>,
}

impl Registry {
    /// Empty registry holding only the catalog stream
    pub fn new(catalog_versions: VersionContainer) -> Self {
        Registry {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            catalog: StreamEntry::new(String::new(), catalog_versions),
            entries: Vec::new(),
        }
    }

    fn id(&self, slot: usize) -> StreamId {
        StreamId {
            owner: self.owner,
            slot,
        }
    }

    pub fn catalog_id(&self) -> StreamId {
        self.id(0)
    }

    /// Whether `id` was issued by this registry and is still live
    pub fn owns(&self, id: StreamId) -> bool {
        self.get(id).is_some()
    }

    pub fn catalog(&self) -> &StreamEntry {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut StreamEntry {
        &mut self.catalog
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamEntry> {
        if id.owner != self.owner {
            return None;
        }
        match id.slot {
            0 => Some(&self.catalog),
            n => self.entries.get(n - 1).and_then(Option::as_ref),
        }
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry> {
        if id.owner != self.owner {
            return None;
        }
        match id.slot {
            0 => Some(&mut self.catalog),
            n => self.entries.get_mut(n - 1).and_then(Option::as_mut),
        }
    }

    /// Look up a named stream (the catalog has no name and is never found)
    pub fn find(&self, name: &str) -> Option<StreamId> {
        self.iter().find(|(_, e)| e.name == name).map(|(id, _)| id)
    }

    /// Register a new named stream
    pub fn insert(&mut self, entry: StreamEntry) -> Result<StreamId> {
        validate_name(&entry.name)?;
        if self.find(&entry.name).is_some() {
            return Err(StoreError::StreamExists(entry.name));
        }
        self.entries.push(Some(entry));
        Ok(self.id(self.entries.len()))
    }

    /// Unregister a stream, handing back its entry
    pub fn remove(&mut self, id: StreamId) -> Option<StreamEntry> {
        if id.is_catalog() || id.owner != self.owner {
            return None;
        }
        self.entries.get_mut(id.slot - 1).and_then(Option::take)
    }

    /// Live named streams in registration order
    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &StreamEntry)> {
        let owner = self.owner;
        self.entries.iter().enumerate().filter_map(move |(i, e)| {
            e.as_ref().map(|e| (StreamId { owner, slot: i + 1 }, e))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamEntry> {
        self.entries.iter_mut().flatten()
    }

    /// Every live file space, catalog included
    pub fn spaces(&self) -> impl Iterator<Item = (StreamId, &FileSpace)> {
        std::iter::once((self.catalog_id(), &self.catalog.space))
            .chain(self.iter().map(|(id, e)| (id, &e.space)))
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|(_, e)| e.name.clone()).collect()
    }

    /// Number of named streams
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize every named stream for the catalog stream
    ///
    /// ```text
    /// count                       layout.count
    /// repeated count times:
    ///   name_len  u16, name  UTF-8
    ///   versions  u8 n, n x u16
    ///   space     counted FileSpace (layout)
    /// ```
    pub fn encode(&self, layout: SpaceLayout) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        put_width(&mut bytes, self.len() as u64, layout.count)?;
        for (_, entry) in self.iter() {
            bytes.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            bytes.extend_from_slice(entry.name.as_bytes());
            bytes.extend_from_slice(&entry.versions.encode()?);
            bytes.extend_from_slice(&entry.space.encode(layout, true)?);
        }
        Ok(bytes)
    }
}

/// Parse catalog stream content into entries
pub fn decode_entries(bytes: &[u8], layout: SpaceLayout) -> Result<Vec<StreamEntry>> {
    let mut offset = 0;
    let count = get_width(bytes, &mut offset, layout.count)?;
    let mut entries = Vec::new();

    for _ in 0..count {
        let name_len = get_width(bytes, &mut offset, CountWidth::U16)? as usize;
        let name = bytes
            .get(offset..offset + name_len)
            .ok_or_else(|| StoreError::BadData("truncated stream name".to_string()))?;
        let name = std::str::from_utf8(name)
            .map_err(|e| StoreError::BadData(format!("stream name is not UTF-8: {}", e)))?
            .to_string();
        offset += name_len;

        let n = *bytes
            .get(offset)
            .ok_or_else(|| StoreError::BadData("truncated version container".to_string()))?
            as usize;
        offset += 1;
        let mut versions = Vec::with_capacity(n);
        for _ in 0..n {
            versions.push(get_width(bytes, &mut offset, CountWidth::U16)? as u16);
        }
        let versions = VersionContainer::from_slice(&versions)?;

        let (space, used) = FileSpace::decode(&bytes[offset..], layout, None)?;
        offset += used;

        entries.push(StreamEntry {
            name,
            space,
            versions,
        });
    }

    Ok(entries)
}

/// Bytes of the link that opens every index cluster
pub const INDEX_LINK: usize = 8;

/// Catalog cluster indices one index cluster holds
pub fn index_entries_per_cluster(capacity: u16, layout: SpaceLayout) -> usize {
    (capacity as usize).saturating_sub(INDEX_LINK) / layout.index.bytes()
}

/// Content of one index cluster
///
/// ```text
/// next     u64   (next index cluster + 1, 0 ends the chain)
/// entries  layout.index each
/// ```
pub fn encode_index_cluster(
    next: Option<ClusterIndex>,
    entries: &[ClusterIndex],
    layout: SpaceLayout,
) -> Result<Vec<u8>> {
    let link = match next {
        Some(index) => index
            .checked_add(1)
            .ok_or_else(|| StoreError::BadData(format!("index link {} out of range", index)))?,
        None => 0,
    };
    let mut bytes = Vec::with_capacity(INDEX_LINK + entries.len() * layout.index.bytes());
    bytes.extend_from_slice(&link.to_le_bytes());
    for &index in entries {
        put_width(&mut bytes, index, layout.index)?;
    }
    Ok(bytes)
}

/// Inverse of [`encode_index_cluster`]
pub fn decode_index_cluster(
    bytes: &[u8],
    layout: SpaceLayout,
) -> Result<(Option<ClusterIndex>, Vec<ClusterIndex>)> {
    let mut offset = 0;
    let link = get_width(bytes, &mut offset, CountWidth::U64)?;
    let width = layout.index.bytes();
    if (bytes.len() - offset) % width != 0 {
        return Err(StoreError::BadData(format!(
            "index cluster of {} bytes splits an entry",
            bytes.len()
        )));
    }

    let mut entries = Vec::with_capacity((bytes.len() - offset) / width);
    while offset < bytes.len() {
        entries.push(get_width(bytes, &mut offset, layout.index)?);
    }
    Ok((link.checked_sub(1), entries))
}

/// Reject names the catalog cannot store
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{STORAGE_V1, STORAGE_V3};

    fn registry() -> Registry {
        Registry::new(VersionContainer::current())
    }

    #[test]
    fn test_catalog_is_never_found_or_listed() {
        let mut reg = registry();
        assert!(reg.is_empty());
        assert!(reg.find("").is_none());
        assert!(reg.catalog_id().is_catalog());
        assert!(reg.remove(reg.catalog_id()).is_none());

        reg.insert(StreamEntry::new("a", VersionContainer::current()))
            .unwrap();
        assert_eq!(reg.names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let mut reg = registry();
        reg.insert(StreamEntry::new("doc", VersionContainer::current()))
            .unwrap();
        assert!(matches!(
            reg.insert(StreamEntry::new("doc", VersionContainer::current())),
            Err(StoreError::StreamExists(_))
        ));
        assert!(matches!(
            reg.insert(StreamEntry::new("", VersionContainer::current())),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_ids_stay_stable_after_remove() {
        let mut reg = registry();
        let a = reg
            .insert(StreamEntry::new("a", VersionContainer::current()))
            .unwrap();
        let b = reg
            .insert(StreamEntry::new("b", VersionContainer::current()))
            .unwrap();
        reg.remove(a).unwrap();

        assert!(!reg.owns(a));
        assert!(reg.owns(b));
        assert_eq!(reg.get(b).unwrap().name, "b");

        let c = reg
            .insert(StreamEntry::new("a", VersionContainer::current()))
            .unwrap();
        assert_ne!(a, c);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn test_foreign_ids_rejected() {
        let mut one = registry();
        let two = registry();
        let id = one
            .insert(StreamEntry::new("x", VersionContainer::current()))
            .unwrap();
        assert!(one.owns(id));
        assert!(!two.owns(id));
        assert!(two.get(id).is_none());
    }

    #[test]
    fn test_encode_decode_entries() {
        let mut reg = registry();
        let mut first = StreamEntry::new("first", VersionContainer::new(STORAGE_V1).with_app(2));
        first.space = FileSpace::from_parts(vec![3, 1], 12);
        reg.insert(first.clone()).unwrap();
        let gone = reg
            .insert(StreamEntry::new("gone", VersionContainer::current()))
            .unwrap();
        reg.insert(StreamEntry::new("empty", VersionContainer::current()))
            .unwrap();
        reg.remove(gone);

        let layout = SpaceLayout::for_version(STORAGE_V3).unwrap();
        let bytes = reg.encode(layout).unwrap();
        let entries = decode_entries(&bytes, layout).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(entries[1].name, "empty");
        assert!(entries[1].space.is_empty());
    }

    #[test]
    fn test_decode_truncated_catalog() {
        let mut reg = registry();
        reg.insert(StreamEntry::new("abc", VersionContainer::current()))
            .unwrap();
        let layout = SpaceLayout::for_version(STORAGE_V1).unwrap();
        let bytes = reg.encode(layout).unwrap();
        assert!(decode_entries(&bytes[..bytes.len() - 1], layout).is_err());
        assert!(decode_entries(&bytes[..4], layout).is_err());
    }

    #[test]
    fn test_index_cluster_codec() {
        let v1 = SpaceLayout::for_version(STORAGE_V1).unwrap();
        let bytes = encode_index_cluster(Some(0), &[5, 9, 2], v1).unwrap();
        assert_eq!(bytes.len(), INDEX_LINK + 3 * 4);
        assert_eq!(&bytes[..INDEX_LINK], &1u64.to_le_bytes());
        assert_eq!(
            decode_index_cluster(&bytes, v1).unwrap(),
            (Some(0), vec![5, 9, 2])
        );

        let last = encode_index_cluster(None, &[7], v1).unwrap();
        assert_eq!(decode_index_cluster(&last, v1).unwrap(), (None, vec![7]));

        assert!(decode_index_cluster(&bytes[..bytes.len() - 1], v1).is_err());
        assert!(decode_index_cluster(&bytes[..4], v1).is_err());
    }

    #[test]
    fn test_index_entries_per_cluster() {
        let v3 = SpaceLayout::for_version(STORAGE_V3).unwrap();
        let v1 = SpaceLayout::for_version(STORAGE_V1).unwrap();
        assert_eq!(index_entries_per_cluster(16, v3), 1);
        assert_eq!(index_entries_per_cluster(4094, v3), 510);
        assert_eq!(index_entries_per_cluster(16, v1), 2);
        assert_eq!(index_entries_per_cluster(4, v1), 0);
    }
}
