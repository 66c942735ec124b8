use crate::cluster::ClusterIndex;
use crate::error::{Result, StoreError};
use crate::version::STORAGE_VERSION_CURRENT;

pub const MAGIC: [u8; 8] = *b"CLSTORE\x01";
/// Bytes reserved at the start of every container
pub const HEADER_SIZE: usize = 4096;
/// Length prefix stored in front of every cluster's content
pub const CLUSTER_PREFIX: usize = 2;
/// Default cluster capacity; one cluster record then fills a 4KB slot
pub const DEFAULT_CLUSTER_CAPACITY: u16 = 4094;
/// Smallest capacity that still fits a chain link plus one 64-bit index
pub const MIN_CLUSTER_CAPACITY: u16 = 16;

const CRC_OFFSET: usize = 28;
const CATALOG_OFFSET: usize = 32;

/// Where the catalog stream starts
///
/// The catalog's extent list lives in a chain of index clusters on the
/// medium, so the header stays the same size however large the catalog
/// grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogRoot {
    /// First index cluster, `None` for a container that never wrote one
    pub head: Option<ClusterIndex>,
    /// Number of catalog clusters listed by the chain
    pub clusters: u64,
    /// Bytes used in the last catalog cluster
    pub last_used: u16,
}

/// Container header (first 4KB)
///
/// Holds everything needed to bootstrap the container: the storage layout
/// version, the cluster geometry, and the root of the catalog stream, which
/// in turn describes every other stream.
///
/// # Layout
///
/// ```text
/// 0   magic            [u8; 8]
/// 8   storage_version  u16
/// 10  cluster_capacity u16
/// 12  format_version   u32
/// 16  cluster_count    u64
/// 24  flags            u32
/// 28  crc32            u32   (computed with this field zeroed)
/// 32  catalog_head     u64   (first index cluster + 1, 0 when absent)
/// 40  catalog_clusters u64
/// 48  catalog_used     u16
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic: [u8; 8],

    /// Layout version of the container (catalog and its index chain)
    pub storage_version: u16,

    /// Content bytes per cluster
    pub cluster_capacity: u16,

    /// Application document format version, opaque to the engine
    pub format_version: u32,

    /// Number of cluster slots after the header
    pub cluster_count: u64,

    /// Reserved, written as zero
    pub flags: u32,

    pub catalog: CatalogRoot,
}

impl ContainerHeader {
    pub fn new(storage_version: u16, cluster_capacity: u16) -> Self {
        ContainerHeader {
            magic: MAGIC,
            storage_version,
            cluster_capacity,
            format_version: 0,
            cluster_count: 0,
            flags: 0,
            catalog: CatalogRoot::default(),
        }
    }

    /// Size of one cluster record on the medium
    pub fn slot_size(&self) -> u64 {
        CLUSTER_PREFIX as u64 + self.cluster_capacity as u64
    }

    /// Offset of cluster `index`
    pub fn location_of(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * self.slot_size()
    }

    /// Validate magic, version and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::BadSignature);
        }

        if self.storage_version == 0 || self.storage_version > STORAGE_VERSION_CURRENT {
            return Err(StoreError::UnsupportedStorageVersion {
                found: self.storage_version,
                supported: STORAGE_VERSION_CURRENT,
            });
        }

        if self.cluster_capacity < MIN_CLUSTER_CAPACITY {
            return Err(StoreError::BadData(format!(
                "cluster capacity {} below minimum {}",
                self.cluster_capacity, MIN_CLUSTER_CAPACITY
            )));
        }

        let root = &self.catalog;
        if root.last_used > self.cluster_capacity {
            return Err(StoreError::CantReadCatalog(format!(
                "catalog last cluster claims {} bytes",
                root.last_used
            )));
        }
        if root.head.is_some() != (root.clusters > 0) {
            return Err(StoreError::CantReadCatalog(format!(
                "catalog of {} clusters with head {:?}",
                root.clusters, root.head
            )));
        }

        Ok(())
    }

    /// Serialize header to bytes (exactly `HEADER_SIZE`)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let head = match self.catalog.head {
            Some(index) => index.checked_add(1).ok_or_else(|| {
                StoreError::CantWriteCatalog(format!("catalog head {} out of range", index))
            })?,
            None => 0,
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.storage_version.to_le_bytes());
        bytes.extend_from_slice(&self.cluster_capacity.to_le_bytes());
        bytes.extend_from_slice(&self.format_version.to_le_bytes());
        bytes.extend_from_slice(&self.cluster_count.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        debug_assert_eq!(bytes.len(), CATALOG_OFFSET);
        bytes.extend_from_slice(&head.to_le_bytes());
        bytes.extend_from_slice(&self.catalog.clusters.to_le_bytes());
        bytes.extend_from_slice(&self.catalog.last_used.to_le_bytes());

        // Pad to HEADER_SIZE
        bytes.resize(HEADER_SIZE, 0);

        let crc = crc32fast::hash(&bytes);
        bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

        Ok(bytes)
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::BadSignature);
        }
        let bytes = &bytes[..HEADER_SIZE];

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(StoreError::BadSignature);
        }

        let stored = u32::from_le_bytes([
            bytes[CRC_OFFSET],
            bytes[CRC_OFFSET + 1],
            bytes[CRC_OFFSET + 2],
            bytes[CRC_OFFSET + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CRC_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[CRC_OFFSET + 4..]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(StoreError::HeaderChecksum { stored, computed });
        }

        let mut header = ContainerHeader::new(
            u16::from_le_bytes([bytes[8], bytes[9]]),
            u16::from_le_bytes([bytes[10], bytes[11]]),
        );
        header.format_version = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        header.cluster_count = read_u64(bytes, 16);
        header.flags = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);

        let head = read_u64(bytes, CATALOG_OFFSET);
        header.catalog = CatalogRoot {
            head: head.checked_sub(1),
            clusters: read_u64(bytes, CATALOG_OFFSET + 8),
            last_used: u16::from_le_bytes([bytes[CATALOG_OFFSET + 16], bytes[CATALOG_OFFSET + 17]]),
        };

        header.validate()?;

        Ok(header)
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self::new(STORAGE_VERSION_CURRENT, DEFAULT_CLUSTER_CAPACITY)
    }
}
