//! Extent list of one logical stream

use crate::cluster::ClusterIndex;
use crate::error::{Result, StoreError};
use crate::version::{CountWidth, SpaceLayout};
use serde::{Deserialize, Serialize};

/// Ordered cluster indices making up one stream, plus the number of bytes
/// used in the final cluster.
///
/// An empty file space has no clusters and `last_used == 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpace {
    indices: Vec<ClusterIndex>,
    last_used: u16,
}

impl FileSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(indices: Vec<ClusterIndex>, last_used: u16) -> Self {
        FileSpace { indices, last_used }
    }

    pub fn add(&mut self, index: ClusterIndex) {
        self.indices.push(index);
    }

    /// Remove the entry at `pos`, returning its cluster index
    pub fn remove_ind(&mut self, pos: usize) -> Option<ClusterIndex> {
        if pos < self.indices.len() {
            Some(self.indices.remove(pos))
        } else {
            None
        }
    }

    /// Insert `index` before position `pos` (appends when `pos == len`)
    pub fn insert_ind(&mut self, pos: usize, index: ClusterIndex) {
        let pos = pos.min(self.indices.len());
        self.indices.insert(pos, index);
    }

    /// Cut the list down to `len` entries, returning the removed tail
    pub fn split_off(&mut self, len: usize) -> Vec<ClusterIndex> {
        if len >= self.indices.len() {
            return Vec::new();
        }
        self.indices.split_off(len)
    }

    pub fn clear(&mut self) -> Vec<ClusterIndex> {
        self.last_used = 0;
        std::mem::take(&mut self.indices)
    }

    pub fn indices(&self) -> &[ClusterIndex] {
        &self.indices
    }

    pub(crate) fn set_indices(&mut self, indices: Vec<ClusterIndex>) {
        self.indices = indices;
    }

    pub fn get(&self, pos: usize) -> Option<ClusterIndex> {
        self.indices.get(pos).copied()
    }

    pub fn last(&self) -> Option<ClusterIndex> {
        self.indices.last().copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn last_used(&self) -> u16 {
        self.last_used
    }

    pub fn set_last_used(&mut self, used: u16) {
        self.last_used = used;
    }

    /// Logical length in bytes: `(n - 1) * capacity + last_used`
    pub fn size(&self, capacity: u16) -> u64 {
        match self.indices.len() {
            0 => 0,
            n => (n as u64 - 1) * capacity as u64 + self.last_used as u64,
        }
    }

    /// Make the list describe exactly `size` bytes, returning the clusters
    /// that are no longer needed. The caller must hold at least
    /// `ceil(size / capacity)` clusters.
    pub fn fit_to(&mut self, size: u64, capacity: u16) -> Vec<ClusterIndex> {
        let cap = capacity as u64;
        let needed = size.div_ceil(cap) as usize;
        let released = self.split_off(needed);
        self.last_used = if needed == 0 {
            0
        } else {
            (size - (needed as u64 - 1) * cap) as u16
        };
        released
    }

    /// Serialize as `[count] index* last_used`
    ///
    /// The count is omitted when `counted` is false; the reader must then
    /// know the number of entries from context.
    pub fn encode(&self, layout: SpaceLayout, counted: bool) -> Result<Vec<u8>> {
        let mut bytes =
            Vec::with_capacity(layout.count.bytes() + self.indices.len() * layout.index.bytes() + 2);
        if counted {
            put_width(&mut bytes, self.indices.len() as u64, layout.count)?;
        }
        for &index in &self.indices {
            put_width(&mut bytes, index, layout.index)?;
        }
        bytes.extend_from_slice(&self.last_used.to_le_bytes());
        Ok(bytes)
    }

    /// Inverse of [`FileSpace::encode`]; returns the file space and the
    /// number of bytes consumed.
    pub fn decode(bytes: &[u8], layout: SpaceLayout, count: Option<u64>) -> Result<(Self, usize)> {
        let mut offset = 0;
        let count = match count {
            Some(n) => n,
            None => get_width(bytes, &mut offset, layout.count)?,
        };

        let needed = (count as u128) * layout.index.bytes() as u128 + 2;
        if needed > (bytes.len() - offset) as u128 {
            return Err(StoreError::BadData(format!(
                "file space of {} clusters truncated ({} bytes available)",
                count,
                bytes.len() - offset
            )));
        }

        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            indices.push(get_width(bytes, &mut offset, layout.index)?);
        }
        let last_used = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        offset += 2;

        Ok((FileSpace { indices, last_used }, offset))
    }

    /// Encoded length for `count` entries
    pub fn encoded_len(count: usize, layout: SpaceLayout, counted: bool) -> usize {
        let head = if counted { layout.count.bytes() } else { 0 };
        head + count * layout.index.bytes() + 2
    }
}

/// Append `value` in little-endian form at the given width
pub(crate) fn put_width(out: &mut Vec<u8>, value: u64, width: CountWidth) -> Result<()> {
    if value > width.max_value() {
        return Err(StoreError::Underflow64To32 {
            value,
            width: width.bits(),
        });
    }
    match width {
        CountWidth::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
        CountWidth::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        CountWidth::U64 => out.extend_from_slice(&value.to_le_bytes()),
    }
    Ok(())
}

/// Read a little-endian value of the given width at `*offset`
pub(crate) fn get_width(bytes: &[u8], offset: &mut usize, width: CountWidth) -> Result<u64> {
    let n = width.bytes();
    let Some(raw) = bytes.get(*offset..*offset + n) else {
        return Err(StoreError::BadData(format!(
            "truncated {}-bit field at offset {}",
            width.bits(),
            offset
        )));
    };
    *offset += n;
    Ok(decode_width(raw))
}

/// Little-endian decode of a 2, 4 or 8 byte slice
pub(crate) fn decode_width(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..raw.len()].copy_from_slice(raw);
    u64::from_le_bytes(buf)
}
