//! Typed records over the byte protocol
//!
//! Fixed-width integers are little-endian. Counts and file spaces follow the
//! layout of the stream being read or written, not the container, so a
//! stream keeps the layout it was written with.

use crate::error::{Result, StoreError};
use crate::file_space::{decode_width, put_width, FileSpace};
use crate::version::{CountWidth, SpaceLayout, VersionContainer};

/// Byte-level access to the active stream
pub trait ByteStream {
    /// Next byte, or `None` at end of stream
    fn get_byte(&mut self) -> Result<Option<u8>>;

    fn put_byte(&mut self, byte: u8) -> Result<()>;

    /// Fill as much of `buf` as the stream holds; returns the count read
    fn get_block(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn put_block(&mut self, data: &[u8]) -> Result<usize>;

    /// Integer widths of the active stream
    fn active_layout(&self) -> Result<SpaceLayout>;

    /// Record a failure detected above the byte layer
    fn record_error(&mut self, err: StoreError) -> StoreError {
        err
    }
}

/// Typed record helpers, available on every [`ByteStream`]
pub trait RecordIo: ByteStream {
    /// Read exactly `buf.len()` bytes or fail with out-of-read
    fn get_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.get_block(buf)?;
        if got < buf.len() {
            return Err(self.record_error(StoreError::OutOfRead {
                needed: buf.len(),
                got,
            }));
        }
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_byte(value)
    }

    fn get_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_block(&value.to_le_bytes()).map(|_| ())
    }

    fn get_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.get_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_block(&value.to_le_bytes()).map(|_| ())
    }

    fn get_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_block(&value.to_le_bytes()).map(|_| ())
    }

    fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Element count at the active stream's count width
    fn put_count(&mut self, count: u64) -> Result<()> {
        let layout = self.active_layout()?;
        let mut bytes = Vec::with_capacity(8);
        if let Err(e) = put_width(&mut bytes, count, layout.count) {
            return Err(self.record_error(e));
        }
        self.put_block(&bytes).map(|_| ())
    }

    fn get_count(&mut self) -> Result<u64> {
        let layout = self.active_layout()?;
        self.get_width(layout.count)
    }

    #[doc(hidden)]
    fn get_width(&mut self, width: CountWidth) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_exact(&mut buf[..width.bytes()])?;
        Ok(decode_width(&buf[..width.bytes()]))
    }

    /// Counted UTF-8 string
    fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_count(s.len() as u64)?;
        self.put_block(s.as_bytes()).map(|_| ())
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_count()?;
        let len = usize::try_from(len).map_err(|_| {
            self.record_error(StoreError::Underflow64To32 {
                value: len,
                width: usize::BITS as u8,
            })
        })?;
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(len) {
            return Err(self.record_error(StoreError::OutOfMemory(format!(
                "string of {} bytes: {}",
                len, e
            ))));
        }
        buf.resize(len, 0);
        self.get_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| {
            self.record_error(StoreError::BadData(format!("string is not UTF-8: {}", e)))
        })
    }

    fn put_versions(&mut self, versions: &VersionContainer) -> Result<()> {
        let bytes = versions.encode().map_err(|e| self.record_error(e))?;
        self.put_block(&bytes).map(|_| ())
    }

    fn get_versions(&mut self) -> Result<VersionContainer> {
        let n = self.get_u8()? as usize;
        let mut versions = Vec::with_capacity(n);
        for _ in 0..n {
            versions.push(self.get_u16()?);
        }
        VersionContainer::from_slice(&versions).map_err(|e| self.record_error(e))
    }

    /// Counted file space at the active stream's layout
    fn put_file_space(&mut self, space: &FileSpace) -> Result<()> {
        let layout = self.active_layout()?;
        let bytes = space
            .encode(layout, true)
            .map_err(|e| self.record_error(e))?;
        self.put_block(&bytes).map(|_| ())
    }

    fn get_file_space(&mut self) -> Result<FileSpace> {
        let layout = self.active_layout()?;
        let count = self.get_width(layout.count)?;
        let mut indices = Vec::new();
        for _ in 0..count {
            indices.push(self.get_width(layout.index)?);
        }
        let last_used = self.get_u16()?;
        Ok(FileSpace::from_parts(indices, last_used))
    }
}

impl<T: ByteStream + ?Sized> RecordIo for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{STORAGE_V1, STORAGE_V3};

    /// Vec-backed stream for exercising the record layer alone
    struct VecStream {
        data: Vec<u8>,
        pos: usize,
        layout: SpaceLayout,
    }

    impl VecStream {
        fn new(version: u16) -> Self {
            VecStream {
                data: Vec::new(),
                pos: 0,
                layout: SpaceLayout::for_version(version).unwrap(),
            }
        }
    }

    impl ByteStream for VecStream {
        fn get_byte(&mut self) -> Result<Option<u8>> {
            let b = self.data.get(self.pos).copied();
            self.pos += b.is_some() as usize;
            Ok(b)
        }

        fn put_byte(&mut self, byte: u8) -> Result<()> {
            self.data.push(byte);
            Ok(())
        }

        fn get_block(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn put_block(&mut self, data: &[u8]) -> Result<usize> {
            self.data.extend_from_slice(data);
            Ok(data.len())
        }

        fn active_layout(&self) -> Result<SpaceLayout> {
            Ok(self.layout)
        }
    }

    #[test]
    fn test_fixed_width_values() {
        let mut s = VecStream::new(STORAGE_V3);
        s.put_u8(1).unwrap();
        s.put_u16(0x0203).unwrap();
        s.put_u32(0x0405_0607).unwrap();
        s.put_u64(u64::MAX - 1).unwrap();
        assert_eq!(s.data.len(), 15);
        assert_eq!(&s.data[..3], &[1, 3, 2]);

        assert_eq!(s.get_u8().unwrap(), 1);
        assert_eq!(s.get_u16().unwrap(), 0x0203);
        assert_eq!(s.get_u32().unwrap(), 0x0405_0607);
        assert_eq!(s.get_u64().unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_short_read_is_out_of_read() {
        let mut s = VecStream::new(STORAGE_V3);
        s.put_u16(7).unwrap();
        assert!(matches!(
            s.get_u32(),
            Err(StoreError::OutOfRead { needed: 4, got: 2 })
        ));
    }

    #[test]
    fn test_count_width_follows_layout() {
        let mut v1 = VecStream::new(STORAGE_V1);
        v1.put_count(3).unwrap();
        assert_eq!(v1.data.len(), 2);
        assert!(matches!(
            v1.put_count(70_000),
            Err(StoreError::Underflow64To32 { width: 16, .. })
        ));

        let mut v3 = VecStream::new(STORAGE_V3);
        v3.put_count(3).unwrap();
        assert_eq!(v3.data.len(), 8);
    }

    #[test]
    fn test_strings_versions_and_spaces() {
        let mut s = VecStream::new(STORAGE_V1);
        s.put_str("solid #1").unwrap();
        s.put_versions(&VersionContainer::new(2).with_app(5)).unwrap();
        s.put_file_space(&FileSpace::from_parts(vec![4, 2], 9)).unwrap();

        assert_eq!(s.get_str().unwrap(), "solid #1");
        assert_eq!(
            s.get_versions().unwrap(),
            VersionContainer::new(2).with_app(5)
        );
        assert_eq!(
            s.get_file_space().unwrap(),
            FileSpace::from_parts(vec![4, 2], 9)
        );
        assert_eq!(s.get_byte().unwrap(), None);
    }
}
