//! Positioned I/O over a table or blob file with a single-block cache.
//!
//! # Layout
//! A [`PxStream`] splits its underlying storage into a raw prefix (the
//! header, `data_start` bytes long) followed by fixed-size blocks. Accesses
//! inside the prefix go straight to the storage. Accesses past it are mapped
//! onto `(block_number, offset_in_block)` and served from one resident,
//! decrypted copy of that block.
//!
//! # Cache
//! Exactly one block is resident. Switching to another block first writes
//! the resident block back if it is dirty, re-encrypting it on the way out,
//! then loads the new one and decrypts it. A single access never spans two
//! blocks: such a request fails with [`PxError::BlockBoundary`].
//!
//! # Ownership
//! The stream assumes exclusive ownership of the file. Two streams over the
//! same file will not see each other's cached writes.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::crypto;
use crate::error::{PxError, Result};

/// Anything a document or blob store can live on.
pub trait Storage: Read + Write + Seek {}

impl<T: Read + Write + Seek> Storage for T {}

/// Which cipher variant protects the blocks of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// Table blocks: per-chunk parameters include the block number.
    Data,
    /// Blob blocks: the same parameters for every chunk of every block.
    Blob,
}

// ── Cached block ─────────────────────────────────────────────────────────────

struct CachedBlock {
    number: u32,
    data:   Vec<u8>,
    dirty:  bool,
}

// ── PxStream ─────────────────────────────────────────────────────────────────

pub struct PxStream<S> {
    inner:        S,
    pos:          u64,
    data_start:   u64,
    block_size:   usize,
    first_number: u32,
    key:          u32,
    cipher:       CipherKind,
    cache:        Option<CachedBlock>,
}

impl<S: Read + Write + Seek> PxStream<S> {
    /// A stream with no block geometry yet: every access is raw.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pos:          0,
            data_start:   u64::MAX,
            block_size:   0,
            first_number: 1,
            key:          0,
            cipher:       CipherKind::Data,
            cache:        None,
        }
    }

    /// Table geometry: header of `header_size` bytes, then blocks numbered
    /// from 1.
    pub fn for_table(inner: S, header_size: u64, block_size: usize, key: u32) -> Self {
        let mut s = Self::new(inner);
        s.data_start = header_size;
        s.block_size = block_size;
        s.key        = key;
        s
    }

    /// Blob-file geometry: 4096-byte blocks numbered from 0, no raw prefix.
    pub fn for_blob(inner: S, key: u32) -> Self {
        let mut s = Self::new(inner);
        s.data_start   = 0;
        s.block_size   = crate::blob::BLOB_BLOCK_SIZE;
        s.first_number = 0;
        s.key          = key;
        s.cipher       = CipherKind::Blob;
        s
    }

    /// Change the block geometry. The resident block is written back first.
    pub fn set_geometry(&mut self, header_size: u64, block_size: usize) -> Result<()> {
        self.flush_cache()?;
        self.cache      = None;
        self.data_start = header_size;
        self.block_size = block_size;
        Ok(())
    }

    /// Re-key the stream. The resident block is written back under the old
    /// key and dropped; later loads use the new key.
    pub fn set_key(&mut self, key: u32) -> Result<()> {
        self.flush_cache()?;
        self.cache = None;
        self.key   = key;
        Ok(())
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    // ── Positioning ──────────────────────────────────────────────────────────

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Physical length of the underlying storage.
    pub fn len(&mut self) -> Result<u64> {
        let end = self.inner.seek(SeekFrom::End(0))?;
        let cached_end = match &self.cache {
            Some(c) => self.block_offset(c.number) + self.block_size as u64,
            None    => 0,
        };
        Ok(end.max(cached_end))
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ── Sequential access ────────────────────────────────────────────────────

    /// Fill `buf` from the current position and advance past it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let pos = self.pos;
        self.read_at(pos, buf)?;
        self.pos = pos + buf.len() as u64;
        Ok(())
    }

    /// Write `buf` at the current position and advance past it.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        let pos = self.pos;
        self.write_at(pos, buf)?;
        self.pos = pos + buf.len() as u64;
        Ok(())
    }

    // ── Positioned access ────────────────────────────────────────────────────

    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.locate(pos, buf.len())? {
            None => {
                self.inner.seek(SeekFrom::Start(pos))?;
                self.inner.read_exact(buf)?;
            }
            Some((number, offset)) => {
                let block = self.load(number, false)?;
                buf.copy_from_slice(&block.data[offset..offset + buf.len()]);
            }
        }
        Ok(())
    }

    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.locate(pos, buf.len())? {
            None => {
                self.inner.seek(SeekFrom::Start(pos))?;
                self.inner.write_all(buf)?;
            }
            Some((number, offset)) => {
                let whole = offset == 0 && buf.len() == self.block_size;
                let block = self.load(number, whole)?;
                block.data[offset..offset + buf.len()].copy_from_slice(buf);
                block.dirty = true;
            }
        }
        Ok(())
    }

    /// Read one whole block by number.
    pub fn read_block(&mut self, number: u32) -> Result<Vec<u8>> {
        let block = self.load(number, false)?;
        Ok(block.data.clone())
    }

    /// Replace one whole block by number.
    pub fn write_block(&mut self, number: u32, data: &[u8]) -> Result<()> {
        let pos = self.block_offset(number);
        self.write_at(pos, data)
    }

    /// Byte offset of block `number`.
    pub fn block_offset(&self, number: u32) -> u64 {
        self.data_start + u64::from(number - self.first_number) * self.block_size as u64
    }

    /// Write back the resident block and flush the storage.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_cache()?;
        self.inner.flush()?;
        Ok(())
    }

    /// Flush and hand back the storage.
    pub fn into_inner(mut self) -> Result<S> {
        self.flush()?;
        Ok(self.inner)
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// `None` for a raw prefix access, otherwise `(block_number, offset)`.
    fn locate(&self, pos: u64, len: usize) -> Result<Option<(u32, usize)>> {
        if pos < self.data_start || self.block_size == 0 {
            if pos.saturating_add(len as u64) > self.data_start && self.block_size != 0 {
                return Err(PxError::BlockBoundary {
                    block:      0,
                    offset:     pos as usize,
                    len,
                    block_size: self.data_start as usize,
                });
            }
            return Ok(None);
        }
        let rel    = pos - self.data_start;
        let bs     = self.block_size as u64;
        let number = u32::try_from(rel / bs)
            .map_err(|_| PxError::InvalidArgument(format!("offset {pos} is beyond the addressable blocks")))?
            + self.first_number;
        let offset = (rel % bs) as usize;
        if offset + len > self.block_size {
            return Err(PxError::BlockBoundary { block: number, offset, len, block_size: self.block_size });
        }
        Ok(Some((number, offset)))
    }

    fn load(&mut self, number: u32, overwrite: bool) -> Result<&mut CachedBlock> {
        let hit = matches!(&self.cache, Some(c) if c.number == number);
        if !hit {
            self.flush_cache()?;
            let mut data = vec![0u8; self.block_size];
            if !overwrite {
                let got = self.read_physical(number, &mut data)?;
                if got > 0 && self.key != 0 {
                    self.decrypt(number, &mut data);
                }
            }
            self.cache = Some(CachedBlock { number, data, dirty: false });
        }
        match self.cache.as_mut() {
            Some(c) => Ok(c),
            None    => Err(PxError::Corrupt("block cache is empty after load".into())),
        }
    }

    /// Read as much of the block as the storage holds; the rest stays zero.
    fn read_physical(&mut self, number: u32, data: &mut [u8]) -> Result<usize> {
        self.inner.seek(SeekFrom::Start(self.block_offset(number)))?;
        let mut got = 0;
        while got < data.len() {
            match self.inner.read(&mut data[got..]) {
                Ok(0)                                           => break,
                Ok(n)                                           => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)                                          => return Err(e.into()),
            }
        }
        Ok(got)
    }

    fn flush_cache(&mut self) -> Result<()> {
        let Some(block) = self.cache.as_mut() else {
            return Ok(());
        };
        if !block.dirty {
            return Ok(());
        }
        let number = block.number;
        let mut out = block.data.clone();
        if self.key != 0 {
            self.encrypt(number, &mut out);
        }
        tracing::trace!(block = number, "writing back cached block");
        self.inner.seek(SeekFrom::Start(self.block_offset(number)))?;
        self.inner.write_all(&out)?;
        // Stays dirty on failure so a later flush retries the write.
        if let Some(block) = self.cache.as_mut() {
            block.dirty = false;
        }
        Ok(())
    }

    fn encrypt(&self, number: u32, data: &mut [u8]) {
        match self.cipher {
            CipherKind::Data => crypto::encrypt_db_block(data, self.key, number),
            CipherKind::Blob => crypto::encrypt_mb_block(data, self.key),
        }
    }

    fn decrypt(&self, number: u32, data: &mut [u8]) {
        match self.cipher {
            CipherKind::Data => crypto::decrypt_db_block(data, self.key, number),
            CipherKind::Blob => crypto::decrypt_mb_block(data, self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table(key: u32) -> PxStream<Cursor<Vec<u8>>> {
        PxStream::for_table(Cursor::new(vec![0u8; 2048]), 2048, 1024, key)
    }

    #[test]
    fn header_prefix_is_raw() {
        let mut s = table(0x1234);
        s.write_at(10, b"raw").unwrap();
        let inner = s.into_inner().unwrap().into_inner();
        assert_eq!(&inner[10..13], b"raw");
    }

    #[test]
    fn block_writes_are_cached_until_flush() {
        let mut s = table(0);
        s.write_at(2048 + 6, b"abc").unwrap();
        assert_eq!(s.get_mut().get_ref().len(), 2048);
        s.flush().unwrap();
        assert_eq!(&s.get_mut().get_ref()[2054..2057], b"abc");
    }

    #[test]
    fn encrypted_blocks_round_trip_through_cache() {
        let mut s = table(0xBEEF_0102);
        s.write_at(2048 + 1024 + 100, b"second block").unwrap();
        s.write_at(2048 + 5, b"first block").unwrap();
        let raw = s.into_inner().unwrap();
        assert_ne!(&raw.get_ref()[2048 + 1024 + 100..2048 + 1024 + 112], b"second block");

        let mut s = PxStream::for_table(raw, 2048, 1024, 0xBEEF_0102);
        let mut buf = [0u8; 12];
        s.read_at(2048 + 1024 + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"second block");
        let mut buf = [0u8; 11];
        s.read_at(2048 + 5, &mut buf).unwrap();
        assert_eq!(&buf, b"first block");
    }

    #[test]
    fn crossing_a_block_is_fatal() {
        let mut s = table(0);
        let err = s.write_at(2048 + 1020, &[1u8; 8]).unwrap_err();
        assert!(matches!(err, PxError::BlockBoundary { block: 1, offset: 1020, len: 8, .. }));
        assert_eq!(err.severity(), crate::error::Severity::Fatal);
    }

    #[test]
    fn read_past_end_is_zero_filled() {
        let mut s = table(0x55);
        let mut buf = [0xAAu8; 16];
        s.read_at(2048 + 3 * 1024, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    /// Storage whose writes fail while `failing` is set.
    struct FlakyDisk {
        data:    Cursor<Vec<u8>>,
        failing: bool,
    }

    impl Read for FlakyDisk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl Write for FlakyDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failing {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.data.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    #[test]
    fn failed_write_back_is_retried() {
        let disk = FlakyDisk { data: Cursor::new(vec![0u8; 2048]), failing: true };
        let mut s = PxStream::for_table(disk, 2048, 1024, 0);
        s.write_at(2058, b"precious").unwrap();
        assert!(matches!(s.flush(), Err(PxError::Io(_))));

        s.get_mut().failing = false;
        s.flush().unwrap();
        let raw = s.get_mut().data.get_ref();
        assert_eq!(raw.get(2058..2066), Some(&b"precious"[..]));
    }

    #[test]
    fn failed_eviction_keeps_block_resident() {
        let disk = FlakyDisk { data: Cursor::new(vec![0u8; 2048]), failing: true };
        let mut s = PxStream::for_table(disk, 2048, 1024, 0x0BAD_CAFE);
        s.write_at(2048 + 40, b"kept").unwrap();
        let mut buf = [0u8; 4];
        assert!(s.read_at(2048 + 1024, &mut buf).is_err());

        s.get_mut().failing = false;
        s.read_at(2048 + 40, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
        let raw = s.into_inner().unwrap().data.into_inner();
        let mut s = PxStream::for_table(Cursor::new(raw), 2048, 1024, 0x0BAD_CAFE);
        s.read_at(2048 + 40, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn sequential_access_advances() {
        let mut s = table(0);
        s.seek(2048);
        s.write(b"ab").unwrap();
        s.write(b"cd").unwrap();
        assert_eq!(s.tell(), 2052);
        s.seek(2048);
        let mut buf = [0u8; 4];
        s.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
