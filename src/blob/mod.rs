//! Blob file (`.MB`) store for values that do not fit their record slot.
//!
//! # Blocks
//! The file is a sequence of 4096-byte blocks. The first byte of each block
//! is its kind:
//!   - `0` header, block 0 only;
//!   - `2` single-value, one value spanning `num_blocks` whole blocks;
//!   - `3` sub-allocated, up to 64 small values in 16-byte chunks;
//!   - `4` free.
//!
//! A single-value block starts with `kind, num_blocks u16, length u32,
//! mod_nr u16` followed by the data. A sub-allocated block starts with
//! `kind, num_blocks u16` and 9 reserved bytes, then a 64-entry slot table
//! of `(chunk_offset u8, chunk_count u8, mod_nr u16, tail_len u8)`. Its data
//! area begins at chunk 21 and is kept contiguous: deleting a value packs
//! the remaining ones towards the front.
//!
//! # Descriptors
//! A blob field ends in a 10-byte [`BlobDescriptor`]: the block offset ORed
//! with the slot index (0xFF for single-value blocks), the value length and
//! a modification number. The bytes before it (the leader) hold the start
//! of the value, or the whole value when it fits.

use std::io::{Read, Seek, Write};

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::{PxError, Result, Warning};
use crate::io_stream::PxStream;

pub const BLOB_BLOCK_SIZE: usize = 4096;
/// Values longer than this get their own single-value block run.
pub const SINGLE_THRESHOLD: usize = 2048;
/// Graphic values carry this many extra bytes in front of the data.
pub const GRAPHIC_PREFIX_LEN: usize = 8;
/// Trailing bytes of a blob field.
pub const DESCRIPTOR_LEN: usize = 10;

const SINGLE_HEADER_LEN: usize = 9;
const SUB_HEADER_LEN: usize    = 12;
const SLOT_ENTRY_LEN: usize    = 5;
const SLOT_COUNT: usize        = 64;
const CHUNK: usize             = 16;
const SUB_DATA_START: usize    = 0x15;
const SUB_CHUNKS: usize        = BLOB_BLOCK_SIZE / CHUNK - SUB_DATA_START;
const SINGLE_INDEX: u8         = 0xFF;

const KIND_HEADER: u8 = 0;
const KIND_SINGLE: u8 = 2;
const KIND_SUB: u8    = 3;
const KIND_FREE: u8   = 4;

// ── Block list ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlobBlockKind {
    Header,
    Single,
    /// Trailing block of a single-value run.
    Continuation,
    SubAllocated,
    Free,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub number:       u32,
    pub kind:         BlobBlockKind,
    pub num_blocks:   u16,
    /// Values stored in the block.
    pub num_blobs:    u8,
    /// 16-byte chunks in use, sub-allocated blocks only.
    pub alloc_chunks: usize,
}

// ── Descriptor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobDescriptor {
    /// Byte offset of the owning block, 0 when the value is inline.
    pub offset: u32,
    pub index:  u8,
    /// Stored length, including the graphic prefix.
    pub size:   u32,
    pub mod_nr: u16,
}

impl BlobDescriptor {
    pub fn inline(size: usize) -> Self {
        Self { offset: 0, index: 0, size: size as u32, mod_nr: 0 }
    }

    /// Parse the last 10 bytes of a blob field.
    pub fn from_field(field: &[u8]) -> Result<Self> {
        let leader = field
            .len()
            .checked_sub(DESCRIPTOR_LEN)
            .ok_or_else(|| PxError::Corrupt(format!("blob field of {} bytes has no descriptor", field.len())))?;
        let d = &field[leader..];
        let ptr = LittleEndian::read_u32(&d[0..]);
        Ok(Self {
            offset: ptr & 0xFFFF_FF00,
            index:  (ptr & 0xFF) as u8,
            size:   LittleEndian::read_u32(&d[4..]),
            mod_nr: LittleEndian::read_u16(&d[8..]),
        })
    }

    pub fn write_to(&self, field: &mut [u8]) {
        let leader = field.len() - DESCRIPTOR_LEN;
        let d = &mut field[leader..];
        LittleEndian::write_u32(&mut d[0..], self.offset | u32::from(self.index));
        LittleEndian::write_u32(&mut d[4..], self.size);
        LittleEndian::write_u16(&mut d[8..], self.mod_nr);
    }

    pub fn is_inline(&self) -> bool {
        self.offset == 0
    }

    pub fn block(&self) -> u32 {
        self.offset / BLOB_BLOCK_SIZE as u32
    }
}

// ── Slot table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct SlotEntry {
    chunk_offset: u8,
    chunks:       u8,
    mod_nr:       u16,
    tail_len:     u8,
}

impl SlotEntry {
    fn read(block: &[u8], slot: usize) -> Self {
        let e = &block[SUB_HEADER_LEN + slot * SLOT_ENTRY_LEN..];
        Self {
            chunk_offset: e[0],
            chunks:       e[1],
            mod_nr:       LittleEndian::read_u16(&e[2..]),
            tail_len:     e[4],
        }
    }

    fn write(&self, block: &mut [u8], slot: usize) {
        let e = &mut block[SUB_HEADER_LEN + slot * SLOT_ENTRY_LEN..];
        e[0] = self.chunk_offset;
        e[1] = self.chunks;
        LittleEndian::write_u16(&mut e[2..], self.mod_nr);
        e[4] = self.tail_len;
    }

    fn is_free(&self) -> bool {
        self.chunk_offset == 0
    }

    fn len(&self) -> usize {
        (usize::from(self.chunks).saturating_sub(1)) * CHUNK + usize::from(self.tail_len)
    }
}

fn header_block() -> Vec<u8> {
    let mut b = vec![0u8; BLOB_BLOCK_SIZE];
    b[0] = KIND_HEADER;
    LittleEndian::write_u16(&mut b[0x01..], 1);
    LittleEndian::write_u16(&mut b[0x03..], 1);
    b[0x05..0x0B].copy_from_slice(&[0x82, 0x73, 0x02, 0x00, 0x29, 0x00]);
    LittleEndian::write_u16(&mut b[0x0B..], 0x1000);
    LittleEndian::write_u16(&mut b[0x0D..], 0x1000);
    b[0x10] = 0x10;
    LittleEndian::write_u16(&mut b[0x11..], 0x0040);
    LittleEndian::write_u16(&mut b[0x13..], 0x0800);
    b
}

fn empty_sub_block() -> Vec<u8> {
    let mut b = vec![0u8; BLOB_BLOCK_SIZE];
    b[0] = KIND_SUB;
    LittleEndian::write_u16(&mut b[1..], 1);
    b
}

// ── BlobStore ────────────────────────────────────────────────────────────────

pub struct BlobStore<S> {
    stream:    PxStream<S>,
    blocks:    Vec<BlockInfo>,
    mod_count: u16,
    dirty:     bool,
}

impl<S: Read + Write + Seek> BlobStore<S> {
    /// Initialise an empty blob file: a lone header block.
    pub fn create(inner: S, key: u32) -> Result<Self> {
        let mut stream = PxStream::for_blob(inner, key);
        stream.write_block(0, &header_block())?;
        stream.flush()?;
        tracing::debug!("created blob file");
        Ok(Self {
            stream,
            blocks:    vec![BlockInfo { number: 0, kind: BlobBlockKind::Header, num_blocks: 1, num_blobs: 0, alloc_chunks: 0 }],
            mod_count: 1,
            dirty:     false,
        })
    }

    pub fn open(inner: S, key: u32) -> Result<Self> {
        let mut stream = PxStream::for_blob(inner, key);
        let size = stream.len()?;
        if size == 0 || size % BLOB_BLOCK_SIZE as u64 != 0 {
            return Err(PxError::Blob(format!("size of blob file ({size}) is not a multiple of 4kB")));
        }
        let head = stream.read_block(0)?;
        if head[0] != KIND_HEADER {
            return Err(PxError::Blob(format!("blob file starts with a block of kind {}", head[0])));
        }
        let mod_count = LittleEndian::read_u16(&head[3..]);
        let mut store = Self { stream, blocks: Vec::new(), mod_count, dirty: false };
        store.blocks = store.scan_blocks((size / BLOB_BLOCK_SIZE as u64) as u32)?;
        tracing::debug!(blocks = store.blocks.len(), mod_count, "opened blob file");
        Ok(store)
    }

    fn scan_blocks(&mut self, count: u32) -> Result<Vec<BlockInfo>> {
        let mut out = Vec::with_capacity(count as usize);
        let mut n = 0;
        while n < count {
            let block = self.stream.read_block(n)?;
            let num_blocks = LittleEndian::read_u16(&block[1..]);
            let mut info = BlockInfo { number: n, kind: BlobBlockKind::Unknown(block[0]), num_blocks, num_blobs: 0, alloc_chunks: 0 };
            match block[0] {
                KIND_HEADER if n == 0 => info.kind = BlobBlockKind::Header,
                KIND_SINGLE => {
                    info.kind = BlobBlockKind::Single;
                    info.num_blobs = 1;
                    out.push(info);
                    let run = u32::from(num_blocks.max(1)).min(count - n);
                    for c in 1..run {
                        out.push(BlockInfo { number: n + c, kind: BlobBlockKind::Continuation, num_blocks: 0, num_blobs: 0, alloc_chunks: 0 });
                    }
                    n += run;
                    continue;
                }
                KIND_SUB => {
                    info.kind = BlobBlockKind::SubAllocated;
                    for slot in 0..SLOT_COUNT {
                        let e = SlotEntry::read(&block, slot);
                        if !e.is_free() {
                            info.num_blobs += 1;
                            info.alloc_chunks += usize::from(e.chunks);
                        }
                    }
                }
                KIND_FREE => info.kind = BlobBlockKind::Free,
                _ => {}
            }
            out.push(info);
            n += 1;
        }
        Ok(out)
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn mod_count(&self) -> u16 {
        self.mod_count
    }

    /// Non-fatal findings of the block scan.
    pub fn warnings(&self) -> Vec<Warning> {
        self.blocks
            .iter()
            .filter_map(|b| match b.kind {
                BlobBlockKind::Unknown(k) => Some(Warning::emit(format!("blob block {} has unknown kind {k}", b.number))),
                _                         => None,
            })
            .collect()
    }

    // ── Span access ──────────────────────────────────────────────────────────

    fn read_span(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let room = BLOB_BLOCK_SIZE - (at % BLOB_BLOCK_SIZE as u64) as usize;
            let n = room.min(buf.len() - done);
            self.stream.read_at(at, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn write_span(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let room = BLOB_BLOCK_SIZE - (at % BLOB_BLOCK_SIZE as u64) as usize;
            let n = room.min(buf.len() - done);
            self.stream.write_at(at, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn info_mut(&mut self, block: u32) -> Result<&mut BlockInfo> {
        self.blocks
            .get_mut(block as usize)
            .ok_or_else(|| PxError::Blob(format!("block {block} is beyond the end of the blob file")))
    }

    fn kind_at(&mut self, desc: &BlobDescriptor) -> Result<u8> {
        if desc.is_inline() {
            return Err(PxError::Blob("Offset in blob file is unexpectedly zero".into()));
        }
        let block = desc.block();
        if block as usize >= self.blocks.len() {
            return Err(PxError::Blob(format!("blob offset {} is beyond the end of the blob file", desc.offset)));
        }
        let mut kind = [0u8; 1];
        self.stream.read_at(u64::from(desc.offset), &mut kind)?;
        match kind[0] {
            KIND_HEADER => Err(PxError::Blob("Trying to read blob data from 'header' block".into())),
            KIND_FREE   => Err(PxError::Blob("Trying to read blob data from a 'free' block".into())),
            KIND_SINGLE | KIND_SUB => Ok(kind[0]),
            k           => Err(PxError::Corrupt(format!("blob block {block} has unknown kind {k}"))),
        }
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Fetch the stored bytes a descriptor points at.
    pub fn read(&mut self, desc: &BlobDescriptor) -> Result<Vec<u8>> {
        let size = desc.size as usize;
        match self.kind_at(desc)? {
            KIND_SINGLE => {
                if desc.index != SINGLE_INDEX {
                    return Err(PxError::Blob("Offset points to a single blob block but index field is not 0xff".into()));
                }
                let mut head = [0u8; SINGLE_HEADER_LEN];
                self.stream.read_at(u64::from(desc.offset), &mut head)?;
                let stored = LittleEndian::read_u32(&head[3..]);
                if stored != desc.size {
                    return Err(PxError::Blob(format!("Blob does not have expected size ({} != {stored})", desc.size)));
                }
                let mut data = vec![0u8; size];
                self.read_span(u64::from(desc.offset) + SINGLE_HEADER_LEN as u64, &mut data)?;
                Ok(data)
            }
            _ => {
                let slot = usize::from(desc.index);
                if slot >= SLOT_COUNT {
                    return Err(PxError::Blob(format!("slot index {slot} is out of range")));
                }
                let block = self.stream.read_block(desc.block())?;
                let e = SlotEntry::read(&block, slot);
                if e.is_free() {
                    return Err(PxError::Blob(format!("slot {slot} of blob block {} is empty", desc.block())));
                }
                if e.len() != size {
                    return Err(PxError::Blob(format!("Blob does not have expected size ({size} != {})", e.len())));
                }
                let start = usize::from(e.chunk_offset) * CHUNK;
                block
                    .get(start..start + size)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| PxError::Corrupt(format!("slot {slot} of blob block {} overruns the block", desc.block())))
            }
        }
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Store `data` and return its descriptor.
    pub fn write(&mut self, data: &[u8]) -> Result<BlobDescriptor> {
        if data.is_empty() {
            return Err(PxError::InvalidArgument("an empty value is never stored in the blob file".into()));
        }
        if data.len() > SINGLE_THRESHOLD {
            self.write_single(data)
        } else {
            self.write_sub(data)
        }
    }

    fn write_single(&mut self, data: &[u8]) -> Result<BlobDescriptor> {
        let len = u32::try_from(data.len()).map_err(|_| PxError::Blob("value is too large for the blob file".into()))?;
        let num_blocks = (data.len() + SINGLE_HEADER_LEN - 1) / BLOB_BLOCK_SIZE + 1;
        let num_blocks16 = u16::try_from(num_blocks).map_err(|_| PxError::Blob("value spans too many blocks".into()))?;
        let start = self.find_free_run(num_blocks).unwrap_or(self.blocks.len() as u32);

        self.mod_count = self.mod_count.wrapping_add(1);
        self.dirty = true;
        let mut buf = vec![0u8; num_blocks * BLOB_BLOCK_SIZE];
        buf[0] = KIND_SINGLE;
        LittleEndian::write_u16(&mut buf[1..], num_blocks16);
        LittleEndian::write_u32(&mut buf[3..], len);
        LittleEndian::write_u16(&mut buf[7..], self.mod_count);
        buf[SINGLE_HEADER_LEN..SINGLE_HEADER_LEN + data.len()].copy_from_slice(data);
        for (i, chunk) in buf.chunks(BLOB_BLOCK_SIZE).enumerate() {
            self.stream.write_block(start + i as u32, chunk)?;
        }

        for i in 0..num_blocks as u32 {
            let info = BlockInfo {
                number:       start + i,
                kind:         if i == 0 { BlobBlockKind::Single } else { BlobBlockKind::Continuation },
                num_blocks:   if i == 0 { num_blocks16 } else { 0 },
                num_blobs:    u8::from(i == 0),
                alloc_chunks: 0,
            };
            match self.blocks.get_mut((start + i) as usize) {
                Some(slot) => *slot = info,
                None       => self.blocks.push(info),
            }
        }
        tracing::debug!(block = start, num_blocks, len = data.len(), "stored value in single-value blocks");
        Ok(BlobDescriptor {
            offset: start * BLOB_BLOCK_SIZE as u32,
            index:  SINGLE_INDEX,
            size:   len,
            mod_nr: self.mod_count,
        })
    }

    /// First run of `n` consecutive free blocks.
    fn find_free_run(&self, n: usize) -> Option<u32> {
        let mut run = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.kind == BlobBlockKind::Free {
                run += 1;
                if run == n {
                    return Some((i + 1 - n) as u32);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn write_sub(&mut self, data: &[u8]) -> Result<BlobDescriptor> {
        let chunks = (data.len() - 1) / CHUNK + 1;
        let host = self
            .blocks
            .iter()
            .find(|b| b.kind == BlobBlockKind::SubAllocated && usize::from(b.num_blobs) < SLOT_COUNT && b.alloc_chunks + chunks <= SUB_CHUNKS)
            .map(|b| b.number);
        let number = match host {
            Some(n) => n,
            None => {
                let n = self
                    .blocks
                    .iter()
                    .find(|b| b.kind == BlobBlockKind::Free)
                    .map_or(self.blocks.len() as u32, |b| b.number);
                self.stream.write_block(n, &empty_sub_block())?;
                let info = BlockInfo { number: n, kind: BlobBlockKind::SubAllocated, num_blocks: 1, num_blobs: 0, alloc_chunks: 0 };
                match self.blocks.get_mut(n as usize) {
                    Some(slot) => *slot = info,
                    None       => self.blocks.push(info),
                }
                tracing::debug!(block = n, "initialised sub-allocated blob block");
                n
            }
        };

        let mut block = self.stream.read_block(number)?;
        let slot = (0..SLOT_COUNT)
            .rev()
            .find(|&s| SlotEntry::read(&block, s).is_free())
            .ok_or_else(|| PxError::Corrupt(format!("blob block {number} has no free slot")))?;
        let alloc = self.info_mut(number)?.alloc_chunks;
        let entry = SlotEntry {
            chunk_offset: (SUB_DATA_START + alloc) as u8,
            chunks:       chunks as u8,
            mod_nr:       self.mod_count.wrapping_add(1),
            tail_len:     match data.len() % CHUNK { 0 => CHUNK as u8, r => r as u8 },
        };
        entry.write(&mut block, slot);
        let start = usize::from(entry.chunk_offset) * CHUNK;
        block[start..start + data.len()].copy_from_slice(data);
        self.stream.write_block(number, &block)?;

        let info = self.info_mut(number)?;
        info.alloc_chunks += chunks;
        info.num_blobs += 1;
        self.mod_count = self.mod_count.wrapping_add(1);
        self.dirty = true;
        Ok(BlobDescriptor {
            offset: number * BLOB_BLOCK_SIZE as u32,
            index:  slot as u8,
            size:   data.len() as u32,
            mod_nr: self.mod_count,
        })
    }

    // ── Delete ───────────────────────────────────────────────────────────────

    /// Release the storage a descriptor points at.
    pub fn delete(&mut self, desc: &BlobDescriptor) -> Result<()> {
        match self.kind_at(desc)? {
            KIND_SINGLE => {
                if desc.index != SINGLE_INDEX {
                    return Err(PxError::Blob("Offset points to a single blob block but index field is not 0xff".into()));
                }
                let mut head = [0u8; SINGLE_HEADER_LEN];
                self.stream.read_at(u64::from(desc.offset), &mut head)?;
                let stored = LittleEndian::read_u32(&head[3..]);
                if stored != desc.size {
                    return Err(PxError::Blob(format!("Blob does not have expected size ({} != {stored})", desc.size)));
                }
                let first = desc.block();
                let run = u32::from(LittleEndian::read_u16(&head[1..]).max(1));
                let last = (first + run).min(self.blocks.len() as u32);
                for n in first..last {
                    self.stream.write_at(u64::from(n) * BLOB_BLOCK_SIZE as u64, &[KIND_FREE])?;
                    let info = self.info_mut(n)?;
                    *info = BlockInfo { number: n, kind: BlobBlockKind::Free, num_blocks: 0, num_blobs: 0, alloc_chunks: 0 };
                }
                tracing::debug!(block = first, run, "freed single-value blocks");
                Ok(())
            }
            _ => {
                let slot = usize::from(desc.index);
                if slot >= SLOT_COUNT {
                    return Err(PxError::Blob(format!("slot index {slot} is out of range")));
                }
                let number = desc.block();
                let original = self.stream.read_block(number)?;
                let removed = SlotEntry::read(&original, slot);
                if removed.is_free() {
                    return Err(PxError::Blob(format!("slot {slot} of blob block {number} is already empty")));
                }
                if removed.len() != desc.size as usize {
                    return Err(PxError::Blob(format!("Blob does not have expected size ({} != {})", desc.size, removed.len())));
                }

                let mut packed = original.clone();
                SlotEntry::default().write(&mut packed, slot);
                let mut next = SUB_DATA_START;
                for s in (0..SLOT_COUNT).rev() {
                    let mut e = SlotEntry::read(&packed, s);
                    if e.is_free() {
                        continue;
                    }
                    let from = usize::from(e.chunk_offset) * CHUNK;
                    let len = usize::from(e.chunks) * CHUNK;
                    let src = original
                        .get(from..from + len)
                        .ok_or_else(|| PxError::Corrupt(format!("slot {s} of blob block {number} overruns the block")))?;
                    packed[next * CHUNK..next * CHUNK + len].copy_from_slice(src);
                    e.chunk_offset = next as u8;
                    e.write(&mut packed, s);
                    next += usize::from(e.chunks);
                }
                packed[next * CHUNK..].fill(0);
                self.stream.write_block(number, &packed)?;

                let info = self.info_mut(number)?;
                info.alloc_chunks = info.alloc_chunks.saturating_sub(usize::from(removed.chunks));
                info.num_blobs = info.num_blobs.saturating_sub(1);
                Ok(())
            }
        }
    }

    /// Rewrite every block under a new key.
    pub fn rekey(&mut self, key: u32) -> Result<()> {
        let old = self.stream.key();
        for n in 0..self.blocks.len() as u32 {
            self.stream.set_key(old)?;
            let block = self.stream.read_block(n)?;
            self.stream.set_key(key)?;
            self.stream.write_block(n, &block)?;
        }
        self.stream.set_key(key)?;
        self.dirty = true;
        self.flush()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Persist the modification counter and write back cached blocks.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            let mut b = [0u8; 2];
            LittleEndian::write_u16(&mut b, self.mod_count);
            self.stream.write_at(3, &b)?;
            self.dirty = false;
        }
        self.stream.flush()
    }

    pub fn into_inner(mut self) -> Result<S> {
        self.flush()?;
        self.stream.into_inner()
    }
}
