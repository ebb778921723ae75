//! Data block layout and in-block slot operations.
//!
//! A data block starts with a 6-byte chain header followed by a dense array
//! of record slots:
//!
//! ```text
//! next_block     u16   logical successor, 0 = none
//! prev_block     u16   logical predecessor, 0 = none
//! add_data_size  i16   (records - 1) * record_size, -record_size when empty
//! ```
//!
//! Slots are packed from index 0 with no gaps; deleting a record shifts the
//! later slots down by one.

use std::io::{Read, Seek, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{PxError, Result};
use crate::header::{Header, BLOCK_HEADER_LEN};
use crate::io_stream::PxStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub next:          u16,
    pub prev:          u16,
    pub add_data_size: i16,
}

impl DataBlockHeader {
    pub fn empty(prev: u16, next: u16, record_size: usize) -> Self {
        Self { next, prev, add_data_size: -(record_size as i16) }
    }

    pub fn from_bytes(b: &[u8; BLOCK_HEADER_LEN]) -> Self {
        Self {
            next:          LittleEndian::read_u16(&b[0..]),
            prev:          LittleEndian::read_u16(&b[2..]),
            add_data_size: LittleEndian::read_i16(&b[4..]),
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut b = [0u8; BLOCK_HEADER_LEN];
        LittleEndian::write_u16(&mut b[0..], self.next);
        LittleEndian::write_u16(&mut b[2..], self.prev);
        LittleEndian::write_i16(&mut b[4..], self.add_data_size);
        b
    }

    /// Record count as declared, which may be nonsense in a damaged file.
    pub fn raw_count(&self, record_size: usize) -> i32 {
        i32::from(self.add_data_size) / record_size as i32 + 1
    }

    /// Record count, checked against the block capacity.
    pub fn record_count(&self, header: &Header, number: u16) -> Result<usize> {
        let rs = header.record_size as i32;
        let used = i32::from(self.add_data_size) + rs;
        if used < 0 || used as usize > header.block_size() - BLOCK_HEADER_LEN || used % rs != 0 {
            return Err(PxError::Corrupt(format!(
                "data block {number} declares {} used bytes for records of {rs} bytes",
                self.add_data_size
            )));
        }
        Ok((used / rs) as usize)
    }

    pub fn set_record_count(&mut self, n: usize, record_size: usize) {
        self.add_data_size = ((n as i32 - 1) * record_size as i32) as i16;
    }
}

fn check_number(header: &Header, number: u16) -> Result<()> {
    if number == 0 || number > header.file_blocks {
        return Err(PxError::Corrupt(format!(
            "block number {number} outside 1..={}",
            header.file_blocks
        )));
    }
    Ok(())
}

fn slot_offset(header: &Header, number: u16, slot: usize) -> u64 {
    header.block_offset(number) + (BLOCK_HEADER_LEN + slot * header.record_size) as u64
}

// ── Chain header access ──────────────────────────────────────────────────────

pub fn read_block_header<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
) -> Result<DataBlockHeader> {
    check_number(header, number)?;
    let mut b = [0u8; BLOCK_HEADER_LEN];
    stream.read_at(header.block_offset(number), &mut b)?;
    Ok(DataBlockHeader::from_bytes(&b))
}

pub fn write_block_header<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
    block:  &DataBlockHeader,
) -> Result<()> {
    check_number(header, number)?;
    stream.write_at(header.block_offset(number), &block.to_bytes())
}

// ── Chain extension ──────────────────────────────────────────────────────────

/// Append an empty block at the end of the file and splice it into the chain
/// after `after` (0 = at the front). Updates the block bookkeeping in
/// `header`; the caller persists the header. Returns the new block number.
pub fn append_block<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &mut Header,
    after:  u16,
) -> Result<u16> {
    if after > header.file_blocks {
        return Err(PxError::InvalidArgument(format!(
            "cannot insert a block after block {after}, the file has {} blocks",
            header.file_blocks
        )));
    }
    let number = header
        .file_blocks
        .checked_add(1)
        .ok_or_else(|| PxError::Unsupported("the file has reached the maximum block count".into()))?;

    let mut prev = None;
    let next = if after != 0 {
        let p = read_block_header(stream, header, after)?;
        prev = Some(p);
        p.next
    } else {
        header.first_block
    };
    let next_head = if next != 0 { Some(read_block_header(stream, header, next)?) } else { None };

    let mut body = vec![0u8; header.block_size()];
    body[..BLOCK_HEADER_LEN].copy_from_slice(&DataBlockHeader::empty(after, next, header.record_size).to_bytes());
    header.file_blocks = number;
    stream.write_block(u32::from(number), &body)?;

    if let Some(mut p) = prev {
        p.next = number;
        write_block_header(stream, header, after, &p)?;
    }
    if let Some(mut n) = next_head {
        n.prev = number;
        write_block_header(stream, header, next, &n)?;
    }
    if after == 0 {
        header.first_block = number;
    }
    if next == 0 {
        header.last_block = number;
    }
    tracing::debug!(block = number, after, "appended data block");
    Ok(number)
}

// ── Slots ────────────────────────────────────────────────────────────────────

pub fn read_record<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
    slot:   usize,
) -> Result<Vec<u8>> {
    check_number(header, number)?;
    let mut buf = vec![0u8; header.record_size];
    stream.read_at(slot_offset(header, number, slot), &mut buf)?;
    Ok(buf)
}

pub fn write_record<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
    slot:   usize,
    data:   &[u8],
) -> Result<()> {
    check_number(header, number)?;
    if data.len() != header.record_size {
        return Err(PxError::InvalidArgument(format!(
            "record is {} bytes, expected {}",
            data.len(),
            header.record_size
        )));
    }
    stream.write_at(slot_offset(header, number, slot), data)
}

/// Outcome of storing a record into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Slot the record ended up in.
    pub slot:   usize,
    /// `true` when an existing record was overwritten.
    pub update: bool,
}

/// Store `data` at `slot`. A slot past the current count is pulled back to
/// the first free slot so the block stays dense.
pub fn add_record_to_block<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
    slot:   usize,
    data:   &[u8],
) -> Result<Placement> {
    let rpb = header.records_per_block();
    if slot >= rpb {
        return Err(PxError::InvalidArgument(format!(
            "slot {slot} is beyond the {rpb} records a block can hold"
        )));
    }
    let mut head = read_block_header(stream, header, number)?;
    let n = head.record_count(header, number)?;
    let placement = if slot >= n {
        if n >= rpb {
            return Err(PxError::Corrupt(format!("data block {number} is already full")));
        }
        head.set_record_count(n + 1, header.record_size);
        write_block_header(stream, header, number, &head)?;
        Placement { slot: n, update: false }
    } else {
        Placement { slot, update: true }
    };
    write_record(stream, header, number, placement.slot, data)?;
    Ok(placement)
}

/// Remove the record at `slot`, shifting later records down. Returns the
/// number of records left in the block.
pub fn delete_record_from_block<S: Read + Write + Seek>(
    stream: &mut PxStream<S>,
    header: &Header,
    number: u16,
    slot:   usize,
) -> Result<usize> {
    let mut head = read_block_header(stream, header, number)?;
    let n = head.record_count(header, number)?;
    if slot >= n {
        return Err(PxError::InvalidArgument(format!(
            "slot {slot} of data block {number} is beyond its {n} records"
        )));
    }
    for i in slot + 1..n {
        let rec = read_record(stream, header, number, i)?;
        write_record(stream, header, number, i - 1, &rec)?;
    }
    let zero = vec![0u8; header.record_size];
    write_record(stream, header, number, n - 1, &zero)?;
    head.set_record_count(n - 1, header.record_size);
    write_block_header(stream, header, number, &head)?;
    Ok(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{FieldSpec, FieldType, FileType};
    use std::io::Cursor;

    fn setup() -> (PxStream<Cursor<Vec<u8>>>, Header) {
        let header = Header::new(FileType::Table, vec![FieldSpec::new("A", FieldType::Alpha, 100)]).unwrap();
        let stream = PxStream::for_table(Cursor::new(vec![0u8; header.header_size]), header.header_size as u64, header.block_size(), 0);
        (stream, header)
    }

    fn rec(h: &Header, b: u8) -> Vec<u8> {
        vec![b; h.record_size]
    }

    #[test]
    fn empty_block_sentinel() {
        let h = DataBlockHeader::empty(0, 0, 61);
        assert_eq!(h.add_data_size, -61);
        assert_eq!(h.raw_count(61), 0);
        let bytes = h.to_bytes();
        assert_eq!(DataBlockHeader::from_bytes(&bytes), h);
    }

    #[test]
    fn chain_extension_links_blocks() {
        let (mut s, mut h) = setup();
        assert_eq!(append_block(&mut s, &mut h, 0).unwrap(), 1);
        assert_eq!(append_block(&mut s, &mut h, 1).unwrap(), 2);
        assert_eq!(append_block(&mut s, &mut h, 1).unwrap(), 3);
        assert_eq!((h.first_block, h.last_block, h.file_blocks), (1, 2, 3));

        let b1 = read_block_header(&mut s, &h, 1).unwrap();
        let b3 = read_block_header(&mut s, &h, 3).unwrap();
        let b2 = read_block_header(&mut s, &h, 2).unwrap();
        assert_eq!((b1.prev, b1.next), (0, 3));
        assert_eq!((b3.prev, b3.next), (1, 2));
        assert_eq!((b2.prev, b2.next), (3, 0));
    }

    #[test]
    fn slots_stay_dense() {
        let (mut s, mut h) = setup();
        append_block(&mut s, &mut h, 0).unwrap();
        for (i, b) in [b'a', b'b', b'c'].into_iter().enumerate() {
            let p = add_record_to_block(&mut s, &h, 1, 5, &rec(&h, b)).unwrap();
            assert_eq!(p, Placement { slot: i, update: false });
        }
        let p = add_record_to_block(&mut s, &h, 1, 1, &rec(&h, b'B')).unwrap();
        assert!(p.update);

        assert_eq!(delete_record_from_block(&mut s, &h, 1, 0).unwrap(), 2);
        assert_eq!(read_record(&mut s, &h, 1, 0).unwrap(), rec(&h, b'B'));
        assert_eq!(read_record(&mut s, &h, 1, 1).unwrap(), rec(&h, b'c'));
        let head = read_block_header(&mut s, &h, 1).unwrap();
        assert_eq!(head.record_count(&h, 1).unwrap(), 2);

        assert_eq!(delete_record_from_block(&mut s, &h, 1, 1).unwrap(), 1);
        assert_eq!(delete_record_from_block(&mut s, &h, 1, 0).unwrap(), 0);
        let head = read_block_header(&mut s, &h, 1).unwrap();
        assert_eq!(head.add_data_size, -(h.record_size as i16));
        assert!(delete_record_from_block(&mut s, &h, 1, 0).is_err());
    }

    #[test]
    fn full_block_rejects_append() {
        let (mut s, mut h) = setup();
        append_block(&mut s, &mut h, 0).unwrap();
        let rpb = h.records_per_block();
        for _ in 0..rpb {
            add_record_to_block(&mut s, &h, 1, rpb - 1, &rec(&h, 1)).unwrap();
        }
        assert!(add_record_to_block(&mut s, &h, 1, rpb - 1, &rec(&h, 2)).unwrap().update);
        assert!(add_record_to_block(&mut s, &h, 1, rpb, &rec(&h, 2)).is_err());
    }

    #[test]
    fn corrupt_count_is_reported() {
        let (mut s, mut h) = setup();
        append_block(&mut s, &mut h, 0).unwrap();
        let bad = DataBlockHeader { next: 0, prev: 0, add_data_size: 7 };
        write_block_header(&mut s, &h, 1, &bad).unwrap();
        let head = read_block_header(&mut s, &h, 1).unwrap();
        assert!(matches!(head.record_count(&h, 1), Err(PxError::Corrupt(_))));
        assert!(read_block_header(&mut s, &h, 2).is_err());
    }
}
