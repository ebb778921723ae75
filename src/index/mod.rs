//! Primary index: record number to `(block, slot)` resolution.
//!
//! # Entries
//! Each [`IndexEntry`] references one block and the number of records it
//! covers. Level-1 entries reference data blocks; level-2 entries reference
//! groups of level-1 entries stored in later index blocks. Only level-1
//! entries take part in lookups.
//!
//! # Sources
//! An index is either self-built by walking the table's block chain once,
//! or read from a primary index file whose records end in a 6-byte trailer
//! `(block number, record count, padding)` encoded as signed shorts.
//!
//! Without any index, [`scan_locate`] and [`scan_free_block`] walk the chain
//! directly.

use std::io::{Read, Seek, Write};

use serde::Serialize;

use crate::block::{read_block_header, read_record};
use crate::codec;
use crate::error::{PxError, Result, Warning};
use crate::header::{FileType, Header, INDEX_TRAILER_LEN};
use crate::io_stream::PxStream;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Referenced block: a data block for level 1, an index block for level 2.
    pub block:       u16,
    pub records:     u32,
    pub level:       u8,
    /// Physical index-file block holding the entry, 0 when self-built.
    pub index_block: u16,
    /// Key bytes of the first record covered, empty when self-built.
    #[serde(with = "hex_bytes")]
    pub key:         Vec<u8>,
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }
}

/// Where a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub block: u16,
    pub slot:  usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexSource {
    SelfBuilt,
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryIndex {
    entries: Vec<IndexEntry>,
    source:  IndexSource,
}

/// Walk the chain from `first_block`, visiting at most `file_blocks` blocks.
fn walk_chain<S, F>(stream: &mut PxStream<S>, header: &Header, mut visit: F) -> Result<()>
where
    S: Read + Write + Seek,
    F: FnMut(u16, usize) -> bool,
{
    let mut number = header.first_block;
    let mut seen = 0;
    while number != 0 && seen < header.file_blocks {
        let head = read_block_header(stream, header, number)?;
        let n = head.record_count(header, number)?;
        if !visit(number, n) {
            return Ok(());
        }
        number = head.next;
        seen += 1;
    }
    if number != 0 {
        return Err(PxError::Corrupt(format!(
            "block chain does not end after {} blocks",
            header.file_blocks
        )));
    }
    Ok(())
}

impl PrimaryIndex {
    pub fn from_entries(entries: Vec<IndexEntry>, source: IndexSource) -> Self {
        Self { entries, source }
    }

    /// Replay the block chain into level-1 entries.
    pub fn build<S: Read + Write + Seek>(stream: &mut PxStream<S>, header: &Header) -> Result<(Self, Vec<Warning>)> {
        let mut entries = Vec::with_capacity(usize::from(header.file_blocks));
        walk_chain(stream, header, |block, n| {
            entries.push(IndexEntry { block, records: n as u32, level: 1, index_block: 0, key: Vec::new() });
            true
        })?;

        let mut warnings = Vec::new();
        for e in entries.iter().filter(|e| e.records == 0) {
            warnings.push(Warning::emit(format!("Block with number {} has no records", e.block)));
        }
        let index = Self { entries, source: IndexSource::SelfBuilt };
        let total = index.total_records();
        if total != u64::from(header.num_records) {
            warnings.push(Warning::emit(format!(
                "Number of records counted in blocks does not match number of records in header ({} != {})",
                total, header.num_records
            )));
        }
        tracing::debug!(entries = index.entries.len(), records = total, "built primary index from block chain");
        Ok((index, warnings))
    }

    /// Load the entries of a primary index file.
    pub fn read_file<S: Read + Write + Seek>(stream: &mut PxStream<S>, header: &Header) -> Result<(Self, Vec<Warning>)> {
        if header.file_type != FileType::PrimaryIndex {
            return Err(PxError::IndexMismatch(format!("{} is not a primary index", header.file_type.description())));
        }
        let key_len = header.fields_len();
        if key_len + INDEX_TRAILER_LEN != header.record_size {
            return Err(PxError::IndexMismatch(format!(
                "Inconsistency in length of primary index record. Expected {} but calculated {}",
                header.record_size - INDEX_TRAILER_LEN,
                key_len
            )));
        }

        let mut blocks = Vec::new();
        walk_chain(stream, header, |block, n| {
            blocks.push((block, n));
            true
        })?;
        let mut entries = Vec::new();
        for (block, n) in blocks {
            for slot in 0..n {
                let rec = read_record(stream, header, block, slot)?;
                let trailer = &rec[key_len..];
                let target = codec::decode_short(&trailer[0..2])?.unwrap_or(0);
                let count = codec::decode_short(&trailer[2..4])?.unwrap_or(0);
                if target < 0 || count < 0 {
                    return Err(PxError::Corrupt(format!("index record in block {block} has negative references")));
                }
                entries.push(IndexEntry {
                    block:       target as u16,
                    records:     count as u32,
                    level:       1,
                    index_block: block,
                    key:         rec[..key_len].to_vec(),
                });
            }
        }

        let mut warnings = Vec::new();
        if entries.len() != header.num_records as usize {
            warnings.push(Warning::emit(format!(
                "Index file declares {} entries but its blocks hold {}",
                header.num_records,
                entries.len()
            )));
        }
        if header.file_blocks > 1 {
            if let Some(first) = entries.first().map(|e| e.index_block) {
                let mut balance: i64 = 0;
                for e in entries.iter_mut() {
                    if e.index_block == first {
                        e.level = 2;
                        balance += i64::from(e.records);
                    } else {
                        balance -= i64::from(e.records);
                    }
                }
                if balance != 0 {
                    warnings.push(Warning::emit("The number of records covered by index level 2 is unequal to level 1"));
                }
            }
        }
        tracing::debug!(entries = entries.len(), "read primary index file");
        Ok((Self { entries, source: IndexSource::External }, warnings))
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn source(&self) -> IndexSource {
        self.source
    }

    pub fn level1(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| e.level == 1)
    }

    pub fn total_records(&self) -> u64 {
        self.level1().map(|e| u64::from(e.records)).sum()
    }

    /// Resolve the `recno`-th record (0-based) by accumulating level-1 counts.
    pub fn locate(&self, recno: u64) -> Option<Location> {
        let mut rest = recno;
        for e in self.level1() {
            let n = u64::from(e.records);
            if rest < n {
                return Some(Location { block: e.block, slot: rest as usize });
            }
            rest -= n;
        }
        None
    }

    /// First level-1 block with room for another record.
    pub fn find_free(&self, records_per_block: usize) -> Option<u16> {
        self.level1().find(|e| (e.records as usize) < records_per_block).map(|e| e.block)
    }

    fn entry_mut(&mut self, block: u16) -> Result<&mut IndexEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.level == 1 && e.block == block)
            .ok_or_else(|| PxError::IndexMismatch(format!("data block {block} has no index entry")))
    }

    /// Set the record count of a data block. The level-2 entry covering the
    /// index block that holds its entry moves by the same amount.
    pub fn set_block_count(&mut self, block: u16, records: usize) -> Result<()> {
        let entry = self.entry_mut(block)?;
        let old = i64::from(entry.records);
        let parent = entry.index_block;
        entry.records = records as u32;
        if let Some(l2) = self.entries.iter_mut().find(|e| e.level == 2 && e.block == parent) {
            l2.records = (i64::from(l2.records) + records as i64 - old).max(0) as u32;
        }
        Ok(())
    }

    /// Register a block spliced into the chain after `after` (0 = front).
    /// The new entry joins the index block of its neighbour.
    pub fn block_appended(&mut self, after: u16, block: u16) {
        let pos = match after {
            0 => self.entries.iter().position(|e| e.level == 1).unwrap_or(self.entries.len()),
            a => self
                .entries
                .iter()
                .position(|e| e.level == 1 && e.block == a)
                .map_or(self.entries.len(), |p| p + 1),
        };
        let neighbour = match after {
            0 => self.entries.get(pos),
            _ => pos.checked_sub(1).and_then(|p| self.entries.get(p)),
        };
        let index_block = neighbour.filter(|e| e.level == 1).map_or(0, |e| e.index_block);
        let entry = IndexEntry { block, records: 0, level: 1, index_block, key: Vec::new() };
        self.entries.insert(pos, entry);
    }
}

/// Encode the trailer of an index record.
pub fn encode_trailer(block: u16, records: u32) -> Result<[u8; INDEX_TRAILER_LEN]> {
    let block = i16::try_from(block).map_err(|_| PxError::Unsupported(format!("block number {block} does not fit an index entry")))?;
    let records = i16::try_from(records).map_err(|_| PxError::Unsupported(format!("record count {records} does not fit an index entry")))?;
    let mut out = [0u8; INDEX_TRAILER_LEN];
    out[0..2].copy_from_slice(&codec::encode_short(Some(block))?);
    out[2..4].copy_from_slice(&codec::encode_short(Some(records))?);
    out[4..6].copy_from_slice(&codec::encode_short(Some(0))?);
    Ok(out)
}

// ── Chain scans ──────────────────────────────────────────────────────────────

/// Resolve a record without an index.
pub fn scan_locate<S: Read + Write + Seek>(stream: &mut PxStream<S>, header: &Header, recno: u64) -> Result<Option<Location>> {
    let mut rest = recno;
    let mut found = None;
    walk_chain(stream, header, |block, n| {
        if rest < n as u64 {
            found = Some(Location { block, slot: rest as usize });
            return false;
        }
        rest -= n as u64;
        true
    })?;
    Ok(found)
}

/// First block in chain order with room for another record.
pub fn scan_free_block<S: Read + Write + Seek>(stream: &mut PxStream<S>, header: &Header) -> Result<Option<u16>> {
    let rpb = header.records_per_block();
    let mut found = None;
    walk_chain(stream, header, |block, n| {
        if n < rpb {
            found = Some(block);
            return false;
        }
        true
    })?;
    Ok(found)
}

/// `(block, record count)` of every block in chain order.
pub fn chain_counts<S: Read + Write + Seek>(stream: &mut PxStream<S>, header: &Header) -> Result<Vec<(u16, usize)>> {
    let mut out = Vec::new();
    walk_chain(stream, header, |block, n| {
        out.push((block, n));
        true
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block: u16, records: u32, level: u8) -> IndexEntry {
        IndexEntry { block, records, level, index_block: 0, key: Vec::new() }
    }

    #[test]
    fn locate_accumulates_level_one_counts() {
        let idx = PrimaryIndex::from_entries(
            vec![entry(9, 99, 2), entry(1, 3, 1), entry(4, 0, 1), entry(2, 2, 1)],
            IndexSource::External,
        );
        assert_eq!(idx.total_records(), 5);
        assert_eq!(idx.locate(0), Some(Location { block: 1, slot: 0 }));
        assert_eq!(idx.locate(2), Some(Location { block: 1, slot: 2 }));
        assert_eq!(idx.locate(3), Some(Location { block: 2, slot: 0 }));
        assert_eq!(idx.locate(5), None);
    }

    #[test]
    fn free_block_search() {
        let idx = PrimaryIndex::from_entries(vec![entry(1, 10, 1), entry(3, 4, 1)], IndexSource::SelfBuilt);
        assert_eq!(idx.find_free(10), Some(3));
        assert_eq!(idx.find_free(4), None);
    }

    #[test]
    fn appended_blocks_follow_their_predecessor() {
        let mut idx = PrimaryIndex::from_entries(vec![entry(1, 1, 1), entry(2, 1, 1)], IndexSource::SelfBuilt);
        idx.block_appended(1, 3);
        idx.block_appended(2, 4);
        idx.block_appended(0, 5);
        let order: Vec<u16> = idx.entries().iter().map(|e| e.block).collect();
        assert_eq!(order, vec![5, 1, 3, 2, 4]);
        idx.set_block_count(3, 7).unwrap();
        assert_eq!(idx.total_records(), 9);
        assert!(idx.set_block_count(42, 1).is_err());
    }

    #[test]
    fn level_two_totals_follow_block_counts() {
        let under = |block, records, index_block| IndexEntry { index_block, ..entry(block, records, 1) };
        let mut idx = PrimaryIndex::from_entries(
            vec![
                IndexEntry { index_block: 1, ..entry(2, 5, 2) },
                IndexEntry { index_block: 1, ..entry(3, 4, 2) },
                under(1, 3, 2),
                under(2, 2, 2),
                under(3, 4, 3),
            ],
            IndexSource::External,
        );
        idx.set_block_count(2, 1).unwrap();
        assert_eq!(idx.entries()[0].records, 4);
        assert_eq!(idx.entries()[1].records, 4);

        idx.block_appended(3, 7);
        idx.set_block_count(7, 2).unwrap();
        assert_eq!(idx.entries()[1].records, 6);
        let level2: u64 = idx.entries().iter().filter(|e| e.level == 2).map(|e| u64::from(e.records)).sum();
        assert_eq!(level2, idx.total_records());
    }

    #[test]
    fn trailer_uses_flipped_shorts() {
        let t = encode_trailer(2, 5).unwrap();
        assert_eq!(t, [0x80, 0x02, 0x80, 0x05, 0x80, 0x00]);
        assert!(encode_trailer(u16::MAX, 1).is_err());
    }
}
