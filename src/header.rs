//! Table header codec.
//!
//! # Layout
//! ```text
//! 0x00  fixed header                0x58 bytes
//! 0x58  extended (data) header      0x20 bytes, tables and secondary indexes only
//!       field info                  2 bytes per field (type, length)
//!       table name pointer          4 bytes
//!       field name pointers         4 bytes per field, not in index files
//!       table name                  261 bytes (version 7) or 79 bytes
//!       field names                 NUL-terminated
//!       field numbers               2 bytes per field
//!       sort order tag              "ANSIINTL"
//! ```
//! The region is zero-padded to a multiple of 2048 bytes. Pointer fields are
//! placeholders: they are recomputed on write and ignored on read.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::codec::BCD_LEN;
use crate::error::{PxError, Result};

pub const FIXED_HEADER_LEN: usize  = 0x58;
pub const DATA_HEADER_LEN: usize   = 0x20;
pub const HEADER_ALIGN: usize      = 0x800;
/// Size of the chain header at the start of every data block.
pub const BLOCK_HEADER_LEN: usize  = 6;
/// Trailing bytes of an index record: block number, record count, padding.
pub const INDEX_TRAILER_LEN: usize = 6;

const ENCRYPTION_MARKER: u32  = 0xFF00_FF00;
const SORT_ORDER_TAG: &[u8; 8] = b"ANSIINTL";
const LONG_TABLE_NAME: usize  = 261;
const SHORT_TABLE_NAME: usize = 79;

// ── File types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    IndexedTable,
    PrimaryIndex,
    Table,
    NonIncSecondaryIndex,
    SecondaryIndex,
    IncSecondaryIndex,
    NonIncSecondaryIndexG,
    SecondaryIndexG,
    IncSecondaryIndexG,
}

impl FileType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FileType::IndexedTable,
            1 => FileType::PrimaryIndex,
            2 => FileType::Table,
            3 => FileType::NonIncSecondaryIndex,
            4 => FileType::SecondaryIndex,
            5 => FileType::IncSecondaryIndex,
            6 => FileType::NonIncSecondaryIndexG,
            7 => FileType::SecondaryIndexG,
            8 => FileType::IncSecondaryIndexG,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FileType::IndexedTable          => 0,
            FileType::PrimaryIndex          => 1,
            FileType::Table                 => 2,
            FileType::NonIncSecondaryIndex  => 3,
            FileType::SecondaryIndex        => 4,
            FileType::IncSecondaryIndex     => 5,
            FileType::NonIncSecondaryIndexG => 6,
            FileType::SecondaryIndexG       => 7,
            FileType::IncSecondaryIndexG    => 8,
        }
    }

    /// `.DB` files.
    pub fn is_table(self) -> bool {
        matches!(self, FileType::IndexedTable | FileType::Table)
    }

    /// Files carrying the extended header and field names.
    pub fn has_data_header(self) -> bool {
        !self.has_index_trailer()
    }

    /// Index files whose records end in a block reference.
    pub fn has_index_trailer(self) -> bool {
        matches!(self, FileType::PrimaryIndex | FileType::SecondaryIndex | FileType::SecondaryIndexG)
    }

    pub fn is_secondary(self) -> bool {
        matches!(
            self,
            FileType::NonIncSecondaryIndex
                | FileType::IncSecondaryIndex
                | FileType::NonIncSecondaryIndexG
                | FileType::IncSecondaryIndexG
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            FileType::IndexedTable          => "indexed .DB data file",
            FileType::PrimaryIndex          => "primary index .PX file",
            FileType::Table                 => "non indexed .DB data file",
            FileType::NonIncSecondaryIndex  => "non-incrementing secondary index .Xnn file",
            FileType::SecondaryIndex        => "secondary index .Ynn file",
            FileType::IncSecondaryIndex     => "incrementing secondary index .Xnn file",
            FileType::NonIncSecondaryIndexG => "non-incrementing secondary index .XGn file",
            FileType::SecondaryIndexG       => "secondary index .YGn file",
            FileType::IncSecondaryIndexG    => "incrementing secondary index .XGn file",
        }
    }
}

// ── Field types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    Alpha,
    Date,
    Short,
    Long,
    Currency,
    Number,
    Logical,
    MemoBlob,
    Blob,
    FmtMemoBlob,
    Ole,
    Graphic,
    Time,
    Timestamp,
    AutoInc,
    Bcd,
    Bytes,
}

impl FieldType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => FieldType::Alpha,
            0x02 => FieldType::Date,
            0x03 => FieldType::Short,
            0x04 => FieldType::Long,
            0x05 => FieldType::Currency,
            0x06 => FieldType::Number,
            0x09 => FieldType::Logical,
            0x0C => FieldType::MemoBlob,
            0x0D => FieldType::Blob,
            0x0E => FieldType::FmtMemoBlob,
            0x0F => FieldType::Ole,
            0x10 => FieldType::Graphic,
            0x14 => FieldType::Time,
            0x15 => FieldType::Timestamp,
            0x16 => FieldType::AutoInc,
            0x17 => FieldType::Bcd,
            0x18 => FieldType::Bytes,
            _    => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FieldType::Alpha       => 0x01,
            FieldType::Date        => 0x02,
            FieldType::Short       => 0x03,
            FieldType::Long        => 0x04,
            FieldType::Currency    => 0x05,
            FieldType::Number      => 0x06,
            FieldType::Logical     => 0x09,
            FieldType::MemoBlob    => 0x0C,
            FieldType::Blob        => 0x0D,
            FieldType::FmtMemoBlob => 0x0E,
            FieldType::Ole         => 0x0F,
            FieldType::Graphic     => 0x10,
            FieldType::Time        => 0x14,
            FieldType::Timestamp   => 0x15,
            FieldType::AutoInc     => 0x16,
            FieldType::Bcd         => 0x17,
            FieldType::Bytes       => 0x18,
        }
    }

    /// Short type name as shown by the command line.
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Alpha       => "alpha",
            FieldType::Date        => "date",
            FieldType::Short       => "short",
            FieldType::Long        => "long",
            FieldType::Currency    => "currency",
            FieldType::Number      => "number",
            FieldType::Logical     => "logical",
            FieldType::MemoBlob    => "memo",
            FieldType::Blob        => "blob",
            FieldType::FmtMemoBlob => "fmtmemo",
            FieldType::Ole         => "ole",
            FieldType::Graphic     => "graphic",
            FieldType::Time        => "time",
            FieldType::Timestamp   => "timestamp",
            FieldType::AutoInc     => "autoinc",
            FieldType::Bcd         => "bcd",
            FieldType::Bytes       => "bytes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "alpha" | "text"  => FieldType::Alpha,
            "date"            => FieldType::Date,
            "short"           => FieldType::Short,
            "long" | "int"    => FieldType::Long,
            "currency"        => FieldType::Currency,
            "number" | "real" => FieldType::Number,
            "logical" | "bool" => FieldType::Logical,
            "memo"            => FieldType::MemoBlob,
            "blob"            => FieldType::Blob,
            "fmtmemo"         => FieldType::FmtMemoBlob,
            "ole"             => FieldType::Ole,
            "graphic"         => FieldType::Graphic,
            "time"            => FieldType::Time,
            "timestamp"       => FieldType::Timestamp,
            "autoinc"         => FieldType::AutoInc,
            "bcd"             => FieldType::Bcd,
            "bytes"           => FieldType::Bytes,
            _                 => return None,
        })
    }

    /// Byte length for types whose length is implied by the type.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            FieldType::Logical                                   => Some(1),
            FieldType::Short                                     => Some(2),
            FieldType::Date | FieldType::Long | FieldType::Time
            | FieldType::AutoInc                                 => Some(4),
            FieldType::Currency | FieldType::Number
            | FieldType::Timestamp                               => Some(8),
            FieldType::Bcd                                       => Some(BCD_LEN),
            _                                                    => None,
        }
    }

    /// Types whose value may live in the blob file.
    pub fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::MemoBlob | FieldType::Blob | FieldType::FmtMemoBlob | FieldType::Ole | FieldType::Graphic
        )
    }
}

// ── Field descriptors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name:       String,
    pub field_type: FieldType,
    /// Byte length inside the record.
    pub len:        usize,
    /// Fraction digits, BCD only.
    pub decimals:   u8,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, len: usize) -> Self {
        Self { name: name.into(), field_type, len, decimals: 0 }
    }

    /// A field of a fixed-length type. Variable-length types get their
    /// smallest useful length.
    pub fn of(name: impl Into<String>, field_type: FieldType) -> Self {
        let len = field_type.fixed_len().unwrap_or(if field_type.is_blob() { 10 } else { 1 });
        Self::new(name, field_type, len)
    }

    pub fn bcd(name: impl Into<String>, decimals: u8) -> Self {
        Self { name: name.into(), field_type: FieldType::Bcd, len: BCD_LEN, decimals }
    }

    /// Bytes of a blob field kept inside the record.
    pub fn leader_len(&self) -> usize {
        self.len.saturating_sub(10)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PxError::InvalidArgument("field name is empty".into()));
        }
        if self.name.contains('\0') {
            return Err(PxError::field(&self.name, "name contains a NUL character"));
        }
        if let Some(len) = self.field_type.fixed_len() {
            if self.len != len {
                return Err(PxError::field(&self.name, format!("{} fields are {len} bytes, not {}", self.field_type.name(), self.len)));
            }
        }
        let ok = match self.field_type {
            FieldType::Alpha | FieldType::Bytes => (1..=255).contains(&self.len),
            t if t.is_blob()                    => (10..=255).contains(&self.len),
            FieldType::Bcd                      => self.decimals <= 32,
            _                                   => true,
        };
        if !ok {
            return Err(PxError::field(&self.name, format!("invalid length {} for a {} field", self.len, self.field_type.name())));
        }
        Ok(())
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Header {
    pub file_type:          FileType,
    /// Format version times ten: 30, 35, 40, 50 or 70. 0 when unknown.
    pub version:            u16,
    pub record_size:        usize,
    pub header_size:        usize,
    pub num_records:        u32,
    pub file_blocks:        u16,
    pub first_block:        u16,
    pub last_block:         u16,
    /// Block size in KiB, 1..=32.
    pub max_table_size:     u8,
    pub index_field_number: u8,
    pub index_root:         u16,
    pub num_index_levels:   u8,
    pub write_protected:    u8,
    pub modified_flags1:    u8,
    pub modified_flags2:    u8,
    pub primary_key_fields: u16,
    pub sort_order:         u8,
    pub ref_integrity:      u8,
    pub auto_inc:           i32,
    /// Password checksum, 0 when unencrypted.
    pub encryption:         u32,
    pub codepage:           u16,
    pub update_time:        u32,
    pub table_name:         String,
    pub fields:             Vec<FieldSpec>,
}

fn version_from_id(id: u8) -> u16 {
    match id {
        3      => 30,
        4      => 35,
        5..=9  => 40,
        10 | 11 => 50,
        12     => 70,
        _      => 0,
    }
}

fn table_name_len(version: u16) -> usize {
    if version == 70 { LONG_TABLE_NAME } else { SHORT_TABLE_NAME }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn to_latin1(what: &str, s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| PxError::InvalidArgument(format!("{what} contains unrepresentable character {c:?}"))))
        .collect()
}

/// Bounds-checked positional cursor over the header bytes.
struct Slots<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Slots<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let s = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| PxError::InvalidHeader(format!("{what} runs past the end of the header")))?;
        self.pos += n;
        Ok(s)
    }

    fn cstr(&mut self) -> String {
        let rest = self.buf.get(self.pos..).unwrap_or(&[]);
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        latin1(&rest[..end])
    }
}

impl Header {
    /// A header for a new, empty file with create defaults applied.
    pub fn new(file_type: FileType, fields: Vec<FieldSpec>) -> Result<Self> {
        if fields.is_empty() {
            return Err(PxError::InvalidArgument("a table needs at least one field".into()));
        }
        for (i, f) in fields.iter().enumerate() {
            f.validate()?;
            if fields[..i].iter().any(|g| g.name.eq_ignore_ascii_case(&f.name)) {
                return Err(PxError::field(&f.name, "duplicate field name"));
            }
        }
        let mut record_size: usize = fields.iter().map(|f| f.len).sum();
        if file_type.has_index_trailer() {
            record_size += INDEX_TRAILER_LEN;
        }
        let max_table_size = match record_size {
            0..=79   => 2,
            80..=139 => 3,
            _        => 16,
        };
        let secondary = file_type.is_secondary();
        let mut h = Self {
            file_type,
            version:            70,
            record_size,
            header_size:        HEADER_ALIGN,
            num_records:        0,
            file_blocks:        0,
            first_block:        0,
            last_block:         0,
            max_table_size,
            index_field_number: 0,
            index_root:         0,
            num_index_levels:   0,
            write_protected:    0,
            modified_flags1:    0,
            modified_flags2:    0,
            primary_key_fields: if secondary { 2 } else { 0 },
            sort_order:         0x62,
            ref_integrity:      u8::from(secondary),
            auto_inc:           i32::from(file_type == FileType::PrimaryIndex),
            encryption:         0,
            codepage:           1252,
            update_time:        0,
            table_name:         String::new(),
            fields,
        };
        if h.record_size > h.block_size() - BLOCK_HEADER_LEN {
            return Err(PxError::InvalidArgument(format!("record size {} does not fit into a data block", h.record_size)));
        }
        h.header_size = h.required_header_size();
        Ok(h)
    }

    // ── Geometry ─────────────────────────────────────────────────────────────

    pub fn block_size(&self) -> usize {
        usize::from(self.max_table_size) * 0x400
    }

    pub fn records_per_block(&self) -> usize {
        (self.block_size() - BLOCK_HEADER_LEN) / self.record_size
    }

    pub fn theoretical_records(&self) -> usize {
        usize::from(self.file_blocks) * self.records_per_block()
    }

    /// File offset of physical block `number` (1-based).
    pub fn block_offset(&self, number: u16) -> u64 {
        self.header_size as u64 + u64::from(number.saturating_sub(1)) * self.block_size() as u64
    }

    /// Sum of the field lengths, without the index trailer.
    pub fn fields_len(&self) -> usize {
        self.fields.iter().map(|f| f.len).sum()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Byte offset of field `i` inside a record.
    pub fn field_offset(&self, i: usize) -> usize {
        self.fields[..i].iter().map(|f| f.len).sum()
    }

    /// Header size a writer reserves for this field set.
    pub fn required_header_size(&self) -> usize {
        let nf = self.fields.len();
        let mut approx: usize = self.fields.iter().map(|f| f.name.chars().count() + 1).sum();
        approx += FIXED_HEADER_LEN + nf * 2 + LONG_TABLE_NAME + 4;
        if self.file_type.has_data_header() {
            approx += DATA_HEADER_LEN + nf * 4 + nf * 2 + SORT_ORDER_TAG.len();
        }
        (approx / HEADER_ALIGN + 1) * HEADER_ALIGN
    }

    /// Non-fatal inconsistencies found in a parsed header.
    pub fn consistency_warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        let expected = self.fields_len() + if self.file_type.has_index_trailer() { INDEX_TRAILER_LEN } else { 0 };
        if expected != self.record_size {
            out.push(format!("record size {} does not match the sum of field lengths {}", self.record_size, expected));
        }
        if self.table_name.is_empty() {
            out.push("table name is empty".to_owned());
        }
        out
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Read the full header region from the start of a file.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = vec![0u8; FIXED_HEADER_LEN];
        reader.read_exact(&mut buf)?;
        let header_size = usize::from(LittleEndian::read_u16(&buf[0x02..]));
        if header_size == 0 {
            return Err(PxError::InvalidHeader("zero header size".into()));
        }
        if header_size < FIXED_HEADER_LEN {
            return Err(PxError::InvalidHeader(format!("header size {header_size} is smaller than the fixed header")));
        }
        buf.resize(header_size, 0);
        reader.read_exact(&mut buf[FIXED_HEADER_LEN..])?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(PxError::InvalidHeader("header is truncated".into()));
        }
        let raw_type = buf[0x04];
        let file_type = FileType::from_u8(raw_type)
            .ok_or_else(|| PxError::InvalidHeader(format!("unknown file type ({raw_type})")))?;
        let max_table_size = buf[0x05];
        if !(1..=32).contains(&max_table_size) {
            return Err(PxError::InvalidHeader(format!("unknown table size ({max_table_size})")));
        }
        let version_id = buf[0x39];
        if !(3..=15).contains(&version_id) {
            return Err(PxError::InvalidHeader(format!("unknown file version (0x{version_id:X})")));
        }
        let record_size = usize::from(LittleEndian::read_u16(&buf[0x00..]));
        if record_size == 0 {
            return Err(PxError::InvalidHeader("zero record size".into()));
        }
        let header_size = usize::from(LittleEndian::read_u16(&buf[0x02..]));
        if header_size == 0 {
            return Err(PxError::InvalidHeader("zero header size".into()));
        }
        if record_size > usize::from(max_table_size) * 0x400 - BLOCK_HEADER_LEN {
            return Err(PxError::InvalidHeader(format!("record size {record_size} exceeds the block size")));
        }
        let version = version_from_id(version_id);
        let num_fields = LittleEndian::read_i16(&buf[0x21..]);
        if num_fields <= 0 {
            return Err(PxError::InvalidHeader(format!("invalid field count ({num_fields})")));
        }
        let nf = num_fields as usize;

        let mut encryption = LittleEndian::read_u32(&buf[0x25..]);
        let mut codepage = 0;
        let mut update_time = 0;
        let mut slots = Slots { buf, pos: FIXED_HEADER_LEN };
        if file_type.has_data_header() && version >= 40 {
            let dh = slots.take(DATA_HEADER_LEN, "extended header")?;
            if encryption == ENCRYPTION_MARKER {
                encryption = LittleEndian::read_u32(&dh[0x04..]);
            }
            update_time = LittleEndian::read_u32(&dh[0x08..]);
            codepage    = LittleEndian::read_u16(&dh[0x12..]);
        } else if encryption == ENCRYPTION_MARKER {
            encryption = 0;
        }

        let mut fields = Vec::with_capacity(nf);
        for i in 0..nf {
            let info = slots.take(2, "field info")?;
            let field_type = FieldType::from_u8(info[0])
                .ok_or_else(|| PxError::InvalidHeader(format!("field {} has unknown type 0x{:02X}", i + 1, info[0])))?;
            let (len, decimals) = match field_type {
                FieldType::Bcd => (BCD_LEN, info[1]),
                _              => (usize::from(info[1]), 0),
            };
            fields.push(FieldSpec { name: String::new(), field_type, len, decimals });
        }

        slots.take(4, "table name pointer")?;
        if file_type.has_data_header() {
            slots.take(nf * 4, "field name pointers")?;
        }
        let raw_name = slots.take(table_name_len(version), "table name")?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let table_name = latin1(&raw_name[..end]);
        for f in fields.iter_mut() {
            f.name = slots.cstr();
        }

        Ok(Self {
            file_type,
            version,
            record_size,
            header_size,
            num_records:        LittleEndian::read_u32(&buf[0x06..]),
            file_blocks:        LittleEndian::read_u16(&buf[0x0C..]),
            first_block:        LittleEndian::read_u16(&buf[0x0E..]),
            last_block:         LittleEndian::read_u16(&buf[0x10..]),
            max_table_size,
            index_field_number: buf[0x15],
            index_root:         LittleEndian::read_u16(&buf[0x1E..]),
            num_index_levels:   buf[0x20],
            write_protected:    buf[0x38],
            modified_flags1:    buf[0x14],
            modified_flags2:    buf[0x2A],
            primary_key_fields: LittleEndian::read_i16(&buf[0x23..]).max(0) as u16,
            sort_order:         buf[0x29],
            ref_integrity:      buf[0x55],
            auto_inc:           LittleEndian::read_i32(&buf[0x49..]),
            encryption,
            codepage,
            update_time,
            table_name,
            fields,
        })
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Version the writer emits: 7.0 stays 7.0, everything else becomes 5.0.
    pub fn written_version(&self) -> u16 {
        if self.version == 70 { 70 } else { 50 }
    }

    /// Serialize into exactly `header_size` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let nf = self.fields.len();
        let version = self.written_version();
        let tnl = table_name_len(version);
        let named = self.file_type.has_data_header();
        let dho = if named { FIXED_HEADER_LEN + DATA_HEADER_LEN } else { FIXED_HEADER_LEN };

        let table_name = to_latin1("table name", &self.table_name)?;
        if table_name.len() >= tnl {
            return Err(PxError::InvalidArgument(format!("table name is longer than {} bytes", tnl - 1)));
        }
        let names = self
            .fields
            .iter()
            .map(|f| to_latin1("field name", &f.name))
            .collect::<Result<Vec<_>>>()?;
        let sum_names: usize = names.iter().map(|n| n.len() + 1).sum();

        let mut content = dho + nf * 2 + 4 + tnl;
        if named {
            content += nf * 4 + sum_names + nf * 2 + SORT_ORDER_TAG.len();
        }
        if content > self.header_size {
            return Err(PxError::InvalidHeader(format!(
                "header content needs {content} bytes but the header holds {}",
                self.header_size
            )));
        }

        let mut buf = vec![0u8; self.header_size];
        let nf16 = nf as u16;
        LittleEndian::write_u16(&mut buf[0x00..], self.record_size as u16);
        LittleEndian::write_u16(&mut buf[0x02..], self.header_size as u16);
        buf[0x04] = self.file_type.as_u8();
        buf[0x05] = self.max_table_size;
        LittleEndian::write_u32(&mut buf[0x06..], self.num_records);
        LittleEndian::write_u16(&mut buf[0x0A..], self.file_blocks);
        LittleEndian::write_u16(&mut buf[0x0C..], self.file_blocks);
        LittleEndian::write_u16(&mut buf[0x0E..], self.first_block);
        LittleEndian::write_u16(&mut buf[0x10..], self.last_block);
        buf[0x14] = self.modified_flags1;
        buf[0x15] = self.index_field_number;
        LittleEndian::write_u16(&mut buf[0x1E..], self.index_root);
        buf[0x20] = self.num_index_levels;
        LittleEndian::write_u16(&mut buf[0x21..], nf16);
        LittleEndian::write_u16(&mut buf[0x23..], self.primary_key_fields);
        buf[0x29] = self.sort_order;
        buf[0x2A] = self.modified_flags2;
        LittleEndian::write_u32(&mut buf[0x30..], (dho + nf * 2) as u32);
        LittleEndian::write_u32(&mut buf[0x34..], dho as u32);
        buf[0x38] = self.write_protected;
        buf[0x39] = if version == 70 { 0x0C } else { 0x0B };
        LittleEndian::write_u16(&mut buf[0x3A..], self.file_blocks);
        LittleEndian::write_i32(&mut buf[0x49..], self.auto_inc);
        buf[0x55] = self.ref_integrity;

        match self.file_type {
            FileType::IndexedTable => {
                LittleEndian::write_u16(&mut buf[0x12..], 12);
                LittleEndian::write_u32(&mut buf[0x16..], dho as u32);
                LittleEndian::write_u32(&mut buf[0x1A..], dho as u32);
            }
            FileType::PrimaryIndex => {
                LittleEndian::write_u16(&mut buf[0x12..], 17);
                buf[0x2C] = 102;
            }
            t if t.is_secondary() => LittleEndian::write_u16(&mut buf[0x23..], 2),
            _ => {}
        }

        if self.file_type.is_table() {
            LittleEndian::write_u32(&mut buf[0x25..], ENCRYPTION_MARKER);
            buf[0x2D] = 2;
            buf[0x2E] = 1;
            buf[0x3E] = 0x1f;
            buf[0x3F] = 0x0f;
            buf[0x56] = 0x20;
        } else {
            LittleEndian::write_u32(&mut buf[0x25..], self.encryption);
        }

        let real_header_size = match self.file_type {
            FileType::PrimaryIndex => dho + nf * 2 + 4 + tnl,
            _                      => dho + nf * 8 + 4 + tnl + sum_names + 9,
        };
        LittleEndian::write_u16(&mut buf[0x51..], real_header_size as u16);

        if named {
            let dh = &mut buf[FIXED_HEADER_LEN..dho];
            let ver_id = if version == 70 { 0x010C } else { 0x010B };
            LittleEndian::write_u16(&mut dh[0x00..], ver_id);
            LittleEndian::write_u16(&mut dh[0x02..], ver_id);
            LittleEndian::write_u32(&mut dh[0x04..], self.encryption);
            LittleEndian::write_u32(&mut dh[0x08..], chrono::Utc::now().timestamp() as u32);
            LittleEndian::write_u16(&mut dh[0x0C..], nf16 + 1);
            LittleEndian::write_u16(&mut dh[0x0E..], (0x20 + nf * 6 + 4 + tnl + sum_names) as u16);
            LittleEndian::write_u16(&mut dh[0x12..], self.codepage);
            if self.file_type.is_table() {
                dh[0x14] = 1;
                dh[0x15] = 1;
            }
            LittleEndian::write_u16(&mut dh[0x16..], (0x18 + nf * 8 + 4 + tnl + sum_names + 8) as u16);
        }

        let mut pos = dho;
        for f in &self.fields {
            buf[pos] = f.field_type.as_u8();
            buf[pos + 1] = match f.field_type {
                FieldType::Bcd => f.decimals,
                _              => f.len as u8,
            };
            pos += 2;
        }
        LittleEndian::write_u32(&mut buf[pos..], (dho + nf * 6 + 4) as u32);
        pos += 4;
        if named {
            let base = dho + nf * 6 + 4 + tnl;
            let mut offset = 0;
            for n in &names {
                LittleEndian::write_u32(&mut buf[pos..], (base + offset) as u32);
                offset += n.len() + 1;
                pos += 4;
            }
        }
        buf[pos..pos + table_name.len()].copy_from_slice(&table_name);
        pos += tnl;
        if named {
            for n in &names {
                buf[pos..pos + n.len()].copy_from_slice(n);
                pos += n.len() + 1;
            }
            for i in 1..=nf16 {
                LittleEndian::write_u16(&mut buf[pos..], i);
                pos += 2;
            }
            buf[pos..pos + SORT_ORDER_TAG.len()].copy_from_slice(SORT_ORDER_TAG);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("Name", FieldType::Alpha, 20),
            FieldSpec::of("Count", FieldType::Long),
            FieldSpec::bcd("Price", 2),
            FieldSpec::new("Notes", FieldType::MemoBlob, 20),
        ]
    }

    #[test]
    fn create_defaults() {
        let h = Header::new(FileType::Table, sample_fields()).unwrap();
        assert_eq!(h.record_size, 20 + 4 + 17 + 20);
        assert_eq!(h.max_table_size, 2);
        assert_eq!(h.header_size % HEADER_ALIGN, 0);
        assert_eq!(h.header_size, 0x800);
        assert_eq!(h.codepage, 1252);
        assert_eq!(h.sort_order, 0x62);
        assert_eq!(h.records_per_block(), (2048 - 6) / 61);
    }

    #[test]
    fn block_class_follows_record_size() {
        let h = Header::new(FileType::Table, vec![FieldSpec::new("A", FieldType::Alpha, 100)]).unwrap();
        assert_eq!(h.max_table_size, 3);
        let h = Header::new(FileType::Table, vec![FieldSpec::new("A", FieldType::Alpha, 200)]).unwrap();
        assert_eq!(h.max_table_size, 16);
    }

    #[test]
    fn primary_index_defaults() {
        let h = Header::new(FileType::PrimaryIndex, vec![FieldSpec::of("Id", FieldType::Long)]).unwrap();
        assert_eq!(h.record_size, 10);
        assert_eq!(h.auto_inc, 1);
        let sec = Header::new(FileType::IncSecondaryIndex, vec![FieldSpec::of("Id", FieldType::Long)]).unwrap();
        assert_eq!(sec.primary_key_fields, 2);
        assert_eq!(sec.ref_integrity, 1);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut h = Header::new(FileType::IndexedTable, sample_fields()).unwrap();
        h.table_name = "stock.db".into();
        h.primary_key_fields = 1;
        h.num_records = 42;
        h.file_blocks = 3;
        h.first_block = 1;
        h.last_block = 3;
        h.encryption = 0x1234_5678;
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), h.header_size);
        let back = Header::read(&bytes[..]).unwrap();
        assert_eq!(back.fields, h.fields);
        assert_eq!(back.table_name, "stock.db");
        assert_eq!(back.version, 70);
        assert_eq!(back.record_size, h.record_size);
        assert_eq!(back.num_records, 42);
        assert_eq!(back.file_blocks, 3);
        assert_eq!(back.last_block, 3);
        assert_eq!(back.encryption, 0x1234_5678);
        assert_eq!(back.codepage, 1252);
        assert_eq!(back.primary_key_fields, 1);
        assert!(back.consistency_warnings().is_empty());
    }

    #[test]
    fn primary_index_has_no_field_names() {
        let mut h = Header::new(FileType::PrimaryIndex, vec![FieldSpec::of("Id", FieldType::Long)]).unwrap();
        h.encryption = 7;
        let bytes = h.to_bytes().unwrap();
        assert_eq!(&bytes[0x39..0x3A], &[0x0C]);
        let back = Header::parse(&bytes).unwrap();
        assert_eq!(back.fields[0].field_type, FieldType::Long);
        assert_eq!(back.fields[0].name, "");
        assert_eq!(back.encryption, 7);
    }

    #[test]
    fn sort_order_tag_written_for_tables() {
        let h = Header::new(FileType::Table, sample_fields()).unwrap();
        let bytes = h.to_bytes().unwrap();
        assert!(bytes.windows(8).any(|w| w == SORT_ORDER_TAG));
        assert_eq!(LittleEndian::read_u32(&bytes[0x25..]), ENCRYPTION_MARKER);
    }

    #[test]
    fn rejects_bad_headers() {
        let h = Header::new(FileType::Table, sample_fields()).unwrap();
        let good = h.to_bytes().unwrap();

        let mut bad = good.clone();
        bad[0x04] = 9;
        assert!(matches!(Header::parse(&bad), Err(PxError::InvalidHeader(_))));

        let mut bad = good.clone();
        bad[0x05] = 33;
        assert!(matches!(Header::parse(&bad), Err(PxError::InvalidHeader(_))));

        let mut bad = good.clone();
        bad[0x39] = 2;
        assert!(matches!(Header::parse(&bad), Err(PxError::InvalidHeader(_))));

        let mut bad = good;
        bad[0x00] = 0;
        bad[0x01] = 0;
        assert!(matches!(Header::parse(&bad), Err(PxError::InvalidHeader(_))));
    }

    #[test]
    fn duplicate_and_invalid_fields() {
        let dup = vec![FieldSpec::of("A", FieldType::Long), FieldSpec::of("a", FieldType::Short)];
        assert!(Header::new(FileType::Table, dup).is_err());
        let bad = vec![FieldSpec::new("A", FieldType::Long, 3)];
        assert!(Header::new(FileType::Table, bad).is_err());
        assert!(Header::new(FileType::Table, Vec::new()).is_err());
    }

    #[test]
    fn long_field_names_grow_the_header() {
        let fields: Vec<FieldSpec> = (0..60).map(|i| FieldSpec::of(format!("a_rather_long_field_name_{i:03}"), FieldType::Long)).collect();
        let h = Header::new(FileType::Table, fields).unwrap();
        assert!(h.header_size > HEADER_ALIGN);
        assert_eq!(h.header_size % HEADER_ALIGN, 0);
        let back = Header::parse(&h.to_bytes().unwrap()).unwrap();
        assert_eq!(back.fields.len(), 60);
        assert_eq!(back.fields[59].name, "a_rather_long_field_name_059");
    }

    #[test]
    fn old_versions_use_short_table_names() {
        let mut h = Header::new(FileType::Table, sample_fields()).unwrap();
        h.version = 40;
        h.table_name = "x".repeat(78);
        let bytes = h.to_bytes().unwrap();
        let back = Header::parse(&bytes).unwrap();
        assert_eq!(back.version, 50);
        assert_eq!(back.table_name.len(), 78);
        assert_eq!(back.fields, h.fields);
    }
}
