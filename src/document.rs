//! One open table or index file and the record-level API over it.
//!
//! # Lifecycle
//! A [`Document`] is created by [`Document::open`] or [`Document::create`]
//! and owns its stream, its primary index and an optional blob store.
//! [`Document::close`] writes everything back; dropping an unclosed
//! document does the same on a best-effort basis.
//!
//! # Record numbers
//! Records are numbered from 0 in block-chain order. Lookups go through the
//! primary index when one is held (self-built on open, or attached from an
//! index file) and fall back to walking the chain otherwise.
//!
//! # Ownership
//! A document assumes it is the only writer of its file. Two documents over
//! the same file will not see each other's cached blocks.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::blob::{BlobDescriptor, BlobStore};
use crate::block::{self, Placement};
use crate::crypto;
use crate::error::{PxError, Result, Warning};
use crate::header::{FieldSpec, FieldType, FileType, Header, INDEX_TRAILER_LEN};
use crate::index::{self, IndexEntry, Location, PrimaryIndex};
use crate::io_stream::{PxStream, Storage};
use crate::value::{self, Value};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub writable: bool,
    /// Checked against the stored checksum when the file is encrypted.
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub file_type:      FileType,
    /// 70 is written as 7.0, anything else as 5.0.
    pub version:        u16,
    pub table_name:     String,
    pub codepage:       u16,
    pub sort_order:     u8,
    pub password:       Option<String>,
    /// Block size in KiB. `None` picks one from the record size.
    pub max_table_size: Option<u8>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            file_type:      FileType::Table,
            version:        70,
            table_name:     String::new(),
            codepage:       1252,
            sort_order:     0x62,
            password:       None,
            max_table_size: None,
        }
    }
}

// ── Document ─────────────────────────────────────────────────────────────────

pub struct Document<S: Storage = File> {
    stream:        PxStream<S>,
    header:        Header,
    writable:      bool,
    index:         Option<PrimaryIndex>,
    blobs:         Option<BlobStore<Box<dyn Storage>>>,
    warnings:      Vec<Warning>,
    last_position: i64,
    closed:        bool,
}

impl Document<File> {
    pub fn open_path<P: AsRef<Path>>(path: P, opts: OpenOptions) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(opts.writable).open(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), writable = opts.writable, "opening document");
        Self::open(file, opts)
    }

    pub fn create_path<P: AsRef<Path>>(path: P, fields: Vec<FieldSpec>, opts: CreateOptions) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "creating document");
        Self::create(file, fields, opts)
    }

    /// Open an existing blob file next to this document.
    pub fn attach_blob_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = fs::OpenOptions::new().read(true).write(self.writable).open(path)?;
        self.attach_blob_store(file)
    }

    pub fn create_blob_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        self.create_blob_store(file)
    }

    /// Create an empty primary index file for this table's key fields.
    pub fn create_primary_index_path<P: AsRef<Path>>(&self, path: P) -> Result<Document<File>> {
        let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        self.create_primary_index(file)
    }
}

impl<S: Storage> Document<S> {
    // ── Open / create ────────────────────────────────────────────────────────

    pub fn open(mut inner: S, opts: OpenOptions) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut inner)?;
        if header.encryption != 0 {
            if let Some(p) = &opts.password {
                if crypto::password_checksum(p) != header.encryption {
                    return Err(PxError::InvalidArgument("password does not match the file".into()));
                }
            }
        }
        let stream = PxStream::for_table(inner, header.header_size as u64, header.block_size(), header.encryption);
        let mut doc = Self::assemble(stream, header, opts.writable);
        for w in doc.header.consistency_warnings() {
            doc.warnings.push(Warning::emit(w));
        }
        doc.rebuild_index();
        tracing::info!(
            file_type = doc.header.file_type.description(),
            records = doc.header.num_records,
            blocks = doc.header.file_blocks,
            "opened document"
        );
        Ok(doc)
    }

    pub fn create(inner: S, fields: Vec<FieldSpec>, opts: CreateOptions) -> Result<Self> {
        let key = match &opts.password {
            Some(p) if !p.is_empty() => crypto::password_checksum(p),
            _                        => 0,
        };
        Self::create_keyed(inner, fields, &opts, key)
    }

    fn create_keyed(inner: S, fields: Vec<FieldSpec>, opts: &CreateOptions, key: u32) -> Result<Self> {
        let mut header = Header::new(opts.file_type, fields)?;
        header.version = opts.version;
        header.table_name = opts.table_name.clone();
        header.codepage = opts.codepage;
        header.sort_order = opts.sort_order;
        header.encryption = key;
        if let Some(size) = opts.max_table_size {
            if !(1..=32).contains(&size) {
                return Err(PxError::InvalidArgument(format!("block size class {size} is outside 1..=32")));
            }
            header.max_table_size = size;
            if header.record_size > header.block_size() - crate::header::BLOCK_HEADER_LEN {
                return Err(PxError::InvalidArgument(format!(
                    "record size {} does not fit into blocks of {size} KiB",
                    header.record_size
                )));
            }
        }
        let autoincs = header.fields.iter().filter(|f| f.field_type == FieldType::AutoInc).count();

        let stream = PxStream::for_table(inner, header.header_size as u64, header.block_size(), key);
        let mut doc = Self::assemble(stream, header, true);
        if autoincs > 1 {
            doc.warnings.push(Warning::emit(format!("table declares {autoincs} autoincrement fields")));
        }
        doc.index = Some(PrimaryIndex::from_entries(Vec::new(), index::IndexSource::SelfBuilt));
        doc.write_header()?;
        doc.stream.flush()?;
        tracing::info!(
            file_type = doc.header.file_type.description(),
            fields = doc.header.fields.len(),
            record_size = doc.header.record_size,
            "created document"
        );
        Ok(doc)
    }

    fn assemble(stream: PxStream<S>, header: Header, writable: bool) -> Self {
        let last_position = i64::from(header.num_records) - 1;
        Self {
            stream,
            header,
            writable,
            index: None,
            blobs: None,
            warnings: Vec::new(),
            last_position,
            closed: false,
        }
    }

    fn rebuild_index(&mut self) {
        match PrimaryIndex::build(&mut self.stream, &self.header) {
            Ok((idx, w)) => {
                self.index = Some(idx);
                self.warnings.extend(w);
            }
            Err(e) => {
                self.index = None;
                self.warnings.push(Warning::emit(format!("could not index the block chain: {e}")));
            }
        }
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn file_type(&self) -> FileType {
        self.header.file_type
    }

    pub fn field_count(&self) -> usize {
        self.header.fields.len()
    }

    pub fn field(&self, i: usize) -> Option<&FieldSpec> {
        self.header.fields.get(i)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.header.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.header.field_index(name)
    }

    pub fn record_count(&self) -> u32 {
        self.header.num_records
    }

    pub fn table_name(&self) -> &str {
        &self.header.table_name
    }

    pub fn codepage(&self) -> u16 {
        self.header.codepage
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size()
    }

    pub fn records_per_block(&self) -> usize {
        self.header.records_per_block()
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.encryption != 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Position of the last record stored by [`put_record_at`](Self::put_record_at).
    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    pub fn index(&self) -> Option<&PrimaryIndex> {
        self.index.as_ref()
    }

    pub fn blob_store(&self) -> Option<&BlobStore<Box<dyn Storage>>> {
        self.blobs.as_ref()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    // ── Metadata setters ─────────────────────────────────────────────────────

    fn ensure_writable(&self) -> Result<()> {
        if self.writable { Ok(()) } else { Err(PxError::ReadOnly) }
    }

    fn write_header(&mut self) -> Result<()> {
        let bytes = self.header.to_bytes()?;
        self.stream.write_at(0, &bytes)
    }

    pub fn set_table_name(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let old = std::mem::replace(&mut self.header.table_name, name.to_owned());
        if let Err(e) = self.write_header() {
            self.header.table_name = old;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_codepage(&mut self, codepage: u16) -> Result<()> {
        self.ensure_writable()?;
        if codepage == 0 {
            return Err(PxError::InvalidArgument("codepage must be greater than 0".into()));
        }
        self.header.codepage = codepage;
        self.write_header()
    }

    /// Number of leading fields forming the primary key. A non-zero count
    /// makes the file an indexed table.
    pub fn set_primary_key_fields(&mut self, n: usize) -> Result<()> {
        self.ensure_writable()?;
        if !self.header.file_type.is_table() {
            return Err(PxError::Unsupported(format!(
                "key fields can only be set on tables, not on a {}",
                self.header.file_type.description()
            )));
        }
        if n > self.header.fields.len() {
            return Err(PxError::InvalidArgument(format!(
                "{n} key fields requested but the table has {}",
                self.header.fields.len()
            )));
        }
        self.header.primary_key_fields = n as u16;
        self.header.file_type = if n > 0 { FileType::IndexedTable } else { FileType::Table };
        self.write_header()
    }

    /// Encrypt with the checksum of `password`, or decrypt when `None`.
    /// Every data block and blob block is rewritten under the new key.
    ///
    /// All data blocks are read before the first one is rewritten, so a read
    /// failure leaves the file untouched. The rewrite itself is not atomic:
    /// an I/O error part way through leaves blocks under both keys, with the
    /// header still naming the old one.
    pub fn set_password(&mut self, password: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        let new = password.filter(|p| !p.is_empty()).map_or(0, crypto::password_checksum);
        let old = self.stream.key();
        if new == old {
            return Ok(());
        }
        let blocks = (1..=u32::from(self.header.file_blocks))
            .map(|b| self.stream.read_block(b))
            .collect::<Result<Vec<_>>>()?;
        self.stream.set_key(new)?;
        for (b, data) in (1u32..).zip(&blocks) {
            self.stream.write_block(b, data)?;
        }
        if let Some(blobs) = self.blobs.as_mut() {
            blobs.rekey(new)?;
        }
        self.header.encryption = new;
        self.write_header()?;
        tracing::debug!(blocks = self.header.file_blocks, encrypted = new != 0, "re-keyed document");
        Ok(())
    }

    // ── Blob store ───────────────────────────────────────────────────────────

    pub fn attach_blob_store<B: Storage + 'static>(&mut self, inner: B) -> Result<()> {
        let store = BlobStore::open(Box::new(inner) as Box<dyn Storage>, self.stream.key())?;
        self.warnings.extend(store.warnings());
        self.blobs = Some(store);
        Ok(())
    }

    pub fn create_blob_store<B: Storage + 'static>(&mut self, inner: B) -> Result<()> {
        self.ensure_writable()?;
        self.blobs = Some(BlobStore::create(Box::new(inner) as Box<dyn Storage>, self.stream.key())?);
        Ok(())
    }

    fn read_blob_field(&mut self, spec: &FieldSpec, data: &[u8]) -> Result<Value> {
        let desc = BlobDescriptor::from_field(data)?;
        let size = desc.size as usize;
        if size == 0 {
            return Ok(Value::Null);
        }
        let leader = spec.leader_len();
        let payload = if size <= leader {
            data[..size].to_vec()
        } else if desc.is_inline() {
            self.warnings.push(Warning::emit(format!(
                "field '{}': offset in blob file is unexpectedly zero",
                spec.name
            )));
            return Ok(Value::Null);
        } else {
            match self.blobs.as_mut() {
                Some(store) => store.read(&desc)?,
                None => {
                    self.warnings.push(Warning::emit(format!(
                        "field '{}' is stored in a blob file, but none is attached",
                        spec.name
                    )));
                    return Ok(Value::Null);
                }
            }
        };
        value::blob_value(spec, payload)
    }

    /// Encode and store the blob fields in `items` into `rec`. Every value
    /// is checked before anything is written, and a failed store removes
    /// the blobs this call already wrote. Returns the blobs written.
    fn store_blobs(&mut self, items: &[(usize, &FieldSpec, &Value)], rec: &mut [u8]) -> Result<Vec<BlobDescriptor>> {
        let mut staged = Vec::with_capacity(items.len());
        for &(off, spec, v) in items {
            let payload = value::blob_payload(spec, v)?;
            if let Some(p) = &payload {
                if p.len() > spec.leader_len() && self.blobs.is_none() {
                    return Err(PxError::Blob(format!("field '{}' needs a blob file, but none is attached", spec.name)));
                }
            }
            staged.push((off, spec, payload));
        }

        let mut written = Vec::new();
        for (off, spec, payload) in staged {
            let out = &mut rec[off..off + spec.len];
            out.fill(0);
            let Some(payload) = payload else { continue };
            let leader = spec.leader_len();
            let n = payload.len().min(leader);
            out[..n].copy_from_slice(&payload[..n]);
            let desc = match self.blobs.as_mut() {
                Some(store) if payload.len() > leader => match store.write(&payload) {
                    Ok(d) => {
                        written.push(d);
                        d
                    }
                    Err(e) => {
                        self.discard_blobs(&written);
                        return Err(e);
                    }
                },
                _ => BlobDescriptor::inline(payload.len()),
            };
            desc.write_to(out);
        }
        Ok(written)
    }

    /// Drop blobs written by an operation that did not complete.
    fn discard_blobs(&mut self, written: &[BlobDescriptor]) {
        let Some(store) = self.blobs.as_mut() else { return };
        for desc in written {
            if let Err(e) = store.delete(desc) {
                self.warnings.push(Warning::emit(format!("blob at offset {} was left allocated: {e}", desc.offset)));
            }
        }
    }

    /// Blob fields of a full record with their offsets and new values.
    fn blob_items<'a>(fields: &'a [FieldSpec], values: &'a [Value]) -> Vec<(usize, &'a FieldSpec, &'a Value)> {
        let mut off = 0;
        let mut out = Vec::new();
        for (f, v) in fields.iter().zip(values) {
            if f.field_type.is_blob() {
                out.push((off, f, v));
            }
            off += f.len;
        }
        out
    }

    /// Free the out-of-line storage of one blob field.
    fn release_blob_field(&mut self, spec: &FieldSpec, data: &[u8]) -> Result<()> {
        let desc = BlobDescriptor::from_field(data)?;
        if desc.size as usize <= spec.leader_len() || desc.is_inline() {
            return Ok(());
        }
        match self.blobs.as_mut() {
            Some(store) => store.delete(&desc),
            None => {
                self.warnings.push(Warning::emit(format!(
                    "blob of field '{}' cannot be released, no blob file is attached",
                    spec.name
                )));
                Ok(())
            }
        }
    }

    /// Release the blobs of a record that has already been overwritten. The
    /// write stands, so a failure here only leaves the old blob allocated.
    fn release_replaced(&mut self, record: &[u8], field: Option<usize>) {
        let fields = self.header.fields.clone();
        let mut off = 0;
        for (i, f) in fields.iter().enumerate() {
            if f.field_type.is_blob() && field.map_or(true, |only| only == i) {
                if let Err(e) = self.release_blob_field(f, &record[off..off + f.len]) {
                    self.warnings.push(Warning::emit(format!("old blob of field '{}' was not released: {e}", f.name)));
                }
            }
            off += f.len;
        }
    }

    fn release_blobs(&mut self, record: &[u8]) -> Result<()> {
        let fields = self.header.fields.clone();
        let mut off = 0;
        for f in &fields {
            if f.field_type.is_blob() {
                self.release_blob_field(f, &record[off..off + f.len])?;
            }
            off += f.len;
        }
        Ok(())
    }

    // ── Record encoding ──────────────────────────────────────────────────────

    /// Encode every fixed-width field. Blob fields are left zeroed.
    fn encode_fixed_fields(&mut self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.header.fields.len() {
            return Err(PxError::InvalidArgument(format!(
                "{} values given for {} fields",
                values.len(),
                self.header.fields.len()
            )));
        }
        let mut rec = vec![0u8; self.header.record_size];
        let mut next_auto = self.header.auto_inc;
        let mut off = 0;
        for (f, v) in self.header.fields.iter().zip(values) {
            let out = &mut rec[off..off + f.len];
            off += f.len;
            if f.field_type.is_blob() {
                continue;
            }
            if f.field_type == FieldType::AutoInc && v.is_null() {
                next_auto = next_auto
                    .checked_add(1)
                    .ok_or_else(|| PxError::field(&f.name, "autoincrement counter overflow"))?;
                value::encode_fixed(f, &Value::AutoInc(next_auto), out)?;
                continue;
            }
            value::encode_fixed(f, v, out)?;
        }
        self.header.auto_inc = next_auto;
        Ok(rec)
    }

    fn decode_record(&mut self, rec: &[u8]) -> Result<Vec<Value>> {
        let fields = self.header.fields.clone();
        let mut out = Vec::with_capacity(fields.len());
        let mut off = 0;
        for f in &fields {
            let data = &rec[off..off + f.len];
            off += f.len;
            out.push(if f.field_type.is_blob() { self.read_blob_field(f, data)? } else { value::decode_fixed(f, data)? });
        }
        Ok(out)
    }

    // ── Location ─────────────────────────────────────────────────────────────

    fn check_recno(&self, recno: u32) -> Result<()> {
        if recno >= self.header.num_records {
            return Err(PxError::RecordOutOfRange { recno: i64::from(recno), count: self.header.num_records });
        }
        Ok(())
    }

    fn locate(&mut self, recno: u32) -> Result<Location> {
        self.check_recno(recno)?;
        let found = match &self.index {
            Some(idx) => idx.locate(u64::from(recno)),
            None      => index::scan_locate(&mut self.stream, &self.header, u64::from(recno))?,
        };
        found.ok_or_else(|| PxError::Corrupt(format!("record {recno} could not be found in the block chain")))
    }

    /// Chain-order record number of a location.
    fn record_number(&mut self, loc: Location) -> Result<u32> {
        let counts: Vec<(u16, usize)> = match &self.index {
            Some(idx) => idx.level1().map(|e| (e.block, e.records as usize)).collect(),
            None      => index::chain_counts(&mut self.stream, &self.header)?,
        };
        let mut before = 0usize;
        for (block, n) in counts {
            if block == loc.block {
                return Ok((before + loc.slot) as u32);
            }
            before += n;
        }
        Err(PxError::Corrupt(format!("block {} is not part of the block chain", loc.block)))
    }

    fn note_block_count(&mut self, block: u16) -> Result<()> {
        if let Some(idx) = self.index.as_mut() {
            let head = block::read_block_header(&mut self.stream, &self.header, block)?;
            let n = head.record_count(&self.header, block)?;
            idx.set_block_count(block, n)?;
        }
        Ok(())
    }

    fn append_block_after(&mut self, after: u16) -> Result<u16> {
        let number = block::append_block(&mut self.stream, &mut self.header, after)?;
        if let Some(idx) = self.index.as_mut() {
            idx.block_appended(after, number);
        }
        Ok(number)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get_record_raw(&mut self, recno: u32) -> Result<Vec<u8>> {
        let loc = self.locate(recno)?;
        block::read_record(&mut self.stream, &self.header, loc.block, loc.slot)
    }

    pub fn get_record(&mut self, recno: u32) -> Result<Vec<Value>> {
        let raw = self.get_record_raw(recno)?;
        self.decode_record(&raw)
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Store a new record in the first block with room, extending the chain
    /// when every block is full. Returns the new record's number.
    pub fn insert_record(&mut self, values: &[Value]) -> Result<u32> {
        self.ensure_writable()?;
        let target = self.free_block()?;
        let saved_auto = self.header.auto_inc;
        let mut rec = self.encode_fixed_fields(values)?;
        let fields = self.header.fields.clone();
        let written = match self.store_blobs(&Self::blob_items(&fields, values), &mut rec) {
            Ok(w) => w,
            Err(e) => {
                self.header.auto_inc = saved_auto;
                return Err(e);
            }
        };
        match self.place_new_record(target, &rec) {
            Ok(recno) => Ok(recno),
            Err(e) => {
                self.discard_blobs(&written);
                self.header.auto_inc = saved_auto;
                Err(e)
            }
        }
    }

    /// A chain block with a free slot, checked to be readable.
    fn free_block(&mut self) -> Result<Option<u16>> {
        let rpb = self.header.records_per_block();
        let free = match &self.index {
            Some(idx) => idx.find_free(rpb),
            None      => index::scan_free_block(&mut self.stream, &self.header)?,
        };
        if let Some(number) = free {
            let head = block::read_block_header(&mut self.stream, &self.header, number)?;
            head.record_count(&self.header, number)?;
        }
        Ok(free)
    }

    fn place_new_record(&mut self, target: Option<u16>, rec: &[u8]) -> Result<u32> {
        let rpb = self.header.records_per_block();
        let number = match target {
            Some(b) => b,
            None    => self.append_block_after(self.header.last_block)?,
        };
        let placement = block::add_record_to_block(&mut self.stream, &self.header, number, rpb - 1, rec)?;
        self.note_block_count(number)?;
        self.header.num_records += 1;
        self.write_header()?;
        let recno = self.record_number(Location { block: number, slot: placement.slot })?;
        tracing::debug!(recno, block = number, slot = placement.slot, "inserted record");
        Ok(recno)
    }

    /// Replace record `recno`. Blobs of the old record are released once
    /// the new record is in place.
    pub fn update_record(&mut self, recno: u32, values: &[Value]) -> Result<()> {
        self.ensure_writable()?;
        let loc = self.locate(recno)?;
        let old = block::read_record(&mut self.stream, &self.header, loc.block, loc.slot)?;
        let saved_auto = self.header.auto_inc;
        let mut rec = self.encode_fixed_fields(values)?;
        let fields = self.header.fields.clone();
        let written = match self.store_blobs(&Self::blob_items(&fields, values), &mut rec) {
            Ok(w) => w,
            Err(e) => {
                self.header.auto_inc = saved_auto;
                return Err(e);
            }
        };
        if let Err(e) = block::write_record(&mut self.stream, &self.header, loc.block, loc.slot, &rec) {
            self.discard_blobs(&written);
            self.header.auto_inc = saved_auto;
            return Err(e);
        }
        self.release_replaced(&old, None);
        self.write_header()
    }

    /// Remove record `recno` and close the gap it leaves in its block.
    pub fn delete_record(&mut self, recno: u32) -> Result<()> {
        self.ensure_writable()?;
        let loc = self.locate(recno)?;
        let old = block::read_record(&mut self.stream, &self.header, loc.block, loc.slot)?;
        self.release_blobs(&old)?;
        let left = block::delete_record_from_block(&mut self.stream, &self.header, loc.block, loc.slot)?;
        if let Some(idx) = self.index.as_mut() {
            idx.set_block_count(loc.block, left)?;
        }
        self.header.num_records -= 1;
        self.last_position = self.last_position.min(i64::from(self.header.num_records) - 1);
        self.write_header()?;
        tracing::debug!(recno, block = loc.block, left, "deleted record");
        Ok(())
    }

    /// Overwrite a single field of record `recno` in place.
    pub fn set_field(&mut self, recno: u32, field: usize, v: &Value) -> Result<()> {
        self.ensure_writable()?;
        let spec = self
            .header
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| PxError::InvalidArgument(format!("field index {field} is out of range")))?;
        let loc = self.locate(recno)?;
        let old = block::read_record(&mut self.stream, &self.header, loc.block, loc.slot)?;
        let mut rec = old.clone();
        let off = self.header.field_offset(field);
        let range = off..off + spec.len;
        let mut next_auto = self.header.auto_inc;
        let mut written = Vec::new();
        if spec.field_type.is_blob() {
            written = self.store_blobs(&[(off, &spec, v)], &mut rec)?;
        } else if spec.field_type == FieldType::AutoInc && v.is_null() {
            next_auto = next_auto
                .checked_add(1)
                .ok_or_else(|| PxError::field(&spec.name, "autoincrement counter overflow"))?;
            value::encode_fixed(&spec, &Value::AutoInc(next_auto), &mut rec[range])?;
        } else {
            value::encode_fixed(&spec, v, &mut rec[range])?;
        }
        if let Err(e) = block::write_record(&mut self.stream, &self.header, loc.block, loc.slot, &rec) {
            self.discard_blobs(&written);
            return Err(e);
        }
        self.header.auto_inc = next_auto;
        if spec.field_type.is_blob() {
            self.release_replaced(&old, Some(field));
        }
        self.write_header()
    }

    /// Store a record at physical position `recpos`: block `recpos / rpb + 1`,
    /// slot `recpos % rpb`. Missing blocks are appended first. A slot past
    /// the block's records is pulled back so the block stays dense.
    pub fn put_record_at(&mut self, recpos: u32, values: &[Value]) -> Result<()> {
        self.ensure_writable()?;
        let old = self.existing_at(recpos)?;
        let saved_auto = self.header.auto_inc;
        let mut rec = self.encode_fixed_fields(values)?;
        let fields = self.header.fields.clone();
        let written = match self.store_blobs(&Self::blob_items(&fields, values), &mut rec) {
            Ok(w) => w,
            Err(e) => {
                self.header.auto_inc = saved_auto;
                return Err(e);
            }
        };
        if let Err(e) = self.put_raw_at(recpos, &rec) {
            self.discard_blobs(&written);
            self.header.auto_inc = saved_auto;
            return Err(e);
        }
        if let Some(old) = old {
            self.release_replaced(&old, None);
        }
        Ok(())
    }

    /// Store a record after the last one written with
    /// [`put_record_at`](Self::put_record_at).
    pub fn put_record(&mut self, values: &[Value]) -> Result<()> {
        let next = u32::try_from(self.last_position + 1)
            .map_err(|_| PxError::InvalidArgument("record position overflow".into()))?;
        self.put_record_at(next, values)
    }

    fn position_of(&self, recpos: u32) -> Result<(u16, usize)> {
        let rpb = self.header.records_per_block();
        let block = u16::try_from(recpos as usize / rpb + 1)
            .map_err(|_| PxError::Unsupported(format!("record position {recpos} needs more than 65535 blocks")))?;
        Ok((block, recpos as usize % rpb))
    }

    /// Raw record currently occupying `recpos`, if any.
    fn existing_at(&mut self, recpos: u32) -> Result<Option<Vec<u8>>> {
        let (number, slot) = self.position_of(recpos)?;
        if number > self.header.file_blocks {
            return Ok(None);
        }
        let head = block::read_block_header(&mut self.stream, &self.header, number)?;
        if slot >= head.record_count(&self.header, number)? {
            return Ok(None);
        }
        block::read_record(&mut self.stream, &self.header, number, slot).map(Some)
    }

    fn put_raw_at(&mut self, recpos: u32, rec: &[u8]) -> Result<Placement> {
        let (number, slot) = self.position_of(recpos)?;
        while self.header.file_blocks < number {
            self.append_block_after(self.header.last_block)?;
        }
        let placement = block::add_record_to_block(&mut self.stream, &self.header, number, slot, rec)?;
        if placement.slot != slot {
            self.warnings.push(Warning::emit(format!(
                "record position {recpos} recalculated to slot {} of block {number}",
                placement.slot
            )));
        }
        self.note_block_count(number)?;
        if !placement.update {
            self.header.num_records += 1;
        }
        let rpb = self.header.records_per_block() as i64;
        self.last_position = (i64::from(number) - 1) * rpb + placement.slot as i64;
        self.write_header()?;
        Ok(placement)
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Walk the block chain and report structural findings as warnings.
    pub fn verify(&mut self) -> Result<Vec<Warning>> {
        let mut found: Vec<Warning> = self.header.consistency_warnings().into_iter().map(Warning::emit).collect();
        let rs = self.header.record_size as i32;
        let capacity = (self.header.block_size() - crate::header::BLOCK_HEADER_LEN) as i32;
        let mut number = self.header.first_block;
        let mut seen = 0u16;
        let mut total: u64 = 0;
        while number != 0 && seen < self.header.file_blocks {
            let head = block::read_block_header(&mut self.stream, &self.header, number)?;
            let used = i32::from(head.add_data_size) + rs;
            if used < 0 || used > capacity || used % rs != 0 {
                found.push(Warning::emit(format!(
                    "data block {number} declares {} used bytes, not a whole number of {rs}-byte records",
                    head.add_data_size
                )));
            } else if used == 0 {
                found.push(Warning::emit(format!("data block {number} has no records")));
            } else {
                total += (used / rs) as u64;
            }
            number = head.next;
            seen += 1;
        }
        if number != 0 {
            found.push(Warning::emit(format!("block chain does not end after {} blocks", self.header.file_blocks)));
        }
        if total != u64::from(self.header.num_records) {
            found.push(Warning::emit(format!(
                "blocks hold {total} records but the header declares {}",
                self.header.num_records
            )));
        }
        if let Some(idx) = &self.index {
            if idx.total_records() != u64::from(self.header.num_records) {
                found.push(Warning::emit(format!(
                    "index covers {} records but the header declares {}",
                    idx.total_records(),
                    self.header.num_records
                )));
            }
        }
        self.warnings.extend(found.iter().cloned());
        Ok(found)
    }

    // ── Primary index files ──────────────────────────────────────────────────

    fn key_fields(&self) -> Result<&[FieldSpec]> {
        let n = usize::from(self.header.primary_key_fields);
        if self.header.file_type != FileType::IndexedTable || n == 0 {
            return Err(PxError::IndexMismatch("table has no primary key".into()));
        }
        self.header
            .fields
            .get(..n)
            .ok_or_else(|| PxError::IndexMismatch(format!("table declares {n} key fields but has fewer fields")))
    }

    fn check_pairing(&self, px: &Header) -> Result<()> {
        let keys = self.key_fields()?;
        if px.file_type != FileType::PrimaryIndex {
            return Err(PxError::IndexMismatch(format!("{} is not a primary index", px.file_type.description())));
        }
        if px.fields.len() != keys.len() {
            return Err(PxError::IndexMismatch(format!(
                "index has {} fields but the table has {} key fields",
                px.fields.len(),
                keys.len()
            )));
        }
        for (i, (k, p)) in keys.iter().zip(&px.fields).enumerate() {
            if k.field_type != p.field_type || k.len != p.len {
                return Err(PxError::IndexMismatch(format!(
                    "index field {} is {} ({} bytes) but key field '{}' is {} ({} bytes)",
                    i + 1,
                    p.field_type.name(),
                    p.len,
                    k.name,
                    k.field_type.name(),
                    k.len
                )));
            }
        }
        Ok(())
    }

    /// Use the entries of a primary index file for record lookups.
    pub fn add_primary_index<T: Storage>(&mut self, px: &mut Document<T>) -> Result<()> {
        self.check_pairing(&px.header)?;
        let (idx, w) = PrimaryIndex::read_file(&mut px.stream, &px.header)?;
        self.warnings.extend(w);
        if idx.total_records() != u64::from(self.header.num_records) {
            return Err(PxError::IndexMismatch(format!(
                "index covers {} records but the table has {}",
                idx.total_records(),
                self.header.num_records
            )));
        }
        tracing::debug!(entries = idx.entries().len(), "attached primary index file");
        self.index = Some(idx);
        Ok(())
    }

    /// A new, empty primary index document for this table's key fields.
    pub fn create_primary_index<T: Storage>(&self, inner: T) -> Result<Document<T>> {
        let fields = self.key_fields()?.to_vec();
        let opts = CreateOptions {
            file_type:  FileType::PrimaryIndex,
            version:    self.header.version,
            table_name: self.header.table_name.clone(),
            codepage:   self.header.codepage,
            sort_order: self.header.sort_order,
            ..CreateOptions::default()
        };
        Document::create_keyed(inner, fields, &opts, self.stream.key())
    }

    /// Fill an empty primary index document with one entry per data block.
    pub fn write_primary_index<T: Storage>(&mut self, px: &mut Document<T>) -> Result<()> {
        px.ensure_writable()?;
        self.check_pairing(&px.header)?;
        if px.header.num_records != 0 {
            return Err(PxError::InvalidArgument("primary index file is not empty".into()));
        }
        let key_len = px.header.fields_len();

        let mut level1 = Vec::new();
        for (block, n) in index::chain_counts(&mut self.stream, &self.header)? {
            let rec = if n > 0 {
                block::read_record(&mut self.stream, &self.header, block, 0)?
            } else {
                vec![0u8; self.header.record_size]
            };
            level1.push(IndexEntry { block, records: n as u32, level: 1, index_block: 0, key: rec[..key_len].to_vec() });
        }

        let index_record = |e: &IndexEntry| -> Result<Vec<u8>> {
            let mut rec = Vec::with_capacity(key_len + INDEX_TRAILER_LEN);
            rec.extend_from_slice(&e.key);
            rec.extend_from_slice(&index::encode_trailer(e.block, e.records)?);
            Ok(rec)
        };

        let rpb = px.header.records_per_block();
        let levels = if level1.len() <= rpb {
            for (i, e) in level1.iter().enumerate() {
                px.put_raw_at(i as u32, &index_record(e)?)?;
            }
            1
        } else {
            let groups = (level1.len() + rpb - 1) / rpb;
            if groups > rpb {
                return Err(PxError::Unsupported(format!(
                    "{} data blocks need more than two index levels",
                    level1.len()
                )));
            }
            for (g, chunk) in level1.chunks(rpb).enumerate() {
                let entry = IndexEntry {
                    block:       (2 + g) as u16,
                    records:     chunk.iter().map(|e| e.records).sum(),
                    level:       2,
                    index_block: 1,
                    key:         chunk[0].key.clone(),
                };
                px.put_raw_at(g as u32, &index_record(&entry)?)?;
            }
            for (i, e) in level1.iter().enumerate() {
                px.put_raw_at((rpb + i) as u32, &index_record(e)?)?;
            }
            2
        };
        px.header.index_root = 1;
        px.header.num_index_levels = levels;
        px.write_header()?;
        px.rebuild_index();
        tracing::debug!(entries = level1.len(), levels, "wrote primary index file");
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Write back the resident block, the header and the blob store.
    pub fn flush(&mut self) -> Result<()> {
        if self.writable {
            self.write_header()?;
        }
        self.stream.flush()?;
        if let Some(blobs) = self.blobs.as_mut() {
            blobs.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        tracing::info!(records = self.header.num_records, "closed document");
        Ok(())
    }

    /// Underlying storage, with all cached writes flushed to it.
    pub fn storage_mut(&mut self) -> Result<&mut S> {
        self.flush()?;
        Ok(self.stream.get_mut())
    }
}

impl<S: Storage> Drop for Document<S> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.flush() {
                tracing::warn!("flushing document on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};

    type Mem = Document<Cursor<Vec<u8>>>;

    fn people() -> Vec<FieldSpec> {
        vec![FieldSpec::new("Name", FieldType::Alpha, 20), FieldSpec::of("Age", FieldType::Long)]
    }

    fn new_doc(fields: Vec<FieldSpec>) -> Mem {
        let opts = CreateOptions { table_name: "test".into(), ..CreateOptions::default() };
        Document::create(Cursor::new(Vec::new()), fields, opts).unwrap()
    }

    fn row(name: &str, age: i32) -> Vec<Value> {
        vec![Value::Text(name.into()), Value::Long(age)]
    }

    fn reopen(mut doc: Mem, writable: bool) -> Mem {
        let raw = doc.storage_mut().unwrap().get_ref().clone();
        doc.close().unwrap();
        Document::open(Cursor::new(raw), OpenOptions { writable, password: None }).unwrap()
    }

    #[test]
    fn insert_and_read_back() {
        let mut doc = new_doc(people());
        assert_eq!(doc.insert_record(&row("ada", 36)).unwrap(), 0);
        assert_eq!(doc.insert_record(&row("bob", 41)).unwrap(), 1);
        assert_eq!(doc.record_count(), 2);
        assert_eq!(doc.get_record(1).unwrap(), row("bob", 41));

        let mut doc = reopen(doc, false);
        assert_eq!(doc.record_count(), 2);
        assert_eq!(doc.get_record(0).unwrap(), row("ada", 36));
        assert!(doc.insert_record(&row("x", 1)).is_err());
    }

    #[test]
    fn out_of_range_is_reported() {
        let mut doc = new_doc(people());
        doc.insert_record(&row("a", 1)).unwrap();
        assert!(matches!(doc.get_record(1), Err(PxError::RecordOutOfRange { recno: 1, count: 1 })));
        assert!(doc.delete_record(5).is_err());
        assert_eq!(doc.record_count(), 1);
    }

    #[test]
    fn delete_compacts_and_insert_refills() {
        let mut doc = new_doc(people());
        for (i, n) in ["r0", "r1", "r2"].iter().enumerate() {
            doc.insert_record(&row(n, i as i32)).unwrap();
        }
        doc.delete_record(1).unwrap();
        assert_eq!(doc.record_count(), 2);
        assert_eq!(doc.get_record(0).unwrap(), row("r0", 0));
        assert_eq!(doc.get_record(1).unwrap(), row("r2", 2));
        let recno = doc.insert_record(&row("r3", 3)).unwrap();
        assert_eq!(recno, 2);
        assert_eq!(doc.header().file_blocks, 1);
    }

    #[test]
    fn inserts_extend_the_chain() {
        let mut doc = new_doc(people());
        let rpb = doc.records_per_block();
        for i in 0..rpb + 3 {
            doc.insert_record(&row("n", i as i32)).unwrap();
        }
        assert_eq!(doc.header().file_blocks, 2);
        assert_eq!(doc.get_record(rpb as u32 + 2).unwrap(), row("n", rpb as i32 + 2));
        let doc = reopen(doc, false);
        assert_eq!(doc.index().unwrap().total_records(), rpb as u64 + 3);
    }

    #[test]
    fn update_and_set_field() {
        let mut doc = new_doc(people());
        doc.insert_record(&row("a", 1)).unwrap();
        doc.update_record(0, &row("b", 2)).unwrap();
        assert_eq!(doc.get_record(0).unwrap(), row("b", 2));
        doc.set_field(0, 1, &Value::Null).unwrap();
        assert_eq!(doc.get_record(0).unwrap(), vec![Value::Text("b".into()), Value::Null]);
        assert!(doc.set_field(0, 0, &Value::Long(3)).is_err());
        assert!(doc.update_record(0, &[Value::Null]).is_err());
    }

    #[test]
    fn autoinc_fills_nulls() {
        let fields = vec![FieldSpec::of("Id", FieldType::AutoInc), FieldSpec::new("Name", FieldType::Alpha, 8)];
        let mut doc = new_doc(fields);
        doc.insert_record(&[Value::Null, Value::Text("a".into())]).unwrap();
        doc.insert_record(&[Value::Null, Value::Text("b".into())]).unwrap();
        doc.insert_record(&[Value::AutoInc(100), Value::Text("c".into())]).unwrap();
        assert_eq!(doc.get_record(1).unwrap()[0], Value::AutoInc(2));
        assert_eq!(doc.get_record(2).unwrap()[0], Value::AutoInc(100));
        assert_eq!(doc.header().auto_inc, 2);
    }

    #[test]
    fn put_record_at_places_by_position() {
        let mut doc = new_doc(people());
        let rpb = doc.records_per_block() as u32;
        doc.put_record_at(rpb + 1, &row("far", 9)).unwrap();
        assert_eq!(doc.header().file_blocks, 2);
        assert_eq!(doc.record_count(), 1);
        assert_eq!(doc.last_position(), i64::from(rpb));
        assert!(!doc.warnings().is_empty());
        doc.put_record(&row("next", 10)).unwrap();
        assert_eq!(doc.record_count(), 2);
        doc.put_record_at(rpb, &row("over", 11)).unwrap();
        assert_eq!(doc.record_count(), 2);
        assert_eq!(doc.get_record(0).unwrap(), row("over", 11));
    }

    #[test]
    fn memo_fields_use_the_blob_store() {
        let fields = vec![FieldSpec::of("Id", FieldType::Long), FieldSpec::new("Notes", FieldType::MemoBlob, 20)];
        let mut doc = new_doc(fields);
        doc.create_blob_store(Cursor::new(Vec::new())).unwrap();
        let short = vec![Value::Long(1), Value::Text("tiny".into())];
        let long = vec![Value::Long(2), Value::Text("x".repeat(5000))];
        doc.insert_record(&short).unwrap();
        doc.insert_record(&long).unwrap();
        assert_eq!(doc.get_record(0).unwrap(), short);
        assert_eq!(doc.get_record(1).unwrap(), long);

        let raw = doc.get_record_raw(1).unwrap();
        assert_eq!(&raw[4..14], "xxxxxxxxxx".as_bytes());
        let desc = BlobDescriptor::from_field(&raw[4..24]).unwrap();
        assert_eq!((desc.index, desc.size), (0xFF, 5000));

        doc.delete_record(1).unwrap();
        let store = doc.blob_store().unwrap();
        assert_eq!(store.blocks()[1].kind, crate::blob::BlobBlockKind::Free);
    }

    fn memo_doc() -> Mem {
        let fields = vec![FieldSpec::of("Id", FieldType::AutoInc), FieldSpec::new("Notes", FieldType::MemoBlob, 20)];
        let mut doc = new_doc(fields);
        doc.create_blob_store(Cursor::new(Vec::new())).unwrap();
        doc
    }

    #[test]
    fn rejected_update_keeps_the_old_blob() {
        let mut doc = memo_doc();
        let original = vec![Value::AutoInc(4), Value::Text("n".repeat(300))];
        doc.insert_record(&original).unwrap();
        let blocks = doc.blob_store().unwrap().blocks().to_vec();

        let err = doc.update_record(0, &[Value::AutoInc(4), Value::Text("€".repeat(300))]).unwrap_err();
        assert!(matches!(err, PxError::Field { ref field, .. } if field == "Notes"));
        assert_eq!(doc.get_record(0).unwrap(), original);

        assert!(doc.set_field(0, 1, &Value::Long(5)).is_err());
        assert_eq!(doc.get_record(0).unwrap(), original);
        assert_eq!(doc.blob_store().unwrap().blocks(), &blocks[..]);

        let auto = doc.header().auto_inc;
        assert!(doc.update_record(0, &[Value::Null, Value::Blob(vec![1])]).is_err());
        assert_eq!(doc.header().auto_inc, auto);
        assert_eq!(doc.get_record(0).unwrap(), original);
    }

    #[test]
    fn accepted_update_releases_the_old_blob() {
        let mut doc = memo_doc();
        doc.insert_record(&[Value::AutoInc(1), Value::Text("a".repeat(300))]).unwrap();
        doc.set_field(0, 1, &Value::Text("b".repeat(400))).unwrap();
        doc.update_record(0, &[Value::AutoInc(1), Value::Text("c".repeat(500))]).unwrap();
        assert_eq!(doc.get_record(0).unwrap()[1], Value::Text("c".repeat(500)));
        let store = doc.blob_store().unwrap();
        assert_eq!(store.blocks()[1].num_blobs, 1);
        assert!(doc.warnings().is_empty());
    }

    #[test]
    fn failed_insert_leaves_no_blobs_behind() {
        let mut doc = memo_doc();
        doc.insert_record(&[Value::Null, Value::Text("short".into())]).unwrap();
        let mut head = block::read_block_header(&mut doc.stream, &doc.header, 1).unwrap();
        head.add_data_size = 7;
        block::write_block_header(&mut doc.stream, &doc.header, 1, &head).unwrap();

        let blocks = doc.blob_store().unwrap().blocks().to_vec();
        let auto = doc.header().auto_inc;
        let err = doc.insert_record(&[Value::Null, Value::Text("y".repeat(5000))]).unwrap_err();
        assert!(matches!(err, PxError::Corrupt(_)));
        assert_eq!(doc.blob_store().unwrap().blocks(), &blocks[..]);
        assert_eq!(doc.header().auto_inc, auto);
        assert_eq!(doc.record_count(), 1);
    }

    /// In-memory storage whose reads and writes fail while `failing` is set.
    struct FlakyDisk {
        data:    Cursor<Vec<u8>>,
        failing: bool,
    }

    impl Read for FlakyDisk {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.failing {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "read error"));
            }
            self.data.read(buf)
        }
    }

    impl Write for FlakyDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failing {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.data.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyDisk {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.data.seek(pos)
        }
    }

    #[test]
    fn failed_flush_can_be_retried() {
        let disk = FlakyDisk { data: Cursor::new(Vec::new()), failing: false };
        let opts = CreateOptions { table_name: "flaky".into(), ..CreateOptions::default() };
        let mut doc = Document::create(disk, people(), opts).unwrap();
        doc.insert_record(&row("kept", 1)).unwrap();

        doc.stream.get_mut().failing = true;
        assert!(doc.stream.flush().is_err());
        assert!(matches!(doc.flush(), Err(PxError::Io(_))));
        doc.stream.get_mut().failing = false;
        doc.close().unwrap();

        let raw = doc.storage_mut().unwrap().data.get_ref().clone();
        let mut back = Document::open(Cursor::new(raw), OpenOptions::default()).unwrap();
        assert_eq!(back.record_count(), 1);
        assert_eq!(back.get_record(0).unwrap(), row("kept", 1));
    }

    #[test]
    fn rekey_read_failure_changes_nothing() {
        let disk = FlakyDisk { data: Cursor::new(Vec::new()), failing: false };
        let opts = CreateOptions { table_name: "rekey".into(), ..CreateOptions::default() };
        let mut doc = Document::create(disk, people(), opts).unwrap();
        let total = doc.records_per_block() as i32 * 2 + 5;
        for i in 0..total {
            doc.insert_record(&row("r", i)).unwrap();
        }
        doc.flush().unwrap();

        doc.stream.get_mut().failing = true;
        assert!(doc.set_password(Some("pw")).is_err());
        doc.stream.get_mut().failing = false;
        assert!(!doc.is_encrypted());
        assert_eq!(doc.get_record(total as u32 - 1).unwrap(), row("r", total - 1));

        doc.set_password(Some("pw")).unwrap();
        doc.close().unwrap();
        let raw = doc.storage_mut().unwrap().data.get_ref().clone();
        let opts = OpenOptions { writable: false, password: Some("pw".into()) };
        let mut back = Document::open(Cursor::new(raw), opts).unwrap();
        assert_eq!(back.get_record(0).unwrap(), row("r", 0));
        assert_eq!(back.get_record(total as u32 - 1).unwrap(), row("r", total - 1));
    }

    #[test]
    fn blob_without_store_is_an_error_on_write() {
        let fields = vec![FieldSpec::new("Pic", FieldType::Graphic, 12)];
        let mut doc = new_doc(fields);
        assert!(matches!(doc.insert_record(&[Value::Blob(vec![1; 50])]), Err(PxError::Blob(_))));
        assert_eq!(doc.record_count(), 0);
    }

    #[test]
    fn encrypted_documents_round_trip() {
        let opts = CreateOptions { password: Some("Secret123".into()), ..CreateOptions::default() };
        let mut doc = Document::create(Cursor::new(Vec::new()), people(), opts).unwrap();
        doc.insert_record(&row("hidden", 7)).unwrap();
        let raw = doc.storage_mut().unwrap().get_ref().clone();
        let hs = doc.header().header_size;
        assert!(!raw[hs..].windows(6).any(|w| w == b"hidden"));

        let wrong = OpenOptions { writable: false, password: Some("nope".into()) };
        assert!(Document::open(Cursor::new(raw.clone()), wrong).is_err());
        let mut back = Document::open(Cursor::new(raw), OpenOptions::default()).unwrap();
        assert!(back.is_encrypted());
        assert_eq!(back.get_record(0).unwrap(), row("hidden", 7));
    }

    #[test]
    fn set_password_rekeys_blocks() {
        let mut doc = new_doc(people());
        doc.insert_record(&row("plain", 1)).unwrap();
        doc.set_password(Some("pw")).unwrap();
        assert!(doc.is_encrypted());
        let mut doc = reopen(doc, true);
        assert_eq!(doc.get_record(0).unwrap(), row("plain", 1));
        doc.set_password(None).unwrap();
        let mut doc = reopen(doc, false);
        assert!(!doc.is_encrypted());
        assert_eq!(doc.get_record(0).unwrap(), row("plain", 1));
    }

    #[test]
    fn metadata_setters() {
        let mut doc = new_doc(people());
        doc.set_table_name("people").unwrap();
        doc.set_codepage(437).unwrap();
        assert!(doc.set_codepage(0).is_err());
        doc.set_primary_key_fields(1).unwrap();
        assert_eq!(doc.file_type(), FileType::IndexedTable);
        let doc = reopen(doc, false);
        assert_eq!(doc.table_name(), "people");
        assert_eq!(doc.codepage(), 437);
        assert_eq!(doc.header().primary_key_fields, 1);
    }

    #[test]
    fn read_only_documents_refuse_changes() {
        let mut doc = reopen(new_doc(people()), false);
        assert!(matches!(doc.set_table_name("x"), Err(PxError::ReadOnly)));
        assert!(matches!(doc.insert_record(&row("a", 1)), Err(PxError::ReadOnly)));
    }

    #[test]
    fn primary_index_file_round_trip() {
        let mut doc = new_doc(people());
        doc.set_primary_key_fields(1).unwrap();
        let rpb = doc.records_per_block();
        for i in 0..rpb * 2 + 1 {
            doc.insert_record(&row(&format!("k{i:04}"), i as i32)).unwrap();
        }
        let mut px = doc.create_primary_index(Cursor::new(Vec::new())).unwrap();
        doc.write_primary_index(&mut px).unwrap();
        assert_eq!(px.record_count(), 3);
        assert_eq!(px.header().num_index_levels, 1);

        doc.add_primary_index(&mut px).unwrap();
        let idx = doc.index().unwrap();
        assert_eq!(idx.source(), index::IndexSource::External);
        assert_eq!(idx.level1().count(), 3);
        assert_eq!(&idx.entries()[1].key[..5], format!("k{rpb:04}").as_bytes());
        assert_eq!(doc.get_record(rpb as u32).unwrap(), row(&format!("k{rpb:04}"), rpb as i32));
    }

    #[test]
    fn index_pairing_is_validated() {
        let mut doc = new_doc(people());
        let mut other = new_doc(vec![FieldSpec::of("Id", FieldType::Long)]);
        other.set_primary_key_fields(1).unwrap();
        let mut px = other.create_primary_index(Cursor::new(Vec::new())).unwrap();
        assert!(matches!(doc.add_primary_index(&mut px), Err(PxError::IndexMismatch(_))));
        doc.set_primary_key_fields(1).unwrap();
        assert!(matches!(doc.add_primary_index(&mut px), Err(PxError::IndexMismatch(_))));
    }

    #[test]
    fn verify_reports_count_mismatch() {
        let mut doc = new_doc(people());
        doc.insert_record(&row("a", 1)).unwrap();
        assert!(doc.verify().unwrap().is_empty());
        doc.header.num_records = 5;
        let found = doc.verify().unwrap();
        assert!(found.iter().any(|w| w.message.contains("declares 5")));
    }
}
