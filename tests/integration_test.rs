use chrono::NaiveDate;
use pxstore::block::read_block_header;
use pxstore::header::BLOCK_HEADER_LEN;
use pxstore::{CreateOptions, Document, FieldSpec, FieldType, FileType, OpenOptions, Value};
use std::fs::File;
use std::io::Read;
use tempfile::NamedTempFile;

fn table_fields() -> Vec<FieldSpec> {
    vec![FieldSpec::new("Name", FieldType::Alpha, 20), FieldSpec::of("Qty", FieldType::Long)]
}

fn named(name: &str) -> CreateOptions {
    CreateOptions { table_name: name.into(), ..CreateOptions::default() }
}

fn row(name: &str, qty: i32) -> Vec<Value> {
    vec![Value::Text(name.into()), Value::Long(qty)]
}

#[test]
fn test_delete_compacts_block() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut doc = Document::create_path(tmp.path(), table_fields(), named("stock")).unwrap();
        doc.insert_record(&row("first", 0)).unwrap();
        doc.insert_record(&row("second", 1)).unwrap();
        doc.insert_record(&row("third", 2)).unwrap();
        doc.delete_record(1).unwrap();
        doc.close().unwrap();
    }

    let mut doc = Document::open_path(tmp.path(), OpenOptions { writable: true, password: None }).unwrap();
    assert_eq!(doc.record_count(), 2);
    assert_eq!(doc.get_record(0).unwrap(), row("first", 0));
    assert_eq!(doc.get_record(1).unwrap(), row("third", 2));

    // The freed tail slot is reused before any new block is appended.
    let recno = doc.insert_record(&row("fourth", 3)).unwrap();
    assert_eq!(recno, 2);
    assert_eq!(doc.header().file_blocks, 1);
    assert_eq!(doc.get_record(2).unwrap(), row("fourth", 3));
    doc.close().unwrap();
}

#[test]
fn test_raw_layout_matches_format() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut doc = Document::create_path(tmp.path(), table_fields(), named("raw")).unwrap();
        doc.insert_record(&row("ab", 5)).unwrap();
        doc.close().unwrap();
    }
    let mut bytes = Vec::new();
    File::open(tmp.path()).unwrap().read_to_end(&mut bytes).unwrap();
    let header_size = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    assert_eq!(header_size % 0x800, 0);
    assert_eq!(bytes[4], FileType::Table.as_u8());
    assert_eq!(u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]), 1);

    let block = &bytes[header_size..];
    assert_eq!(&block[..4], &[0, 0, 0, 0]);
    assert_eq!(i16::from_le_bytes([block[4], block[5]]), 0);
    let rec = &block[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + 24];
    assert_eq!(&rec[..3], b"ab\0");
    assert_eq!(&rec[20..24], &[0x80, 0, 0, 5]);
}

#[test]
fn test_date_field_round_trip() {
    let tmp = NamedTempFile::new().unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    {
        let fields = vec![FieldSpec::of("When", FieldType::Date), FieldSpec::bcd("Amount", 2)];
        let mut doc = Document::create_path(tmp.path(), fields, named("dates")).unwrap();
        doc.insert_record(&[Value::Date(day), Value::Bcd("1234.56".into())]).unwrap();
        doc.close().unwrap();
    }
    let mut doc = Document::open_path(tmp.path(), OpenOptions::default()).unwrap();
    assert_eq!(doc.get_record(0).unwrap(), vec![Value::Date(day), Value::Bcd("1234.56".into())]);
}

#[test]
fn test_large_blob_uses_single_blocks() {
    let db = NamedTempFile::new().unwrap();
    let mb = NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    {
        let fields = vec![FieldSpec::of("Id", FieldType::Long), FieldSpec::new("Data", FieldType::Blob, 20)];
        let mut doc = Document::create_path(db.path(), fields, named("blobs")).unwrap();
        doc.create_blob_path(mb.path()).unwrap();
        doc.insert_record(&[Value::Long(1), Value::Blob(payload.clone())]).unwrap();
        doc.insert_record(&[Value::Long(2), Value::Blob(vec![7; 300])]).unwrap();
        doc.close().unwrap();
    }
    assert_eq!(std::fs::metadata(mb.path()).unwrap().len(), 4 * 4096);

    let mut doc = Document::open_path(db.path(), OpenOptions::default()).unwrap();
    doc.attach_blob_path(mb.path()).unwrap();
    let store = doc.blob_store().unwrap();
    assert_eq!(store.blocks()[1].num_blocks, 2);
    assert_eq!(doc.get_record(0).unwrap()[1], Value::Blob(payload));
    assert_eq!(doc.get_record(1).unwrap()[1], Value::Blob(vec![7; 300]));
}

#[test]
fn test_blob_missing_store_warns() {
    let db = NamedTempFile::new().unwrap();
    let mb = NamedTempFile::new().unwrap();
    {
        let fields = vec![FieldSpec::new("Memo", FieldType::MemoBlob, 12)];
        let mut doc = Document::create_path(db.path(), fields, named("memo")).unwrap();
        doc.create_blob_path(mb.path()).unwrap();
        doc.insert_record(&[Value::Text("long enough to spill".into())]).unwrap();
        doc.close().unwrap();
    }
    let mut doc = Document::open_path(db.path(), OpenOptions::default()).unwrap();
    doc.take_warnings();
    assert_eq!(doc.get_record(0).unwrap(), vec![Value::Null]);
    assert_eq!(doc.warnings().len(), 1);
}

#[test]
fn test_encrypted_table_and_blob() {
    let db = NamedTempFile::new().unwrap();
    let mb = NamedTempFile::new().unwrap();
    let memo = "confidential ".repeat(40);
    {
        let fields = vec![FieldSpec::new("Name", FieldType::Alpha, 16), FieldSpec::new("Memo", FieldType::MemoBlob, 15)];
        let opts = CreateOptions { password: Some("jIGGAe".into()), ..named("secret") };
        let mut doc = Document::create_path(db.path(), fields, opts).unwrap();
        doc.create_blob_path(mb.path()).unwrap();
        doc.insert_record(&[Value::Text("visible?".into()), Value::Text(memo.clone())]).unwrap();
        doc.close().unwrap();
    }
    let raw_db = std::fs::read(db.path()).unwrap();
    let raw_mb = std::fs::read(mb.path()).unwrap();
    assert!(!raw_db.windows(8).any(|w| w == b"visible?"));
    assert!(!raw_mb.windows(12).any(|w| w == b"confidential"));

    let opts = OpenOptions { writable: false, password: Some("jIGGAe".into()) };
    let mut doc = Document::open_path(db.path(), opts).unwrap();
    assert_eq!(doc.header().encryption, 0x3c9c_fd4d);
    doc.attach_blob_path(mb.path()).unwrap();
    assert_eq!(doc.get_record(0).unwrap(), vec![Value::Text("visible?".into()), Value::Text(memo)]);
}

#[test]
fn test_rejected_edits_leave_file_intact() {
    let db = NamedTempFile::new().unwrap();
    let mb = NamedTempFile::new().unwrap();
    let notes = "a note that spills ".repeat(20);
    let fields = vec![FieldSpec::of("Id", FieldType::Long), FieldSpec::new("Notes", FieldType::MemoBlob, 20)];
    {
        let mut doc = Document::create_path(db.path(), fields, named("edits")).unwrap();
        doc.create_blob_path(mb.path()).unwrap();
        doc.insert_record(&[Value::Long(1), Value::Text(notes.clone())]).unwrap();
        assert!(doc.update_record(0, &[Value::Long(2), Value::Text("\u{20ac}".repeat(300))]).is_err());
        assert!(doc.set_field(0, 1, &Value::Long(5)).is_err());
        assert!(doc.insert_record(&[Value::Long(3), Value::Blob(vec![0; 10])]).is_err());
        doc.close().unwrap();
    }
    let mb_len = std::fs::metadata(mb.path()).unwrap().len();

    let mut doc = Document::open_path(db.path(), OpenOptions::default()).unwrap();
    doc.attach_blob_path(mb.path()).unwrap();
    assert_eq!(doc.record_count(), 1);
    assert_eq!(doc.get_record(0).unwrap(), vec![Value::Long(1), Value::Text(notes)]);
    assert_eq!(doc.blob_store().unwrap().blocks().len() as u64 * 4096, mb_len);
    assert_eq!(mb_len, 2 * 4096);
    assert!(doc.verify().unwrap().is_empty());
}

#[test]
fn test_primary_index_file() {
    let db = NamedTempFile::new().unwrap();
    let px = NamedTempFile::new().unwrap();
    let total = {
        let fields = vec![FieldSpec::of("Id", FieldType::Long), FieldSpec::new("Name", FieldType::Alpha, 40)];
        let mut doc = Document::create_path(db.path(), fields, named("keyed")).unwrap();
        doc.set_primary_key_fields(1).unwrap();
        let total = doc.records_per_block() as i32 * 3 + 2;
        for i in 0..total {
            doc.insert_record(&[Value::Long(i), Value::Text(format!("n{i}"))]).unwrap();
        }
        let mut index = doc.create_primary_index_path(px.path()).unwrap();
        doc.write_primary_index(&mut index).unwrap();
        index.close().unwrap();
        doc.close().unwrap();
        total
    };

    let mut doc = Document::open_path(db.path(), OpenOptions::default()).unwrap();
    let mut index = Document::open_path(px.path(), OpenOptions::default()).unwrap();
    assert_eq!(index.file_type(), FileType::PrimaryIndex);
    assert_eq!(index.record_count(), 4);
    doc.add_primary_index(&mut index).unwrap();
    assert_eq!(doc.index().unwrap().total_records(), total as u64);
    let last = (total - 1) as u32;
    assert_eq!(doc.get_record(last).unwrap()[0], Value::Long(total - 1));

    // Level-1 keys are the first key of each data block.
    let keys: Vec<Value> = (0..4).map(|i| index.get_record(i).unwrap()[0].clone()).collect();
    let rpb = doc.records_per_block() as i32;
    assert_eq!(keys, vec![Value::Long(0), Value::Long(rpb), Value::Long(2 * rpb), Value::Long(3 * rpb)]);
}

#[test]
fn test_verify_clean_document() {
    let tmp = NamedTempFile::new().unwrap();
    let mut doc = Document::create_path(tmp.path(), table_fields(), named("ok")).unwrap();
    for i in 0..200 {
        doc.insert_record(&row("x", i)).unwrap();
    }
    for i in (0..200).step_by(3).rev() {
        doc.delete_record(i).unwrap();
    }
    assert!(doc.verify().unwrap().is_empty());
    doc.close().unwrap();
}

mod proptest_store {
    use super::*;
    use proptest::prelude::*;
    use pxstore::index::chain_counts;
    use std::io::Cursor;

    #[derive(Debug, Clone)]
    enum Op {
        Insert(i32),
        Delete(u32),
        Update(u32, i32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..10_000i32).prop_map(Op::Insert),
            1 => any::<u32>().prop_map(Op::Delete),
            1 => (any::<u32>(), 0..10_000i32).prop_map(|(r, v)| Op::Update(r, v)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn index_agrees_with_header(ops in proptest::collection::vec(op(), 1..300)) {
            let fields = vec![FieldSpec::of("V", FieldType::Long), FieldSpec::new("Pad", FieldType::Alpha, 60)];
            let mut doc = Document::create(Cursor::new(Vec::new()), fields, named("prop")).unwrap();
            let mut live: u32 = 0;
            for op in ops {
                match op {
                    Op::Insert(v) => {
                        doc.insert_record(&[Value::Long(v), Value::Null]).unwrap();
                        live += 1;
                    }
                    Op::Delete(r) if live > 0 => {
                        doc.delete_record(r % live).unwrap();
                        live -= 1;
                    }
                    Op::Update(r, v) if live > 0 => {
                        doc.update_record(r % live, &[Value::Long(v), Value::Null]).unwrap();
                        prop_assert_eq!(doc.get_record(r % live).unwrap()[0].clone(), Value::Long(v));
                    }
                    _ => {}
                }
            }

            prop_assert_eq!(doc.index().unwrap().total_records(), u64::from(doc.record_count()));
            prop_assert_eq!(doc.record_count(), live);
            let header = doc.header().clone();
            let raw = doc.storage_mut().unwrap().get_ref().clone();
            let mut stream = pxstore::io_stream::PxStream::for_table(
                Cursor::new(raw), header.header_size as u64, header.block_size(), 0);
            let counts = chain_counts(&mut stream, &header).unwrap();
            prop_assert_eq!(counts.iter().map(|c| c.1 as u64).sum::<u64>(), u64::from(header.num_records));
            for (block, _) in counts {
                let head = read_block_header(&mut stream, &header, block).unwrap();
                prop_assert!(head.record_count(&header, block).is_ok());
            }
        }
    }
}
