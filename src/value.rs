//! Typed record values and their field-level encodings.
//!
//! Fixed-width fields go straight through the byte codec. Blob-bearing
//! fields are split here into a stored payload and handed to the document,
//! which decides between the record leader and the blob file.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::ser::{Serialize, Serializer};

use crate::blob::GRAPHIC_PREFIX_LEN;
use crate::codec::{self, calendar};
use crate::error::{PxError, Result};
use crate::header::{FieldSpec, FieldType};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Alpha and memo fields.
    Text(String),
    Date(NaiveDate),
    Short(i16),
    Long(i32),
    Currency(f64),
    Number(f64),
    Logical(bool),
    /// Binary blob, OLE and graphic fields.
    Blob(Vec<u8>),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    AutoInc(i32),
    /// Fixed-point decimal in its printed form.
    Bcd(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null         => "null",
            Value::Text(_)      => "text",
            Value::Date(_)      => "date",
            Value::Short(_)     => "short",
            Value::Long(_)      => "long",
            Value::Currency(_)  => "currency",
            Value::Number(_)    => "number",
            Value::Logical(_)   => "logical",
            Value::Blob(_)      => "blob",
            Value::Time(_)      => "time",
            Value::Timestamp(_) => "timestamp",
            Value::AutoInc(_)   => "autoinc",
            Value::Bcd(_)       => "bcd",
            Value::Bytes(_)     => "bytes",
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::Short(v)                  => Some(i64::from(v)),
            Value::Long(v) | Value::AutoInc(v) => Some(i64::from(v)),
            _                                => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Currency(v) | Value::Number(v) => Some(v),
            _                                     => self.as_integer().map(|v| v as f64),
        }
    }

    /// Parse command-line text into a value for `spec`. An empty string or
    /// `NULL` gives [`Value::Null`]; binary fields take hex.
    pub fn parse(text: &str, spec: &FieldSpec) -> Result<Self> {
        if text.is_empty() || text.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }
        let bad = |what: &str| PxError::field(&spec.name, format!("cannot parse {text:?} as {what}"));
        let t = text.trim();
        Ok(match spec.field_type {
            FieldType::Alpha | FieldType::MemoBlob | FieldType::FmtMemoBlob => Value::Text(text.to_owned()),
            FieldType::Short    => Value::Short(t.parse().map_err(|_| bad("a short integer"))?),
            FieldType::Long     => Value::Long(t.parse().map_err(|_| bad("a long integer"))?),
            FieldType::AutoInc  => Value::AutoInc(t.parse().map_err(|_| bad("an autoincrement value"))?),
            FieldType::Currency => Value::Currency(t.parse().map_err(|_| bad("a number"))?),
            FieldType::Number   => Value::Number(t.parse().map_err(|_| bad("a number"))?),
            FieldType::Logical  => match t.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1"  => Value::Logical(true),
                "false" | "f" | "no" | "n" | "0"  => Value::Logical(false),
                _                                 => return Err(bad("a logical")),
            },
            FieldType::Date => Value::Date(NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| bad("a date (YYYY-MM-DD)"))?),
            FieldType::Time => Value::Time(
                NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
                    .map_err(|_| bad("a time (HH:MM:SS)"))?,
            ),
            FieldType::Timestamp => Value::Timestamp(
                NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|_| bad("a timestamp (YYYY-MM-DD HH:MM:SS)"))?,
            ),
            FieldType::Bcd => {
                codec::encode_bcd(Some(t), spec.decimals)?;
                Value::Bcd(t.to_owned())
            }
            FieldType::Bytes => Value::Bytes(hex::decode(t).map_err(|_| bad("hex bytes"))?),
            FieldType::Blob | FieldType::Ole | FieldType::Graphic => {
                Value::Blob(hex::decode(t).map_err(|_| bad("hex bytes"))?)
            }
        })
    }

    /// Plain text rendering used by listings.
    pub fn display(&self) -> String {
        match self {
            Value::Null                           => String::new(),
            Value::Text(s) | Value::Bcd(s)        => s.clone(),
            Value::Date(d)                        => d.format("%Y-%m-%d").to_string(),
            Value::Short(v)                       => v.to_string(),
            Value::Long(v) | Value::AutoInc(v)    => v.to_string(),
            Value::Currency(v)                    => format!("{v:.2}"),
            Value::Number(v)                      => v.to_string(),
            Value::Logical(v)                     => v.to_string(),
            Value::Time(t)                        => t.format("%H:%M:%S").to_string(),
            Value::Timestamp(t)                   => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Blob(b) | Value::Bytes(b)      => hex::encode(b),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null                        => s.serialize_none(),
            Value::Text(v) | Value::Bcd(v)     => s.serialize_str(v),
            Value::Short(v)                    => s.serialize_i16(*v),
            Value::Long(v) | Value::AutoInc(v) => s.serialize_i32(*v),
            Value::Currency(v) | Value::Number(v) => s.serialize_f64(*v),
            Value::Logical(v)                  => s.serialize_bool(*v),
            Value::Date(d)                     => s.collect_str(&d.format("%Y-%m-%d")),
            Value::Time(t)                     => s.collect_str(&t.format("%H:%M:%S%.3f")),
            Value::Timestamp(t)                => s.collect_str(&t.format("%Y-%m-%dT%H:%M:%S%.3f")),
            Value::Blob(b) | Value::Bytes(b)   => s.serialize_str(&hex::encode(b)),
        }
    }
}

fn mismatch(spec: &FieldSpec, value: &Value) -> PxError {
    PxError::field(
        &spec.name,
        format!("cannot store a {} value in a {} field", value.kind_name(), spec.field_type.name()),
    )
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn to_latin1(spec: &FieldSpec, s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| PxError::field(&spec.name, format!("character {c:?} is not representable"))))
        .collect()
}

// ── Fixed-width fields ───────────────────────────────────────────────────────

/// Decode a field whose value lives entirely inside the record.
pub fn decode_fixed(spec: &FieldSpec, data: &[u8]) -> Result<Value> {
    let corrupt = |what: &str, raw: i64| PxError::Corrupt(format!("field '{}' holds invalid {what} {raw}", spec.name));
    Ok(match spec.field_type {
        FieldType::Alpha => codec::decode_alpha(data).map_or(Value::Null, Value::Text),
        FieldType::Short => codec::decode_short(data)?.map_or(Value::Null, Value::Short),
        FieldType::Long  => codec::decode_long(data)?.map_or(Value::Null, Value::Long),
        FieldType::AutoInc => codec::decode_long(data)?.map_or(Value::Null, Value::AutoInc),
        FieldType::Currency => codec::decode_double(data)?.map_or(Value::Null, Value::Currency),
        FieldType::Number   => codec::decode_double(data)?.map_or(Value::Null, Value::Number),
        FieldType::Logical  => codec::decode_byte(data)?.map_or(Value::Null, |v| Value::Logical(v != 0)),
        FieldType::Date => match codec::decode_long(data)? {
            None    => Value::Null,
            Some(d) => Value::Date(calendar::date_from_days(d).ok_or_else(|| corrupt("day number", i64::from(d)))?),
        },
        FieldType::Time => match codec::decode_long(data)? {
            None     => Value::Null,
            Some(ms) => Value::Time(calendar::time_from_millis(ms).ok_or_else(|| corrupt("time of day", i64::from(ms)))?),
        },
        FieldType::Timestamp => match codec::decode_double(data)? {
            None     => Value::Null,
            Some(ts) => Value::Timestamp(calendar::datetime_from_timestamp(ts).ok_or_else(|| corrupt("timestamp", ts as i64))?),
        },
        FieldType::Bcd   => codec::decode_bcd(data, spec.decimals)?.map_or(Value::Null, Value::Bcd),
        FieldType::Bytes => codec::decode_bytes(data).map_or(Value::Null, Value::Bytes),
        t => return Err(PxError::field(&spec.name, format!("{} fields are not fixed-width", t.name()))),
    })
}

/// Encode a fixed-width field value into `out`, which is exactly the field
/// length.
pub fn encode_fixed(spec: &FieldSpec, value: &Value, out: &mut [u8]) -> Result<()> {
    let name = spec.name.as_str();
    let int_in = |lo: i64, hi: i64| -> Result<Option<i64>> {
        match value {
            Value::Null => Ok(None),
            v => match v.as_integer() {
                Some(i) if (lo..=hi).contains(&i) => Ok(Some(i)),
                Some(i) => Err(PxError::field(name, format!("value {i} is out of range"))),
                None    => Err(mismatch(spec, value)),
            },
        }
    };
    match spec.field_type {
        FieldType::Alpha => match value {
            Value::Null    => codec::encode_alpha(name, None, out)?,
            Value::Text(s) => codec::encode_alpha(name, Some(s), out)?,
            v              => return Err(mismatch(spec, v)),
        },
        FieldType::Short => {
            let v = int_in(i64::from(i16::MIN), i64::from(i16::MAX))?;
            out.copy_from_slice(&codec::encode_short(v.map(|v| v as i16))?);
        }
        FieldType::Long | FieldType::AutoInc => {
            let v = int_in(i64::from(i32::MIN), i64::from(i32::MAX))?;
            out.copy_from_slice(&codec::encode_long(v.map(|v| v as i32))?);
        }
        FieldType::Currency | FieldType::Number => {
            let v = match value {
                Value::Null => None,
                v           => Some(v.as_float().ok_or_else(|| mismatch(spec, v))?),
            };
            if v.is_some_and(f64::is_nan) {
                return Err(PxError::field(name, "NaN cannot be stored"));
            }
            out.copy_from_slice(&codec::encode_double(v)?);
        }
        FieldType::Logical => {
            let v = match value {
                Value::Null       => None,
                Value::Logical(b) => Some(i8::from(*b)),
                v                 => return Err(mismatch(spec, v)),
            };
            out.copy_from_slice(&codec::encode_byte(v)?);
        }
        FieldType::Date => {
            let v = match value {
                Value::Null    => None,
                Value::Date(d) => Some(
                    calendar::days_from_date(*d).ok_or_else(|| PxError::field(name, format!("date {d} is out of range")))?,
                ),
                v              => return Err(mismatch(spec, v)),
            };
            out.copy_from_slice(&codec::encode_long(v)?);
        }
        FieldType::Time => {
            let v = match value {
                Value::Null    => None,
                Value::Time(t) => Some(calendar::millis_from_time(*t)),
                v              => return Err(mismatch(spec, v)),
            };
            out.copy_from_slice(&codec::encode_long(v)?);
        }
        FieldType::Timestamp => {
            let v = match value {
                Value::Null         => None,
                Value::Timestamp(t) => Some(
                    calendar::timestamp_from_datetime(*t)
                        .ok_or_else(|| PxError::field(name, format!("timestamp {t} is out of range")))?,
                ),
                v                   => return Err(mismatch(spec, v)),
            };
            out.copy_from_slice(&codec::encode_double(v)?);
        }
        FieldType::Bcd => {
            let v = match value {
                Value::Null                    => None,
                Value::Bcd(s) | Value::Text(s) => Some(s.as_str()),
                v                              => return Err(mismatch(spec, v)),
            };
            out.copy_from_slice(&codec::encode_bcd(v, spec.decimals)?);
        }
        FieldType::Bytes => match value {
            Value::Null                      => codec::encode_bytes(name, None, out)?,
            Value::Bytes(b) | Value::Blob(b) => codec::encode_bytes(name, Some(b), out)?,
            v                                => return Err(mismatch(spec, v)),
        },
        t => return Err(PxError::field(name, format!("{} fields are not fixed-width", t.name()))),
    }
    Ok(())
}

// ── Blob-bearing fields ──────────────────────────────────────────────────────

/// Bytes to store for a blob-bearing field, graphic prefix included.
/// `None` for NULL.
pub fn blob_payload(spec: &FieldSpec, value: &Value) -> Result<Option<Vec<u8>>> {
    let data = match (spec.field_type, value) {
        (_, Value::Null) => return Ok(None),
        (FieldType::MemoBlob | FieldType::FmtMemoBlob, Value::Text(s)) => to_latin1(spec, s)?,
        (t, Value::Blob(b) | Value::Bytes(b)) if t.is_blob() => b.clone(),
        (t, v) if t.is_blob() => return Err(mismatch(spec, v)),
        (t, _) => return Err(PxError::field(&spec.name, format!("{} fields do not hold blobs", t.name()))),
    };
    if data.is_empty() {
        return Ok(None);
    }
    if spec.field_type == FieldType::Graphic {
        let mut out = Vec::with_capacity(data.len() + GRAPHIC_PREFIX_LEN);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        return Ok(Some(out));
    }
    Ok(Some(data))
}

/// Value of a blob-bearing field from its stored bytes.
pub fn blob_value(spec: &FieldSpec, mut payload: Vec<u8>) -> Result<Value> {
    if spec.field_type == FieldType::Graphic {
        if payload.len() < GRAPHIC_PREFIX_LEN {
            return Err(PxError::Corrupt(format!("graphic value of field '{}' is shorter than its prefix", spec.name)));
        }
        payload.drain(..GRAPHIC_PREFIX_LEN);
    }
    Ok(match spec.field_type {
        _ if payload.is_empty()                            => Value::Null,
        FieldType::MemoBlob | FieldType::FmtMemoBlob       => Value::Text(latin1(&payload)),
        _                                                  => Value::Blob(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(spec: &FieldSpec, v: Value) -> Value {
        let mut buf = vec![0u8; spec.len];
        encode_fixed(spec, &v, &mut buf).unwrap();
        decode_fixed(spec, &buf).unwrap()
    }

    #[test]
    fn fixed_fields_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let ts = date.and_hms_milli_opt(13, 45, 7, 250).unwrap();
        let cases = [
            (FieldSpec::new("a", FieldType::Alpha, 10), Value::Text("hello".into())),
            (FieldSpec::of("s", FieldType::Short), Value::Short(-42)),
            (FieldSpec::of("l", FieldType::Long), Value::Long(123_456)),
            (FieldSpec::of("c", FieldType::Currency), Value::Currency(-19.95)),
            (FieldSpec::of("n", FieldType::Number), Value::Number(3.5)),
            (FieldSpec::of("b", FieldType::Logical), Value::Logical(false)),
            (FieldSpec::of("d", FieldType::Date), Value::Date(date)),
            (FieldSpec::of("t", FieldType::Time), Value::Time(ts.time())),
            (FieldSpec::of("ts", FieldType::Timestamp), Value::Timestamp(ts)),
            (FieldSpec::of("ai", FieldType::AutoInc), Value::AutoInc(7)),
            (FieldSpec::bcd("x", 2), Value::Bcd("-12.50".into())),
            (FieldSpec::new("y", FieldType::Bytes, 4), Value::Bytes(vec![1, 2, 3, 4])),
        ];
        for (spec, v) in cases {
            assert_eq!(round_trip(&spec, v.clone()), v, "{}", spec.name);
            assert_eq!(round_trip(&spec, Value::Null), Value::Null, "{}", spec.name);
        }
    }

    #[test]
    fn integers_coerce_within_range() {
        let short = FieldSpec::of("s", FieldType::Short);
        assert_eq!(round_trip(&short, Value::Long(5)), Value::Short(5));
        let mut buf = [0u8; 2];
        assert!(encode_fixed(&short, &Value::Long(70_000), &mut buf).is_err());
        let num = FieldSpec::of("n", FieldType::Number);
        assert_eq!(round_trip(&num, Value::Short(2)), Value::Number(2.0));
    }

    #[test]
    fn nan_is_refused() {
        let spec = FieldSpec::of("price", FieldType::Currency);
        let mut buf = [0u8; 8];
        let err = encode_fixed(&spec, &Value::Currency(f64::NAN), &mut buf).unwrap_err();
        assert!(matches!(err, PxError::Field { ref field, .. } if field == "price"));
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn type_mismatch_names_field() {
        let spec = FieldSpec::of("when", FieldType::Date);
        let mut buf = [0u8; 4];
        let err = encode_fixed(&spec, &Value::Text("x".into()), &mut buf).unwrap_err();
        assert!(err.to_string().contains("when"));
    }

    #[test]
    fn graphic_payload_carries_prefix() {
        let spec = FieldSpec::new("g", FieldType::Graphic, 20);
        let payload = blob_payload(&spec, &Value::Blob(vec![9; 5])).unwrap().unwrap();
        assert_eq!(payload.len(), 13);
        assert_eq!(&payload[4..8], &5u32.to_le_bytes());
        assert_eq!(blob_value(&spec, payload).unwrap(), Value::Blob(vec![9; 5]));
    }

    #[test]
    fn memo_text_is_latin1() {
        let spec = FieldSpec::new("m", FieldType::MemoBlob, 15);
        let payload = blob_payload(&spec, &Value::Text("café".into())).unwrap().unwrap();
        assert_eq!(payload, vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(blob_value(&spec, payload).unwrap(), Value::Text("café".into()));
        assert_eq!(blob_payload(&spec, &Value::Text(String::new())).unwrap(), None);
    }

    #[test]
    fn parse_per_field_type() {
        let date = FieldSpec::of("d", FieldType::Date);
        assert_eq!(Value::parse("2024-01-01", &date).unwrap(), Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert_eq!(Value::parse("", &date).unwrap(), Value::Null);
        assert!(Value::parse("01/01/2024", &date).is_err());
        assert_eq!(Value::parse("yes", &FieldSpec::of("b", FieldType::Logical)).unwrap(), Value::Logical(true));
        assert_eq!(Value::parse("0a0b", &FieldSpec::new("x", FieldType::Bytes, 2)).unwrap(), Value::Bytes(vec![10, 11]));
        assert!(Value::parse("1.2.3", &FieldSpec::bcd("n", 2)).is_err());
    }

    #[test]
    fn json_rendering() {
        let d = Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap());
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"1999-12-31\"");
        assert_eq!(serde_json::to_string(&Value::Bytes(vec![0xde, 0xad])).unwrap(), "\"dead\"");
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
    }
}
