//! Field byte codec: the on-disk encodings of fixed-width field values.
//!
//! # Sign encoding
//! Integers and doubles are stored big-endian with a flipped sign scheme:
//!   - non-negative values have the top bit **set**;
//!   - negative integers have the top bit **cleared**;
//!   - negative doubles have **every** byte inverted;
//!   - an all-zero field is NULL.
//!
//! The most negative integer of each width would encode to all zeros and is
//! therefore rejected on encode.
//!
//! # Text
//! Alpha fields are NUL-padded byte strings. Bytes are mapped to `char`
//! one-to-one (Latin-1); codepage transliteration is left to the caller.
//!
//! # BCD
//! Fixed-point decimals occupy 17 bytes: a size/sign byte followed by 32
//! packed nibbles. Negative values are stored with every digit nibble XORed
//! against `0xF`.

pub mod calendar;

use crate::error::{PxError, Result};

/// Byte length of every BCD field on disk.
pub const BCD_LEN: usize = 17;
/// Nibble positions available after the size/sign byte.
const BCD_NIBBLES: usize = 34;

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| PxError::Corrupt(format!("field data shorter than {N} bytes")))
}

// ── Integers ─────────────────────────────────────────────────────────────────

/// Undo the integer sign flip in place. Returns `false` for NULL.
fn unflip_int(buf: &mut [u8]) -> bool {
    if buf[0] & 0x80 != 0 {
        buf[0] &= 0x7f;
        true
    } else if buf.iter().any(|&b| b != 0) {
        buf[0] |= 0x80;
        true
    } else {
        false
    }
}

fn flip_int(buf: &mut [u8], negative: bool) {
    if negative {
        buf[0] &= 0x7f;
    } else {
        buf[0] |= 0x80;
    }
}

fn collides_with_null(width: &str, v: i64) -> PxError {
    PxError::InvalidArgument(format!("{width} value {v} is reserved for NULL"))
}

pub fn decode_byte(data: &[u8]) -> Result<Option<i8>> {
    let mut b = fixed::<1>(data)?;
    Ok(unflip_int(&mut b).then(|| b[0] as i8))
}

pub fn encode_byte(v: Option<i8>) -> Result<[u8; 1]> {
    match v {
        None           => Ok([0]),
        Some(i8::MIN)  => Err(collides_with_null("byte", i8::MIN as i64)),
        Some(v)        => {
            let mut b = v.to_be_bytes();
            flip_int(&mut b, v < 0);
            Ok(b)
        }
    }
}

pub fn decode_short(data: &[u8]) -> Result<Option<i16>> {
    let mut b = fixed::<2>(data)?;
    Ok(unflip_int(&mut b).then(|| i16::from_be_bytes(b)))
}

pub fn encode_short(v: Option<i16>) -> Result<[u8; 2]> {
    match v {
        None           => Ok([0; 2]),
        Some(i16::MIN) => Err(collides_with_null("short", i16::MIN as i64)),
        Some(v)        => {
            let mut b = v.to_be_bytes();
            flip_int(&mut b, v < 0);
            Ok(b)
        }
    }
}

pub fn decode_long(data: &[u8]) -> Result<Option<i32>> {
    let mut b = fixed::<4>(data)?;
    Ok(unflip_int(&mut b).then(|| i32::from_be_bytes(b)))
}

pub fn encode_long(v: Option<i32>) -> Result<[u8; 4]> {
    match v {
        None           => Ok([0; 4]),
        Some(i32::MIN) => Err(collides_with_null("long", i32::MIN as i64)),
        Some(v)        => {
            let mut b = v.to_be_bytes();
            flip_int(&mut b, v < 0);
            Ok(b)
        }
    }
}

// ── Doubles ──────────────────────────────────────────────────────────────────

pub fn decode_double(data: &[u8]) -> Result<Option<f64>> {
    let mut b = fixed::<8>(data)?;
    if b[0] & 0x80 != 0 {
        b[0] &= 0x7f;
    } else if b.iter().any(|&x| x != 0) {
        b.iter_mut().for_each(|x| *x = !*x);
    } else {
        return Ok(None);
    }
    Ok(Some(f64::from_be_bytes(b)))
}

/// NaN has no stored form: its sign-flipped pattern decodes to a different
/// value, so it is refused.
pub fn encode_double(v: Option<f64>) -> Result<[u8; 8]> {
    let Some(v) = v else { return Ok([0; 8]) };
    if v.is_nan() {
        return Err(PxError::InvalidArgument("NaN cannot be stored in a numeric field".into()));
    }
    let mut b = v.to_be_bytes();
    if v >= 0.0 {
        b[0] |= 0x80;
    } else {
        b.iter_mut().for_each(|x| *x = !*x);
    }
    Ok(b)
}

// ── Text and raw bytes ───────────────────────────────────────────────────────

/// Decode a NUL-padded alpha field. A leading NUL means NULL.
pub fn decode_alpha(data: &[u8]) -> Option<String> {
    if data.first().copied().unwrap_or(0) == 0 {
        return None;
    }
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Some(data[..end].iter().map(|&b| b as char).collect())
}

/// Encode into `out`, zero-filling the remainder.
pub fn encode_alpha(field: &str, v: Option<&str>, out: &mut [u8]) -> Result<()> {
    out.fill(0);
    let Some(text) = v else { return Ok(()) };
    let bytes = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| PxError::field(field, format!("character {c:?} is not representable"))))
        .collect::<Result<Vec<u8>>>()?;
    if bytes.len() > out.len() {
        return Err(PxError::ValueTooLong { field: field.to_owned(), len: bytes.len(), max: out.len() });
    }
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

pub fn decode_bytes(data: &[u8]) -> Option<Vec<u8>> {
    match data.first() {
        None | Some(0) => None,
        Some(_)        => Some(data.to_vec()),
    }
}

pub fn encode_bytes(field: &str, v: Option<&[u8]>, out: &mut [u8]) -> Result<()> {
    out.fill(0);
    let Some(bytes) = v else { return Ok(()) };
    if bytes.len() > out.len() {
        return Err(PxError::ValueTooLong { field: field.to_owned(), len: bytes.len(), max: out.len() });
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

// ── BCD ──────────────────────────────────────────────────────────────────────

fn nibble(data: &[u8], i: usize) -> u8 {
    if i % 2 == 1 { data[i / 2] & 0x0f } else { data[i / 2] >> 4 }
}

fn set_nibble(buf: &mut [u8], i: usize, v: u8) {
    let idx = i / 2;
    if i % 2 == 1 {
        buf[idx] = (buf[idx] & 0xf0) | v;
    } else {
        buf[idx] = (buf[idx] & 0x0f) | (v << 4);
    }
}

/// Decode a 17-byte BCD field holding `decimals` fraction digits. The
/// separator is always present, so a field without fraction digits reads
/// as `"42."`.
pub fn decode_bcd(data: &[u8], decimals: u8) -> Result<Option<String>> {
    let data = fixed::<BCD_LEN>(data)?;
    if data[0] == 0 {
        return Ok(None);
    }
    let (mut out, sign) = if data[0] & 0x80 != 0 {
        (String::new(), 0x00)
    } else {
        (String::from("-"), 0x0f)
    };
    let size = (data[0] & 0x3f) as usize;
    if size != decimals as usize || size > BCD_NIBBLES - 2 {
        return Err(PxError::Corrupt(format!("BCD precision {size} does not match field precision {decimals}")));
    }

    let digit = |i: usize| -> Result<char> {
        let d = nibble(&data, i) ^ sign;
        if d > 9 {
            return Err(PxError::Corrupt(format!("BCD nibble {i} holds {d:#x}")));
        }
        Ok((b'0' + d) as char)
    };

    let int_end = BCD_NIBBLES - size;
    let mut leading = true;
    for i in 2..int_end {
        let c = digit(i)?;
        if leading && c == '0' {
            continue;
        }
        leading = false;
        out.push(c);
    }
    if leading {
        out.push('0');
    }
    out.push('.');
    for i in int_end..BCD_NIBBLES {
        out.push(digit(i)?);
    }
    Ok(Some(out))
}

/// Encode a decimal string such as `"-12.50"` into a 17-byte BCD field.
///
/// Either `.` or `,` is accepted as the decimal separator. Fraction digits
/// beyond `decimals` are truncated; integer digits that do not fit are an
/// error.
pub fn encode_bcd(v: Option<&str>, decimals: u8) -> Result<[u8; BCD_LEN]> {
    let mut buf = [0u8; BCD_LEN];
    let Some(text) = v else { return Ok(buf) };
    let dc = decimals as usize;
    if dc > BCD_NIBBLES - 2 {
        return Err(PxError::InvalidArgument(format!("BCD precision {dc} exceeds 32 digits")));
    }

    let text = text.trim();
    let (negative, body) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _          => (false, text),
    };
    let (int_part, frac_part) = match body.find(['.', ',']) {
        Some(p) => (&body[..p], &body[p + 1..]),
        None    => (body, ""),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if body.is_empty() || !all_digits(int_part) || !all_digits(frac_part) {
        return Err(PxError::InvalidArgument(format!("'{text}' is not a decimal number")));
    }

    let sign = if negative { 0x0f } else { 0x00 };
    buf[0] = if negative { 0x40 } else { 0xC0 } + decimals;
    if negative {
        buf[1..].fill(0xff);
    }

    for (i, b) in frac_part.bytes().take(dc).enumerate() {
        set_nibble(&mut buf, BCD_NIBBLES - dc + i, (b - b'0') ^ sign);
    }

    let int_digits = int_part.trim_start_matches('0');
    let room = BCD_NIBBLES - dc - 2;
    if int_digits.len() > room {
        return Err(PxError::InvalidArgument(format!("'{text}' has more than {room} integer digits")));
    }
    for (k, b) in int_digits.bytes().rev().enumerate() {
        set_nibble(&mut buf, BCD_NIBBLES - dc - 1 - k, (b - b'0') ^ sign);
    }
    Ok(buf)
}
