//! Order-preserving key primitives.
//!
//! The underlying engine orders keys as unsigned lexicographic bytes, so
//! every primitive here encodes such that byte order equals logical order:
//!
//! - instants: 12 bytes, big-endian epoch seconds with the sign bit
//!   flipped, then big-endian nanos-of-second. The -inf/+inf sentinels
//!   encode as all-zero / all-one bytes and sort outside any real instant.
//! - u64: 8 bytes big-endian.
//! - var_u64: LEB128. Ordered only within runs of equal values, which is
//!   sufficient for its single use as a fixed series prefix: LEB128 is
//!   prefix-free, so a range scan under one prefix can never leak into
//!   another series.
//! - strings: raw UTF-8 with a null terminator, so shorter strings sort
//!   before their extensions.

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, TimeZone, Utc};

use crate::errdata;
use crate::error::Result;

/// Encoded width of an instant.
pub const INSTANT_LEN: usize = 12;

/// The -infinity instant sentinel.
pub fn min_instant() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// The +infinity instant sentinel.
pub fn max_instant() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// Appends the 12-byte encoding of an instant.
pub fn encode_instant_into(buf: &mut Vec<u8>, t: DateTime<Utc>) {
    if t == min_instant() {
        buf.extend_from_slice(&[0x00; INSTANT_LEN]);
        return;
    }
    if t == max_instant() {
        buf.extend_from_slice(&[0xFF; INSTANT_LEN]);
        return;
    }
    let mut bytes = [0u8; INSTANT_LEN];
    // Flip the sign bit so negative epochs sort before positive ones
    let seconds = (t.timestamp() as u64) ^ (1u64 << 63);
    BigEndian::write_u64(&mut bytes[0..8], seconds);
    BigEndian::write_u32(&mut bytes[8..12], t.timestamp_subsec_nanos());
    buf.extend_from_slice(&bytes);
}

/// Encodes an instant to its 12-byte form.
pub fn encode_instant(t: DateTime<Utc>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INSTANT_LEN);
    encode_instant_into(&mut buf, t);
    buf
}

/// Decodes an instant from the first 12 bytes of the slice.
pub fn decode_instant(bytes: &[u8]) -> Result<DateTime<Utc>> {
    if bytes.len() < INSTANT_LEN {
        return errdata!("truncated instant: {} bytes", bytes.len());
    }
    let bytes = &bytes[..INSTANT_LEN];
    if bytes.iter().all(|b| *b == 0x00) {
        return Ok(min_instant());
    }
    if bytes.iter().all(|b| *b == 0xFF) {
        return Ok(max_instant());
    }
    let seconds = (BigEndian::read_u64(&bytes[0..8]) ^ (1u64 << 63)) as i64;
    let nanos = BigEndian::read_u32(&bytes[8..12]);
    match Utc.timestamp_opt(seconds, nanos).single() {
        Some(t) => Ok(t),
        None => errdata!("instant out of range: {seconds}s {nanos}ns"),
    }
}

/// Appends a big-endian u64.
pub fn encode_u64_into(buf: &mut Vec<u8>, v: u64) {
    let mut bytes = [0u8; 8];
    BigEndian::write_u64(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

/// Decodes a big-endian u64 from the first 8 bytes of the slice.
pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return errdata!("truncated u64: {} bytes", bytes.len());
    }
    Ok(BigEndian::read_u64(&bytes[0..8]))
}

/// Appends a LEB128 variable-width u64.
pub fn encode_var_u64_into(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            buf.push(byte | 0x80);
        } else {
            buf.push(byte);
            return;
        }
    }
}

/// Decodes a LEB128 u64, returning the value and the number of bytes read.
pub fn decode_var_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    errdata!("truncated or overlong var u64")
}

/// Appends a null-terminated string. Interior null bytes are rejected
/// since they would break the terminator framing.
pub fn encode_string_into(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0x00) {
        return crate::errinput!("string key contains a null byte");
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
    Ok(())
}

/// Decodes a null-terminated string, returning it and the number of bytes
/// consumed including the terminator.
pub fn decode_string(bytes: &[u8]) -> Result<(String, usize)> {
    let end = match bytes.iter().position(|b| *b == 0x00) {
        Some(i) => i,
        None => return errdata!("unterminated string key"),
    };
    let s = std::str::from_utf8(&bytes[..end])
        .map_err(|_| crate::error::Error::InvalidData("string key is not utf-8".to_string()))?;
    Ok((s.to_string(), end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn instant(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).single().expect("valid instant")
    }

    #[test]
    fn test_instant_round_trip() {
        let values = [
            instant(0, 0),
            instant(1704067200, 123_456_789),
            instant(-62135596800, 0),
            min_instant(),
            max_instant(),
        ];
        for t in values {
            let encoded = encode_instant(t);
            assert_eq!(encoded.len(), INSTANT_LEN);
            assert_eq!(decode_instant(&encoded).unwrap(), t);
        }
    }

    #[test]
    fn test_instant_ordering() {
        let values = [
            min_instant(),
            instant(-1000, 0),
            instant(-1, 999_999_999),
            instant(0, 0),
            instant(0, 1),
            instant(1704067200, 0),
            max_instant(),
        ];
        let encoded: Vec<_> = values.iter().map(|t| encode_instant(*t)).collect();
        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i], "{:?} !< {:?}", values[i - 1], values[i]);
        }
    }

    #[test]
    fn test_sentinels_are_extremes() {
        assert_eq!(encode_instant(min_instant()), vec![0x00; 12]);
        assert_eq!(encode_instant(max_instant()), vec![0xFF; 12]);
    }

    #[test]
    fn test_var_u64_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 1 << 20, 1 << 47, u64::MAX] {
            let mut buf = Vec::new();
            encode_var_u64_into(&mut buf, v);
            let (decoded, len) = decode_var_u64(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn test_var_u64_prefix_free() {
        // No encoding is a prefix of another value's encoding
        let a = {
            let mut b = Vec::new();
            encode_var_u64_into(&mut b, 1);
            b
        };
        let b = {
            let mut b = Vec::new();
            encode_var_u64_into(&mut b, 128);
            b
        };
        assert!(!b.starts_with(&a));
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        encode_string_into(&mut buf, "temp").unwrap();
        encode_string_into(&mut buf, "pressure").unwrap();
        let (first, n) = decode_string(&buf).unwrap();
        assert_eq!(first, "temp");
        let (second, _) = decode_string(&buf[n..]).unwrap();
        assert_eq!(second, "pressure");
    }

    #[test]
    fn test_string_rejects_interior_null() {
        let mut buf = Vec::new();
        assert!(encode_string_into(&mut buf, "a\0b").is_err());
    }

    #[test]
    fn test_decode_instant_truncated() {
        assert!(decode_instant(&[0x01, 0x02]).is_err());
    }

    proptest! {
        #[test]
        fn prop_instant_round_trip(secs in -62135596800i64..=253402300799, nanos in 0u32..1_000_000_000) {
            let t = instant(secs, nanos);
            prop_assert_eq!(decode_instant(&encode_instant(t)).unwrap(), t);
        }

        #[test]
        fn prop_instant_monotone(
            a_secs in -62135596800i64..=253402300799, a_nanos in 0u32..1_000_000_000,
            b_secs in -62135596800i64..=253402300799, b_nanos in 0u32..1_000_000_000,
        ) {
            let a = instant(a_secs, a_nanos);
            let b = instant(b_secs, b_nanos);
            let (ea, eb) = (encode_instant(a), encode_instant(b));
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn prop_var_u64_round_trip(v in any::<u64>()) {
            let mut buf = Vec::new();
            encode_var_u64_into(&mut buf, v);
            let (decoded, len) = decode_var_u64(&buf).unwrap();
            prop_assert_eq!(decoded, v);
            prop_assert_eq!(len, buf.len());
        }
    }
}
