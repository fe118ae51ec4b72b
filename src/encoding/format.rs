//! Debug formatting for raw keys and values, used when logging recovery
//! and corruption diagnostics.

use itertools::Itertools as _;

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }

    /// Formats a key/value pair, where the value may not exist.
    pub fn key_maybe_value(key: &[u8], value: Option<&[u8]>) -> String {
        let fmtkey = Self::bytes(key);
        let fmtvalue = value.map_or("None".to_string(), Self::bytes);
        format!("{fmtkey} -> {fmtvalue}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_non_printable() {
        assert_eq!(Raw::bytes(&[0x00, 0x61, 0xFF]), "\"\\x00a\\xff\"");
    }

    #[test]
    fn test_key_without_value() {
        assert_eq!(Raw::key_maybe_value(b"k", None), "\"k\" -> None");
    }
}
