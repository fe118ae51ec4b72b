use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Rolling CRC-64 over log records and snapshot sections.
pub struct Hasher {
    rolling_checksum: u64,
    crc64: Crc<u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("rolling_checksum", &self.rolling_checksum)
            .finish()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            rolling_checksum: 0,
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
        }
    }

    /// Folds a byte chunk into the rolling checksum.
    pub fn write(&mut self, bytes: &[u8]) {
        self.rolling_checksum ^= self.crc64.checksum(bytes);
    }

    /// Returns the current rolling checksum.
    pub fn value(&self) -> u64 {
        self.rolling_checksum
    }

    /// Resets the rolling checksum to its initial state.
    pub fn reset(&mut self) {
        self.rolling_checksum = 0;
    }

    /// One-shot checksum of a single byte chunk.
    pub fn checksum(bytes: &[u8]) -> u64 {
        let crc64 = Crc::<u64>::new(&CRC_64_ECMA);
        crc64.checksum(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_checksum() {
        let mut hasher = Hasher::new();

        hasher.write(b"key1");
        hasher.write(b"value1");
        let rolled = hasher.value();

        // XOR-folding is order-independent per chunk but sensitive to content
        hasher.reset();
        hasher.write(b"value1");
        hasher.write(b"key1");
        assert_eq!(rolled, hasher.value());

        hasher.reset();
        hasher.write(b"key1");
        assert_ne!(rolled, hasher.value());
    }

    #[test]
    fn test_one_shot_matches_single_write() {
        let mut hasher = Hasher::new();
        hasher.write(b"abc");
        assert_eq!(hasher.value(), Hasher::checksum(b"abc"));
    }
}
