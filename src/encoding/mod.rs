pub mod bincode;
pub mod format;
pub mod keycode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Trait for composite index keys with order preservation.
///
/// Encoded keys must maintain their logical ordering under unsigned
/// lexicographic byte comparison, since the underlying engine sorts and
/// range-scans raw bytes. Implementations hand-build their layout from the
/// keycode primitives; they never go through serde.
pub trait Key: Sized {
    /// Encode the key to bytes while preserving sort order
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Trait for stored values, encoded with bincode.
///
/// Values don't need to preserve ordering, so they use straight serde
/// serialization.
pub trait Value: Serialize + DeserializeOwned {
    /// Encode the value to bytes
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decode bytes back to the original value type
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl<T> Value for T where T: Serialize + DeserializeOwned {}
