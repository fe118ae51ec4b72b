use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Serialize a value into a writer using bincode
pub fn serialize_into<T: Serialize, W: Write>(writer: W, value: &T) -> Result<()> {
    Ok(bincode::serialize_into(writer, value)?)
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Deserialize a value from a reader using bincode
pub fn deserialize_from<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T> {
    Ok(bincode::deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let serialized = serialize(&original).unwrap();
        let deserialized: TestStruct = deserialize(&serialized).unwrap();

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_reader_writer_round_trip() {
        let original = TestStruct {
            id: 123,
            name: "reader writer".to_string(),
            active: false,
        };

        let mut buffer = Vec::new();
        serialize_into(&mut buffer, &original).unwrap();
        let deserialized: TestStruct = deserialize_from(buffer.as_slice()).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_invalid_data() {
        let invalid = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = deserialize(&invalid);
        assert!(result.is_err());
    }
}
