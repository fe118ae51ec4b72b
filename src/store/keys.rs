//! Composite index keys for the observation maps.
//!
//! Three correlated layouts, all ordered as unsigned lexicographic bytes:
//!
//! - record key:          `var_u64(series_id) . instant(phenomenon_time)`
//! - series by stream:    `u64(stream_id) . u64(foi_id) . instant(result_time)`
//! - series by foi:       `u64(foi_id) . u64(stream_id) . instant(result_time)`
//!
//! The record key doubles as the public observation identifier,
//! bit-for-bit, so externally persisted ids keep resolving across
//! restarts and backups.

use chrono::{DateTime, Utc};

use crate::encoding::{keycode, Key};
use crate::error::Result;
use crate::model::{ObsId, Observation};

/// Physical series grouping: one per `(stream, foi, result time)` triple.
///
/// The stored result time is the -infinity sentinel when every record in
/// the series has `result_time == phenomenon_time` (the plain sensor
/// case); forecast-style series carry their real run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesKey {
    pub stream_id: u64,
    pub foi_id: u64,
    pub result_time: DateTime<Utc>,
}

impl SeriesKey {
    pub fn new(stream_id: u64, foi_id: u64, result_time: DateTime<Utc>) -> Self {
        Self { stream_id, foi_id, result_time }
    }

    /// The series an observation belongs to, normalizing the sensor case
    /// to the sentinel.
    pub fn for_observation(obs: &Observation) -> Self {
        let result_time = if obs.result_time == obs.phenomenon_time {
            keycode::min_instant()
        } else {
            obs.result_time
        };
        Self::new(obs.stream_id, obs.foi_id, result_time)
    }

    /// Whether this series stores sensor-style records where result time
    /// equals phenomenon time.
    pub fn has_implicit_result_time(&self) -> bool {
        self.result_time == keycode::min_instant()
    }

    /// Key in the stream-major index.
    pub fn encode_by_stream(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        keycode::encode_u64_into(&mut buf, self.stream_id);
        keycode::encode_u64_into(&mut buf, self.foi_id);
        keycode::encode_instant_into(&mut buf, self.result_time);
        buf
    }

    pub fn decode_by_stream(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 28 {
            return crate::errdata!("series key must be 28 bytes, got {}", bytes.len());
        }
        Ok(Self {
            stream_id: keycode::decode_u64(&bytes[0..8])?,
            foi_id: keycode::decode_u64(&bytes[8..16])?,
            result_time: keycode::decode_instant(&bytes[16..28])?,
        })
    }

    /// Key in the foi-major inverted index.
    pub fn encode_by_foi(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        keycode::encode_u64_into(&mut buf, self.foi_id);
        keycode::encode_u64_into(&mut buf, self.stream_id);
        keycode::encode_instant_into(&mut buf, self.result_time);
        buf
    }

    pub fn decode_by_foi(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 28 {
            return crate::errdata!("series key must be 28 bytes, got {}", bytes.len());
        }
        Ok(Self {
            foi_id: keycode::decode_u64(&bytes[0..8])?,
            stream_id: keycode::decode_u64(&bytes[8..16])?,
            result_time: keycode::decode_instant(&bytes[16..28])?,
        })
    }
}

/// Primary observation key: `(series, phenomenon time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey {
    pub series_id: u64,
    pub phenomenon_time: DateTime<Utc>,
}

impl Key for RecordKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22);
        keycode::encode_var_u64_into(&mut buf, self.series_id);
        keycode::encode_instant_into(&mut buf, self.phenomenon_time);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (series_id, var_len) = keycode::decode_var_u64(bytes)?;
        if bytes.len() != var_len + keycode::INSTANT_LEN {
            return crate::errdata!("record key has trailing bytes");
        }
        let phenomenon_time = keycode::decode_instant(&bytes[var_len..])?;
        Ok(Self { series_id, phenomenon_time })
    }
}

impl RecordKey {
    pub fn new(series_id: u64, phenomenon_time: DateTime<Utc>) -> Self {
        Self { series_id, phenomenon_time }
    }

    /// The caller-visible identifier: the same bytes, opaque.
    pub fn to_obs_id(&self) -> ObsId {
        ObsId::from_bytes(self.encode())
    }

    /// Decodes a public identifier. Malformed ids yield None so lookups
    /// can report not-found instead of failing the query.
    pub fn from_obs_id(id: &ObsId) -> Option<Self> {
        Self::decode(id.as_bytes()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("instant")
    }

    #[test]
    fn test_record_key_round_trip() {
        let key = RecordKey::new(12345, t(1704067200));
        let decoded = RecordKey::decode(&key.encode()).expect("decode");
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_record_key_orders_by_time_within_series() {
        let earlier = RecordKey::new(7, t(100)).encode();
        let later = RecordKey::new(7, t(101)).encode();
        assert!(earlier < later);
    }

    #[test]
    fn test_series_key_round_trips() {
        let key = SeriesKey::new(3, 9, t(500));
        assert_eq!(SeriesKey::decode_by_stream(&key.encode_by_stream()).expect("decode"), key);
        assert_eq!(SeriesKey::decode_by_foi(&key.encode_by_foi()).expect("decode"), key);
    }

    #[test]
    fn test_series_key_order_by_stream() {
        let keys = [
            SeriesKey::new(1, 5, t(100)),
            SeriesKey::new(1, 5, t(200)),
            SeriesKey::new(1, 6, keycode::min_instant()),
            SeriesKey::new(2, 0, keycode::min_instant()),
        ];
        let encoded: Vec<_> = keys.iter().map(|k| k.encode_by_stream()).collect();
        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }
    }

    #[test]
    fn test_public_id_is_record_key() {
        let key = RecordKey::new(42, t(1234));
        let id = key.to_obs_id();
        assert_eq!(id.as_bytes(), key.encode().as_slice());
        assert_eq!(RecordKey::from_obs_id(&id), Some(key));
    }

    #[test]
    fn test_malformed_id_decodes_to_none() {
        assert_eq!(RecordKey::from_obs_id(&ObsId::from_bytes(vec![])), None);
        assert_eq!(RecordKey::from_obs_id(&ObsId::from_bytes(vec![0x80])), None);
        assert_eq!(
            RecordKey::from_obs_id(&ObsId::from_bytes(vec![0x01, 0x02, 0x03])),
            None
        );
    }

    #[test]
    fn test_sensor_normalization() {
        use crate::model::DataBlock;

        let sensor = Observation::new(1, t(100), DataBlock::Double(0.0));
        let key = SeriesKey::for_observation(&sensor);
        assert!(key.has_implicit_result_time());

        let model = Observation::new(1, t(100), DataBlock::Double(0.0)).with_result_time(t(90));
        let key = SeriesKey::for_observation(&model);
        assert_eq!(key.result_time, t(90));
    }

    proptest! {
        #[test]
        fn prop_record_key_round_trip(series_id in any::<u64>(), secs in 0i64..4_000_000_000) {
            let key = RecordKey::new(series_id, t(secs));
            prop_assert_eq!(RecordKey::decode(&key.encode()).unwrap(), key);
        }

        #[test]
        fn prop_record_key_monotone_in_time(
            series_id in any::<u64>(),
            a in 0i64..4_000_000_000,
            b in 0i64..4_000_000_000,
        ) {
            let ka = RecordKey::new(series_id, t(a)).encode();
            let kb = RecordKey::new(series_id, t(b)).encode();
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
