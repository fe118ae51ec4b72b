use chrono::{DateTime, Utc};
use geo_types::Point;
use serde::{Deserialize, Serialize};

use super::datablock::DataBlock;

/// Caller-opaque observation identifier.
///
/// The bytes are the internal record key (`var_u64(series_id)` followed by
/// the 12-byte phenomenon-time instant), so identifiers persisted by
/// external systems stay valid across restarts and backups. They are not
/// globally sortable; they only round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObsId(Vec<u8>);

impl ObsId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Display for ObsId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One timestamped observation produced by a data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Owning data stream; must be registered before the first add.
    pub stream_id: u64,
    /// Observed feature of interest; 0 when none applies. Denormalized
    /// here so stored records can be validated against their series.
    pub foi_id: u64,
    /// When the observed phenomenon occurred.
    pub phenomenon_time: DateTime<Utc>,
    /// When the result was produced. Equal to the phenomenon time for
    /// plain sensors; the run time for forecast models.
    pub result_time: DateTime<Utc>,
    /// Where the sample was taken, for mobile sensors.
    pub sampling_geometry: Option<Point<f64>>,
    /// Result payload, shaped by the stream's record structure.
    pub result: DataBlock,
}

impl Observation {
    /// A sensor observation: result time equals phenomenon time.
    pub fn new(stream_id: u64, phenomenon_time: DateTime<Utc>, result: DataBlock) -> Self {
        Self {
            stream_id,
            foi_id: 0,
            phenomenon_time,
            result_time: phenomenon_time,
            sampling_geometry: None,
            result,
        }
    }

    pub fn with_foi(mut self, foi_id: u64) -> Self {
        self.foi_id = foi_id;
        self
    }

    pub fn with_result_time(mut self, result_time: DateTime<Utc>) -> Self {
        self.result_time = result_time;
        self
    }

    pub fn with_sampling_geometry(mut self, point: Point<f64>) -> Self {
        self.sampling_geometry = Some(point);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sensor_defaults() {
        let t = Utc.timestamp_opt(1000, 0).single().expect("instant");
        let obs = Observation::new(1, t, DataBlock::Double(1.0));
        assert_eq!(obs.result_time, obs.phenomenon_time);
        assert_eq!(obs.foi_id, 0);
        assert!(obs.sampling_geometry.is_none());
    }

    #[test]
    fn test_obs_id_display() {
        let id = ObsId::from_bytes(vec![0x01, 0xAB]);
        assert_eq!(id.to_string(), "01ab");
    }
}
