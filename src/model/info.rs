use chrono::{DateTime, Utc};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};

use super::datablock::{DataComponent, RecordEncoding};

/// Registered observing system (sensor, platform, process).
///
/// Versioned by valid-time start; a re-registration with a later valid
/// time describes the same system after a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Globally unique string identifier (typically a URN).
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    /// Parent group when the system is a member of one.
    pub parent_system: Option<u64>,
    pub valid_time_begin: DateTime<Utc>,
    /// Output names this system produces data streams for.
    pub outputs: Vec<String>,
    /// Control input names accepted by the system.
    pub control_inputs: Vec<String>,
}

impl SystemInfo {
    pub fn new(uid: &str, name: &str, valid_time_begin: DateTime<Utc>) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            description: None,
            parent_system: None,
            valid_time_begin,
            outputs: Vec::new(),
            control_inputs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.outputs.push(output.to_string());
        self
    }
}

/// Feature of interest: the real-world thing being observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoiInfo {
    /// Unique string identifier.
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    pub geometry: Option<Geometry<f64>>,
    pub valid_time_begin: DateTime<Utc>,
}

impl FoiInfo {
    pub fn new(uid: &str, name: &str, valid_time_begin: DateTime<Utc>) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            description: None,
            geometry: None,
            valid_time_begin,
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry<f64>) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

/// One output of one system: the unit of schema for observations.
///
/// A stream is Live on creation, Retired once its valid time is closed
/// (queryable, but accepts no further writes), and gone after a cascade
/// remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamInfo {
    pub system_id: u64,
    pub output_name: String,
    pub record_structure: DataComponent,
    pub record_encoding: RecordEncoding,
    pub valid_time_begin: DateTime<Utc>,
    /// Set when the stream is retired.
    pub valid_time_end: Option<DateTime<Utc>>,
}

impl DataStreamInfo {
    pub fn new(
        system_id: u64,
        output_name: &str,
        record_structure: DataComponent,
        valid_time_begin: DateTime<Utc>,
    ) -> Self {
        Self {
            system_id,
            output_name: output_name.to_string(),
            record_structure,
            record_encoding: RecordEncoding::default(),
            valid_time_begin,
            valid_time_end: None,
        }
    }

    pub fn with_encoding(mut self, encoding: RecordEncoding) -> Self {
        self.record_encoding = encoding;
        self
    }

    pub fn is_retired(&self) -> bool {
        self.valid_time_end.is_some()
    }

    /// Whether the stream's valid time covers the given instant.
    pub fn valid_at(&self, t: DateTime<Utc>) -> bool {
        if t < self.valid_time_begin {
            return false;
        }
        match self.valid_time_end {
            Some(end) => t < end,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("instant")
    }

    #[test]
    fn test_stream_state() {
        let mut stream = DataStreamInfo::new(
            1,
            "temp",
            DataComponent::quantity("temp", "Cel"),
            t(100),
        );
        assert!(!stream.is_retired());
        assert!(stream.valid_at(t(100)));
        assert!(!stream.valid_at(t(99)));

        stream.valid_time_end = Some(t(200));
        assert!(stream.is_retired());
        assert!(stream.valid_at(t(150)));
        assert!(!stream.valid_at(t(200)));
    }
}
