//! Persistent observation database engine for sensor and actuator
//! platforms: durable storage of timestamped observations keyed by
//! `(data stream, feature of interest, result time, phenomenon time)`,
//! with range, point and aggregate queries over the ordered indexes.

pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod federation;
pub mod flock;
pub mod hasher;
pub mod model;
pub mod query;
pub mod store;
pub mod tmpfs;

pub use config::{DbConfig, StreamIdStrategy};
pub use error::{Error, Result};
pub use federation::FederatedObsStore;
pub use model::{DataBlock, DataComponent, DataStreamInfo, FoiInfo, ObsId, Observation, SystemInfo};
pub use query::{FoiFilter, HistogramBinning, ObsFilter, StatsQuery, StreamFilter, TemporalFilter};
pub use store::{ObsDatabase, ObsStats};
