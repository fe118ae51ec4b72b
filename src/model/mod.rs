pub mod datablock;
pub mod info;
pub mod observation;
pub mod time;

pub use datablock::{DataBlock, DataComponent, RecordEncoding};
pub use info::{DataStreamInfo, FoiInfo, SystemInfo};
pub use observation::{ObsId, Observation};
pub use time::TimeRange;
