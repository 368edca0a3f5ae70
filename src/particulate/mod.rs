/// PMS5003 laser particulate sensor: frame decoder, sensor session and the
/// structured report published to the hub.
pub mod decoder;
pub mod report;
pub mod sensor;

pub use decoder::{DecodeStatus, Decoder, Frame, FramingError};
pub use report::{generate_report, ParticulateReport};
pub use sensor::PmsSensor;
