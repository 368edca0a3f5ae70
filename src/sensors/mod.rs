/// Capability interfaces for the sensors the scheduler samples
///
/// Each driver only has to produce a numeric reading or fail; the scheduler
/// treats any failure as a skipped sample.
pub mod iio;
pub mod mhz19;
pub mod mq135;

use futures_util::future::BoxFuture;
use std::io;
use thiserror::Error;

use crate::models::{ClimateReading, GasReading};

pub use iio::IioClimate;
pub use mhz19::Mhz19;
pub use mq135::Mq135;

/// Error type for sensor operations
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("checksum mismatch (computed {computed:#04x}, received {received:#04x})")]
    Checksum { computed: u8, received: u8 },
}

/// Temperature and humidity source
pub trait ClimateSensor: Send {
    fn read_climate(&mut self) -> BoxFuture<'_, Result<ClimateReading, SensorError>>;
}

/// Gas sensor whose output is derived from the current climate sample
pub trait GasSensor: Send {
    fn read_gas(&mut self, climate: ClimateReading) -> BoxFuture<'_, Result<GasReading, SensorError>>;
}

/// Dedicated CO2 sensor reporting parts per million
pub trait Co2Sensor: Send {
    fn read_ppm(&mut self) -> BoxFuture<'_, Result<i32, SensorError>>;
}
