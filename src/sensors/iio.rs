/// DHT22 temperature/humidity through the Linux IIO sysfs interface
use futures_util::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration};

use super::{ClimateSensor, SensorError};
use crate::models::ClimateReading;

// The dht11 kernel driver bit-bangs the bus, a read can take ~250 ms
const SYSFS_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct IioClimate {
    dir: PathBuf,
}

impl IioClimate {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    async fn read_attribute(&self, name: &'static str) -> Result<f32, SensorError> {
        let path = self.dir.join(name);
        let raw = timeout(SYSFS_TIMEOUT, tokio::fs::read_to_string(&path))
            .await
            .map_err(|_| SensorError::Timeout(name))??;
        parse_milli(&raw)
    }
}

/// IIO reports milli-degrees and milli-percent
pub fn parse_milli(raw: &str) -> Result<f32, SensorError> {
    raw.trim()
        .parse::<i64>()
        .map(|milli| milli as f32 / 1000.0)
        .map_err(|e| SensorError::InvalidData(format!("'{}': {}", raw.trim(), e)))
}

impl ClimateSensor for IioClimate {
    fn read_climate(&mut self) -> BoxFuture<'_, Result<ClimateReading, SensorError>> {
        async move {
            let temperature = self.read_attribute("in_temp_input").await?;
            let humidity = self.read_attribute("in_humidityrelative_input").await?;
            Ok(ClimateReading {
                temperature,
                humidity,
            })
        }
        .boxed()
    }
}
