/// MQ135 gas sensor on an ADC channel, compensated for temperature and humidity
use futures_util::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration};

use super::{GasSensor, SensorError};
use crate::models::{ClimateReading, GasReading};

// Curve fit of the datasheet CO2 line
const PARA: f32 = 116.602_07;
const PARB: f32 = 2.769_035;

// Temperature/humidity dependency fit
const CORA: f32 = 0.000_35;
const CORB: f32 = 0.027_18;
const CORC: f32 = 1.395_38;
const CORD: f32 = 0.001_8;
const CORE: f32 = -0.003_333_333;
const CORF: f32 = -0.001_923_077;
const CORG: f32 = 1.130_128_2;

/// Atmospheric CO2 used as the calibration reference, ppm
pub const ATMOSPHERIC_CO2: f32 = 397.13;
pub const DEFAULT_RLOAD_KOHM: f32 = 10.0;
pub const DEFAULT_RZERO: f32 = 76.63;
/// 10-bit converter
pub const DEFAULT_ADC_MAX: f32 = 1023.0;

const SYSFS_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Mq135 {
    raw_path: PathBuf,
    adc_max: f32,
    rload: f32,
    rzero: f32,
}

impl Mq135 {
    pub fn new(raw_path: impl AsRef<Path>) -> Self {
        Self {
            raw_path: raw_path.as_ref().to_path_buf(),
            adc_max: DEFAULT_ADC_MAX,
            rload: DEFAULT_RLOAD_KOHM,
            rzero: DEFAULT_RZERO,
        }
    }

    /// Sensor resistance in kΩ for a raw ADC value
    pub fn resistance(&self, raw: u32) -> Result<f32, SensorError> {
        if raw == 0 {
            return Err(SensorError::InvalidData("ADC reads 0".into()));
        }
        Ok((self.adc_max / raw as f32 - 1.0) * self.rload)
    }

    pub fn derive(&self, raw: u32, climate: ClimateReading) -> Result<GasReading, SensorError> {
        let factor = correction_factor(climate.temperature, climate.humidity);
        let corrected = self.resistance(raw)? / factor;
        Ok(GasReading {
            rzero: rzero_for(corrected),
            ppm: ppm_for(corrected, self.rzero),
        })
    }
}

pub fn correction_factor(temperature: f32, humidity: f32) -> f32 {
    if temperature < 20.0 {
        CORA * temperature * temperature - CORB * temperature + CORC - (humidity - 33.0) * CORD
    } else {
        CORE * temperature + CORF * humidity + CORG
    }
}

/// CO2 concentration for a corrected resistance
pub fn ppm_for(resistance: f32, rzero: f32) -> f32 {
    PARA * (resistance / rzero).powf(-PARB)
}

/// Reference resistance that would make `resistance` read as atmospheric CO2
pub fn rzero_for(resistance: f32) -> f32 {
    resistance * (ATMOSPHERIC_CO2 / PARA).powf(1.0 / PARB)
}

impl GasSensor for Mq135 {
    fn read_gas(&mut self, climate: ClimateReading) -> BoxFuture<'_, Result<GasReading, SensorError>> {
        async move {
            let raw = timeout(SYSFS_TIMEOUT, tokio::fs::read_to_string(&self.raw_path))
                .await
                .map_err(|_| SensorError::Timeout("gas ADC"))??;
            let raw = raw
                .trim()
                .parse::<u32>()
                .map_err(|e| SensorError::InvalidData(format!("gas ADC '{}': {}", raw.trim(), e)))?;
            self.derive(raw, climate)
        }
        .boxed()
    }
}
