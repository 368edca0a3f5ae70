use crate::particulate::report::ParticulateReport;

/// Which timer drives a metric channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Fast,
    Slow,
}

/// Scalar metrics that get their own state and discovery topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    /// MQ135 corrected reference resistance
    GasReference,
    /// CO2 estimate derived from the MQ135
    GasConcentration,
    /// CO2 from the MH-Z19 NDIR sensor
    NdirCo2,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::GasReference,
        Metric::GasConcentration,
        Metric::NdirCo2,
    ];

    /// Topic object id, also the name used in the CHANNELS setting
    pub fn key(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::GasReference => "rzero",
            Metric::GasConcentration => "co2",
            Metric::NdirCo2 => "mhz19_co2",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
            Metric::GasReference => "RZero",
            Metric::GasConcentration => "CO2",
            Metric::NdirCo2 => "MHZ19 CO2",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Humidity => "%rh",
            Metric::GasReference => "z",
            Metric::GasConcentration | Metric::NdirCo2 => "ppm",
        }
    }

    /// Home Assistant device class, if one applies
    pub fn device_class(&self) -> Option<&'static str> {
        match self {
            Metric::Temperature => Some("temperature"),
            Metric::Humidity => Some("humidity"),
            Metric::GasReference => None,
            Metric::GasConcentration | Metric::NdirCo2 => Some("carbon_dioxide"),
        }
    }

    pub fn cadence(&self) -> Cadence {
        match self {
            Metric::NdirCo2 => Cadence::Slow,
            _ => Cadence::Fast,
        }
    }

    pub fn from_key(key: &str) -> Option<Metric> {
        Metric::ALL.iter().copied().find(|m| m.key() == key)
    }
}

/// One temperature/humidity sample; either value may be NaN on a bad read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature: f32,
    pub humidity: f32,
}

impl ClimateReading {
    pub fn is_numeric(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }
}

/// Values derived from the gas sensor, compensated for temperature and humidity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasReading {
    pub rzero: f32,
    pub ppm: f32,
}

/// Atmospheric-environment particulate concentrations in µg/m³
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticulateReading {
    pub pm1: f32,
    pub pm25: f32,
    pub pm10: f32,
}

/// Average of one metric channel at the end of a publish cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAverage {
    pub metric: Metric,
    pub value: f32,
    pub samples: usize,
}

/// Everything drained from the accumulators in one publish cycle
#[derive(Debug, Clone, PartialEq)]
pub struct PublishBatch {
    pub metrics: Vec<MetricAverage>,
    pub particulate: Option<ParticulateReport>,
    pub particulate_samples: usize,
}

impl PublishBatch {
    pub fn average_of(&self, metric: Metric) -> Option<&MetricAverage> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}
