/// Structured particulate report published to the hub
///
/// The hub keys off these field names, so the layout is fixed:
/// `{ "version": 1, "data": [ { "pm1": .., "pm25": .., "pm10": .. } ] }`
use serde::Serialize;

pub const REPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticulateReport {
    pub version: u32,
    pub data: Vec<ParticulateRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParticulateRecord {
    pub pm1: f32,
    pub pm25: f32,
    pub pm10: f32,
}

impl ParticulateReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Map three averaged concentrations onto the report layout
pub fn generate_report(pm1: f32, pm25: f32, pm10: f32) -> ParticulateReport {
    ParticulateReport {
        version: REPORT_VERSION,
        data: vec![ParticulateRecord { pm1, pm25, pm10 }],
    }
}
