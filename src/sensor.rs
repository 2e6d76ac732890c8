//! Parsing of the air monitor's `event/post` payload.
//!
//! The monitor reports a flat numeric array under `body`. Positions are fixed by
//! the device firmware:
//!
//! | index | field                     | scale  |
//! |-------|---------------------------|--------|
//! | 0     | air quality index         |        |
//! | 8     | PM2.5 (µg/m³)             |        |
//! | 9     | PM10 (µg/m³)              |        |
//! | 10    | formaldehyde (mg/m³)      | ÷ 1000 |
//! | 11    | CO2 (ppm)                 |        |
//! | 12    | temperature (°C)          | ÷ 10   |
//! | 13    | relative humidity (%)     | ÷ 10   |

use chrono::DateTime;
use serde::Deserialize;
use tracing::info;

use crate::error::PayloadError;

const AIR_QUALITY: usize = 0;
const PM25: usize = 8;
const PM10: usize = 9;
const HCHO: usize = 10;
const CO2: usize = 11;
const TEMPERATURE: usize = 12;
const HUMIDITY: usize = 13;

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    t: Option<serde_json::Value>,
    #[serde(default)]
    body: Option<Vec<serde_json::Value>>,
}

/// One sensor report with the decision inputs already extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReport {
    /// Epoch seconds as reported by the monitor, possibly fractional.
    pub timestamp: Option<f64>,
    pub co2: i64,
    pub pm25: i64,
    body: Vec<Option<f64>>,
}

impl SensorReport {
    fn field(&self, index: usize) -> Option<f64> {
        self.body.get(index).copied().flatten()
    }

    /// Log every known field, scaled for humans.
    pub fn log(&self) {
        let time = self
            .timestamp
            .and_then(|t| {
                let nanos = (t.fract() * 1e9) as u32;
                DateTime::from_timestamp(t.trunc() as i64, nanos)
            })
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            time = %time,
            air_quality = ?self.field(AIR_QUALITY),
            pm25 = self.pm25,
            pm10 = ?self.field(PM10),
            hcho = ?self.field(HCHO).map(|v| v / 1000.0),
            co2 = self.co2,
            temperature = ?self.field(TEMPERATURE).map(|v| v / 10.0),
            humidity = ?self.field(HUMIDITY).map(|v| v / 10.0),
            "Sensor report"
        );
    }
}

/// Parse an inbound payload.
///
/// Returns `Ok(None)` when the message is valid JSON without a `body` array,
/// which the monitor sends for acknowledgements and is not an error.
pub fn parse_report(payload: &[u8]) -> Result<Option<SensorReport>, PayloadError> {
    let text = std::str::from_utf8(payload)?;
    let raw: RawReport = serde_json::from_str(text)?;
    let Some(body) = raw.body else {
        return Ok(None);
    };

    let body: Vec<Option<f64>> = body.iter().map(serde_json::Value::as_f64).collect();
    let co2 = reading(&body, CO2, "co2")?;
    let pm25 = reading(&body, PM25, "pm25")?;

    Ok(Some(SensorReport {
        // only logged, so an odd `t` must not cost the reading
        timestamp: raw.t.as_ref().and_then(serde_json::Value::as_f64),
        co2,
        pm25,
        body,
    }))
}

fn reading(body: &[Option<f64>], index: usize, name: &str) -> Result<i64, PayloadError> {
    match body.get(index) {
        None => Err(PayloadError::MissingField(format!("body[{index}] ({name})"))),
        Some(None) => Err(PayloadError::InvalidValue {
            field: format!("body[{index}] ({name})"),
            message: "not a number".into(),
        }),
        // Truncate like the monitor's own app does.
        Some(Some(v)) => Ok(v.trunc() as i64),
    }
}
