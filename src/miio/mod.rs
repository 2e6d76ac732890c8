pub mod client;

use std::future::Future;

use serde_json::Value;

use crate::error::DeviceError;

/// A controllable attribute, addressed by service and property index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub siid: u32,
    pub piid: u32,
}

impl Property {
    pub const POWER: Property = Property { siid: 2, piid: 1 };
    pub const MODE: Property = Property { siid: 2, piid: 4 };
    pub const SPEED: Property = Property { siid: 2, piid: 5 };
}

/// Remote property access on the purifier.
pub trait PurifierDevice {
    /// Read properties; values come back in request order.
    fn get_properties(
        &self,
        properties: &[Property],
    ) -> impl Future<Output = Result<Vec<Value>, DeviceError>> + Send;

    fn set_properties(
        &self,
        values: &[(Property, Value)],
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Power, mode and fan level as currently reported by the purifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub power: bool,
    pub mode: i64,
    pub speed: i64,
}

impl DeviceState {
    /// Query the live state. Never cached.
    pub async fn fetch<D: PurifierDevice>(device: &D) -> Result<Self, DeviceError> {
        let values = device
            .get_properties(&[Property::POWER, Property::MODE, Property::SPEED])
            .await?;
        let [power, mode, speed] = values.as_slice() else {
            return Err(DeviceError::Protocol(format!(
                "expected 3 property values, got {}",
                values.len()
            )));
        };
        Ok(Self {
            power: power
                .as_bool()
                .ok_or_else(|| DeviceError::Protocol(format!("power is not a bool: {power}")))?,
            mode: mode
                .as_i64()
                .ok_or_else(|| DeviceError::Protocol(format!("mode is not an integer: {mode}")))?,
            speed: speed
                .as_i64()
                .ok_or_else(|| DeviceError::Protocol(format!("speed is not an integer: {speed}")))?,
        })
    }
}
