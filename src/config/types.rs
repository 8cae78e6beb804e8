use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    CONNECT_DEADLINE, DEVICE_NAME_PREFIX, MAX_WIRE_ANGLE, MOTOR_COMMAND_CHARACTERISTIC, MOTOR_SERVICE,
    MOTOR_TELEMETRY_CHARACTERISTIC, REQUESTED_MTU, SCAN_DEADLINE, WRITE_DEADLINE,
};
use crate::device::session::SessionConfig;
use crate::device::transport::WriteMode;
use crate::device::types::AngleRange;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name_prefix: String,
    pub service_uuid: Uuid,
    pub telemetry_characteristic_uuid: Uuid,
    pub command_characteristic_uuid: Uuid,
    pub connect_timeout_ms: u64,
    pub requested_mtu: u16,
    pub write_deadline_ms: u64,
    pub write_with_response: bool,
    // null: scan until a matching device is found
    pub scan_timeout_ms: Option<u64>,
    pub angle_range: AngleRange,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "deviceNamePrefix",
                reason: "must not be empty".to_string(),
            });
        }

        let range = &self.angle_range;
        if !range.fits_wire() {
            return Err(ConfigError::Invalid {
                field: "angleRange",
                reason: format!("{} to {} is not a valid range (0 to {})", range.min, range.max, MAX_WIRE_ANGLE),
            });
        }

        for (field, value) in [
            ("connectTimeoutMs", Some(self.connect_timeout_ms)),
            ("writeDeadlineMs", Some(self.write_deadline_ms)),
            ("scanTimeoutMs", self.scan_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid { field, reason: "must be greater than 0".to_string() });
            }
        }

        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            device_name_prefix: self.device_name_prefix.clone(),
            service: self.service_uuid,
            telemetry_characteristic: self.telemetry_characteristic_uuid,
            command_characteristic: self.command_characteristic_uuid,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            requested_mtu: self.requested_mtu,
            write_deadline: Duration::from_millis(self.write_deadline_ms),
            write_mode: if self.write_with_response { WriteMode::WithResponse } else { WriteMode::WithoutResponse },
            scan_timeout: self.scan_timeout_ms.map(Duration::from_millis),
            angle_range: self.angle_range,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service_uuid: MOTOR_SERVICE,
            telemetry_characteristic_uuid: MOTOR_TELEMETRY_CHARACTERISTIC,
            command_characteristic_uuid: MOTOR_COMMAND_CHARACTERISTIC,
            connect_timeout_ms: CONNECT_DEADLINE,
            requested_mtu: REQUESTED_MTU,
            write_deadline_ms: WRITE_DEADLINE,
            write_with_response: false,
            scan_timeout_ms: Some(SCAN_DEADLINE),
            angle_range: AngleRange::default(),
        }
    }
}
