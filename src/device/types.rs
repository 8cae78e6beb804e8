use std::fmt;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Transport level identifier of a peripheral (a MAC address, or a platform UUID on macOS).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        DeviceIdentity {
            id: DeviceId(id.into()),
            name: name.map(str::to_string),
        }
    }

    pub fn name_starts_with(&self, prefix: &str) -> bool {
        self.name.as_deref().map_or(false, |name| name.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            SessionState::Idle => "Idle",
            SessionState::Scanning => "Scanning…",
            SessionState::Connecting => "Connecting…",
            SessionState::Connected => "Connected",
            SessionState::Disconnected => "Disconnected",
            SessionState::Error => "Error",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDeviceInfo {
    pub id: DeviceId,
    pub name: Option<String>,
    pub mtu: u16,
    pub subscribed: IndexSet<Uuid>,
}

/// A single servo reading. The angle is kept in tenths of a degree, as it is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoTelemetryRecord {
    pub servo_id: u8,
    pub angle_tenths: u16,
}

impl ServoTelemetryRecord {
    pub fn angle(&self) -> f32 {
        f32::from(self.angle_tenths) / 10.0
    }
}

/// A commanded angle (degrees) for one servo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoTarget {
    pub servo_id: u8,
    pub angle: f32,
}

impl ServoTarget {
    pub fn new(servo_id: u8, angle: f32) -> Self {
        ServoTarget { servo_id, angle }
    }
}

/// Inclusive range (degrees) the servos accept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRange {
    pub min: f32,
    pub max: f32,
}

impl AngleRange {
    /// Never panics, an inverted range yields `max`.
    pub fn clamp(&self, angle: f32) -> f32 {
        if angle.is_nan() {
            return self.min;
        }
        angle.max(self.min).min(self.max)
    }

    /// True when the range is ordered and every angle in it fits in an angle group.
    pub fn fits_wire(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min >= 0.0
            && self.min <= self.max
            && self.max <= crate::device::constants::MAX_WIRE_ANGLE
    }
}

impl Default for AngleRange {
    fn default() -> Self {
        AngleRange {
            min: crate::device::constants::MIN_ANGLE,
            max: crate::device::constants::MAX_ANGLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub device: Option<ConnectedDeviceInfo>,
    pub telemetry: Vec<ServoTelemetryRecord>,
    pub last_error: Option<SessionError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot {
            state: SessionState::Idle,
            device: None,
            telemetry: Vec::new(),
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::device::constants::MAX_WIRE_ANGLE;
    use super::*;

    #[test]
    fn clamp_with_inverted_range_does_not_panic() {
        let inverted = AngleRange { min: 90.0, max: 10.0 };

        assert_eq!(inverted.clamp(50.0), 10.0);
        assert_eq!(inverted.clamp(f32::NAN), 90.0);
        assert!(!inverted.fits_wire());
    }

    #[test]
    fn wire_range_limits() {
        assert!(AngleRange::default().fits_wire());
        assert!(AngleRange { min: 0.0, max: MAX_WIRE_ANGLE }.fits_wire());
        assert!(!AngleRange { min: -90.0, max: 90.0 }.fits_wire());
        assert!(!AngleRange { min: 0.0, max: 10000.0 }.fits_wire());
        assert!(!AngleRange { min: 0.0, max: f32::INFINITY }.fits_wire());
    }
}
