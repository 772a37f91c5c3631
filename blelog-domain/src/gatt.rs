//! GATT identifiers of the sensor profile and the failures a link can report.

use std::time::Duration;

use uuid::Uuid;

/// Service exposed by the sensor firmware.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Characteristic notifying one `i32` sample per update.
pub const SENSOR_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GattError {
    #[error("device busy")]
    Busy,
    #[error("connection congested")]
    Congested,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("device gone")]
    DeviceGone,
    #[error("permission denied")]
    PermissionDenied,
    #[error("service {0} not found")]
    ServiceMissing(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl GattError {
    /// Whether the operation is worth trying again.
    pub fn is_transient(&self) -> bool {
        use GattError::*;
        match self {
            Busy | Congested | TimedOut(_) | NotConnected | Transport(_) => true,
            DeviceGone
            | PermissionDenied
            | ServiceMissing(_)
            | CharacteristicMissing(_)
            | NotSupported(_) => false,
        }
    }
}
