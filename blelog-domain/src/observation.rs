use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// One sample received from a device's sensor characteristic.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Observation {
    pub date_time: DateTime<Utc>,
    pub device: DeviceId,
    pub value: i32,
}

impl Observation {
    #[must_use]
    pub fn new(date_time: DateTime<Utc>, device: DeviceId, value: i32) -> Observation {
        Observation {
            date_time,
            device,
            value,
        }
    }
}

/// Sensor payloads carry a signed 32-bit little-endian integer at offset 0.
pub fn decode_sample(value: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}
