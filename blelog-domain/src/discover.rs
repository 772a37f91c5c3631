use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct DiscoveryEvent {
    pub date_time: DateTime<Utc>,
    pub device: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
}

impl DiscoveryEvent {
    #[must_use]
    pub fn new(
        date_time: DateTime<Utc>,
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
    ) -> DiscoveryEvent {
        DiscoveryEvent {
            date_time,
            device,
            name,
            rssi,
        }
    }
}
