use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{device::DeviceId, discover::DiscoveryEvent};

#[derive(Serialize, PartialEq, Debug, Clone)]
pub struct DeviceState {
    pub date_time: DateTime<Utc>,
    pub device: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
}

impl DeviceState {
    #[must_use]
    pub fn new(
        date_time: DateTime<Utc>,
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
    ) -> DeviceState {
        DeviceState {
            date_time,
            device,
            name,
            rssi,
        }
    }

    #[must_use]
    pub fn from_event(event: &DiscoveryEvent) -> DeviceState {
        DeviceState {
            date_time: event.date_time,
            device: event.device.clone(),
            name: event.name.clone(),
            rssi: event.rssi,
        }
    }

    /// Later sightings refresh time and signal; a name, once seen, is kept
    /// even if a later advertisement omits it.
    pub fn update(&mut self, event: &DiscoveryEvent) {
        self.date_time = event.date_time;
        self.rssi = event.rssi;
        if event.name.is_some() {
            self.name = event.name.clone();
        }
    }
}
