use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Devices that have been connected at least once.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct KnownDevices(BTreeSet<DeviceId>);

impl KnownDevices {
    /// Returns true if the device was not known before.
    pub fn insert(&mut self, device: DeviceId) -> bool {
        self.0.insert(device)
    }

    pub fn remove(&mut self, device: &DeviceId) -> bool {
        self.0.remove(device)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.0.contains(device)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
