use std::collections::HashMap;

use crate::{
    device::DeviceId, device_state::DeviceState, discover::DiscoveryEvent, snapshot::Snapshot,
};

/// Registry of devices seen while scanning.
#[derive(Default)]
pub struct State {
    state: HashMap<DeviceId, DeviceState>,
}

impl State {
    pub fn snapshot(&self) -> Snapshot {
        let mut s: Vec<DeviceState> = self.state.values().cloned().collect();
        s.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.device.cmp(&b.device)));
        Snapshot(s)
    }

    pub fn discover(&mut self, events: &[DiscoveryEvent]) {
        for event in events {
            self.state
                .entry(event.device.clone())
                .and_modify(|s: &mut DeviceState| s.update(event))
                .or_insert_with(|| DeviceState::from_event(event));
        }
    }

    pub fn forget(&mut self, device: &DeviceId) -> Option<DeviceState> {
        self.state.remove(device)
    }

    pub fn clear(&mut self) {
        self.state.clear();
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
