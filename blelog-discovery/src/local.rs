use chrono::Utc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, trace};
use uuid::Uuid;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};

use blelog_domain::device::DeviceId;
use blelog_domain::discover::DiscoveryEvent;

use crate::{ScanError, Scanner};
use async_trait::async_trait;

pub struct LocalScanner {
    adapter: Adapter,
    window: Duration,
    services: Vec<Uuid>,
}

impl LocalScanner {
    pub async fn new(window: Duration) -> Result<LocalScanner, ScanError> {
        let adapter = first_adapter().await?;
        Ok(LocalScanner {
            adapter,
            window,
            services: vec![],
        })
    }

    /// Only report peripherals advertising one of `services`.
    #[must_use]
    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Peripherals heard with an RSSI since the scan started.
    async fn collect_heard(&self) -> Result<Vec<DiscoveryEvent>, ScanError> {
        let peripherals = self.adapter.peripherals().await?;
        let mut events = vec![];
        let current_time = Utc::now();
        for peripheral in &peripherals {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if let Some(rssi) = properties.rssi {
                events.push(DiscoveryEvent::new(
                    current_time,
                    DeviceId::new(properties.address.to_string()),
                    properties.local_name.clone(),
                    rssi,
                ));
            }
        }
        Ok(events)
    }
}

pub async fn first_adapter() -> Result<Adapter, ScanError> {
    let manager = Manager::new().await?;
    let mut adapter_list = manager.adapters().await?;
    if adapter_list.is_empty() {
        return Err(ScanError::NoAdapter);
    }
    Ok(adapter_list.remove(0))
}

#[async_trait]
impl Scanner for LocalScanner {
    async fn scan(&mut self) -> Result<Vec<DiscoveryEvent>, ScanError> {
        trace!("[LocalScanner] Starting scan");
        self.adapter
            .start_scan(ScanFilter {
                services: self.services.clone(),
            })
            .await?;
        time::sleep(self.window).await;
        let heard = self.collect_heard().await;
        self.adapter.stop_scan().await?;
        let events = heard?;
        debug!("[LocalScanner] Scan heard {} devices", events.len());
        Ok(events)
    }
}
