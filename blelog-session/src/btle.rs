use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, future};
use tokio::time::{self, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};

use blelog_domain::{device::DeviceId, gatt::GattError};

use crate::link::{Connector, DisconnectionStream, Link, Notification, NotificationStream};

const LOOKUP_POLL: Duration = Duration::from_millis(250);

/// Maps platform errors onto the transient/terminal split used for retries.
pub fn classify(error: btleplug::Error) -> GattError {
    use btleplug::Error::*;
    match error {
        PermissionDenied => GattError::PermissionDenied,
        DeviceNotFound => GattError::DeviceGone,
        NotConnected => GattError::NotConnected,
        NotSupported(what) => GattError::NotSupported(what),
        TimedOut(after) => GattError::TimedOut(after),
        NoSuchCharacteristic => GattError::NotSupported("no such characteristic".to_string()),
        other => classify_message(other.to_string()),
    }
}

fn classify_message(message: String) -> GattError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("in progress") || lower.contains("busy") {
        GattError::Busy
    } else if lower.contains("congest") {
        GattError::Congested
    } else {
        GattError::Transport(message)
    }
}

pub struct BtleLink {
    device: DeviceId,
    service: Uuid,
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleLink {
    pub fn new(device: DeviceId, service: Uuid, adapter: Adapter, peripheral: Peripheral) -> Self {
        BtleLink {
            device,
            service,
            adapter,
            peripheral,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, GattError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(GattError::CharacteristicMissing(uuid))
    }
}

#[async_trait]
impl Link for BtleLink {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn connect(&self) -> Result<(), GattError> {
        self.peripheral.connect().await.map_err(classify)
    }

    async fn discover_services(&self) -> Result<(), GattError> {
        self.peripheral.discover_services().await.map_err(classify)?;
        let services = self.peripheral.services();
        debug!("{} exposes {} services", self.device, services.len());
        if services.iter().any(|s| s.uuid == self.service) {
            Ok(())
        } else {
            Err(GattError::ServiceMissing(self.service))
        }
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), GattError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(classify)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), GattError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(classify)
    }

    async fn notifications(&self) -> Result<NotificationStream, GattError> {
        let stream = self.peripheral.notifications().await.map_err(classify)?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    /// The peripheral's notification stream does not end reliably when the
    /// link drops, so disconnects are taken from the adapter's events.
    async fn disconnections(&self) -> Result<DisconnectionStream, GattError> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await.map_err(classify)?;
        Ok(events
            .filter_map(move |event| {
                future::ready(match event {
                    CentralEvent::DeviceDisconnected(gone) if gone == id => Some(()),
                    _ => None,
                })
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<(), GattError> {
        self.peripheral.disconnect().await.map_err(classify)
    }

    async fn is_connected(&self) -> Result<bool, GattError> {
        self.peripheral.is_connected().await.map_err(classify)
    }
}

/// Finds peripherals on a local adapter, scanning briefly for devices the
/// adapter has not seen yet.
pub struct BtleConnector {
    adapter: Adapter,
    service: Uuid,
    lookup_timeout: Duration,
}

impl BtleConnector {
    pub fn new(adapter: Adapter, service: Uuid, lookup_timeout: Duration) -> Self {
        BtleConnector {
            adapter,
            service,
            lookup_timeout,
        }
    }

    fn wrap(&self, device: &DeviceId, peripheral: Peripheral) -> BtleLink {
        BtleLink::new(device.clone(), self.service, self.adapter.clone(), peripheral)
    }

    async fn find(&self, device: &DeviceId) -> Result<Option<Peripheral>, GattError> {
        for peripheral in self.adapter.peripherals().await.map_err(classify)? {
            if DeviceId::new(peripheral.address().to_string()) == *device {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for BtleConnector {
    async fn link(&self, device: &DeviceId) -> Result<Box<dyn Link>, GattError> {
        if let Some(peripheral) = self.find(device).await? {
            return Ok(Box::new(self.wrap(device, peripheral)));
        }

        trace!("{device} not cached by adapter, scanning");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(classify)?;
        let deadline = Instant::now() + self.lookup_timeout;
        let found = loop {
            match self.find(device).await {
                Ok(Some(peripheral)) => break Ok(peripheral),
                Ok(None) if Instant::now() < deadline => time::sleep(LOOKUP_POLL).await,
                Ok(None) => break Err(GattError::DeviceGone),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stopping lookup scan failed: {e}");
        }
        Ok(Box::new(self.wrap(device, found?)))
    }
}
