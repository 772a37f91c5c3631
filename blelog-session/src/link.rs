use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use blelog_domain::{device::DeviceId, gatt::GattError};

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Notifications from a connected device. The stream ends when the link
/// drops.
pub type NotificationStream = BoxStream<'static, Notification>;

/// Yields once each time the platform reports the device disconnected.
pub type DisconnectionStream = BoxStream<'static, ()>;

/// GATT client operations on one remote device.
#[async_trait]
pub trait Link: Send + Sync {
    fn device(&self) -> &DeviceId;
    async fn connect(&self) -> Result<(), GattError>;
    async fn discover_services(&self) -> Result<(), GattError>;
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), GattError>;
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), GattError>;
    async fn notifications(&self) -> Result<NotificationStream, GattError>;
    async fn disconnections(&self) -> Result<DisconnectionStream, GattError>;
    async fn disconnect(&self) -> Result<(), GattError>;
    async fn is_connected(&self) -> Result<bool, GattError>;
}

/// Resolves a device identifier into a [`Link`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn link(&self, device: &DeviceId) -> Result<Box<dyn Link>, GattError>;
}
