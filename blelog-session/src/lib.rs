pub mod actor;
pub mod btle;
pub mod link;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use uuid::Uuid;

use blelog_domain::{
    device::DeviceId,
    gatt::{GattError, SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID},
    observation::Observation,
    retry::RetryPolicy,
    session::SessionState,
};
use blelog_sinks::catalog::CatalogError;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Limit for a single connect or service discovery step.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            service: SENSOR_SERVICE_UUID,
            characteristic: SENSOR_CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("no session for device {0}")]
    UnknownDevice(DeviceId),
    #[error("session for device {0} has stopped")]
    Closed(DeviceId),
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("sink error: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub device: DeviceId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    StateChanged(SessionState),
    Observation(Observation),
    /// Writing to the sink failed; the session keeps streaming.
    SinkFailed(String),
    /// A command could not be carried out.
    Error(String),
}
