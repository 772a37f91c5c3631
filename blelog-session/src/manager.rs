use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use blelog_domain::{
    device::DeviceId, known::KnownDevices, observation::Observation, session::SessionState,
};
use blelog_sinks::{
    catalog::Catalog,
    history::{ObservationSink, csv::CsvObservationSink},
};

use crate::{
    SessionConfig, SessionError, SessionEvent, SessionEventKind,
    actor::{Command, SessionHandle, spawn_session},
    link::Connector,
};

/// Registry of device sessions, plus the bookkeeping the front ends show:
/// latest state and value per device, known devices and their files.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    catalog: Catalog,
    sessions: HashMap<DeviceId, SessionHandle>,
    states: BTreeMap<DeviceId, SessionState>,
    latest: HashMap<DeviceId, Observation>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        catalog: Catalog,
    ) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            SessionManager {
                connector,
                config,
                catalog,
                sessions: HashMap::new(),
                states: BTreeMap::new(),
                latest: HashMap::new(),
                events,
            },
            rx,
        )
    }

    /// Starts connecting, creating the session on first use.
    pub async fn connect(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        if !self.sessions.contains_key(device) {
            let link = self.connector.link(device).await?;
            debug!("{device}: new session");
            let handle = spawn_session(link, self.config.clone(), self.events.clone());
            self.sessions.insert(device.clone(), handle);
            self.states.insert(device.clone(), SessionState::Discovered);
        }
        self.send(device, Command::Connect).await
    }

    pub async fn disconnect(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        self.send(device, Command::Disconnect).await
    }

    pub async fn subscribe(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        self.send(device, Command::Subscribe).await
    }

    pub async fn unsubscribe(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        self.send(device, Command::Unsubscribe).await
    }

    pub async fn toggle_notifications(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        self.send(device, Command::ToggleNotifications).await
    }

    /// Replaces the session's sink. `None` stops writing.
    pub async fn set_sink(
        &mut self,
        device: &DeviceId,
        sink: Option<Box<dyn ObservationSink>>,
    ) -> Result<(), SessionError> {
        self.send(device, Command::SetSink(sink)).await
    }

    async fn send(&self, device: &DeviceId, command: Command) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .get(device)
            .ok_or_else(|| SessionError::UnknownDevice(device.clone()))?;
        if handle.send(command).await {
            Ok(())
        } else {
            Err(SessionError::Closed(device.clone()))
        }
    }

    /// Opens the device's selected file for appending, if it has one.
    pub async fn open_selected_sink(
        &self,
        device: &DeviceId,
    ) -> Result<Option<Box<dyn ObservationSink>>, SessionError> {
        let Some(path) = self.catalog.selected_path(device) else {
            return Ok(None);
        };
        let sink = CsvObservationSink::open(&path)
            .await
            .map_err(|e| SessionError::Sink(format!("{}: {e}", path.display())))?;
        Ok(Some(Box::new(sink)))
    }

    /// Creates a new timestamped file for the device and selects it.
    pub async fn start_new_file(&mut self, device: &DeviceId) -> Result<String, SessionError> {
        self.catalog.create_device_folder(device).await?;
        let name = self.catalog.create_csv_file(device, &Local::now()).await?;
        self.catalog.select_file(device, Some(&name)).await?;
        Ok(name)
    }

    /// Stops the session and removes everything stored for the device.
    pub async fn delete(&mut self, device: &DeviceId) -> Result<(), SessionError> {
        if let Some(handle) = self.sessions.remove(device) {
            handle.shutdown().await;
        }
        self.states.remove(device);
        self.latest.remove(device);
        self.catalog.forget_device(device).await?;
        self.catalog.delete_device_folder(device).await?;
        info!("{device}: deleted");
        Ok(())
    }

    /// Folds an event from the sessions into the manager's view.
    pub async fn apply(&mut self, event: &SessionEvent) -> Result<(), SessionError> {
        match &event.kind {
            SessionEventKind::StateChanged(state) => {
                self.states.insert(event.device.clone(), state.clone());
                if *state == SessionState::Ready
                    && self.catalog.remember_device(&event.device).await?
                {
                    info!("{}: remembered", event.device);
                }
            }
            SessionEventKind::Observation(observation) => {
                self.latest
                    .insert(event.device.clone(), observation.clone());
            }
            SessionEventKind::SinkFailed(message) => {
                warn!("{}: sink failed: {message}", event.device);
            }
            SessionEventKind::Error(message) => {
                warn!("{}: {message}", event.device);
            }
        }
        Ok(())
    }

    pub fn state(&self, device: &DeviceId) -> Option<&SessionState> {
        self.states.get(device)
    }

    pub fn states(&self) -> &BTreeMap<DeviceId, SessionState> {
        &self.states
    }

    pub fn latest_value(&self, device: &DeviceId) -> Option<&Observation> {
        self.latest.get(device)
    }

    pub fn known_devices(&self) -> &KnownDevices {
        self.catalog.known_devices()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    /// Devices whose session sits between a connect request and a completed
    /// disconnect, including ones still connecting.
    pub fn active(&self) -> impl Iterator<Item = &DeviceId> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_active())
            .map(|(device, _)| device)
    }

    pub async fn shutdown(&mut self) {
        for (device, handle) in self.sessions.drain() {
            debug!("{device}: shutting down");
            handle.shutdown().await;
        }
    }
}
