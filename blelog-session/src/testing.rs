//! Scripted stand-ins for the BLE stack.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    stream,
};
use uuid::Uuid;

use blelog_domain::{
    device::DeviceId,
    gatt::{GattError, SENSOR_CHARACTERISTIC_UUID},
    observation::Observation,
};
use blelog_sinks::history::{ObservationSink, SinkError};

use crate::link::{Connector, DisconnectionStream, Link, Notification, NotificationStream};

#[derive(Clone, Debug)]
pub enum Step {
    Ok,
    Fail(GattError),
    Hang,
}

#[derive(Default)]
pub struct MockState {
    pub connects: VecDeque<Step>,
    pub discoveries: VecDeque<Step>,
    pub subscribes: VecDeque<Step>,
    pub connect_calls: u32,
    pub disconnect_calls: u32,
    pub subscribed: bool,
    notifications: Option<UnboundedReceiver<Notification>>,
    disconnections: Option<UnboundedReceiver<()>>,
}

pub struct MockLink {
    device: DeviceId,
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle for a [`MockLink`].
#[derive(Clone)]
pub struct MockControl {
    pub state: Arc<Mutex<MockState>>,
    sender: UnboundedSender<Notification>,
    dropped: UnboundedSender<()>,
}

impl MockControl {
    pub fn script_connects(&self, steps: Vec<Step>) {
        self.state.lock().unwrap().connects = steps.into();
    }

    pub fn script_discoveries(&self, steps: Vec<Step>) {
        self.state.lock().unwrap().discoveries = steps.into();
    }

    pub fn script_subscribes(&self, steps: Vec<Step>) {
        self.state.lock().unwrap().subscribes = steps.into();
    }

    pub fn send_raw(&self, value: Vec<u8>) {
        self.sender
            .unbounded_send(Notification {
                uuid: SENSOR_CHARACTERISTIC_UUID,
                value,
            })
            .unwrap();
    }

    pub fn send_sample(&self, value: i32) {
        self.send_raw(value.to_le_bytes().to_vec());
    }

    pub fn send_other(&self, uuid: Uuid, value: i32) {
        self.sender
            .unbounded_send(Notification {
                uuid,
                value: value.to_le_bytes().to_vec(),
            })
            .unwrap();
    }

    /// Reports the device as disconnected by the platform.
    pub fn drop_link(&self) {
        self.dropped.unbounded_send(()).unwrap();
    }

    pub fn end_notifications(&self) {
        self.sender.close_channel();
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().unwrap().disconnect_calls
    }
}

impl MockLink {
    pub fn new(device: DeviceId) -> (MockLink, MockControl) {
        let (sender, receiver) = unbounded();
        let (dropped, disconnections) = unbounded();
        let state = Arc::new(Mutex::new(MockState {
            notifications: Some(receiver),
            disconnections: Some(disconnections),
            ..MockState::default()
        }));
        (
            MockLink {
                device,
                state: state.clone(),
            },
            MockControl {
                state,
                sender,
                dropped,
            },
        )
    }

    async fn play(&self, pick: fn(&mut MockState) -> &mut VecDeque<Step>) -> Result<(), GattError> {
        let step = pick(&mut self.state.lock().unwrap()).pop_front();
        match step.unwrap_or(Step::Ok) {
            Step::Ok => Ok(()),
            Step::Fail(e) => Err(e),
            Step::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Link for MockLink {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn connect(&self) -> Result<(), GattError> {
        self.state.lock().unwrap().connect_calls += 1;
        self.play(|s| &mut s.connects).await
    }

    async fn discover_services(&self) -> Result<(), GattError> {
        self.play(|s| &mut s.discoveries).await
    }

    async fn subscribe(&self, _: Uuid) -> Result<(), GattError> {
        self.play(|s| &mut s.subscribes).await?;
        self.state.lock().unwrap().subscribed = true;
        Ok(())
    }

    async fn unsubscribe(&self, _: Uuid) -> Result<(), GattError> {
        self.state.lock().unwrap().subscribed = false;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, GattError> {
        let receiver = self.state.lock().unwrap().notifications.take();
        Ok(match receiver {
            Some(receiver) => receiver.boxed(),
            None => stream::pending().boxed(),
        })
    }

    async fn disconnections(&self) -> Result<DisconnectionStream, GattError> {
        let receiver = self.state.lock().unwrap().disconnections.take();
        Ok(match receiver {
            Some(receiver) => receiver.boxed(),
            None => stream::pending().boxed(),
        })
    }

    async fn disconnect(&self) -> Result<(), GattError> {
        let mut state = self.state.lock().unwrap();
        state.disconnect_calls += 1;
        state.subscribed = false;
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, GattError> {
        Ok(true)
    }
}

#[derive(Default)]
pub struct MockConnector {
    links: Mutex<HashMap<DeviceId, MockLink>>,
}

impl MockConnector {
    pub fn with_device(self, device: &DeviceId) -> (Self, MockControl) {
        let (link, control) = MockLink::new(device.clone());
        self.links.lock().unwrap().insert(device.clone(), link);
        (self, control)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn link(&self, device: &DeviceId) -> Result<Box<dyn Link>, GattError> {
        match self.links.lock().unwrap().remove(device) {
            Some(link) => Ok(Box::new(link)),
            None => Err(GattError::DeviceGone),
        }
    }
}

/// What a [`RecordingSink`] was given.
#[derive(Default)]
pub struct Recorded {
    pub saved: Mutex<Vec<Observation>>,
    pub closed: AtomicBool,
}

impl Recorded {
    pub fn values(&self) -> Vec<i32> {
        self.saved.lock().unwrap().iter().map(|o| o.value).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sink recording what it is given, optionally failing every save.
pub struct RecordingSink {
    recorded: Arc<Recorded>,
    fail: bool,
}

impl RecordingSink {
    pub fn new(fail: bool) -> (Self, Arc<Recorded>) {
        let recorded = Arc::new(Recorded::default());
        (
            RecordingSink {
                recorded: recorded.clone(),
                fail,
            },
            recorded,
        )
    }
}

#[async_trait]
impl ObservationSink for RecordingSink {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
        if self.fail {
            return Err("disk full".into());
        }
        self.recorded
            .saved
            .lock()
            .unwrap()
            .extend_from_slice(observations);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SinkError> {
        self.recorded.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
