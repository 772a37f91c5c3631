//! One task per device.
//!
//! The actor owns the device's [`Link`], its [`SessionState`] and its sink.
//! Commands arrive on an `mpsc` channel, notifications and disconnects on
//! the link's streams; all are handled inside the task, so every transition
//! of a device is serialised without locks.

use std::{future::Future, time::Duration};

use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, error, info, trace, warn};

use blelog_domain::{
    device::DeviceId,
    gatt::GattError,
    observation::{Observation, decode_sample},
    session::{SessionInput, SessionState},
};
use blelog_sinks::history::ObservationSink;

use crate::{
    SessionConfig, SessionEvent, SessionEventKind,
    link::{DisconnectionStream, Link, Notification, NotificationStream},
};

const COMMAND_CAPACITY: usize = 32;

pub enum Command {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    ToggleNotifications,
    SetSink(Option<Box<dyn ObservationSink>>),
    Shutdown,
}

pub struct SessionHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Asks the actor to disconnect and close its sink, then waits for it.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("session task failed: {e}");
        }
    }
}

pub fn spawn_session(
    link: Box<dyn Link>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let device = link.device().clone();
    let actor = SessionActor {
        link,
        config,
        state: SessionState::Discovered,
        notifications: None,
        disconnections: None,
        mailbox: Mailbox {
            device,
            commands: rx,
            events,
            sink: None,
            wants_subscription: false,
        },
    };
    SessionHandle {
        commands: tx,
        task: tokio::spawn(actor.run()),
    }
}

enum Flow {
    Continue,
    Stop,
}

/// A command that cut a link operation short.
enum Interrupt {
    Disconnect,
    Shutdown,
}

enum Interruptible<T> {
    Completed(T),
    Interrupted(Interrupt),
}

/// The parts of the actor that stay usable while a link operation is in
/// flight.
struct Mailbox {
    device: DeviceId,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    sink: Option<Box<dyn ObservationSink>>,
    wants_subscription: bool,
}

impl Mailbox {
    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            device: self.device.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            trace!("{}: no event listener", self.device);
        }
    }

    async fn set_sink(&mut self, sink: Option<Box<dyn ObservationSink>>) {
        if let Some(previous) = std::mem::replace(&mut self.sink, sink)
            && let Err(e) = previous.close().await
        {
            warn!("{}: closing previous sink failed: {e}", self.device);
            self.emit(SessionEventKind::SinkFailed(e.to_string()));
        }
    }

    async fn save(&mut self, observation: Observation) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.save(std::slice::from_ref(&observation)).await {
            warn!("{}: writing observation failed: {e}", self.device);
            self.emit(SessionEventKind::SinkFailed(e.to_string()));
        }
    }

    /// Drives `operation` while serving the commands that do not need the
    /// link. A disconnect or shutdown drops `operation`, cancelling it.
    async fn serve_while<F: Future>(&mut self, operation: F) -> Interruptible<F::Output> {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                output = &mut operation => return Interruptible::Completed(output),
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        return Interruptible::Interrupted(Interrupt::Shutdown);
                    }
                    Some(Command::Disconnect) => {
                        return Interruptible::Interrupted(Interrupt::Disconnect);
                    }
                    Some(Command::SetSink(sink)) => self.set_sink(sink).await,
                    Some(Command::Subscribe) => self.wants_subscription = true,
                    Some(Command::Unsubscribe) => self.wants_subscription = false,
                    Some(Command::ToggleNotifications) => {
                        self.wants_subscription = !self.wants_subscription;
                    }
                    Some(Command::Connect) => debug!("{}: busy, connect ignored", self.device),
                },
            }
        }
    }

    /// [`Mailbox::serve_while`] with a time limit; running out of time is a
    /// [`GattError::TimedOut`].
    async fn run_bounded<T, F>(
        &mut self,
        limit: Duration,
        operation: F,
    ) -> Interruptible<Result<T, GattError>>
    where
        F: Future<Output = Result<T, GattError>>,
    {
        match self.serve_while(time::timeout(limit, operation)).await {
            Interruptible::Completed(Ok(result)) => Interruptible::Completed(result),
            Interruptible::Completed(Err(_)) => {
                Interruptible::Completed(Err(GattError::TimedOut(limit)))
            }
            Interruptible::Interrupted(interrupt) => Interruptible::Interrupted(interrupt),
        }
    }
}

struct SessionActor {
    link: Box<dyn Link>,
    config: SessionConfig,
    state: SessionState,
    notifications: Option<NotificationStream>,
    disconnections: Option<DisconnectionStream>,
    mailbox: Mailbox,
}

async fn next_item<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self) {
        debug!("{}: session started", self.mailbox.device);
        loop {
            tokio::select! {
                command = self.mailbox.commands.recv() => {
                    let Some(command) = command else { break };
                    if let Flow::Stop = self.handle(command).await {
                        break;
                    }
                }
                notification = next_item(&mut self.notifications) => match notification {
                    Some(n) => self.on_notification(n).await,
                    None => self.on_link_lost(),
                },
                dropped = next_item(&mut self.disconnections) => match dropped {
                    Some(()) => self.on_link_lost(),
                    None => {
                        debug!("{}: disconnect watch ended", self.mailbox.device);
                        self.disconnections = None;
                    }
                },
            }
        }
        self.disconnect().await;
        self.mailbox.set_sink(None).await;
        debug!("{}: session stopped", self.mailbox.device);
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => {
                self.disconnect().await;
                Flow::Continue
            }
            Command::Subscribe => self.subscribe().await,
            Command::Unsubscribe => self.unsubscribe().await,
            Command::ToggleNotifications => {
                if self.mailbox.wants_subscription || self.state.is_subscribed() {
                    self.unsubscribe().await
                } else {
                    self.subscribe().await
                }
            }
            Command::SetSink(sink) => {
                self.mailbox.set_sink(sink).await;
                Flow::Continue
            }
            Command::Shutdown => Flow::Stop,
        }
    }

    /// Acts on a command that arrived while a link operation was running.
    async fn interrupted(&mut self, interrupt: Interrupt) -> Flow {
        match interrupt {
            Interrupt::Disconnect => {
                self.disconnect().await;
                Flow::Continue
            }
            Interrupt::Shutdown => Flow::Stop,
        }
    }

    fn transition(&mut self, input: SessionInput) -> bool {
        match self.state.next(input) {
            Ok(next) => {
                info!("{}: {} -> {}", self.mailbox.device, self.state, next);
                self.state = next.clone();
                self.mailbox.emit(SessionEventKind::StateChanged(next));
                true
            }
            Err(e) => {
                warn!("{}: {e}", self.mailbox.device);
                false
            }
        }
    }

    fn report(&self, message: String) {
        warn!("{}: {message}", self.mailbox.device);
        self.mailbox.emit(SessionEventKind::Error(message));
    }

    async fn connect(&mut self) -> Flow {
        if !self.transition(SessionInput::ConnectRequested) {
            self.report(format!("cannot connect while {}", self.state));
            return Flow::Continue;
        }
        let mut attempt = 1;
        loop {
            let error = match self.attempt().await {
                Interruptible::Completed(Ok(())) => break,
                Interruptible::Completed(Err(e)) => e,
                Interruptible::Interrupted(interrupt) => return self.interrupted(interrupt).await,
            };
            if let Err(e) = self.release_link().await {
                debug!("{}: cleanup after failed attempt: {e}", self.mailbox.device);
            }
            if !error.is_transient() {
                self.give_up(error.to_string());
                return Flow::Continue;
            }
            let Some(delay) = self.config.retry.delay_after(attempt) else {
                self.give_up(format!("gave up after {attempt} attempts: {error}"));
                return Flow::Continue;
            };
            warn!(
                "{}: attempt {attempt} failed: {error}, retrying in {delay:?}",
                self.mailbox.device
            );
            if let Interruptible::Interrupted(interrupt) =
                self.mailbox.serve_while(time::sleep(delay)).await
            {
                return self.interrupted(interrupt).await;
            }
            attempt += 1;
            self.transition(SessionInput::Retry { attempt });
        }

        if let Flow::Stop = self.watch_link().await {
            return Flow::Stop;
        }
        if self.mailbox.wants_subscription {
            return self.subscribe().await;
        }
        Flow::Continue
    }

    /// One connect plus service discovery, each bounded by the timeout.
    async fn attempt(&mut self) -> Interruptible<Result<(), GattError>> {
        let limit = self.config.connect_timeout;
        match self.mailbox.run_bounded(limit, self.link.connect()).await {
            Interruptible::Completed(Ok(())) => {}
            other => return other,
        }
        self.transition(SessionInput::Connected);

        match self.mailbox.run_bounded(limit, self.link.discover_services()).await {
            Interruptible::Completed(Ok(())) => {}
            other => return other,
        }
        self.transition(SessionInput::ServicesDiscovered);
        Interruptible::Completed(Ok(()))
    }

    /// Starts listening for the platform's disconnect reports.
    async fn watch_link(&mut self) -> Flow {
        let limit = self.config.connect_timeout;
        match self.mailbox.run_bounded(limit, self.link.disconnections()).await {
            Interruptible::Completed(Ok(stream)) => self.disconnections = Some(stream),
            Interruptible::Completed(Err(e)) => {
                warn!("{}: cannot watch for link loss: {e}", self.mailbox.device);
            }
            Interruptible::Interrupted(interrupt) => return self.interrupted(interrupt).await,
        }
        Flow::Continue
    }

    fn give_up(&mut self, reason: String) {
        error!("{}: connection failed: {reason}", self.mailbox.device);
        self.mailbox.wants_subscription = false;
        self.transition(SessionInput::GaveUp { reason });
    }

    async fn release_link(&mut self) -> Result<(), GattError> {
        let limit = self.config.connect_timeout;
        time::timeout(limit, self.link.disconnect())
            .await
            .unwrap_or(Err(GattError::TimedOut(limit)))
    }

    async fn disconnect(&mut self) {
        self.mailbox.wants_subscription = false;
        if !self.state.is_active() {
            return;
        }
        self.transition(SessionInput::DisconnectRequested);
        self.drop_streams();
        if let Err(e) = self.release_link().await {
            warn!("{}: disconnect failed: {e}", self.mailbox.device);
        }
        self.transition(SessionInput::Closed);
    }

    /// Subscribes now if the link is ready, otherwise once it becomes ready.
    async fn subscribe(&mut self) -> Flow {
        self.mailbox.wants_subscription = true;
        if self.state != SessionState::Ready {
            debug!("{}: subscription deferred while {}", self.mailbox.device, self.state);
            return Flow::Continue;
        }
        let limit = self.config.connect_timeout;
        let characteristic = self.config.characteristic;
        let mut attempt = 1;
        let subscribed = loop {
            let error = match self
                .mailbox
                .run_bounded(limit, self.link.subscribe(characteristic))
                .await
            {
                Interruptible::Completed(Ok(())) => break Ok(()),
                Interruptible::Completed(Err(e)) => e,
                Interruptible::Interrupted(interrupt) => return self.interrupted(interrupt).await,
            };
            if !error.is_transient() || error == GattError::NotConnected {
                break Err(error);
            }
            let Some(delay) = self.config.retry.delay_after(attempt) else {
                break Err(error);
            };
            debug!("{}: subscribe failed: {error}, retrying", self.mailbox.device);
            if let Interruptible::Interrupted(interrupt) =
                self.mailbox.serve_while(time::sleep(delay)).await
            {
                return self.interrupted(interrupt).await;
            }
            attempt += 1;
        };
        let stream = match subscribed {
            Ok(()) => match self.mailbox.run_bounded(limit, self.link.notifications()).await {
                Interruptible::Completed(stream) => stream,
                Interruptible::Interrupted(interrupt) => return self.interrupted(interrupt).await,
            },
            Err(e) => Err(e),
        };
        match stream {
            Ok(stream) => {
                self.notifications = Some(stream);
                self.transition(SessionInput::Subscribed);
                if !self.mailbox.wants_subscription {
                    // unsubscribe requested while subscribing
                    return self.unsubscribe().await;
                }
            }
            Err(GattError::NotConnected) => {
                self.mailbox.wants_subscription = false;
                self.on_link_lost();
            }
            Err(e) => {
                self.mailbox.wants_subscription = false;
                self.report(format!("subscribe failed: {e}"));
            }
        }
        Flow::Continue
    }

    async fn unsubscribe(&mut self) -> Flow {
        self.mailbox.wants_subscription = false;
        if !self.state.is_subscribed() {
            return Flow::Continue;
        }
        let limit = self.config.connect_timeout;
        match self
            .mailbox
            .run_bounded(limit, self.link.unsubscribe(self.config.characteristic))
            .await
        {
            Interruptible::Completed(Ok(())) => {
                self.notifications = None;
                self.transition(SessionInput::Unsubscribed);
            }
            Interruptible::Completed(Err(e)) => self.report(format!("unsubscribe failed: {e}")),
            Interruptible::Interrupted(interrupt) => return self.interrupted(interrupt).await,
        }
        Flow::Continue
    }

    async fn on_notification(&mut self, notification: Notification) {
        if notification.uuid != self.config.characteristic {
            trace!(
                "{}: ignoring notification from {}",
                self.mailbox.device, notification.uuid
            );
            return;
        }
        let Some(value) = decode_sample(&notification.value) else {
            warn!(
                "{}: undecodable payload of {} bytes",
                self.mailbox.device,
                notification.value.len()
            );
            return;
        };
        if self.state == SessionState::Subscribed {
            self.transition(SessionInput::SampleReceived);
        }
        let observation = Observation::new(Utc::now(), self.mailbox.device.clone(), value);
        self.mailbox
            .emit(SessionEventKind::Observation(observation.clone()));
        self.mailbox.save(observation).await;
    }

    fn drop_streams(&mut self) {
        self.notifications = None;
        self.disconnections = None;
    }

    fn on_link_lost(&mut self) {
        self.drop_streams();
        self.mailbox.wants_subscription = false;
        if self.transition(SessionInput::LinkLost) {
            warn!("{}: link lost", self.mailbox.device);
        }
    }
}
