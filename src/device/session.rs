//! The device session: one task that owns the connection lifecycle.
//!
//! Callers talk to the task through a [`SessionHandle`]. Radio events are forwarded into the task by
//! small helper tasks (scan, connect attempt, notifications, disconnect watch). Every helper tags
//! its events with the epoch of the phase that spawned it, so events that arrive after the session
//! moved on are recognised and dropped. Commands and events are applied one at a time.

use std::mem;
use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::{channel, unbounded, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::future;
use futures::{SinkExt, StreamExt};
use indexmap::IndexSet;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{
    CONNECT_DEADLINE, DEVICE_NAME_PREFIX, MOTOR_COMMAND_CHARACTERISTIC, MOTOR_SERVICE,
    MOTOR_TELEMETRY_CHARACTERISTIC, REQUESTED_MTU, SCAN_DEADLINE, WRITE_DEADLINE,
};
use crate::device::frame::{decode_telemetry, encode_command};
use crate::device::store::SessionStore;
use crate::device::transport::{
    ConnectOptions, ConnectedHandle, DisconnectWatch, NotificationStream, RadioTransport, ScanStream, WriteMode,
};
use crate::device::types::{
    AngleRange, ConnectedDeviceInfo, DeviceIdentity, ServoTarget, ServoTelemetryRecord, SessionSnapshot, SessionState,
};
use crate::error::{SessionError, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub device_name_prefix: String,
    pub service: Uuid,
    pub telemetry_characteristic: Uuid,
    pub command_characteristic: Uuid,
    pub connect_timeout: Duration,
    pub requested_mtu: u16,
    pub write_deadline: Duration,
    pub write_mode: WriteMode,
    /// `None` scans until a matching device shows up.
    pub scan_timeout: Option<Duration>,
    pub angle_range: AngleRange,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service: MOTOR_SERVICE,
            telemetry_characteristic: MOTOR_TELEMETRY_CHARACTERISTIC,
            command_characteristic: MOTOR_COMMAND_CHARACTERISTIC,
            connect_timeout: Duration::from_millis(CONNECT_DEADLINE),
            requested_mtu: REQUESTED_MTU,
            write_deadline: Duration::from_millis(WRITE_DEADLINE),
            write_mode: WriteMode::WithoutResponse,
            scan_timeout: Some(Duration::from_millis(SCAN_DEADLINE)),
            angle_range: AngleRange::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionCommand {
    Connect(Reply<ConnectedDeviceInfo>),
    Disconnect(Reply<()>),
    Reset(Reply<()>),
    SendCommand(Vec<ServoTarget>, Reply<()>),
}

struct Established<H> {
    connected: ConnectedHandle<H>,
    watch: DisconnectWatch,
}

enum SessionEvent<H> {
    DeviceFound { epoch: u64, device: DeviceIdentity },
    ScanFinished { epoch: u64 },
    ConnectResolved { epoch: u64, device: DeviceIdentity, result: Result<Established<H>, SessionError> },
    Notification { epoch: u64, payload: Vec<u8> },
    LinkDropped { epoch: u64 },
}

struct ActiveLink<H> {
    handle: H,
    info: ConnectedDeviceInfo,
    // cancels the notification forwarder and the disconnect watcher
    tasks: CancellationToken,
}

enum Phase<H> {
    Idle,
    Scanning { epoch: u64, scan: CancellationToken },
    Connecting { epoch: u64 },
    Connected { epoch: u64, link: ActiveLink<H> },
    Disconnected,
    Error,
}

impl<H> Phase<H> {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Scanning { .. } => SessionState::Scanning,
            Phase::Connecting { .. } => SessionState::Connecting,
            Phase::Connected { .. } => SessionState::Connected,
            Phase::Disconnected => SessionState::Disconnected,
            Phase::Error => SessionState::Error,
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            Phase::Scanning { epoch, .. } | Phase::Connecting { epoch } | Phase::Connected { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    fn is_current(&self, event_epoch: u64) -> bool {
        self.epoch() == Some(event_epoch)
    }
}

/// Cloneable entry point to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    store: SessionStore,
}

impl SessionHandle {
    async fn request<R>(&self, make: impl FnOnce(Reply<R>) -> SessionCommand) -> Result<R, SessionError> {
        let (reply, response) = oneshot::channel();
        let mut commands = self.commands.clone();

        commands.send(make(reply)).await.map_err(|_| SessionError::SessionClosed)?;
        response.await.unwrap_or(Err(SessionError::SessionClosed))
    }

    /// Scans for a matching device and connects to it. Resolves once the session is `Connected`
    /// or has failed. Joins the attempt in flight if there is one.
    pub async fn connect(&self) -> Result<ConnectedDeviceInfo, SessionError> {
        self.request(SessionCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Disconnect).await
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Reset).await
    }

    pub async fn send_command(&self, targets: &[ServoTarget]) -> Result<(), SessionError> {
        let targets = targets.to_vec();
        self.request(move |reply| SessionCommand::SendCommand(targets, reply)).await
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }
}

struct Session<T: RadioTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    store: SessionStore,
    events: UnboundedSender<SessionEvent<T::Handle>>,
    cancel: CancellationToken,
    phase: Phase<T::Handle>,
    telemetry: Vec<ServoTelemetryRecord>,
    last_error: Option<SessionError>,
    waiters: Vec<Reply<ConnectedDeviceInfo>>,
    next_epoch: u64,
}

/// Spawns the session task. The task stops when `cancel` is cancelled or every handle is dropped.
pub fn start_session<T: RadioTransport>(
    transport: T,
    config: SessionConfig,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_sender, command_receiver) = channel::<SessionCommand>(16);
    let (event_sender, event_receiver) = unbounded();
    let store = SessionStore::new();

    let session = Session {
        transport: Arc::new(transport),
        config,
        store: store.clone(),
        events: event_sender,
        cancel,
        phase: Phase::Idle,
        telemetry: Vec::new(),
        last_error: None,
        waiters: Vec::new(),
        next_epoch: 0,
    };

    let handle = spawn(session.run(command_receiver, event_receiver));
    (SessionHandle { commands: command_sender, store }, handle)
}

impl<T: RadioTransport> Session<T> {
    async fn run(
        mut self,
        mut commands: Receiver<SessionCommand>,
        mut events: UnboundedReceiver<SessionEvent<T::Handle>>,
    ) {
        let cancel = self.cancel.clone();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break 'mainloop,
                },
                Some(event) = events.next() => {
                    self.handle_event(event).await;
                },
            }
        }

        info!("Session stopping");
        self.tear_down().await;
        self.resolve_waiters(Err(SessionError::SessionClosed));
        self.enter(Phase::Idle);
    }

    fn take_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn publish(&self) {
        let device = match &self.phase {
            Phase::Connected { link, .. } => Some(link.info.clone()),
            _ => None,
        };

        self.store.publish(SessionSnapshot {
            state: self.phase.state(),
            device,
            telemetry: self.telemetry.clone(),
            last_error: self.last_error.clone(),
        });
    }

    fn enter(&mut self, phase: Phase<T::Handle>) {
        debug!("Session state {} -> {}", self.phase.state(), phase.state());
        self.phase = phase;
        self.telemetry.clear();
        self.publish();
    }

    fn resolve_waiters(&mut self, result: Result<ConnectedDeviceInfo, SessionError>) {
        for waiter in self.waiters.drain(..) {
            // the caller may have stopped waiting
            let _ = waiter.send(result.clone());
        }
    }

    fn fail(&mut self, error: SessionError) {
        warn!("Session failed: {}", error);
        self.last_error = Some(error.clone());
        self.enter(Phase::Error);
        self.resolve_waiters(Err(error));
    }

    async fn stop_scan(&self) {
        if let Err(err) = self.transport.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }
    }

    async fn release(&self, handle: &T::Handle) {
        if let Err(err) = self.transport.disconnect(handle).await {
            warn!("Failed to disconnect from peripheral: {}", err);
        }
    }

    // Stops everything the current phase owns and leaves the session in `Idle` (unpublished).
    async fn tear_down(&mut self) {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Scanning { scan, .. } => {
                scan.cancel();
                self.stop_scan().await;
            },
            Phase::Connected { link, .. } => {
                link.tasks.cancel();
                let result = self.transport.unsubscribe(
                    &link.handle,
                    self.config.service,
                    self.config.telemetry_characteristic,
                ).await;
                if let Err(err) = result {
                    warn!("Failed to unsubscribe from telemetry: {}", err);
                }
                self.release(&link.handle).await;
            },
            _ => {},
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect(reply) => match &self.phase {
                Phase::Connected { link, .. } => {
                    let _ = reply.send(Ok(link.info.clone()));
                },
                Phase::Scanning { .. } | Phase::Connecting { .. } => {
                    debug!("Connect requested while already {}", self.phase.state());
                    self.waiters.push(reply);
                },
                Phase::Idle | Phase::Disconnected | Phase::Error => {
                    self.waiters.push(reply);
                    self.begin_scan().await;
                },
            },
            SessionCommand::Disconnect(reply) => {
                if let Phase::Connected { .. } = self.phase {
                    info!("Disconnecting from peripheral");
                    self.tear_down().await;
                    self.last_error = None;
                    self.enter(Phase::Disconnected);
                } else {
                    debug!("Disconnect requested while {}, ignoring", self.phase.state());
                }
                let _ = reply.send(Ok(()));
            },
            SessionCommand::Reset(reply) => {
                info!("Resetting session");
                self.tear_down().await;
                self.resolve_waiters(Err(SessionError::ConnectFailure {
                    reason: "the session was reset".to_string(),
                }));
                self.last_error = None;
                self.enter(Phase::Idle);
                let _ = reply.send(Ok(()));
            },
            SessionCommand::SendCommand(targets, reply) => {
                let result = self.send_command(&targets).await;
                let _ = reply.send(result);
            },
        }
    }

    async fn begin_scan(&mut self) {
        if let Err(err) = self.transport.ensure_ready().await {
            warn!("Bluetooth is not ready: {}", err);
            let error = SessionError::TransportUnavailable { reason: err.to_string() };
            // the state is left as it was, only the error is published
            self.last_error = Some(error.clone());
            self.publish();
            self.resolve_waiters(Err(error));
            return;
        }

        let prefix = self.config.device_name_prefix.clone();
        info!("Scanning for devices named {}*...", prefix);

        match self.transport.start_scan(&prefix).await {
            Ok(stream) => {
                let epoch = self.take_epoch();
                let scan = self.cancel.child_token();
                forward_scan(self.events.clone(), epoch, stream, scan.clone(), self.config.scan_timeout);

                self.last_error = None;
                self.enter(Phase::Scanning { epoch, scan });
            },
            Err(TransportError::Unavailable { reason }) => {
                let error = SessionError::TransportUnavailable { reason };
                self.last_error = Some(error.clone());
                self.publish();
                self.resolve_waiters(Err(error));
            },
            Err(err) => self.fail(SessionError::connect_failure(&err)),
        }
    }

    async fn handle_event(&mut self, event: SessionEvent<T::Handle>) {
        match event {
            SessionEvent::DeviceFound { epoch, device } => {
                if !self.phase.is_current(epoch) {
                    debug!("Ignoring scan result {} from a finished scan", device.id);
                    return;
                }
                // Some transports ignore the filter, so make sure to check the name again
                if !device.name_starts_with(&self.config.device_name_prefix) {
                    debug!("Ignoring non matching device {} {:?}", device.id, device.name);
                    return;
                }

                info!("Using peripheral {} {}", device.id, device.name.as_deref().unwrap_or("NONE"));
                self.tear_down().await;

                let epoch = self.take_epoch();
                attempt_connect(
                    self.transport.clone(),
                    self.events.clone(),
                    epoch,
                    device,
                    &self.config,
                );
                self.enter(Phase::Connecting { epoch });
            },
            SessionEvent::ScanFinished { epoch } => {
                if self.phase.is_current(epoch) {
                    self.tear_down().await;
                    self.fail(SessionError::DeviceNotFound);
                }
            },
            SessionEvent::ConnectResolved { epoch, device, result } => {
                if self.phase.is_current(epoch) {
                    match result {
                        Ok(established) => self.finish_connect(device, established).await,
                        Err(error) => self.fail(error),
                    }
                } else if let Ok(established) = result {
                    info!("Releasing peripheral {} from a superseded connect attempt", device.id);
                    self.release(&established.connected.handle).await;
                }
            },
            SessionEvent::Notification { epoch, payload } => {
                if !self.phase.is_current(epoch) {
                    debug!("Discarding telemetry received after disconnect");
                    return;
                }

                match decode_telemetry(&payload) {
                    Ok(records) => {
                        self.telemetry = records;
                        self.publish();
                    },
                    Err(err) => warn!("Discarding telemetry: {}", err),
                }
            },
            SessionEvent::LinkDropped { epoch } => {
                if !self.phase.is_current(epoch) {
                    return;
                }

                warn!("Connection lost");
                if let Phase::Connected { link, .. } = mem::replace(&mut self.phase, Phase::Idle) {
                    link.tasks.cancel();
                }
                self.last_error = Some(SessionError::UnsolicitedDisconnect);
                self.enter(Phase::Disconnected);
            },
        }
    }

    async fn finish_connect(&mut self, device: DeviceIdentity, established: Established<T::Handle>) {
        let Established { connected, watch } = established;
        let service = self.config.service;
        let characteristic = self.config.telemetry_characteristic;

        info!("Subscribing to characteristic {:?} {:?}", service, characteristic);
        let notifications = match self.transport.subscribe(&connected.handle, service, characteristic).await {
            Ok(stream) => stream,
            Err(err) => {
                self.release(&connected.handle).await;
                self.fail(SessionError::connect_failure(&err));
                return;
            },
        };

        let epoch = self.take_epoch();
        let tasks = self.cancel.child_token();
        forward_notifications(self.events.clone(), epoch, notifications, tasks.clone());
        watch_link(self.events.clone(), epoch, watch, tasks.clone());

        let mut subscribed = IndexSet::new();
        subscribed.insert(characteristic);

        let info = ConnectedDeviceInfo {
            id: device.id,
            name: device.name,
            mtu: connected.mtu,
            subscribed,
        };

        info!("Peripheral ready (mtu {})", info.mtu);
        self.last_error = None;
        self.enter(Phase::Connected {
            epoch,
            link: ActiveLink { handle: connected.handle, info: info.clone(), tasks },
        });
        self.resolve_waiters(Ok(info));
    }

    async fn send_command(&mut self, targets: &[ServoTarget]) -> Result<(), SessionError> {
        let handle = match &self.phase {
            Phase::Connected { link, .. } => link.handle.clone(),
            _ => return Err(SessionError::NotConnected),
        };

        let frame = encode_command(targets, &self.config.angle_range);
        let write = self.transport.write(
            &handle,
            self.config.service,
            self.config.command_characteristic,
            &frame,
            self.config.write_mode,
        );

        let failure = match timeout(self.config.write_deadline, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "sending to command characteristic took too long".to_string(),
        };

        // a failed write means the link is gone, even if no disconnect event arrived yet
        warn!("Failed to send to command characteristic: {}", failure);
        if let Phase::Connected { link, .. } = mem::replace(&mut self.phase, Phase::Idle) {
            link.tasks.cancel();
            self.release(&link.handle).await;
        }
        self.last_error = Some(SessionError::UnsolicitedDisconnect);
        self.enter(Phase::Disconnected);
        Err(SessionError::UnsolicitedDisconnect)
    }
}

fn forward_scan<H: Send + 'static>(
    events: UnboundedSender<SessionEvent<H>>,
    epoch: u64,
    mut stream: ScanStream,
    cancel: CancellationToken,
    scan_timeout: Option<Duration>,
) -> JoinHandle<()> {
    spawn(async move {
        let deadline = async move {
            match scan_timeout {
                Some(duration) => sleep(duration).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = &mut deadline => {
                    info!("No matching device found before the scan deadline");
                    let _ = events.unbounded_send(SessionEvent::ScanFinished { epoch });
                    break 'mainloop;
                },
                device = stream.next() => match device {
                    Some(device) => {
                        let _ = events.unbounded_send(SessionEvent::DeviceFound { epoch, device });
                    },
                    None => {
                        let _ = events.unbounded_send(SessionEvent::ScanFinished { epoch });
                        break 'mainloop;
                    },
                },
            }
        }
    })
}

async fn prepare_link<T: RadioTransport>(transport: &T, handle: &T::Handle) -> Result<DisconnectWatch, SessionError> {
    let mut watch = transport.disconnect_watch(handle).await
        .map_err(|err| SessionError::connect_failure(&err))?;

    info!("Connected; Discovering services...");
    tokio::select! {
        result = transport.discover_services(handle) => {
            result.map_err(|err| SessionError::connect_failure(&err))?;
        },
        _ = &mut watch => {
            return Err(SessionError::ConnectFailure {
                reason: "link dropped during service discovery".to_string(),
            });
        },
    }

    Ok(watch)
}

async fn establish<T: RadioTransport>(
    transport: &T,
    device: &DeviceIdentity,
    options: ConnectOptions,
    deadline: Duration,
) -> Result<Established<T::Handle>, SessionError> {
    let started = Instant::now();

    info!("Connecting to peripheral...");
    let connected = match timeout(deadline, transport.connect(&device.id, options)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return Err(SessionError::connect_failure(&err)),
        Err(_) => return Err(SessionError::ConnectTimeout),
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    let failure = match timeout(remaining, prepare_link(transport, &connected.handle)).await {
        Ok(Ok(watch)) => return Ok(Established { connected, watch }),
        Ok(Err(err)) => err,
        Err(_) => SessionError::ConnectTimeout,
    };

    if let Err(err) = transport.disconnect(&connected.handle).await {
        warn!("Failed to release half connected peripheral: {}", err);
    }
    Err(failure)
}

fn attempt_connect<T: RadioTransport>(
    transport: Arc<T>,
    events: UnboundedSender<SessionEvent<T::Handle>>,
    epoch: u64,
    device: DeviceIdentity,
    config: &SessionConfig,
) -> JoinHandle<()> {
    let deadline = config.connect_timeout;
    let options = ConnectOptions {
        timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        requested_mtu: config.requested_mtu,
    };

    // never cancelled: an attempt always resolves, the session decides whether it still wants it
    spawn(async move {
        let result = establish(transport.as_ref(), &device, options, deadline).await;
        let _ = events.unbounded_send(SessionEvent::ConnectResolved { epoch, device, result });
    })
}

fn forward_notifications<H: Send + 'static>(
    events: UnboundedSender<SessionEvent<H>>,
    epoch: u64,
    mut stream: NotificationStream,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(payload) = stream.next() => {
                    let _ = events.unbounded_send(SessionEvent::Notification { epoch, payload });
                },
            }
        }
    })
}

fn watch_link<H: Send + 'static>(
    events: UnboundedSender<SessionEvent<H>>,
    epoch: u64,
    watch: DisconnectWatch,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {},
            _ = watch => {
                let _ = events.unbounded_send(SessionEvent::LinkDropped { epoch });
            },
        }
    })
}
