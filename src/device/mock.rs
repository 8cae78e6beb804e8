//! Scripted in-memory transport for the session tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::channel::oneshot;
use futures::{future, FutureExt, StreamExt};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::device::transport::{
    ConnectOptions, ConnectedHandle, DisconnectWatch, NotificationStream, RadioTransport, ScanStream, WriteMode,
};
use crate::device::types::{DeviceId, DeviceIdentity};
use crate::error::TransportError;

pub enum MockConnect {
    Succeed,
    Fail,
    Hang,
    SucceedAfter(Arc<Notify>),
}

#[derive(Default)]
pub enum MockDiscover {
    #[default]
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockHandle(pub u32);

#[derive(Default)]
struct MockInner {
    unavailable: Option<String>,
    scan: Option<UnboundedSender<DeviceIdentity>>,
    scans_started: usize,
    scans_stopped: usize,
    script: VecDeque<MockConnect>,
    connects: Vec<String>,
    discover: MockDiscover,
    discoveries: usize,
    subscribe_fails: bool,
    subscriptions: usize,
    unsubscribes: usize,
    notifications: Option<UnboundedSender<Vec<u8>>>,
    link_drop: Option<oneshot::Sender<()>>,
    write_fails: bool,
    writes: Vec<Vec<u8>>,
    disconnects: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_unavailable(&self, reason: &str) {
        self.lock().unavailable = Some(reason.to_string());
    }

    pub fn script_connect(&self, outcome: MockConnect) {
        self.lock().script.push_back(outcome);
    }

    pub fn script_discover(&self, outcome: MockDiscover) {
        self.lock().discover = outcome;
    }

    pub fn fail_subscribe(&self) {
        self.lock().subscribe_fails = true;
    }

    pub fn fail_writes(&self) {
        self.lock().write_fails = true;
    }

    /// Reports a scan hit. Returns false when no scan is running.
    pub fn found(&self, id: &str, name: Option<&str>) -> bool {
        match &self.lock().scan {
            Some(scan) => scan.unbounded_send(DeviceIdentity::new(id, name)).is_ok(),
            None => false,
        }
    }

    pub fn notify(&self, payload: &[u8]) -> bool {
        match &self.lock().notifications {
            Some(sender) => sender.unbounded_send(payload.to_vec()).is_ok(),
            None => false,
        }
    }

    pub fn drop_link(&self) -> bool {
        match self.lock().link_drop.take() {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    pub fn scans_started(&self) -> usize {
        self.lock().scans_started
    }

    pub fn scans_stopped(&self) -> usize {
        self.lock().scans_stopped
    }

    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    pub fn discoveries(&self) -> usize {
        self.lock().discoveries
    }

    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }

    pub fn unsubscribes(&self) -> usize {
        self.lock().unsubscribes
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

#[async_trait]
impl RadioTransport for MockTransport {
    type Handle = MockHandle;

    async fn ensure_ready(&self) -> Result<(), TransportError> {
        match &self.lock().unavailable {
            Some(reason) => Err(TransportError::Unavailable { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    async fn start_scan(&self, _name_prefix: &str) -> Result<ScanStream, TransportError> {
        let (sender, receiver) = unbounded();
        let mut inner = self.lock();
        inner.scans_started += 1;
        inner.scan = Some(sender);
        Ok(receiver.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.scans_stopped += 1;
        inner.scan = None;
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceId,
        options: ConnectOptions,
    ) -> Result<ConnectedHandle<MockHandle>, TransportError> {
        let (outcome, attempt) = {
            let mut inner = self.lock();
            inner.connects.push(device.0.clone());
            (inner.script.pop_front().unwrap_or(MockConnect::Succeed), inner.connects.len())
        };

        match outcome {
            MockConnect::Succeed => {},
            MockConnect::Fail => return Err(TransportError::UnknownDevice(device.0.clone())),
            MockConnect::Hang => future::pending::<()>().await,
            MockConnect::SucceedAfter(gate) => gate.notified().await,
        }

        Ok(ConnectedHandle {
            handle: MockHandle(attempt as u32),
            mtu: options.requested_mtu.min(247),
        })
    }

    async fn discover_services(&self, _handle: &MockHandle) -> Result<(), TransportError> {
        let hang = {
            let mut inner = self.lock();
            inner.discoveries += 1;
            match inner.discover {
                MockDiscover::Succeed => false,
                MockDiscover::Fail => return Err(TransportError::MissingCharacteristic),
                MockDiscover::Hang => true,
            }
        };

        if hang {
            future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _handle: &MockHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let mut inner = self.lock();
        if inner.subscribe_fails {
            return Err(TransportError::MissingCharacteristic);
        }

        let (sender, receiver) = unbounded();
        inner.subscriptions += 1;
        inner.notifications = Some(sender);
        Ok(receiver.boxed())
    }

    async fn unsubscribe(
        &self,
        _handle: &MockHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.unsubscribes += 1;
        inner.notifications = None;
        Ok(())
    }

    async fn write(
        &self,
        _handle: &MockHandle,
        _service: Uuid,
        _characteristic: Uuid,
        value: &[u8],
        _mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.write_fails {
            return Err(TransportError::Closed);
        }
        inner.writes.push(value.to_vec());
        Ok(())
    }

    async fn disconnect(&self, _handle: &MockHandle) -> Result<(), TransportError> {
        self.lock().disconnects += 1;
        Ok(())
    }

    async fn disconnect_watch(&self, _handle: &MockHandle) -> Result<DisconnectWatch, TransportError> {
        let (sender, receiver) = oneshot::channel();
        self.lock().link_drop = Some(sender);

        Ok(async move {
            // a dropped sender is not a disconnect
            if receiver.await.is_err() {
                future::pending::<()>().await;
            }
        }.boxed())
    }
}
