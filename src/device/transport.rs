//! Contract between the session and the radio stack.
//!
//! The session only ever talks to the radio through [`RadioTransport`]. Streams and futures returned
//! here are owned by the session, which drops (unsubscribes from) them when the link goes away.

use std::fmt::Debug;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::{DeviceId, DeviceIdentity};
use crate::error::TransportError;

pub type ScanStream = BoxStream<'static, DeviceIdentity>;
pub type NotificationStream = BoxStream<'static, Vec<u8>>;
pub type DisconnectWatch = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub timeout_ms: u64,
    pub requested_mtu: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone)]
pub struct ConnectedHandle<H> {
    pub handle: H,
    pub mtu: u16,
}

#[async_trait]
pub trait RadioTransport: Send + Sync + 'static {
    type Handle: Clone + Debug + Send + Sync + 'static;

    /// Fails with [`TransportError::Unavailable`] when the radio is off or access was denied.
    async fn ensure_ready(&self) -> Result<(), TransportError>;

    /// Starts a scan. The stream runs until [`RadioTransport::stop_scan`] is called or it is dropped.
    /// Implementations may pre-filter on the name prefix, but are not required to.
    async fn start_scan(&self, name_prefix: &str) -> Result<ScanStream, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(
        &self,
        device: &DeviceId,
        options: ConnectOptions,
    ) -> Result<ConnectedHandle<Self::Handle>, TransportError>;

    async fn discover_services(&self, handle: &Self::Handle) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError>;

    /// Resolves once the link behind `handle` drops without being asked to.
    async fn disconnect_watch(&self, handle: &Self::Handle) -> Result<DisconnectWatch, TransportError>;
}
