use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{future, pin_mut, FutureExt, Stream, StreamExt};
use log::{debug, info};
use tokio::time::timeout;
use uuid::Uuid;

use crate::device::constants::DEFAULT_ATT_MTU;
use crate::device::transport::{
    ConnectOptions, ConnectedHandle, DisconnectWatch, NotificationStream, RadioTransport, ScanStream, WriteMode,
};
use crate::device::types::{DeviceId, DeviceIdentity};
use crate::error::TransportError;

type KnownPeripherals = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

fn lock_known(known: &KnownPeripherals) -> MutexGuard<'_, HashMap<DeviceId, Peripheral>> {
    known.lock().unwrap_or_else(PoisonError::into_inner)
}

fn classify(err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::PermissionDenied => TransportError::Unavailable {
            reason: "permission to use bluetooth was denied".to_string(),
        },
        err => TransportError::Btle { source: err },
    }
}

fn device_id(peripheral: &Peripheral) -> DeviceId {
    DeviceId(format!("{:?}", peripheral.id()))
}

/// Radio transport backed by the first bluetooth adapter btleplug reports.
pub struct BtleTransport {
    // keeps the platform backend alive
    _manager: Manager,
    adapter: Adapter,
    // peripherals seen by a scan, so connect() can find them again by id
    known: KnownPeripherals,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(classify)?;
        let adapter = manager.adapters().await.map_err(classify)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable { reason: "no bluetooth adapter found".to_string() })?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(BtleTransport {
            _manager: manager,
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn peripheral(&self, device: &DeviceId) -> Result<Peripheral, TransportError> {
        lock_known(&self.known)
            .get(device)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(device.0.clone()))
    }
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<Characteristic, TransportError> {
    for gatt_service in peripheral.services() {
        if !gatt_service.uuid.eq(&service) {
            continue;
        }

        for gatt_characteristic in &gatt_service.characteristics {
            if gatt_characteristic.uuid.eq(&characteristic) {
                return Ok(gatt_characteristic.clone());
            }
        }
    }

    Err(TransportError::MissingCharacteristic)
}

async fn identify(adapter: &Adapter, known: &KnownPeripherals, event: CentralEvent, prefix: &str) -> Option<DeviceIdentity> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };

    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;

    if !name.starts_with(prefix) {
        return None;
    }

    debug!("Discovered {} {} {:?}", properties.address, name, properties.rssi);
    let identity = DeviceIdentity {
        id: device_id(&peripheral),
        name: Some(name),
    };
    lock_known(known).insert(identity.id.clone(), peripheral);
    Some(identity)
}

// Resolves when `id` disconnects, right away when it was not connected to begin with. Also
// resolves when the adapter goes away.
async fn wait_for_disconnect<I, S>(connected: bool, disconnected: S, id: I)
where
    I: PartialEq,
    S: Stream<Item = I>,
{
    if !connected {
        return;
    }

    pin_mut!(disconnected);
    while let Some(device) = disconnected.next().await {
        if device == id {
            break;
        }
    }
}

#[async_trait]
impl RadioTransport for BtleTransport {
    type Handle = Peripheral;

    async fn ensure_ready(&self) -> Result<(), TransportError> {
        self.adapter.adapter_info().await.map_err(|err| TransportError::Unavailable { reason: err.to_string() })?;
        Ok(())
    }

    async fn start_scan(&self, name_prefix: &str) -> Result<ScanStream, TransportError> {
        let events = self.adapter.events().await.map_err(classify)?;
        self.adapter.start_scan(ScanFilter::default()).await.map_err(classify)?;

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let prefix = name_prefix.to_string();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            let prefix = prefix.clone();
            async move { identify(&adapter, &known, event, &prefix).await }
        });

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await.map_err(classify)
    }

    async fn connect(&self, device: &DeviceId, options: ConnectOptions) -> Result<ConnectedHandle<Peripheral>, TransportError> {
        let peripheral = self.peripheral(device)?;
        let deadline = Duration::from_millis(options.timeout_ms);

        match timeout(deadline, peripheral.connect()).await {
            Ok(result) => result.map_err(classify)?,
            Err(_) => return Err(TransportError::Btle { source: btleplug::Error::TimedOut(deadline) }),
        }

        // btleplug negotiates the MTU on its own and does not report it
        debug!("Requested mtu {} is left to the platform", options.requested_mtu);
        Ok(ConnectedHandle { handle: peripheral, mtu: DEFAULT_ATT_MTU })
    }

    async fn discover_services(&self, handle: &Peripheral) -> Result<(), TransportError> {
        handle.discover_services().await.map_err(classify)
    }

    async fn subscribe(&self, handle: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let gatt_characteristic = find_characteristic(handle, service, characteristic)?;

        // open the stream first, so no notification sent right after subscribing is lost
        let notifications = handle.notifications().await.map_err(classify)?;
        handle.subscribe(&gatt_characteristic).await.map_err(classify)?;

        let stream = notifications.filter_map(move |notification| {
            future::ready((notification.uuid == characteristic).then_some(notification.value))
        });

        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, handle: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        let gatt_characteristic = find_characteristic(handle, service, characteristic)?;
        handle.unsubscribe(&gatt_characteristic).await.map_err(classify)
    }

    async fn write(
        &self,
        handle: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let gatt_characteristic = find_characteristic(handle, service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };

        handle.write(&gatt_characteristic, value, write_type).await.map_err(classify)
    }

    async fn disconnect(&self, handle: &Peripheral) -> Result<(), TransportError> {
        handle.disconnect().await.map_err(classify)
    }

    async fn disconnect_watch(&self, handle: &Peripheral) -> Result<DisconnectWatch, TransportError> {
        let events = self.adapter.events().await.map_err(classify)?;
        // a disconnect between connect() and the subscription above has no event
        let connected = handle.is_connected().await.map_err(classify)?;

        let disconnected = events.filter_map(|event| future::ready(match event {
            CentralEvent::DeviceDisconnected(id) => Some(id),
            _ => None,
        }));

        Ok(wait_for_disconnect(connected, disconnected, handle.id()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use super::*;

    #[tokio::test]
    async fn already_disconnected_resolves_at_once() {
        wait_for_disconnect(false, stream::pending::<u32>(), 1).await;
    }

    #[tokio::test]
    async fn waits_for_the_matching_device() {
        let mut watch = wait_for_disconnect(true, stream::iter([2, 3]).chain(stream::pending()), 1).boxed();
        assert!(futures::poll!(&mut watch).is_pending());

        wait_for_disconnect(true, stream::iter([2, 1]).chain(stream::pending()), 1).await;
    }

    #[tokio::test]
    async fn adapter_going_away_resolves() {
        wait_for_disconnect(true, stream::empty::<u32>(), 1).await;
    }
}
