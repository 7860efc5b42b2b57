use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::time::sleep;
use uuid::Uuid;

use crate::device::constants::{millis, STOP_DEADLINE, UNKNOWN_DEVICE_NAME};
use crate::device::transport::{Discovery, DiscoveryHandle, Transport};
use crate::device::types::Device;
use crate::error::DeviceError;

/// A [`Transport`] on top of every bluetooth adapter btleplug can find.
pub struct BtleTransport {
    manager: Manager,
    service_filter: Option<Uuid>,
    connect_deadline: Duration,
    next_handle: AtomicU64,
    scanning: Mutex<HashMap<DiscoveryHandle, Vec<Adapter>>>,
}

impl BtleTransport {
    pub async fn new(service_filter: Option<Uuid>, connect_deadline: Duration) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;

        Ok(BtleTransport {
            manager,
            service_filter,
            connect_deadline,
            next_handle: AtomicU64::new(1),
            scanning: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
trait ScanControl: Send + Sync {
    async fn begin_scan(&self, filter: &ScanFilter) -> Result<(), DeviceError>;

    async fn end_scan(&self);
}

#[async_trait]
impl ScanControl for Adapter {
    async fn begin_scan(&self, filter: &ScanFilter) -> Result<(), DeviceError> {
        info!("Scanning using adapter {}...", self.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        self.start_scan(filter.clone()).await?;
        Ok(())
    }

    async fn end_scan(&self) {
        tokio::select! {
            _ = sleep(millis(STOP_DEADLINE)) => {
                warn!("Stopping the scan took too long");
            }
            result = self.stop_scan() => {
                if let Err(err) = result {
                    warn!("Failed to stop scanning: {:?}", err);
                }
            }
        }
    }
}

async fn stop_all<A: ScanControl>(adapters: &[A]) {
    for adapter in adapters {
        adapter.end_scan().await;
    }
}

// Either every adapter scans or none does.
async fn start_all<A: ScanControl>(adapters: &[A], filter: &ScanFilter) -> Result<(), DeviceError> {
    for (index, adapter) in adapters.iter().enumerate() {
        if let Err(err) = adapter.begin_scan(filter).await {
            warn!("Scanning failed, stopping {} adapter(s) that already started", index);
            stop_all(&adapters[..index]).await;
            return Err(err);
        }
    }

    Ok(())
}

async fn start_scanning(manager: &Manager, service_filter: Option<Uuid>) -> Result<Vec<Adapter>, DeviceError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(DeviceError::NoAdapter);
    }

    let filter = ScanFilter {
        services: service_filter.into_iter().collect(),
    };
    start_all(&adapters, &filter).await?;

    Ok(adapters)
}

// CoreBluetooth hides the hardware address and reports 00:00:00:00:00:00 for every peripheral, the
// platform id is the only thing that tells them apart there.
fn device_address(id: &str, address: BDAddr) -> String {
    if address == BDAddr::default() {
        id.to_string()
    } else {
        address.to_string()
    }
}

fn make_device(id: String, local_name: Option<String>, address: BDAddr) -> Device {
    let address = device_address(&id, address);
    Device::new(id, local_name.unwrap_or(String::from(UNKNOWN_DEVICE_NAME)), address)
}

async fn describe_peripheral(adapter: &Adapter, id: &PeripheralId, service_filter: Option<Uuid>) -> Option<Device> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to look up discovered peripheral: {}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => {
            // Some environments ignore the filter, so make sure to check the service uuid again
            if let Some(service) = service_filter {
                if !properties.services.contains(&service) {
                    return None;
                }
            }

            Some(make_device(peripheral.id().to_string(), properties.local_name, properties.address))
        },
    }
}

async fn find_peripheral(manager: &Manager, address: &str) -> Result<Peripheral, DeviceError> {
    for adapter in manager.adapters().await? {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Ok(Some(properties)) if device_address(&peripheral.id().to_string(), properties.address) == address => {
                    return Ok(peripheral);
                },
                Ok(_) => {},
                Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
            }
        }
    }

    Err(DeviceError::PeripheralNotFound { address: address.to_string() })
}

async fn connect_peripheral(peripheral: &Peripheral) -> Result<(), DeviceError> {
    if peripheral.is_connected().await? {
        debug!("Peripheral is already connected");
        return Ok(());
    }

    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;
    Ok(())
}

#[async_trait]
impl Transport for BtleTransport {
    async fn begin_discovery(&self) -> Result<Discovery, DeviceError> {
        let adapters = start_scanning(&self.manager, self.service_filter).await?;
        let service_filter = self.service_filter;
        let mut streams = Vec::with_capacity(adapters.len());

        for adapter in &adapters {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(err) => {
                    stop_all(&adapters).await;
                    return Err(err.into());
                },
            };
            let adapter = adapter.clone();

            let devices = events.filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            describe_peripheral(&adapter, &id, service_filter).await
                        },
                        _ => None,
                    }
                }
            });
            streams.push(devices.boxed());
        }

        let handle = DiscoveryHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.scanning.lock().expect("Failed to lock scanning adapters").insert(handle, adapters);

        Ok(Discovery {
            handle,
            devices: stream::select_all(streams).boxed(),
        })
    }

    async fn cancel_discovery(&self, handle: DiscoveryHandle) {
        let adapters = self.scanning.lock().expect("Failed to lock scanning adapters").remove(&handle);

        let Some(adapters) = adapters else {
            debug!("Discovery {:?} was already stopped", handle);
            return;
        };

        stop_all(&adapters).await;
    }

    async fn open_connection(&self, address: &str) -> Result<(), DeviceError> {
        let peripheral = find_peripheral(&self.manager, address).await?;

        tokio::select! {
            _ = sleep(self.connect_deadline) => {
                warn!("Connecting to {} took too long", address);
                Err(DeviceError::ConnectTimeout { address: address.to_string() })
            }
            result = connect_peripheral(&peripheral) => result,
        }
    }

    async fn close_connection(&self, address: &str) -> Result<(), DeviceError> {
        let peripheral = find_peripheral(&self.manager, address).await?;

        tokio::select! {
            _ = sleep(millis(STOP_DEADLINE)) => {
                warn!("Disconnecting from {} took too long", address);
                Ok(())
            }
            result = peripheral.disconnect() => Ok(result?),
        }
    }
}
