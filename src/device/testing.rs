//! Fakes for driving a session without a radio.

#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::device::transport::{Discovery, DiscoveryHandle, Transport};
use crate::device::types::Device;
use crate::error::DeviceError;

pub fn sensor(id: &str) -> Device {
    let suffix = id.bytes().fold(0u8, |acc, byte| acc.wrapping_add(byte));
    Device::new(id, format!("Sensor {}", id.to_uppercase()), format!("C0:FF:EE:00:00:{:02X}", suffix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEnd {
    // the stream ends right after yielding the scripted devices
    Instant,
    // the stream never ends, only the scan duration ends the cycle
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    BeginDiscovery(DiscoveryHandle),
    CancelDiscovery(DiscoveryHandle),
    OpenConnection(String),
    CloseConnection(String),
}

pub struct FakeTransport {
    devices: Mutex<Vec<Device>>,
    end: DiscoveryEnd,
    fail_discovery: AtomicBool,
    failing_connects: AtomicU32,
    next_handle: AtomicU64,
    calls: Mutex<Vec<TransportCall>>,
}

impl FakeTransport {
    pub fn new(devices: Vec<Device>, end: DiscoveryEnd) -> Self {
        FakeTransport {
            devices: Mutex::new(devices),
            end,
            fail_discovery: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            next_handle: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// The next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn begin_discovery(&self) -> Result<Discovery, DeviceError> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(DeviceError::NoAdapter);
        }

        let handle = DiscoveryHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.record(TransportCall::BeginDiscovery(handle));

        let found = stream::iter(self.devices.lock().unwrap().clone());
        let devices = match self.end {
            DiscoveryEnd::Instant => found.boxed(),
            DiscoveryEnd::Never => found.chain(stream::pending()).boxed(),
        };

        Ok(Discovery { handle, devices })
    }

    async fn cancel_discovery(&self, handle: DiscoveryHandle) {
        self.record(TransportCall::CancelDiscovery(handle));
    }

    async fn open_connection(&self, address: &str) -> Result<(), DeviceError> {
        self.record(TransportCall::OpenConnection(address.to_string()));

        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(DeviceError::PeripheralNotFound { address: address.to_string() });
        }
        Ok(())
    }

    async fn close_connection(&self, address: &str) -> Result<(), DeviceError> {
        self.record(TransportCall::CloseConnection(address.to_string()));
        Ok(())
    }
}
