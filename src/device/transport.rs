use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::warn;

use crate::device::types::Device;
use crate::error::DeviceError;

/// Identifies one running discovery of a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryHandle(pub u64);

pub struct Discovery {
    pub handle: DiscoveryHandle,
    // Yields every advertisement that was seen; the same device may show up more than once.
    // Ending the stream ends the scan cycle early.
    pub devices: BoxStream<'static, Device>,
}

/// The radio a session drives. Implemented with btleplug by
/// [`crate::device::btle::BtleTransport`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn begin_discovery(&self) -> Result<Discovery, DeviceError>;

    /// Stops a discovery. Stopping a discovery that already stopped must be harmless.
    async fn cancel_discovery(&self, handle: DiscoveryHandle);

    async fn open_connection(&self, address: &str) -> Result<(), DeviceError>;

    async fn close_connection(&self, address: &str) -> Result<(), DeviceError>;
}

/// The operating system's permission subsystem, queried before every transport operation.
pub trait PermissionGate: Send + Sync + 'static {
    fn has_permission(&self) -> bool;

    /// Asks for permission without waiting for the answer, which shows up as a later
    /// `has_permission() == true`.
    fn request_permission(&self);
}

/// A permission gate backed by a flag that the embedding application flips once the OS answered.
#[derive(Debug, Clone)]
pub struct PermissionFlag {
    granted: Arc<AtomicBool>,
    requested: Arc<AtomicBool>,
}

impl PermissionFlag {
    pub fn new(granted: bool) -> Self {
        PermissionFlag {
            granted: Arc::new(AtomicBool::new(granted)),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    pub fn was_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl PermissionGate for PermissionFlag {
    fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request_permission(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            warn!("Bluetooth permission is missing; grant it in the system settings");
        }
    }
}
