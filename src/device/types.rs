use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disabled,
    Searching,
    Connected,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Disabled => "Disabled",
            ConnectionState::Searching => "Searching",
            ConnectionState::Connected => "Connected",
            ConnectionState::Ready => "Ready",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub address: String,
    pub is_connected: bool,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Device {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            is_connected: false,
        }
    }
}

/**
 * Everything an observer of a session can see, captured at one transition.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub devices: Arc<[Device]>,
    pub is_scanning: bool,
}

impl SessionSnapshot {
    pub fn initial() -> Self {
        SessionSnapshot {
            state: ConnectionState::Disabled,
            devices: Arc::from(Vec::new()),
            is_scanning: false,
        }
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == id)
    }
}
