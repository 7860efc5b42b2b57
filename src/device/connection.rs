use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::types::{Config, RescanPolicy};
use crate::device::constants::{millis, COMMAND_CHANNEL_SIZE, CONNECT_RETRY_DELAY, SCAN_CHANNEL_SIZE};
use crate::device::registry::DeviceRegistry;
use crate::device::transport::{Discovery, DiscoveryHandle, PermissionGate, Transport};
use crate::device::types::{ConnectionState, Device, SessionSnapshot};
use crate::error::{CommandError, DeviceError, RegistryError};

pub type CommandResult = Result<ConnectionState, CommandError>;

#[derive(Debug)]
enum Command {
    Enable(oneshot::Sender<CommandResult>),
    Disable(oneshot::Sender<CommandResult>),
    StartScan(oneshot::Sender<CommandResult>),
    Connect(String, oneshot::Sender<CommandResult>),
}

#[derive(Debug)]
enum ScanEvent {
    Discovered { cycle: u64, device: Device },
    Finished { cycle: u64 },
}

#[derive(Debug)]
struct ScanCycle {
    id: u64,
    cancel: CancellationToken,
    handle: DiscoveryHandle,
}

fn scan_cycle_task(
    cycle: u64,
    duration: Duration,
    cancel: CancellationToken,
    mut devices: BoxStream<'static, Device>,
    mut sender: Sender<ScanEvent>,
) -> JoinHandle<()> {
    spawn(async move {
        let deadline = sleep(duration);
        tokio::pin!(deadline);

        'mainloop: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = &mut deadline => {
                    let _ = sender.send(ScanEvent::Finished { cycle }).await;
                    break 'mainloop;
                },
                next = devices.next() => match next {
                    Some(device) => {
                        if sender.send(ScanEvent::Discovered { cycle, device }).await.is_err() {
                            break 'mainloop;
                        }
                    },
                    None => {
                        debug!("Discovery of scan cycle {} ended early", cycle);
                        let _ = sender.send(ScanEvent::Finished { cycle }).await;
                        break 'mainloop;
                    },
                },
            }
        }
    })
}

struct ConnectionStateMachine {
    state: ConnectionState,
    registry: DeviceRegistry,
    scan: Option<ScanCycle>,
    next_cycle: u64,
    config: Config,
    transport: Arc<dyn Transport>,
    permission: Arc<dyn PermissionGate>,
    scan_sender: Sender<ScanEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl ConnectionStateMachine {
    fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        permission: Arc<dyn PermissionGate>,
        scan_sender: Sender<ScanEvent>,
        snapshots: watch::Sender<SessionSnapshot>,
    ) -> Self {
        ConnectionStateMachine {
            state: ConnectionState::Disabled,
            registry: DeviceRegistry::new(),
            scan: None,
            next_cycle: 1,
            config,
            transport,
            permission,
            scan_sender,
            snapshots,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(SessionSnapshot {
            state: self.state,
            devices: self.registry.snapshot(),
            is_scanning: self.scan.is_some(),
        });
    }

    fn enter(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("{} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn reject(&self, command: &'static str) -> CommandError {
        debug!("Rejecting {} in state {}", command, self.state);
        CommandError::InvalidTransition { command, state: self.state }
    }

    fn require_permission(&self) -> Result<(), CommandError> {
        if self.permission.has_permission() {
            return Ok(());
        }

        self.permission.request_permission();
        Err(CommandError::PermissionDenied)
    }

    fn start_cycle(&mut self, discovery: Discovery) {
        if self.config.rescan_policy == RescanPolicy::Clear {
            self.registry.clear();
        }

        let id = self.next_cycle;
        self.next_cycle += 1;

        let cancel = CancellationToken::new();
        scan_cycle_task(id, self.config.scan_duration(), cancel.clone(), discovery.devices, self.scan_sender.clone());

        info!("Scan cycle {} started", id);
        self.scan = Some(ScanCycle { id, cancel, handle: discovery.handle });
    }

    // Calling this without a running scan cycle does nothing.
    async fn cancel_scan(&mut self) {
        if let Some(cycle) = self.scan.take() {
            cycle.cancel.cancel();
            self.transport.cancel_discovery(cycle.handle).await;
            info!("Scan cycle {} cancelled", cycle.id);
        }
    }

    async fn close_connections(&mut self) {
        for device in self.registry.clear_connections() {
            if let Err(err) = self.transport.close_connection(&device.address).await {
                warn!("Failed to close connection to {}: {}", device.address, err);
            }
        }
    }

    async fn open_connection(&self, address: &str) -> Result<(), CommandError> {
        let attempts = self.config.connect_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.open_connection(address).await {
                Ok(()) => return Ok(()),
                Err(DeviceError::PermissionDenied) => return Err(CommandError::PermissionDenied),
                Err(err) => {
                    warn!("Connecting to {} failed (attempt {}/{}): {}", address, attempt, attempts, err);
                    last_error = Some(err);
                },
            }

            if attempt < attempts {
                sleep(millis(CONNECT_RETRY_DELAY)).await;
            }
        }

        Err(last_error.map(CommandError::from).unwrap_or(CommandError::TransportFailure {
            message: format!("Could not connect to {}", address),
        }))
    }

    async fn enable(&mut self) -> CommandResult {
        if self.state != ConnectionState::Disabled {
            return Err(self.reject("enable"));
        }
        self.require_permission()?;

        let discovery = self.transport.begin_discovery().await?;

        self.enter(ConnectionState::Ready);
        self.publish();

        self.start_cycle(discovery);
        self.enter(ConnectionState::Searching);
        self.publish();
        Ok(self.state)
    }

    async fn disable(&mut self) -> CommandResult {
        if self.state == ConnectionState::Disabled {
            return Err(self.reject("disable"));
        }

        self.cancel_scan().await;
        if self.state == ConnectionState::Connected {
            self.close_connections().await;
        }

        self.enter(ConnectionState::Disabled);
        self.publish();
        Ok(self.state)
    }

    async fn start_scan(&mut self) -> CommandResult {
        match self.state {
            ConnectionState::Disabled | ConnectionState::Connected => return Err(self.reject("start_scan")),
            ConnectionState::Ready | ConnectionState::Searching => {},
        }
        self.require_permission()?;

        // the adapters can only run one scan, so the superseded cycle has to stop first
        self.cancel_scan().await;

        let discovery = match self.transport.begin_discovery().await {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!("Failed to start scanning: {}", err);
                self.enter(ConnectionState::Ready);
                self.publish();
                return Err(err.into());
            },
        };

        self.start_cycle(discovery);
        self.enter(ConnectionState::Searching);
        self.publish();
        Ok(self.state)
    }

    async fn connect(&mut self, id: String) -> CommandResult {
        // an unknown id is reported as such in every state
        let device = match self.registry.get(&id) {
            Some(device) => device.clone(),
            None => return Err(RegistryError::UnknownDevice { id }.into()),
        };

        if self.state == ConnectionState::Disabled {
            return Err(self.reject("connect"));
        }
        self.require_permission()?;

        info!("Connecting to {} ({})", device.name, device.address);
        self.open_connection(&device.address).await?;

        self.cancel_scan().await;
        self.enter(ConnectionState::Connected);
        self.registry.mark_connected(&device.id)?;
        self.publish();
        Ok(self.state)
    }

    async fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Enable(reply) => (self.enable().await, reply),
            Command::Disable(reply) => (self.disable().await, reply),
            Command::StartScan(reply) => (self.start_scan().await, reply),
            Command::Connect(id, reply) => (self.connect(id).await, reply),
        };

        if let Err(err) = &result {
            info!("Command failed: {}", err);
        }

        if reply.send(result).is_err() {
            debug!("Caller went away before the command completed");
        }
    }

    async fn handle_scan_event(&mut self, event: ScanEvent) {
        let current = self.scan.as_ref().map(|cycle| cycle.id);

        match event {
            ScanEvent::Discovered { cycle, device } => {
                if current != Some(cycle) {
                    debug!("Ignoring device from stale scan cycle {}", cycle);
                    return;
                }

                let result = match self.registry.upsert(device.clone()) {
                    Ok(()) => {
                        info!("Discovered {} {} ({})", device.id, device.name, device.address);
                        Ok(())
                    },
                    Err(RegistryError::DuplicateDevice { .. }) => self.registry.refresh(device),
                    Err(err) => Err(err),
                };

                match result {
                    Ok(()) => self.publish(),
                    Err(err) => warn!("Ignoring advertisement: {}", err),
                }
            },
            ScanEvent::Finished { cycle } => {
                if current != Some(cycle) {
                    debug!("Ignoring completion of stale scan cycle {}", cycle);
                    return;
                }

                if let Some(cycle) = self.scan.take() {
                    self.transport.cancel_discovery(cycle.handle).await;
                    info!("Scan cycle {} finished with {} device(s)", cycle.id, self.registry.len());
                }

                if self.state == ConnectionState::Searching {
                    self.enter(ConnectionState::Ready);
                }
                self.publish();
            },
        }
    }

    async fn run(mut self, cancel: CancellationToken, mut commands: Receiver<Command>, mut scan_events: Receiver<ScanEvent>) {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break 'mainloop,
                },
                Some(event) = scan_events.next() => {
                    self.handle_scan_event(event).await;
                },
            }
        }

        self.cancel_scan().await;
        if self.state == ConnectionState::Connected {
            self.close_connections().await;
        }
        self.enter(ConnectionState::Disabled);
        self.publish();
        info!("Session stopped");
    }
}

/// The command surface and observable state of one session.
///
/// Commands are processed one at a time by the session task, in the order they were sent. Every
/// command resolves to the resulting [`ConnectionState`] or a [`CommandError`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    async fn request(&self, command: impl FnOnce(oneshot::Sender<CommandResult>) -> Command) -> CommandResult {
        let (reply, response) = oneshot::channel();
        let mut commands = self.commands.clone();

        commands.send(command(reply)).await.map_err(|_| CommandError::SessionClosed)?;
        response.await.map_err(|_| CommandError::SessionClosed)?
    }

    pub async fn enable(&self) -> CommandResult {
        self.request(Command::Enable).await
    }

    pub async fn disable(&self) -> CommandResult {
        self.request(Command::Disable).await
    }

    pub async fn start_scan(&self) -> CommandResult {
        self.request(Command::StartScan).await
    }

    pub async fn connect(&self, id: &str) -> CommandResult {
        let id = id.to_string();
        self.request(move |reply| Command::Connect(id, reply)).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshots.borrow().state
    }

    pub fn devices(&self) -> Arc<[Device]> {
        self.snapshots.borrow().devices.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.snapshots.borrow().is_scanning
    }

    /// A receiver that is notified with a new snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Starts a session task. The session stops when `cancel` is cancelled or every handle is dropped.
pub fn spawn_session(
    cancel: CancellationToken,
    config: Config,
    transport: Arc<dyn Transport>,
    permission: Arc<dyn PermissionGate>,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_sender, command_receiver) = channel::<Command>(COMMAND_CHANNEL_SIZE);
    let (scan_sender, scan_receiver) = channel::<ScanEvent>(SCAN_CHANNEL_SIZE);
    let (snapshot_sender, snapshot_receiver) = watch::channel(SessionSnapshot::initial());

    let machine = ConnectionStateMachine::new(config, transport, permission, scan_sender, snapshot_sender);
    let handle = spawn(machine.run(cancel.clone(), command_receiver, scan_receiver));

    let session = SessionHandle {
        commands: command_sender,
        snapshots: snapshot_receiver,
        cancel,
    };

    (session, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    use crate::device::constants::SCAN_DURATION;
    use crate::device::testing::{sensor, DiscoveryEnd, FakeTransport, TransportCall};
    use crate::device::transport::PermissionFlag;

    fn start(transport: &Arc<FakeTransport>, permission: &PermissionFlag, config: Config) -> (SessionHandle, JoinHandle<()>) {
        let transport: Arc<dyn Transport> = transport.clone();
        spawn_session(CancellationToken::new(), config, transport, Arc::new(permission.clone()))
    }

    async fn wait_for_ready(session: &SessionHandle) -> SessionSnapshot {
        let mut snapshots = session.subscribe();
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.state == ConnectionState::Ready)
            .await
            .expect("session stopped");
        snapshot.clone()
    }

    fn ids(snapshot: &SessionSnapshot) -> Vec<&str> {
        snapshot.devices.iter().map(|device| device.id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_only_accepts_enable() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Never));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        for result in [session.disable().await, session.start_scan().await] {
            assert!(matches!(
                result,
                Err(CommandError::InvalidTransition { state: ConnectionState::Disabled, .. })
            ));
        }
        assert_eq!(session.connect("a").await, Err(CommandError::UnknownDevice { id: "a".to_string() }));
        assert_eq!(session.state(), ConnectionState::Disabled);
        assert!(transport.calls().is_empty());

        assert_eq!(session.enable().await, Ok(ConnectionState::Searching));
        assert!(matches!(session.enable().await, Err(CommandError::InvalidTransition { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn enable_searches_then_becomes_ready() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Never));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        assert_eq!(session.enable().await, Ok(ConnectionState::Searching));
        let started = Instant::now();
        assert!(session.is_scanning());

        let snapshot = wait_for_ready(&session).await;

        assert!(started.elapsed() >= millis(SCAN_DURATION));
        assert!(started.elapsed() < millis(SCAN_DURATION + 1000));
        assert!(!snapshot.is_scanning);
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert!(transport.calls().contains(&TransportCall::CancelDiscovery(DiscoveryHandle(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn disable_while_searching_cancels_scan() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Never));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());
        let mut snapshots = session.subscribe();

        session.enable().await.unwrap();
        assert_eq!(session.disable().await, Ok(ConnectionState::Disabled));
        assert!(!session.is_scanning());

        snapshots.borrow_and_update();
        sleep(millis(SCAN_DURATION * 3)).await;

        assert!(!snapshots.has_changed().unwrap());
        assert_eq!(session.state(), ConnectionState::Disabled);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::BeginDiscovery(DiscoveryHandle(1)), TransportCall::CancelDiscovery(DiscoveryHandle(1))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disable_from_ready_and_again_is_rejected() {
        let transport = Arc::new(FakeTransport::new(vec![], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        assert_eq!(session.disable().await, Ok(ConnectionState::Disabled));
        assert!(matches!(session.disable().await, Err(CommandError::InvalidTransition { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_marks_only_that_device() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        assert_eq!(session.connect("b").await, Ok(ConnectionState::Connected));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert!(!snapshot.device("a").unwrap().is_connected);
        assert!(snapshot.device("b").unwrap().is_connected);
        assert!(transport.calls().contains(&TransportCall::OpenConnection(sensor("b").address)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_searching_stops_the_scan() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Never));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());
        let mut snapshots = session.subscribe();

        session.enable().await.unwrap();
        snapshots.wait_for(|snapshot| snapshot.devices.len() == 1).await.unwrap();

        assert_eq!(session.connect("a").await, Ok(ConnectionState::Connected));
        assert!(!session.is_scanning());

        sleep(millis(SCAN_DURATION * 2)).await;
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_unknown_device_changes_nothing() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        let before = wait_for_ready(&session).await;

        assert_eq!(
            session.connect("zzz").await,
            Err(CommandError::UnknownDevice { id: "zzz".to_string() })
        );
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_permission_is_reported_and_requested() {
        let permission = PermissionFlag::new(false);
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &permission, Config::default());

        assert_eq!(session.enable().await, Err(CommandError::PermissionDenied));
        assert!(permission.was_requested());
        assert_eq!(session.state(), ConnectionState::Disabled);
        assert!(transport.calls().is_empty());

        permission.set_granted(true);
        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        permission.set_granted(false);
        assert_eq!(session.start_scan().await, Err(CommandError::PermissionDenied));
        assert_eq!(session.connect("a").await, Err(CommandError::PermissionDenied));
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn start_scan_supersedes_running_cycle() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Never));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        sleep(millis(SCAN_DURATION - 1000)).await;
        assert_eq!(session.state(), ConnectionState::Searching);

        assert_eq!(session.start_scan().await, Ok(ConnectionState::Searching));
        let restarted = Instant::now();
        wait_for_ready(&session).await;

        assert!(restarted.elapsed() >= millis(SCAN_DURATION));
        let calls = transport.calls();
        assert_eq!(calls[0], TransportCall::BeginDiscovery(DiscoveryHandle(1)));
        assert_eq!(calls[1], TransportCall::CancelDiscovery(DiscoveryHandle(1)));
        assert_eq!(calls[2], TransportCall::BeginDiscovery(DiscoveryHandle(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_scan_is_rejected_while_connected() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;
        session.connect("a").await.unwrap();

        assert!(matches!(
            session.start_scan().await,
            Err(CommandError::InvalidTransition { state: ConnectionState::Connected, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rescan_clears_previous_devices() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        transport.set_devices(vec![sensor("c")]);
        session.start_scan().await.unwrap();
        let snapshot = wait_for_ready(&session).await;

        assert_eq!(ids(&snapshot), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rescan_merges_previous_devices() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Instant));
        let config = Config { rescan_policy: RescanPolicy::Merge, ..Config::default() };
        let (session, _) = start(&transport, &PermissionFlag::new(true), config);

        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        transport.set_devices(vec![sensor("c"), Device::new("a", "Freezer", sensor("a").address)]);
        session.start_scan().await.unwrap();
        let snapshot = wait_for_ready(&session).await;

        assert_eq!(ids(&snapshot), vec!["a", "b", "c"]);
        assert_eq!(snapshot.device("a").unwrap().name, "Freezer");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_advertisements_do_not_duplicate() {
        let renamed = Device::new("a", "Renamed", sensor("a").address);
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b"), renamed], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        let snapshot = wait_for_ready(&session).await;

        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert_eq!(snapshot.device("a").unwrap().name, "Renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_is_reported() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        transport.fail_connects(1);
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        let before = wait_for_ready(&session).await;

        assert!(matches!(session.connect("a").await, Err(CommandError::TransportFailure { .. })));
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_retried_when_configured() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        transport.fail_connects(2);
        let config = Config { connect_attempts: 3, ..Config::default() };
        let (session, _) = start(&transport, &PermissionFlag::new(true), config);

        session.enable().await.unwrap();
        wait_for_ready(&session).await;

        let started = Instant::now();
        assert_eq!(session.connect("a").await, Ok(ConnectionState::Connected));
        assert!(started.elapsed() >= millis(CONNECT_RETRY_DELAY * 2));

        let attempts = transport.calls().into_iter()
            .filter(|call| matches!(call, TransportCall::OpenConnection(_)))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_from_connected_closes_connections() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a"), sensor("b")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;
        session.connect("b").await.unwrap();

        assert_eq!(session.disable().await, Ok(ConnectionState::Disabled));
        assert!(session.devices().iter().all(|device| !device.is_connected));
        assert!(transport.calls().contains(&TransportCall::CloseConnection(sensor("b").address)));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_failure_leaves_state_unchanged() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        transport.fail_discovery(true);
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        assert!(matches!(session.enable().await, Err(CommandError::TransportFailure { .. })));
        assert_eq!(session.state(), ConnectionState::Disabled);
        assert!(!session.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn commands_fail_after_shutdown() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Never));
        let (session, join_handle) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        session.shutdown();
        join_handle.await.unwrap();

        assert_eq!(session.enable().await, Err(CommandError::SessionClosed));
        assert_eq!(session.state(), ConnectionState::Disabled);
        assert!(transport.calls().contains(&TransportCall::CancelDiscovery(DiscoveryHandle(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_disabled_rejects_known_devices() {
        let transport = Arc::new(FakeTransport::new(vec![sensor("a")], DiscoveryEnd::Instant));
        let (session, _) = start(&transport, &PermissionFlag::new(true), Config::default());

        session.enable().await.unwrap();
        wait_for_ready(&session).await;
        session.disable().await.unwrap();
        let before = session.snapshot();

        assert!(matches!(
            session.connect("a").await,
            Err(CommandError::InvalidTransition { state: ConnectionState::Disabled, .. })
        ));
        assert_eq!(session.connect("zzz").await, Err(CommandError::UnknownDevice { id: "zzz".to_string() }));
        assert_eq!(session.snapshot(), before);
    }

    fn machine(transport: &Arc<FakeTransport>) -> (ConnectionStateMachine, Receiver<ScanEvent>, watch::Receiver<SessionSnapshot>) {
        let (scan_sender, scan_receiver) = channel::<ScanEvent>(SCAN_CHANNEL_SIZE);
        let (snapshot_sender, snapshot_receiver) = watch::channel(SessionSnapshot::initial());
        let transport: Arc<dyn Transport> = transport.clone();
        let machine = ConnectionStateMachine::new(
            Config::default(),
            transport,
            Arc::new(PermissionFlag::new(true)),
            scan_sender,
            snapshot_sender,
        );
        (machine, scan_receiver, snapshot_receiver)
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_superseded_cycle_are_ignored() {
        let transport = Arc::new(FakeTransport::new(vec![], DiscoveryEnd::Never));
        let (mut machine, _scan_events, snapshots) = machine(&transport);

        machine.enable().await.unwrap();
        machine.start_scan().await.unwrap();
        assert_eq!(machine.scan.as_ref().map(|cycle| cycle.id), Some(2));

        machine.handle_scan_event(ScanEvent::Discovered { cycle: 1, device: sensor("a") }).await;
        machine.handle_scan_event(ScanEvent::Finished { cycle: 1 }).await;

        assert_eq!(machine.state, ConnectionState::Searching);
        assert!(machine.registry.is_empty());
        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.state, ConnectionState::Searching);
        assert!(snapshot.is_scanning);

        machine.handle_scan_event(ScanEvent::Finished { cycle: 2 }).await;
        assert_eq!(machine.state, ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_after_disable_does_not_make_ready() {
        let transport = Arc::new(FakeTransport::new(vec![], DiscoveryEnd::Never));
        let (mut machine, _scan_events, snapshots) = machine(&transport);

        machine.enable().await.unwrap();
        machine.disable().await.unwrap();

        machine.handle_scan_event(ScanEvent::Discovered { cycle: 1, device: sensor("a") }).await;
        machine.handle_scan_event(ScanEvent::Finished { cycle: 1 }).await;

        assert_eq!(machine.state, ConnectionState::Disabled);
        assert!(machine.registry.is_empty());
        assert!(!snapshots.borrow().is_scanning);
        let cancels = transport.calls().into_iter()
            .filter(|call| matches!(call, TransportCall::CancelDiscovery(_)))
            .count();
        assert_eq!(cancels, 1);
    }
}
