use std::sync::Arc;
use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::types::{Action, Args};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::connection::{spawn_session, SessionHandle};
use crate::device::transport::PermissionFlag;
use crate::device::types::{ConnectionState, SessionSnapshot};
use crate::error::{AppRunError, CommandError};

async fn load_config(config_io: &ConfigIO) -> Result<Config, AppRunError> {
    match config_io.read().await {
        Ok(config) => Ok(config),
        Err(err) if err.is_file_not_found_error() => {
            info!("Config file not found, using defaults");
            Ok(Config::default())
        },
        Err(err) => {
            error!("Failed to load config: {:?}", &err);
            Err(err.into())
        },
    }
}

fn print_devices(snapshot: &SessionSnapshot) {
    if snapshot.devices.is_empty() {
        println!("No sensors found");
        return;
    }

    for device in snapshot.devices.iter() {
        let marker = if device.is_connected { "*" } else { " " };
        println!("{} {}  {}  {}", marker, device.id, device.address, device.name);
    }
}

// enables the radio and waits until the first scan cycle is over
async fn scan_cycle(session: &SessionHandle) -> Result<SessionSnapshot, AppRunError> {
    let mut snapshots = session.subscribe();
    session.enable().await?;

    let snapshot = snapshots
        .wait_for(|snapshot| snapshot.state != ConnectionState::Searching)
        .await
        .map_err(|_| CommandError::SessionClosed)?
        .clone();
    Ok(snapshot)
}

async fn perform(session: &SessionHandle, action: &Action) -> Result<(), AppRunError> {
    let snapshot = scan_cycle(session).await?;

    match action {
        Action::Connect { id } => {
            session.connect(id).await?;
            print_devices(&session.snapshot());
        },
        _ => print_devices(&snapshot),
    }

    session.disable().await?;
    Ok(())
}

async fn run_session(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.clone())?;

    if let Action::InitConfig = args.action {
        config_io.save(&Config::default()).await?;
        println!("Wrote default config to {}", config_io.path().to_string_lossy());
        return Ok(());
    }

    // only one process may drive the radio at a time
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let mut config = load_config(&config_io).await?;
    if let Some(duration) = args.scan_duration {
        config.scan_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    }

    let transport = BtleTransport::new(config.service_uuid()?, config.connect_deadline()).await?;
    // desktop platforms have no runtime permission prompt; btleplug reports a missing permission
    // as an error of the scan itself
    let permission = PermissionFlag::new(true);

    let cancel = CancellationToken::new();
    let (session, session_handle) = spawn_session(cancel.clone(), config, Arc::new(transport), Arc::new(permission));

    let result = perform(&session, &args.action).await;

    cancel.cancel();
    join_session(session_handle).await?;

    result
}

async fn join_session(session_handle: JoinHandle<()>) -> Result<(), AppRunError> {
    info!("Waiting for session to stop");
    if let Err(err) = session_handle.await {
        error!("Session task did not stop cleanly: {}", err);
        return Err(err.into());
    }
    Ok(())
}

pub fn run_application(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_session(args))
}
