use std::env;
use std::path::Path;
use futures::StreamExt;
use log::{info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::device::btle::BtleTransport;
use crate::device::session::{start_session, SessionHandle};
use crate::device::types::{ServoTarget, SessionSnapshot, SessionState};
use crate::error::{AppRunError, ConfigError, SessionError};

pub mod device;
pub mod error;
pub mod config;

pub fn init_logging(level: LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Print every snapshot until interrupted.
    Monitor,
    /// Send a single command frame.
    Move(Vec<ServoTarget>),
    ShowConfig,
}

/// Parses `ID:ANGLE`, for example `2:90.5`.
pub fn parse_target(arg: &str) -> Result<ServoTarget, AppRunError> {
    let invalid = || AppRunError::InvalidTarget(arg.to_string());

    let (servo_id, angle) = arg.split_once(':').ok_or_else(invalid)?;
    let servo_id: u8 = servo_id.trim().parse().map_err(|_| invalid())?;
    let angle: f32 = angle.trim().parse().map_err(|_| invalid())?;

    if !angle.is_finite() {
        return Err(invalid());
    }

    Ok(ServoTarget::new(servo_id, angle))
}

pub fn describe_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut line = snapshot.state.to_string();

    if let Some(device) = &snapshot.device {
        let name = device.name.as_deref().unwrap_or("unnamed");
        line.push_str(&format!(" {} ({}, mtu {})", name, device.id, device.mtu));
    }

    if !snapshot.telemetry.is_empty() {
        let servos: Vec<String> = snapshot.telemetry.iter()
            .map(|record| format!("{}={:.1}", record.servo_id, record.angle()))
            .collect();
        line.push_str(&format!(" [{}]", servos.join(" ")));
    }

    if let Some(err) = &snapshot.last_error {
        line.push_str(&format!(" error: {}", err));
    }

    line
}

async fn show_config(config_io: &ConfigIO) -> Result<(), AppRunError> {
    let was_empty = std::fs::metadata(config_io.path())
        .map(|attr| attr.len() == 0)
        .map_err(|source| ConfigError::IOError { source })?;

    let config = config_io.read().await?;
    if was_empty {
        config_io.save(&config).await?;
    }

    let content = serde_json::to_string_pretty(&config)
        .map_err(|source| ConfigError::JsonError { source })?;
    println!("{}", content);
    Ok(())
}

async fn monitor(session: &SessionHandle) -> Result<(), AppRunError> {
    let mut updates = session.store().updates();
    session.connect().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                break signal.map_err(|source| AppRunError::Signal { source });
            },
            snapshot = updates.next() => {
                let Some(snapshot) = snapshot else {
                    break Err(SessionError::SessionClosed.into());
                };
                println!("{}", describe_snapshot(&snapshot));

                if matches!(snapshot.state, SessionState::Disconnected | SessionState::Error) {
                    break Err(snapshot.last_error.unwrap_or(SessionError::UnsolicitedDisconnect).into());
                }
            },
        }
    };

    session.disconnect().await?;
    result
}

async fn move_servos(session: &SessionHandle, targets: &[ServoTarget]) -> Result<(), AppRunError> {
    let device = session.connect().await?;
    info!("Connected to {} ({})", device.name.as_deref().unwrap_or("unnamed"), device.id);

    session.send_command(targets).await?;
    session.disconnect().await?;
    Ok(())
}

pub async fn run(config_path: Option<&Path>, command: Command) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(config_path)?;

    if command == Command::ShowConfig {
        return show_config(&config_io).await;
    }

    // one process drives the device at a time
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let config = config_io.read().await?;
    let transport = BtleTransport::new().await?;

    let app_cancel = CancellationToken::new();
    let (session, session_task) = start_session(transport, config.session_config(), app_cancel.child_token());

    let result = match &command {
        Command::Monitor => monitor(&session).await,
        Command::Move(targets) => move_servos(&session, targets).await,
        Command::ShowConfig => Ok(()),
    };

    app_cancel.cancel();
    if let Err(err) = session_task.await {
        warn!("Session task did not stop cleanly: {}", err);
    }

    result
}

#[cfg(test)]
mod tests {
    use indexmap::IndexSet;
    use crate::device::types::{ConnectedDeviceInfo, DeviceId, ServoTelemetryRecord};
    use super::*;

    #[test]
    fn parses_targets() {
        assert_eq!(parse_target("2:90.5").unwrap(), ServoTarget::new(2, 90.5));
        assert_eq!(parse_target(" 7 : -10 ").unwrap(), ServoTarget::new(7, -10.0));

        for arg in ["", "2", "2:", ":90", "300:90", "a:90", "2:NaN", "2:inf"] {
            assert!(matches!(parse_target(arg), Err(AppRunError::InvalidTarget(_))), "{}", arg);
        }
    }

    #[test]
    fn describes_snapshots() {
        assert_eq!(describe_snapshot(&SessionSnapshot::default()), "Idle");

        let snapshot = SessionSnapshot {
            state: SessionState::Connected,
            device: Some(ConnectedDeviceInfo {
                id: DeviceId::from("AA:BB"),
                name: Some("CLO-1".to_string()),
                mtu: 247,
                subscribed: IndexSet::new(),
            }),
            telemetry: vec![
                ServoTelemetryRecord { servo_id: 1, angle_tenths: 900 },
                ServoTelemetryRecord { servo_id: 2, angle_tenths: 455 },
            ],
            last_error: None,
        };
        assert_eq!(describe_snapshot(&snapshot), "Connected CLO-1 (AA:BB, mtu 247) [1=90.0 2=45.5]");

        let snapshot = SessionSnapshot {
            state: SessionState::Error,
            last_error: Some(SessionError::ConnectTimeout),
            ..SessionSnapshot::default()
        };
        assert_eq!(describe_snapshot(&snapshot), "Error error: Connecting to device took too long");
    }
}
