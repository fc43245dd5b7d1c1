mod config;
mod device;
mod fleet;
mod mqtt;
mod surface;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::fleet::Fleet;
use crate::mqtt::client::MqttConnector;
use crate::surface::{Action, ControlSurface};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting {} v{} (port={}, devices={})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.session.port,
        config.devices.len(),
    );

    for device in &config.devices {
        info!(
            "  Device: {} at {} (command={}, feedback={})",
            device.uuid, device.endpoint, device.cmd_topic, device.fdbk_topic,
        );
    }

    let connector = MqttConnector::new(config.session.clone());
    let fleet = Fleet::connect(&config.devices, &connector, config.publish_delay).await;
    let Fleet { devices, mut drivers } = fleet;

    // Feedback subscriptions settle in the background; controls are live meanwhile.
    let listeners: Vec<_> = devices.iter().map(|device| device.listen_feedback()).collect();

    let mut surface = ControlSurface::new(devices);
    info!(
        "{} of {} devices available",
        surface.devices().len(),
        config.devices.len()
    );
    if let Err(e) = surface.execute(Action::Help).await {
        warn!("{}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::process::exit(1);
        }
    };

    // Main loop: operator commands, session exits and shutdown signals
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match line.parse::<Action>() {
                        Ok(Action::Quit) => {
                            info!("Quit requested, shutting down");
                            break;
                        }
                        Ok(action) => {
                            if let Err(e) = surface.execute(action).await {
                                warn!("{}", e);
                            }
                        }
                        Err(e) => warn!("{}", e),
                    },
                    Ok(None) => {
                        info!("stdin closed, controls disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
            Some(exit) = drivers.join_next() => {
                match exit {
                    Ok((uuid, Ok(()))) => info!("Device {}: session closed", uuid),
                    Ok((uuid, Err(e))) => {
                        error!("Device {}: {}", uuid, e);
                        std::process::exit(1);
                    }
                    Err(e) => error!("Session task failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    for listener in &listeners {
        listener.abort();
    }
    surface.shutdown().await;
    let drain = async { while drivers.join_next().await.is_some() {} };
    if tokio::time::timeout(std::time::Duration::from_secs(2), drain).await.is_err() {
        drivers.abort_all();
    }
    info!("{} stopped", env!("CARGO_PKG_NAME"));
}
