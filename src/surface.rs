use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::device::proxy::DeviceProxy;
use crate::mqtt::{Session, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open,
    Close,
    ToggleWindSensor,
    Next,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("unknown command '{0}', type 'help' for the list")]
    UnknownAction(String),
    #[error("no device selected")]
    NoDevice,
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl FromStr for Action {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            "wind" | "windsensor" => Ok(Self::ToggleWindSensor),
            "next" => Ok(Self::Next),
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(SurfaceError::UnknownAction(other.to_string())),
        }
    }
}

const HELP: &str = "commands: open | close | wind | next | status | help | quit";

/// Operator controls over the fleet, with an explicit selection of the device being driven.
pub struct ControlSurface<S> {
    devices: Vec<DeviceProxy<S>>,
    selected: usize,
}

impl<S: Session> ControlSurface<S> {
    pub fn new(devices: Vec<DeviceProxy<S>>) -> Self {
        Self { devices, selected: 0 }
    }

    pub fn devices(&self) -> &[DeviceProxy<S>] {
        &self.devices
    }

    pub fn selected(&self) -> Option<&DeviceProxy<S>> {
        self.devices.get(self.selected)
    }

    /// Moves the selection to the next device, wrapping around. Returns the new index.
    pub fn cycle(&mut self) -> Option<usize> {
        if self.devices.is_empty() {
            return None;
        }
        self.selected = (self.selected + 1) % self.devices.len();
        Some(self.selected)
    }

    pub async fn execute(&mut self, action: Action) -> Result<(), SurfaceError> {
        match action {
            Action::Open => {
                let device = self.selected().ok_or(SurfaceError::NoDevice)?;
                info!("Umbrella is opening...");
                device.set_open(true).await?;
            }
            Action::Close => {
                let device = self.selected().ok_or(SurfaceError::NoDevice)?;
                info!("Umbrella is closing...");
                device.set_open(false).await?;
            }
            Action::ToggleWindSensor => {
                let device = self.selected().ok_or(SurfaceError::NoDevice)?;
                device.toggle_windsensor().await?;
                if device.windsensor_on().await {
                    info!("Wind sensor is now on.");
                } else {
                    info!("Wind sensor is now off.");
                }
            }
            Action::Next => {
                let index = self.cycle().ok_or(SurfaceError::NoDevice)?;
                if let Some(device) = self.selected() {
                    info!("Telebrella Controls: Device #{} ({})", index + 1, device.uuid());
                }
            }
            Action::Status => {
                let device = self.selected().ok_or(SurfaceError::NoDevice)?;
                let state = device.state().await;
                info!(
                    "Device #{} ({}): umbrella {}, wind sensor {}",
                    self.selected + 1,
                    device.uuid(),
                    if state.open { "open" } else { "closed" },
                    if state.windsensor_on { "on" } else { "off" },
                );
            }
            Action::Help => info!("{}", HELP),
            Action::Quit => {}
        }
        Ok(())
    }

    /// Disconnects every device session.
    pub async fn shutdown(&self) {
        for device in &self.devices {
            if let Err(e) = device.session().disconnect().await {
                warn!("Device {}: failed to disconnect: {}", device.uuid(), e);
            }
        }
    }
}
