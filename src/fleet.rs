use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::DeviceConfig;
use crate::device::proxy::DeviceProxy;
use crate::mqtt::{Connector, Session, SessionError};

/// Outcome of a session event loop, tagged with the device uuid.
pub type DriverExit = (String, Result<(), SessionError>);

pub struct Fleet<S> {
    pub devices: Vec<DeviceProxy<S>>,
    pub drivers: JoinSet<DriverExit>,
}

impl<S: Session> Fleet<S> {
    /// Establishes a session for every configured device, in order. Devices that cannot
    /// be reached are logged and left out.
    pub async fn connect<C>(
        configs: &[DeviceConfig],
        connector: &C,
        publish_delay: Duration,
    ) -> Self
    where
        C: Connector<Session = S>,
    {
        let mut devices = Vec::with_capacity(configs.len());
        let mut drivers = JoinSet::new();

        for config in configs {
            match connector.connect(config).await {
                Ok((session, driver)) => {
                    info!("Device {} connected", config.uuid);
                    let uuid = config.uuid.clone();
                    drivers.spawn(async move { (uuid, driver.await) });
                    devices.push(DeviceProxy::new(config.clone(), session, publish_delay));
                }
                Err(e) => error!("Device {} unavailable: {}", config.uuid, e),
            }
        }

        Self { devices, drivers }
    }
}
