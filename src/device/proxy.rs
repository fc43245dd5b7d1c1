use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::mqtt::{MqttMessage, Session, SessionError};

use super::{Command, DeviceState, Feedback, SensorPower, UmbrellaAction};

/// Feedback messages buffered per device. The session driver drops messages for a full
/// channel rather than stall the event loop.
pub const FEEDBACK_CAPACITY: usize = 256;

/// One umbrella, reached through its own broker session.
///
/// The cached state mirrors the last command handed to the session, and is overwritten
/// by whatever the device reports on its feedback topic.
pub struct DeviceProxy<S> {
    config: DeviceConfig,
    session: S,
    state: Arc<RwLock<DeviceState>>,
    publish_delay: Duration,
}

impl<S: Session> DeviceProxy<S> {
    pub fn new(config: DeviceConfig, session: S, publish_delay: Duration) -> Self {
        Self {
            config,
            session,
            state: Arc::new(RwLock::new(DeviceState::default())),
            publish_delay,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub async fn state(&self) -> DeviceState {
        *self.state.read().await
    }

    pub async fn windsensor_on(&self) -> bool {
        self.state.read().await.windsensor_on
    }

    /// Commands the umbrella open or closed. Always publishes, whatever the cached state.
    pub async fn set_open(&self, open: bool) -> Result<(), SessionError> {
        {
            let mut state = self.state.write().await;
            self.send(Command::Umbrella(UmbrellaAction::from(open))).await?;
            state.open = open;
        }
        self.throttle().await;
        Ok(())
    }

    /// Switches the wind sensor. Returns `false` without publishing when it is already in
    /// the requested state.
    pub async fn set_windsensor(&self, on: bool) -> Result<bool, SessionError> {
        self.switch_windsensor(|_| on).await
    }

    /// Flips the wind sensor from the state cached when the lock is taken.
    pub async fn toggle_windsensor(&self) -> Result<bool, SessionError> {
        self.switch_windsensor(|on| !on).await
    }

    /// Subscribes the feedback topic in the background and keeps the cached state in line
    /// with what the device reports. The task ends with the subscription error, or once the
    /// session drops the subscription.
    pub fn listen_feedback(&self) -> JoinHandle<Result<(), SessionError>>
    where
        S: Clone + 'static,
    {
        let (tx, rx) = mpsc::channel(FEEDBACK_CAPACITY);
        let session = self.session.clone();
        let topic = self.config.fdbk_topic.clone();
        let uuid = self.config.uuid.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            match session.subscribe(&topic, tx).await {
                Ok(qos) => info!("Device {}: subscribed to feedback with {:?}", uuid, qos),
                Err(e) => {
                    warn!("Device {}: feedback unavailable: {}", uuid, e);
                    return Err(e);
                }
            }
            apply_feedback(&uuid, rx, &state).await;
            Ok(())
        })
    }

    /// Publishes the wind sensor command chosen by `target` from the cached value, holding
    /// the write lock from the read to the cache update.
    async fn switch_windsensor<F>(&self, target: F) -> Result<bool, SessionError>
    where
        F: FnOnce(bool) -> bool,
    {
        {
            let mut state = self.state.write().await;
            let on = target(state.windsensor_on);
            if state.windsensor_on == on {
                let power = if on { "on" } else { "off" };
                debug!("Device {}: wind sensor already {}", self.uuid(), power);
                return Ok(false);
            }
            self.send(Command::WindSensor(SensorPower::from(on))).await?;
            state.windsensor_on = on;
        }
        self.throttle().await;
        Ok(true)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        let payload = command.to_payload()?;
        let topic = &self.config.cmd_topic;
        info!("Device {}: publishing {:?} to {}", self.uuid(), command, topic);
        self.session.publish(topic, payload).await
    }

    async fn throttle(&self) {
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
    }
}

async fn apply_feedback(
    uuid: &str,
    mut rx: mpsc::Receiver<MqttMessage>,
    state: &RwLock<DeviceState>,
) {
    while let Some(message) = rx.recv().await {
        match Feedback::parse(&message.payload) {
            Ok(feedback) => {
                let mut state = state.write().await;
                state.apply(&feedback);
                debug!("Device {}: state after feedback {:?}", uuid, *state);
            }
            Err(e) => warn!(
                "Device {}: ignoring malformed feedback '{}': {}",
                uuid, message.payload, e
            ),
        }
    }
    debug!("Device {}: feedback channel closed", uuid);
}
