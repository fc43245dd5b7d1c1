pub mod client;
pub mod subscriptions;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read certificate material {}: {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: rumqttc::ConnectionError,
    },
    #[error("timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker rejected subscription to {0}")]
    SubscribeRejected(String),
    #[error("server rejected resubscribe to topic: {0}")]
    ResubscribeRejected(String),
    #[error("connection interrupted before the broker acknowledged the request")]
    Interrupted,
    #[error("session event loop is no longer running")]
    DriverStopped,
}

/// An authenticated publish/subscribe channel to the broker for one device.
#[async_trait]
pub trait Session: Send + Sync {
    /// Publishes `payload` at QoS at-least-once. Returns once the session layer accepted it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;

    /// Subscribes `topic` at QoS at-least-once and routes matching messages to `handler`.
    /// Waits for the broker's acknowledgement and returns the granted QoS.
    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::Sender<MqttMessage>,
    ) -> Result<QoS, SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// The event loop behind an established session. Resolves when the session is closed,
/// or with an error the process cannot recover from.
pub type DriverTask = Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>>;

#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(
        &self,
        device: &DeviceConfig,
    ) -> Result<(Self::Session, DriverTask), SessionError>;
}
