use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub session: SessionSettings,
    /// Pause after every published command.
    pub publish_delay: Duration,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id_prefix: String,
    /// Bounds the CONNACK wait and every wait for a SUBACK.
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Capacity of the request channel between a session and its event loop.
    pub request_capacity: usize,
    pub certs: CertPaths,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub root_ca: PathBuf,
}

/// One umbrella as listed in the device file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConfig {
    pub uuid: String,
    pub endpoint: String,
    pub cmd_topic: String,
    pub fdbk_topic: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("device #{index}: {reason}")]
    InvalidDevice { index: usize, reason: String },
    #[error("device uuid '{0}' is listed more than once")]
    DuplicateUuid(String),
    #[error("{key} has an invalid value '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be > 0")]
    Zero(&'static str),
}

#[derive(Deserialize)]
struct DeviceFile {
    devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Builds the configuration from an arbitrary key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let devices_file = lookup("DEVICES_FILE").unwrap_or_else(|| "configs.json".to_string());
        let devices = load_devices(Path::new(&devices_file))?;

        let or_default =
            |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let certs_dir = PathBuf::from(or_default("CERTS_DIR", "certs"));
        let certs = CertPaths {
            certificate: certs_dir.join(or_default("CERT_FILE", "app-cert.pem.crt")),
            private_key: certs_dir.join(or_default("PRIVATE_KEY_FILE", "app-private.pem.key")),
            root_ca: certs_dir.join(or_default("ROOT_CA_FILE", "AmazonRootCA1.pem")),
        };

        // The CONNECT packet carries the keep-alive as a 16-bit number of seconds.
        let keep_alive: u16 = parse_or_default(&lookup, "MQTT_KEEP_ALIVE_SECS", 30)?;
        let connect_timeout = parse_or_default(&lookup, "MQTT_CONNECT_TIMEOUT_SECS", 30)?;
        let reconnect_delay = parse_or_default(&lookup, "MQTT_RECONNECT_DELAY_SECS", 5)?;
        let publish_delay = parse_or_default(&lookup, "PUBLISH_DELAY_MS", 1000)?;

        let config = Self {
            session: SessionSettings {
                port: parse_or_default(&lookup, "MQTT_PORT", 8883)?,
                keep_alive: Duration::from_secs(u64::from(keep_alive)),
                client_id_prefix: or_default("MQTT_CLIENT_ID_PREFIX", "telebrella-"),
                connect_timeout: Duration::from_secs(connect_timeout),
                reconnect_delay: Duration::from_secs(reconnect_delay),
                request_capacity: 100,
                certs,
            },
            publish_delay: Duration::from_millis(publish_delay),
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.port == 0 {
            return Err(ConfigError::Zero("MQTT_PORT"));
        }
        if self.session.keep_alive.is_zero() {
            return Err(ConfigError::Zero("MQTT_KEEP_ALIVE_SECS"));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("MQTT_CONNECT_TIMEOUT_SECS"));
        }
        Ok(())
    }
}

impl SessionSettings {
    pub fn client_id(&self, device: &DeviceConfig) -> String {
        format!("{}{}", self.client_id_prefix, device.uuid)
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

pub fn load_devices(path: &Path) -> Result<Vec<DeviceConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: DeviceFile = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_devices(&file.devices)?;
    Ok(file.devices)
}

fn validate_devices(devices: &[DeviceConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (index, device) in devices.iter().enumerate() {
        let fields = [
            ("uuid", &device.uuid),
            ("endpoint", &device.endpoint),
            ("cmd_topic", &device.cmd_topic),
            ("fdbk_topic", &device.fdbk_topic),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::InvalidDevice {
                index,
                reason: format!("'{name}' must not be empty"),
            });
        }
        if device.cmd_topic.contains(['+', '#']) {
            return Err(ConfigError::InvalidDevice {
                index,
                reason: "'cmd_topic' must not contain wildcards".to_string(),
            });
        }
        if !seen.insert(device.uuid.as_str()) {
            return Err(ConfigError::DuplicateUuid(device.uuid.clone()));
        }
    }
    Ok(())
}
