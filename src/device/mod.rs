pub mod proxy;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UmbrellaAction {
    Open,
    Close,
}

impl From<bool> for UmbrellaAction {
    fn from(open: bool) -> Self {
        if open { Self::Open } else { Self::Close }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorPower {
    On,
    Off,
}

impl From<bool> for SensorPower {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

/// A command published to a device's command topic, e.g. `{"umbrella":"open"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Command {
    #[serde(rename = "umbrella")]
    Umbrella(UmbrellaAction),
    #[serde(rename = "windsensor")]
    WindSensor(SensorPower),
}

impl Command {
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// State reported by a device on its feedback topic. Either key may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Feedback {
    pub umbrella: Option<UmbrellaAction>,
    pub windsensor: Option<SensorPower>,
}

impl Feedback {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Last known state of an umbrella.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub open: bool,
    pub windsensor_on: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            open: true,
            windsensor_on: true,
        }
    }
}

impl DeviceState {
    pub fn apply(&mut self, feedback: &Feedback) {
        if let Some(umbrella) = feedback.umbrella {
            self.open = umbrella == UmbrellaAction::Open;
        }
        if let Some(power) = feedback.windsensor {
            self.windsensor_on = power == SensorPower::On;
        }
    }
}
