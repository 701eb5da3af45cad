//! Host wire messages.
//!
//! Both directions are JSON objects tagged by an `event` field, one per
//! line on the stdio bridge and one per request on the HTTP surface.

use crate::core::KeyId;
use crate::sensors::SensorInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle and configuration events sent by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent {
    /// A key with this action appeared, optionally with stored settings
    KeyAdded {
        key: KeyId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
    },
    KeyRemoved {
        key: KeyId,
    },
    /// The key's page was shown or hidden
    KeyVisible {
        key: KeyId,
        visible: bool,
    },
    /// The property inspector saved new settings
    SettingsChanged {
        key: KeyId,
        settings: Value,
    },
    /// The property inspector wants the sensor picker contents
    GetSensorList {
        key: KeyId,
    },
    Shutdown,
}

impl HostEvent {
    /// Key the event refers to, if any.
    pub fn key(&self) -> Option<&KeyId> {
        match self {
            HostEvent::KeyAdded { key, .. }
            | HostEvent::KeyRemoved { key }
            | HostEvent::KeyVisible { key, .. }
            | HostEvent::SettingsChanged { key, .. }
            | HostEvent::GetSensorList { key } => Some(key),
            HostEvent::Shutdown => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::KeyAdded { .. } => "keyAdded",
            HostEvent::KeyRemoved { .. } => "keyRemoved",
            HostEvent::KeyVisible { .. } => "keyVisible",
            HostEvent::SettingsChanged { .. } => "settingsChanged",
            HostEvent::GetSensorList { .. } => "getSensorList",
            HostEvent::Shutdown => "shutdown",
        }
    }
}

/// Messages the plugin sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostOutput {
    /// New key image as a PNG data URI
    SetImage { key: KeyId, image: String },
    SensorList { key: KeyId, sensors: Vec<SensorInfo> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_host_events() {
        let added: HostEvent = serde_json::from_value(json!({"event": "keyAdded", "key": "k1"})).unwrap();
        assert_eq!(
            added,
            HostEvent::KeyAdded {
                key: KeyId::new("k1"),
                settings: None
            }
        );

        let changed: HostEvent = serde_json::from_value(json!({
            "event": "settingsChanged",
            "key": "k1",
            "settings": {"sensorId": "cpu.load"}
        }))
        .unwrap();
        assert_eq!(changed.key().map(KeyId::as_str), Some("k1"));
        assert_eq!(changed.name(), "settingsChanged");

        let shutdown: HostEvent = serde_json::from_str(r#"{"event":"shutdown"}"#).unwrap();
        assert_eq!(shutdown, HostEvent::Shutdown);
        assert!(shutdown.key().is_none());
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        assert!(serde_json::from_str::<HostEvent>(r#"{"event":"explode","key":"k"}"#).is_err());
    }

    #[test]
    fn test_output_wire_format() {
        let out = HostOutput::SensorList {
            key: KeyId::new("k1"),
            sensors: vec![SensorInfo::new("cpu.load", "CPU Load", "%")],
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["event"], "sensorList");
        assert_eq!(json["sensors"][0]["displayName"], "CPU Load");
    }
}
