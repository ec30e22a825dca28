use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One control-plane push: the full configuration of every workspace this
/// process serves, keyed by workspace id.
pub type ControlPlaneSnapshot = HashMap<String, WorkspaceConfig>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub connection_flags: ConnectionFlags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionFlags {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub services: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub source_definition: SourceDefinition,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Free-form destination configuration as pushed by the control plane
    /// (namespace, syncFrequency, useSSH, sslMode, ...).
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub destination_definition: DestinationDefinition,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationDefinition {
    #[serde(default)]
    pub name: String,
}

impl Destination {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.config
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_deserializes_with_missing_fields() {
        let raw = r#"{
            "ws-1": {
                "sources": [{
                    "id": "src-1",
                    "name": "shop events",
                    "enabled": true,
                    "destinations": [{
                        "id": "dst-1",
                        "name": "analytics pg",
                        "enabled": true,
                        "config": {"namespace": "analytics", "useSSH": true},
                        "destination_definition": {"name": "POSTGRES"}
                    }]
                }]
            }
        }"#;

        let snapshot: ControlPlaneSnapshot = serde_json::from_str(raw).unwrap();
        let ws = &snapshot["ws-1"];
        let dest = &ws.sources[0].destinations[0];
        assert_eq!(dest.destination_definition.name, "POSTGRES");
        assert_eq!(dest.config_str("namespace"), Some("analytics"));
        assert!(dest.config_bool("useSSH"));
        assert!(!dest.config_bool("missing"));
    }
}
