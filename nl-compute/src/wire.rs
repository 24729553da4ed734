use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Emulator backends a compute may host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorType {
    Vpcs,
    Dynamips,
    Iou,
    Qemu,
    Virtualbox,
    Vmware,
    Docker,
}

impl EmulatorType {
    pub const ALL: [EmulatorType; 7] = [
        EmulatorType::Vpcs,
        EmulatorType::Dynamips,
        EmulatorType::Iou,
        EmulatorType::Qemu,
        EmulatorType::Virtualbox,
        EmulatorType::Vmware,
        EmulatorType::Docker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmulatorType::Vpcs => "vpcs",
            EmulatorType::Dynamips => "dynamips",
            EmulatorType::Iou => "iou",
            EmulatorType::Qemu => "qemu",
            EmulatorType::Virtualbox => "virtualbox",
            EmulatorType::Vmware => "vmware",
            EmulatorType::Docker => "docker",
        }
    }
}

impl fmt::Display for EmulatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmulatorType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EmulatorType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| format!("unknown emulator type: {value}"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    #[default]
    Telnet,
    Vnc,
    Spice,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub variables: Option<Vec<ProjectVariable>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Option<Vec<ProjectVariable>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputeProjectRecord {
    pub project_id: Uuid,
    pub name: String,
    pub variables: Option<Vec<ProjectVariable>>,
    pub closed: bool,
}

/// Body of a node creation request as a compute receives it: the
/// emulator-specific properties with the node identity fields on top.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub vm_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub console: Option<u16>,
    #[serde(default)]
    pub console_type: ConsoleType,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputeNodeRecord {
    pub project_id: Uuid,
    pub vm_type: EmulatorType,
    #[serde(flatten)]
    pub definition: NodeDefinition,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub compute_id: String,
    pub emulators: Vec<EmulatorType>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub compute_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_type_parses_wire_names() {
        for kind in EmulatorType::ALL {
            assert_eq!(kind.as_str().parse::<EmulatorType>(), Ok(kind));
        }
        assert!("bhyve".parse::<EmulatorType>().is_err());
    }

    #[test]
    fn node_definition_keeps_properties_next_to_identity() {
        let raw = serde_json::json!({
            "vm_id": "6b7a1c37-08fa-4c39-9f07-8a3c8c2e6e0d",
            "name": "PC1",
            "console": 5000,
            "console_type": "telnet",
            "startup_script": "ip 10.0.0.1/24"
        });
        let definition: NodeDefinition =
            serde_json::from_value(raw).expect("definition should decode");
        assert_eq!(definition.name, "PC1");
        assert_eq!(definition.console, Some(5000));
        assert_eq!(
            definition.properties.get("startup_script"),
            Some(&Value::from("ip 10.0.0.1/24"))
        );
        assert!(!definition.properties.contains_key("vm_id"));
    }
}
