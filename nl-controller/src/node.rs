//! Controller-side proxy for a node hosted on a compute.
//!
//! The controller keeps the node description; the compute owns the running
//! instance. Every mutation goes to the compute first and is only reflected
//! locally once the compute accepted it.

use std::sync::Arc;

use compute::{ConsoleType, EmulatorType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    compute_link::Compute,
    error::{ControllerError, Result},
    ports::{PortAllocator, PortClass},
};

/// Port class a console of this type draws from. `None` consoles hold no port.
pub fn console_port_class(console_type: ConsoleType) -> Option<PortClass> {
    match console_type {
        ConsoleType::Telnet | ConsoleType::Spice => Some(PortClass::Console),
        ConsoleType::Vnc => Some(PortClass::Vnc),
        ConsoleType::None => None,
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub node_id: Option<Uuid>,
    #[serde(default)]
    pub compute_id: Option<String>,
    pub node_type: EmulatorType,
    pub name: String,
    #[serde(default)]
    pub console: Option<u16>,
    #[serde(default)]
    pub console_type: ConsoleType,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub console: Option<u16>,
    #[serde(default)]
    pub console_type: Option<ConsoleType>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub compute_id: String,
    pub project_id: Uuid,
    pub vm_id: Uuid,
    pub vm_type: EmulatorType,
    pub name: String,
    pub console: Option<u16>,
    pub console_type: ConsoleType,
    pub properties: Map<String, Value>,
}

#[derive(Clone)]
pub struct Node {
    id: Uuid,
    project_id: Uuid,
    compute: Arc<Compute>,
    emulator: EmulatorType,
    name: String,
    console: Option<u16>,
    console_type: ConsoleType,
    properties: Map<String, Value>,
}

impl Node {
    /// `console` is the port already reserved for this node, if any.
    pub fn new(
        project_id: Uuid,
        id: Uuid,
        compute: Arc<Compute>,
        spec: NodeSpec,
        console: Option<u16>,
    ) -> Self {
        Self {
            id,
            project_id,
            compute,
            emulator: spec.node_type,
            name: spec.name,
            console,
            console_type: spec.console_type,
            properties: spec.properties.unwrap_or_default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn compute(&self) -> &Arc<Compute> {
        &self.compute
    }

    pub fn console(&self) -> Option<u16> {
        self.console
    }

    pub fn console_type(&self) -> ConsoleType {
        self.console_type
    }

    pub fn console_class(&self) -> Option<PortClass> {
        console_port_class(self.console_type)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    fn vms_path(&self) -> String {
        format!("projects/{}/{}/vms", self.project_id, self.emulator)
    }

    fn vm_path(&self) -> String {
        format!("{}/{}", self.vms_path(), self.id)
    }

    /// Body of the create call: a copy of the properties with the identity
    /// fields written over it. The node itself is left untouched.
    pub fn create_payload(&self) -> Value {
        let mut payload = self.properties.clone();
        payload.insert("vm_id".to_string(), Value::from(self.id.to_string()));
        payload.insert("name".to_string(), Value::from(self.name.clone()));
        payload.insert(
            "console".to_string(),
            self.console.map(Value::from).unwrap_or(Value::Null),
        );
        payload.insert(
            "console_type".to_string(),
            serde_json::to_value(self.console_type).unwrap_or(Value::Null),
        );
        Value::Object(payload)
    }

    /// Creates the instance on the compute. The caller owns the console port
    /// and releases it when this fails.
    pub async fn create(&self) -> Result<()> {
        self.compute
            .post(&self.vms_path(), &self.create_payload())
            .await
            .map_err(|err| match err {
                ControllerError::ComputeRejected { status, body, .. } => {
                    ControllerError::RemoteCreateFailed { status, body }
                }
                other => other,
            })?;
        info!(
            "node created vm_id={} vm_type={} compute_id={} console={:?}",
            self.id,
            self.emulator,
            self.compute.id(),
            self.console
        );
        Ok(())
    }

    /// Sends the changed fields to the compute and returns the updated node.
    /// `console` is the port the node holds after the update.
    pub async fn update(&self, update: NodeUpdate, console: Option<u16>) -> Result<Node> {
        let mut updated = self.clone();
        let mut changes = Map::new();

        if let Some(name) = update.name {
            changes.insert("name".to_string(), Value::from(name.clone()));
            updated.name = name;
        }
        if let Some(console_type) = update.console_type {
            changes.insert(
                "console_type".to_string(),
                serde_json::to_value(console_type).unwrap_or(Value::Null),
            );
            updated.console_type = console_type;
        }
        if console != self.console {
            changes.insert(
                "console".to_string(),
                console.map(Value::from).unwrap_or(Value::Null),
            );
            updated.console = console;
        }
        for (key, value) in update.properties.unwrap_or_default() {
            updated.properties.insert(key.clone(), value.clone());
            changes.insert(key, value);
        }

        if changes.is_empty() {
            return Ok(updated);
        }
        self.compute
            .put(&self.vm_path(), &Value::Object(changes))
            .await
            .map_err(|err| match err {
                ControllerError::ComputeRejected { status, body, .. } => {
                    ControllerError::RemoteUpdateFailed { status, body }
                }
                other => other,
            })?;
        Ok(updated)
    }

    /// Deletes the instance on the compute. The console port goes back to
    /// `ports` whatever the compute answered.
    pub async fn delete(&self, ports: &Arc<PortAllocator>) -> Result<()> {
        let _console = self
            .console_class()
            .zip(self.console)
            .map(|(class, port)| ports.adopt(self.compute.host(), class, port));

        let result = self.compute.delete(&self.vm_path()).await;
        match result {
            Ok(_) => {
                info!(
                    "node deleted vm_id={} compute_id={}",
                    self.id,
                    self.compute.id()
                );
                Ok(())
            }
            Err(ControllerError::ComputeRejected { status, body, .. }) => {
                warn!(
                    "compute {} refused to delete node {} status={status}",
                    self.compute.id(),
                    self.id
                );
                Err(ControllerError::RemoteDeleteFailed { status, body })
            }
            Err(err) => Err(err),
        }
    }

    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            compute_id: self.compute.id().to_string(),
            project_id: self.project_id,
            vm_id: self.id,
            vm_type: self.emulator,
            name: self.name.clone(),
            console: self.console,
            console_type: self.console_type,
            properties: self.properties.clone(),
        }
    }
}
