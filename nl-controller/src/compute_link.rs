use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use compute::{CapabilitiesResponse, EmulatorType, VersionResponse};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ControllerError, Result},
    settings::ServerProtocol,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeStatus {
    Connected,
    Disconnected,
}

/// HTTP transport to one compute. Every call carries the configured
/// timeout and is attempted exactly once.
#[derive(Clone)]
pub struct ComputeLink {
    compute_id: String,
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    credentials: Option<(String, String)>,
}

impl ComputeLink {
    pub fn new(
        compute_id: &str,
        protocol: ServerProtocol,
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        if timeout.is_zero() {
            return Err(ControllerError::InvalidConfiguration(
                "compute RPC timeout must be greater than 0".to_string(),
            ));
        }
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let base_url = Url::parse(&format!("{}://{authority}/", protocol.scheme())).map_err(
            |err| ControllerError::InvalidRequest(format!("invalid compute address {authority}: {err}")),
        )?;
        Ok(Self {
            compute_id: compute_id.to_string(),
            client: reqwest::Client::new(),
            base_url,
            timeout,
            credentials,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let response = self.send(Method::GET, path, Body::Empty).await?;
        self.json_body(response).await
    }

    pub async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        let response = self.send(Method::POST, path, Body::Json(payload)).await?;
        self.json_body(response).await
    }

    pub async fn put(&self, path: &str, payload: &Value) -> Result<Value> {
        let response = self.send(Method::PUT, path, Body::Json(payload)).await?;
        self.json_body(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        let response = self.send(Method::DELETE, path, Body::Empty).await?;
        self.json_body(response).await
    }

    pub async fn version(&self) -> Result<VersionResponse> {
        self.get_as("version").await
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesResponse> {
        self.get_as("capabilities").await
    }

    async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        serde_json::from_value(value).map_err(|err| ControllerError::ComputeRejected {
            compute_id: self.compute_id.clone(),
            status: 200,
            body: format!("unexpected {path} payload: {err}"),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Body<'_>) -> Result<Response> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ControllerError::InvalidRequest(format!("invalid compute path {path}: {err}")))?;
        debug!("compute {} {method} {url}", self.compute_id);

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .timeout(self.timeout);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        request = match body {
            Body::Empty => request,
            Body::Json(payload) => request.json(payload),
        };

        let response = request.send().await.map_err(|err| self.unreachable(&err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "compute {} rejected {method} {url} status={}",
                self.compute_id,
                status.as_u16()
            );
            return Err(ControllerError::ComputeRejected {
                compute_id: self.compute_id.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json_body(&self, response: Response) -> Result<Value> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.unreachable(&err))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| ControllerError::ComputeRejected {
            compute_id: self.compute_id.clone(),
            status,
            body: format!("response is not JSON: {err}"),
        })
    }

    fn unreachable(&self, err: &reqwest::Error) -> ControllerError {
        let message = if err.is_timeout() {
            format!("timed out after {}ms", self.timeout.as_millis())
        } else {
            err.to_string()
        };
        ControllerError::ComputeUnreachable {
            compute_id: self.compute_id.clone(),
            message,
        }
    }
}

enum Body<'a> {
    Empty,
    Json(&'a Value),
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegisterComputeRequest {
    pub compute_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ServerProtocol,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<EmulatorType>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComputeRecord {
    pub compute_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: ServerProtocol,
    pub status: ComputeStatus,
    pub capabilities: Vec<EmulatorType>,
    pub node_count: usize,
}

/// A registered compute. Identity and capabilities are fixed at
/// registration; only the connection state moves afterwards.
pub struct Compute {
    id: String,
    host: String,
    port: u16,
    protocol: ServerProtocol,
    capabilities: Vec<EmulatorType>,
    connected: AtomicBool,
    node_count: AtomicUsize,
    link: ComputeLink,
}

impl Compute {
    /// Builds the compute and probes it. An unreachable compute is still
    /// registered, as disconnected, with whatever capabilities were declared.
    pub async fn connect(
        request: RegisterComputeRequest,
        default_credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let compute_id = request.compute_id.trim().to_string();
        if compute_id.is_empty() {
            return Err(ControllerError::InvalidRequest(
                "compute_id cannot be empty".to_string(),
            ));
        }
        if request.port == 0 {
            return Err(ControllerError::InvalidRequest(format!(
                "compute {compute_id} needs a port greater than 0"
            )));
        }
        let credentials = match (request.user, request.password) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => default_credentials,
            (Some(user), None) => Some((user, String::new())),
            (None, Some(_)) => {
                return Err(ControllerError::InvalidRequest(
                    "compute password given without a user".to_string(),
                ));
            }
        };
        let link = ComputeLink::new(
            &compute_id,
            request.protocol,
            &request.host,
            request.port,
            credentials,
            timeout,
        )?;

        let (connected, capabilities) = match probe(&link).await {
            Ok(probed) => (true, request.capabilities.unwrap_or(probed)),
            Err(err) => {
                warn!("compute {compute_id} registered while unreachable: {err}");
                (false, request.capabilities.unwrap_or_default())
            }
        };
        info!(
            "registered compute compute_id={compute_id} url={} connected={connected} capabilities={}",
            link.base_url(),
            capabilities
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        Ok(Arc::new(Self {
            id: compute_id,
            host: request.host,
            port: request.port,
            protocol: request.protocol,
            capabilities,
            connected: AtomicBool::new(connected),
            node_count: AtomicUsize::new(0),
            link,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn supports(&self, emulator: EmulatorType) -> bool {
        self.capabilities.contains(&emulator)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ComputeStatus {
        if self.is_connected() {
            ComputeStatus::Connected
        } else {
            ComputeStatus::Disconnected
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    pub(crate) fn node_added(&self) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn node_removed(&self) {
        let _ = self
            .node_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    pub fn record(&self) -> ComputeRecord {
        ComputeRecord {
            compute_id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
            status: self.status(),
            capabilities: self.capabilities.clone(),
            node_count: self.node_count(),
        }
    }

    pub async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        self.observe(self.link.post(path, payload).await)
    }

    pub async fn put(&self, path: &str, payload: &Value) -> Result<Value> {
        self.observe(self.link.put(path, payload).await)
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.observe(self.link.delete(path).await)
    }

    /// Probes `/version` and returns whether the compute answered.
    pub async fn refresh(&self) -> bool {
        let _ = self.observe(self.link.version().await);
        self.is_connected()
    }

    /// Any answer from the compute, even a rejection, means it is reachable.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        let reachable = !matches!(result, Err(ControllerError::ComputeUnreachable { .. }));
        let was_connected = self.connected.swap(reachable, Ordering::AcqRel);
        if was_connected != reachable {
            if reachable {
                info!("compute {} connected", self.id);
            } else {
                warn!("compute {} disconnected", self.id);
            }
        }
        result
    }
}

#[cfg(test)]
impl Compute {
    pub(crate) fn detached(id: &str, capabilities: Vec<EmulatorType>) -> Arc<Self> {
        let link = ComputeLink::new(
            id,
            ServerProtocol::Http,
            "127.0.0.1",
            9,
            None,
            Duration::from_millis(200),
        )
        .expect("link should build");
        Arc::new(Self {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
            protocol: ServerProtocol::Http,
            capabilities,
            connected: AtomicBool::new(true),
            node_count: AtomicUsize::new(0),
            link,
        })
    }
}

async fn probe(link: &ComputeLink) -> Result<Vec<EmulatorType>> {
    let version = link.version().await?;
    debug!(
        "compute {} answered version={}",
        version.compute_id, version.version
    );
    Ok(link.capabilities().await?.emulators)
}
