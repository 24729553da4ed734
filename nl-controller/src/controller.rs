use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use compute::{CreateProjectRequest, UpdateProjectRequest};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    compute_link::{Compute, ComputeRecord, RegisterComputeRequest},
    error::{ControllerError, Result},
    node::{Node, NodeRecord, NodeSpec, NodeUpdate, console_port_class},
    ports::{PortAllocator, PortClass, PortReservation},
    project::{Project, ProjectRecord, ProjectStatus},
    settings::ServerSettings,
};

struct ControllerMetrics {
    started_at: Instant,
    nodes_created_total: AtomicU64,
    node_create_failures_total: AtomicU64,
    nodes_deleted_total: AtomicU64,
    projects_created_total: AtomicU64,
    projects_deleted_total: AtomicU64,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            nodes_created_total: AtomicU64::new(0),
            node_create_failures_total: AtomicU64::new(0),
            nodes_deleted_total: AtomicU64::new(0),
            projects_created_total: AtomicU64::new(0),
            projects_deleted_total: AtomicU64::new(0),
        }
    }
}

/// Owns the compute and project registries and coordinates every operation
/// that spans a project, a compute and the port allocator.
pub struct Controller {
    settings: ServerSettings,
    ports: Arc<PortAllocator>,
    computes: RwLock<BTreeMap<String, Arc<Compute>>>,
    projects: RwLock<HashMap<Uuid, Arc<Project>>>,
    metrics: ControllerMetrics,
}

impl Controller {
    pub fn new(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        let ports = PortAllocator::from_settings(&settings)?;
        Ok(Self {
            settings,
            ports: Arc::new(ports),
            computes: RwLock::new(BTreeMap::new()),
            projects: RwLock::new(HashMap::new()),
            metrics: ControllerMetrics::default(),
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.compute_rpc_timeout_ms)
    }

    pub async fn add_compute(&self, request: RegisterComputeRequest) -> Result<ComputeRecord> {
        let compute_id = request.compute_id.trim().to_string();
        if self.computes.read().await.contains_key(&compute_id) {
            return Err(ControllerError::AlreadyExists(format!("compute {compute_id}")));
        }
        let compute = Compute::connect(
            request,
            self.settings.compute_credentials(),
            self.rpc_timeout(),
        )
        .await?;

        let mut computes = self.computes.write().await;
        if computes.contains_key(compute.id()) {
            return Err(ControllerError::AlreadyExists(format!("compute {compute_id}")));
        }
        let record = compute.record();
        computes.insert(compute.id().to_string(), compute);
        Ok(record)
    }

    pub async fn list_computes(&self) -> Vec<ComputeRecord> {
        self.computes
            .read()
            .await
            .values()
            .map(|compute| compute.record())
            .collect()
    }

    pub async fn compute(&self, compute_id: &str) -> Result<Arc<Compute>> {
        self.computes
            .read()
            .await
            .get(compute_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found(format!("compute {compute_id}")))
    }

    pub async fn remove_compute(&self, compute_id: &str) -> Result<()> {
        let mut computes = self.computes.write().await;
        let compute = computes
            .get(compute_id)
            .ok_or_else(|| ControllerError::not_found(format!("compute {compute_id}")))?;
        let hosted = compute.node_count();
        if hosted > 0 {
            return Err(ControllerError::InvalidRequest(format!(
                "compute {compute_id} still hosts {hosted} node(s)"
            )));
        }
        computes.remove(compute_id);
        info!("removed compute compute_id={compute_id}");
        Ok(())
    }

    pub async fn create_project(&self, request: CreateProjectRequest) -> Result<ProjectRecord> {
        if request.name.trim().is_empty() {
            return Err(ControllerError::InvalidRequest(
                "project name cannot be empty".to_string(),
            ));
        }
        if request.path.is_some() && !self.settings.local {
            return Err(ControllerError::InvalidRequest(
                "project path can only be set when the controller runs in local mode".to_string(),
            ));
        }
        let project_id = request.project_id.unwrap_or_else(Uuid::new_v4);
        if self.projects.read().await.contains_key(&project_id) {
            return Err(ControllerError::AlreadyExists(format!("project {project_id}")));
        }
        let path = request
            .path
            .unwrap_or_else(|| self.settings.projects_path.join(project_id.to_string()));

        let project = Arc::new(
            Project::create(project_id, request.name, path, request.variables).await?,
        );
        {
            let mut projects = self.projects.write().await;
            if projects.contains_key(&project_id) {
                return Err(ControllerError::AlreadyExists(format!("project {project_id}")));
            }
            projects.insert(project_id, Arc::clone(&project));
        }
        self.metrics
            .projects_created_total
            .fetch_add(1, Ordering::Relaxed);
        info!(
            "created project project_id={project_id} path={}",
            project.path().display()
        );
        Ok(project.record().await)
    }

    pub async fn list_projects(&self) -> Vec<ProjectRecord> {
        let projects = self
            .projects
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut records = Vec::with_capacity(projects.len());
        for project in projects {
            records.push(project.record().await);
        }
        records.sort_by_key(|record| record.project_id);
        records
    }

    pub async fn project(&self, project_id: Uuid) -> Result<Arc<Project>> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found(format!("project {project_id}")))
    }

    pub async fn update_project(
        &self,
        project_id: Uuid,
        request: UpdateProjectRequest,
    ) -> Result<ProjectRecord> {
        let project = self.project(project_id).await?;
        project.update(&request).await?;
        let payload = serde_json::to_value(&request)
            .map_err(|err| ControllerError::Internal(err.to_string()))?;
        for compute in self.project_computes(&project).await {
            if let Err(err) = compute
                .put(&format!("projects/{project_id}"), &payload)
                .await
            {
                warn!(
                    "failed to update project {project_id} on compute {}: {err}",
                    compute.id()
                );
            }
        }
        Ok(project.record().await)
    }

    /// Closing keeps nodes and ports; computes are told best-effort.
    pub async fn close_project(&self, project_id: Uuid) -> Result<ProjectRecord> {
        let project = self.project(project_id).await?;
        project.set_status(ProjectStatus::Closed).await;
        for compute in self.project_computes(&project).await {
            if let Err(err) = compute
                .post(&format!("projects/{project_id}/close"), &Value::Null)
                .await
            {
                warn!(
                    "failed to close project {project_id} on compute {}: {err}",
                    compute.id()
                );
            }
        }
        info!("closed project project_id={project_id}");
        Ok(project.record().await)
    }

    pub async fn open_project(&self, project_id: Uuid) -> Result<ProjectRecord> {
        let project = self.project(project_id).await?;
        project.set_status(ProjectStatus::Opened).await;
        for compute in self.project_computes(&project).await {
            if let Err(err) = project.ensure_on_compute(&compute).await {
                warn!(
                    "failed to reopen project {project_id} on compute {}: {err}",
                    compute.id()
                );
            }
        }
        info!("opened project project_id={project_id}");
        Ok(project.record().await)
    }

    /// Removes the project and its nodes on every compute. The directory is
    /// removed only when the project created it.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<()> {
        let project = self
            .projects
            .write()
            .await
            .remove(&project_id)
            .ok_or_else(|| ControllerError::not_found(format!("project {project_id}")))?;

        for node in project.seal().await {
            node.compute().node_removed();
            self.metrics
                .nodes_deleted_total
                .fetch_add(1, Ordering::Relaxed);
            if let Err(err) = node.delete(&self.ports).await {
                warn!(
                    "failed to delete node {} of project {project_id}: {err}",
                    node.id()
                );
            }
        }
        for compute in self.project_computes(&project).await {
            if let Err(err) = compute.delete(&format!("projects/{project_id}")).await {
                warn!(
                    "failed to delete project {project_id} on compute {}: {err}",
                    compute.id()
                );
            }
        }
        if project.owns_root() {
            match tokio::fs::remove_dir_all(project.path()).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "failed to remove project directory {}: {err}",
                    project.path().display()
                ),
            }
        } else {
            info!(
                "kept pre-existing project directory {}",
                project.path().display()
            );
        }
        self.metrics
            .projects_deleted_total
            .fetch_add(1, Ordering::Relaxed);
        info!("deleted project project_id={project_id}");
        Ok(())
    }

    async fn project_computes(&self, project: &Project) -> Vec<Arc<Compute>> {
        let computes = self.computes.read().await;
        project
            .compute_ids()
            .await
            .iter()
            .filter_map(|compute_id| computes.get(compute_id).cloned())
            .collect()
    }

    pub async fn create_node(&self, project_id: Uuid, spec: NodeSpec) -> Result<NodeRecord> {
        let result = self.place_node(project_id, spec).await;
        let counter = match result {
            Ok(_) => &self.metrics.nodes_created_total,
            Err(_) => &self.metrics.node_create_failures_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn place_node(&self, project_id: Uuid, spec: NodeSpec) -> Result<NodeRecord> {
        let project = self.project(project_id).await?;
        project.ensure_open().await?;
        if spec.name.trim().is_empty() {
            return Err(ControllerError::InvalidRequest(
                "node name cannot be empty".to_string(),
            ));
        }
        if console_port_class(spec.console_type).is_none() && spec.console.is_some() {
            return Err(ControllerError::InvalidRequest(
                "a node without a console cannot take a console port".to_string(),
            ));
        }

        let node_id = spec.node_id.unwrap_or_else(Uuid::new_v4);
        let claim = project.claim_node_id(node_id).await?;
        let compute = self.select_compute(&spec).await?;

        // Dropping the reservation on any early return gives the port back.
        let reservation = console_port_class(spec.console_type)
            .map(|class| {
                self.ports
                    .reserve_guarded(compute.host(), class, spec.console)
            })
            .transpose()?;

        project.ensure_on_compute(&compute).await?;
        let node = Node::new(
            project_id,
            node_id,
            Arc::clone(&compute),
            spec,
            reservation.as_ref().map(PortReservation::port),
        );
        node.create().await?;

        let record = node.record();
        let committed = claim.commit(node).await;
        // From here the port belongs to the node, or to the delete below.
        if let Some(reservation) = reservation {
            reservation.commit();
        }
        match committed {
            Ok(()) => Ok(record),
            Err(orphan) => {
                warn!(
                    "project {project_id} was deleted while node {node_id} was created; removing it from compute {}",
                    compute.id()
                );
                if let Err(err) = orphan.delete(&self.ports).await {
                    warn!("failed to remove node {node_id} of deleted project {project_id}: {err}");
                }
                if let Err(err) = compute.delete(&format!("projects/{project_id}")).await {
                    warn!(
                        "failed to delete project {project_id} on compute {}: {err}",
                        compute.id()
                    );
                }
                Err(ControllerError::not_found(format!("project {project_id}")))
            }
        }
    }

    async fn select_compute(&self, spec: &NodeSpec) -> Result<Arc<Compute>> {
        if let Some(compute_id) = &spec.compute_id {
            let compute = self.compute(compute_id).await?;
            if !compute.supports(spec.node_type) {
                return Err(ControllerError::UnsupportedEmulatorType {
                    compute_id: compute_id.clone(),
                    emulator: spec.node_type.to_string(),
                });
            }
            if !compute.is_connected() && !compute.refresh().await {
                return Err(ControllerError::ComputeUnreachable {
                    compute_id: compute_id.clone(),
                    message: "compute is disconnected".to_string(),
                });
            }
            return Ok(compute);
        }

        let computes = self.computes.read().await;
        if let Some(compute) = self
            .settings
            .placement
            .select(computes.values(), spec.node_type)
        {
            return Ok(compute);
        }
        if computes.values().any(|compute| compute.is_connected()) {
            Err(ControllerError::UnsupportedEmulatorType {
                compute_id: "(any connected)".to_string(),
                emulator: spec.node_type.to_string(),
            })
        } else {
            Err(ControllerError::ComputeUnreachable {
                compute_id: "(none)".to_string(),
                message: "no compute is connected".to_string(),
            })
        }
    }

    pub async fn list_nodes(&self, project_id: Uuid) -> Result<Vec<NodeRecord>> {
        let project = self.project(project_id).await?;
        Ok(project
            .nodes()
            .await
            .iter()
            .map(Node::record)
            .collect())
    }

    pub async fn node(&self, project_id: Uuid, node_id: Uuid) -> Result<NodeRecord> {
        let project = self.project(project_id).await?;
        Ok(project.node(node_id).await?.record())
    }

    /// Updates a node on its compute. A console change reserves the new port
    /// first and gives the old one back only once the compute accepted it.
    pub async fn update_node(
        &self,
        project_id: Uuid,
        node_id: Uuid,
        update: NodeUpdate,
    ) -> Result<NodeRecord> {
        let project = self.project(project_id).await?;
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(ControllerError::InvalidRequest(
                    "node name cannot be empty".to_string(),
                ));
            }
        }
        let _op = project.lock_node(node_id).await?;
        let current = project.node(node_id).await?;
        let host = current.compute().host().to_string();

        let new_class =
            console_port_class(update.console_type.unwrap_or(current.console_type()));
        if new_class.is_none() && update.console.is_some() {
            return Err(ControllerError::InvalidRequest(
                "a node without a console cannot take a console port".to_string(),
            ));
        }
        let moves_port = new_class != current.console_class()
            || (update.console.is_some() && update.console != current.console());
        let reservation = match new_class {
            Some(class) if moves_port => {
                Some(self.ports.reserve_guarded(&host, class, update.console)?)
            }
            _ => None,
        };
        let console = if moves_port {
            reservation.as_ref().map(PortReservation::port)
        } else {
            current.console()
        };

        let updated = current.update(update, console).await?;
        if !project.replace_node(updated.clone()).await {
            return Err(ControllerError::not_found(format!("node {node_id}")));
        }
        if moves_port {
            if let Some(reservation) = reservation {
                reservation.commit();
            }
            if let Some((class, port)) = current.console_class().zip(current.console()) {
                self.ports.release(&host, class, port);
            }
        }
        Ok(updated.record())
    }

    /// The node leaves the project and its port is released even when the
    /// compute fails the delete; that failure is still reported.
    pub async fn delete_node(&self, project_id: Uuid, node_id: Uuid) -> Result<()> {
        let project = self.project(project_id).await?;
        let _op = project.lock_node(node_id).await?;
        let node = project
            .remove_node(node_id)
            .await
            .ok_or_else(|| ControllerError::not_found(format!("node {node_id}")))?;
        node.compute().node_removed();
        self.metrics
            .nodes_deleted_total
            .fetch_add(1, Ordering::Relaxed);
        node.delete(&self.ports).await
    }

    pub async fn read_project_file(&self, project_id: Uuid, file_path: &str) -> Result<Vec<u8>> {
        self.project(project_id).await?.read_file(file_path).await
    }

    pub async fn write_project_file(
        &self,
        project_id: Uuid,
        file_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.project(project_id)
            .await?
            .write_file(file_path, contents)
            .await
    }

    pub async fn render_metrics(&self) -> String {
        let (computes, connected) = {
            let computes = self.computes.read().await;
            let connected = computes
                .values()
                .filter(|compute| compute.is_connected())
                .count();
            (computes.len(), connected)
        };
        let projects = self
            .projects
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut nodes = 0usize;
        for project in &projects {
            nodes += project.nodes().await.len();
        }

        let mut out = format!(
            concat!(
                "nl_controller_uptime_seconds {}\n",
                "nl_controller_computes {}\n",
                "nl_controller_computes_connected {}\n",
                "nl_controller_projects {}\n",
                "nl_controller_nodes {}\n",
                "nl_controller_projects_created_total {}\n",
                "nl_controller_projects_deleted_total {}\n",
                "nl_controller_nodes_created_total {}\n",
                "nl_controller_node_create_failures_total {}\n",
                "nl_controller_nodes_deleted_total {}\n"
            ),
            self.metrics.started_at.elapsed().as_secs(),
            computes,
            connected,
            projects.len(),
            nodes,
            self.metrics
                .projects_created_total
                .load(Ordering::Relaxed),
            self.metrics
                .projects_deleted_total
                .load(Ordering::Relaxed),
            self.metrics.nodes_created_total.load(Ordering::Relaxed),
            self.metrics
                .node_create_failures_total
                .load(Ordering::Relaxed),
            self.metrics.nodes_deleted_total.load(Ordering::Relaxed),
        );
        for class in PortClass::ALL {
            let _ = writeln!(
                out,
                "nl_controller_reserved_ports{{class=\"{class}\"}} {}",
                self.ports.reserved_total(class)
            );
        }
        out
    }
}
