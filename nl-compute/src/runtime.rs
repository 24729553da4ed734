use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{Response, StatusCode},
    middleware::{self, Next},
    routing::{get, post},
};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ComputeError,
    file_guard::ProjectFileGuard,
    logging::{category_access, category_node, category_project, method_label, status_label},
    wire::{
        CapabilitiesResponse, ComputeNodeRecord, ComputeProjectRecord, ConsoleType,
        CreateProjectRequest, EmulatorType, NodeDefinition, ProjectVariable,
        UpdateProjectRequest, VersionResponse,
    },
};

#[derive(Clone, Debug)]
pub struct ComputeConfig {
    pub compute_id: String,
    pub projects_path: PathBuf,
    pub emulators: Vec<EmulatorType>,
    /// Accept client-supplied project paths. Only for a compute that shares
    /// its filesystem with the client.
    pub local: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            compute_id: "local".to_string(),
            projects_path: PathBuf::from(".nl-compute/projects"),
            emulators: EmulatorType::ALL.to_vec(),
            local: false,
        }
    }
}

#[derive(Clone)]
pub struct SharedState {
    store: Arc<RwLock<ComputeStore>>,
    config: Arc<ComputeConfig>,
}

#[derive(Default)]
struct ComputeStore {
    projects: HashMap<Uuid, ComputeProject>,
}

struct ComputeProject {
    project_id: Uuid,
    name: String,
    variables: Option<Vec<ProjectVariable>>,
    closed: bool,
    files: ProjectFileGuard,
    owns_root: bool,
    nodes: HashMap<Uuid, ComputeNodeRecord>,
}

impl ComputeProject {
    fn to_record(&self) -> ComputeProjectRecord {
        ComputeProjectRecord {
            project_id: self.project_id,
            name: self.name.clone(),
            variables: self.variables.clone(),
            closed: self.closed,
        }
    }
}

impl SharedState {
    pub fn new(config: ComputeConfig) -> Self {
        Self {
            store: Arc::new(RwLock::new(ComputeStore::default())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Opening an id that is already known reopens it and returns the
    /// existing project, so the controller can call this before every node
    /// placement without tracking what the compute has seen.
    pub async fn create_project(
        &self,
        request: CreateProjectRequest,
    ) -> Result<ComputeProjectRecord, ComputeError> {
        if request.name.trim().is_empty() {
            return Err(ComputeError::InvalidRequest(
                "project name cannot be empty".to_string(),
            ));
        }
        if request.path.is_some() && !self.config.local {
            return Err(ComputeError::InvalidRequest(
                "project path can only be set on a local compute".to_string(),
            ));
        }
        let project_id = request.project_id.unwrap_or_else(Uuid::new_v4);
        let mut guard = self.store.write().await;
        if let Some(existing) = guard.projects.get_mut(&project_id) {
            existing.closed = false;
            return Ok(existing.to_record());
        }

        let path = request
            .path
            .unwrap_or_else(|| self.config.projects_path.join(project_id.to_string()));
        let files = ProjectFileGuard::new(path.clone());
        let owns_root = files.create_root().await?;
        let project = ComputeProject {
            project_id,
            name: request.name.trim().to_string(),
            variables: request.variables,
            closed: false,
            files,
            owns_root,
            nodes: HashMap::new(),
        };
        let record = project.to_record();
        guard.projects.insert(project_id, project);
        info!(
            "{} opened project project_id={project_id} path={}",
            category_project(),
            path.display()
        );
        Ok(record)
    }

    pub async fn list_projects(&self) -> Vec<ComputeProjectRecord> {
        let guard = self.store.read().await;
        let mut projects = guard
            .projects
            .values()
            .map(ComputeProject::to_record)
            .collect::<Vec<_>>();
        projects.sort_by(|lhs, rhs| {
            lhs.name
                .cmp(&rhs.name)
                .then(lhs.project_id.cmp(&rhs.project_id))
        });
        projects
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<ComputeProjectRecord, ComputeError> {
        let guard = self.store.read().await;
        guard
            .projects
            .get(&project_id)
            .map(ComputeProject::to_record)
            .ok_or(ComputeError::ProjectNotFound(project_id))
    }

    pub async fn update_project(
        &self,
        project_id: Uuid,
        request: UpdateProjectRequest,
    ) -> Result<ComputeProjectRecord, ComputeError> {
        let mut guard = self.store.write().await;
        let project = guard
            .projects
            .get_mut(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(ComputeError::InvalidRequest(
                    "project name cannot be empty".to_string(),
                ));
            }
            project.name = name.trim().to_string();
        }
        if let Some(variables) = request.variables {
            project.variables = Some(variables);
        }
        Ok(project.to_record())
    }

    pub async fn close_project(&self, project_id: Uuid) -> Result<(), ComputeError> {
        let mut guard = self.store.write().await;
        let project = guard
            .projects
            .get_mut(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        project.closed = true;
        info!("{} closed project project_id={project_id}", category_project());
        Ok(())
    }

    pub async fn delete_project(&self, project_id: Uuid) -> Result<(), ComputeError> {
        let project = {
            let mut guard = self.store.write().await;
            guard
                .projects
                .remove(&project_id)
                .ok_or(ComputeError::ProjectNotFound(project_id))?
        };
        if project.owns_root {
            match tokio::fs::remove_dir_all(project.files.root()).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        "{} failed to remove project directory project_id={project_id} err={err}",
                        category_project()
                    );
                }
            }
        } else {
            info!(
                "{} kept pre-existing project directory project_id={project_id} path={}",
                category_project(),
                project.files.root().display()
            );
        }
        info!("{} deleted project project_id={project_id}", category_project());
        Ok(())
    }

    pub async fn read_file(&self, project_id: Uuid, file_path: &str) -> Result<Vec<u8>, ComputeError> {
        let files = self.project_files(project_id).await?;
        Ok(files.read(file_path).await?)
    }

    pub async fn write_file(
        &self,
        project_id: Uuid,
        file_path: &str,
        contents: &[u8],
    ) -> Result<(), ComputeError> {
        let files = self.project_files(project_id).await?;
        Ok(files.write(file_path, contents).await?)
    }

    async fn project_files(&self, project_id: Uuid) -> Result<ProjectFileGuard, ComputeError> {
        let guard = self.store.read().await;
        guard
            .projects
            .get(&project_id)
            .map(|project| project.files.clone())
            .ok_or(ComputeError::ProjectNotFound(project_id))
    }

    pub async fn create_node(
        &self,
        project_id: Uuid,
        vm_type: &str,
        definition: NodeDefinition,
    ) -> Result<ComputeNodeRecord, ComputeError> {
        let vm_type = self.enabled_emulator(vm_type)?;
        let mut guard = self.store.write().await;
        let project = guard
            .projects
            .get_mut(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        if project.nodes.contains_key(&definition.vm_id) {
            return Err(ComputeError::NodeAlreadyExists(definition.vm_id));
        }
        let record = ComputeNodeRecord {
            project_id,
            vm_type,
            definition,
        };
        project
            .nodes
            .insert(record.definition.vm_id, record.clone());
        info!(
            "{} defined node vm_id={} vm_type={vm_type} project_id={project_id} console={:?}",
            category_node(),
            record.definition.vm_id,
            record.definition.console
        );
        Ok(record)
    }

    pub async fn get_node(
        &self,
        project_id: Uuid,
        vm_type: &str,
        vm_id: Uuid,
    ) -> Result<ComputeNodeRecord, ComputeError> {
        let vm_type = self.enabled_emulator(vm_type)?;
        let guard = self.store.read().await;
        let project = guard
            .projects
            .get(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        project
            .nodes
            .get(&vm_id)
            .filter(|record| record.vm_type == vm_type)
            .cloned()
            .ok_or(ComputeError::NodeNotFound(vm_id))
    }

    /// Applies a partial update. `name`, `console` and `console_type` update
    /// the identity fields; every other key replaces an emulator property.
    pub async fn update_node(
        &self,
        project_id: Uuid,
        vm_type: &str,
        vm_id: Uuid,
        changes: Map<String, Value>,
    ) -> Result<ComputeNodeRecord, ComputeError> {
        let vm_type = self.enabled_emulator(vm_type)?;
        let mut guard = self.store.write().await;
        let project = guard
            .projects
            .get_mut(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        let record = project
            .nodes
            .get_mut(&vm_id)
            .filter(|record| record.vm_type == vm_type)
            .ok_or(ComputeError::NodeNotFound(vm_id))?;

        let mut updated = record.definition.clone();
        for (key, value) in changes {
            match key.as_str() {
                "vm_id" => {}
                "name" => updated.name = decode_field(&key, value)?,
                "console" => updated.console = decode_field(&key, value)?,
                "console_type" => {
                    updated.console_type = decode_field::<ConsoleType>(&key, value)?;
                }
                _ => {
                    updated.properties.insert(key, value);
                }
            }
        }
        record.definition = updated;
        Ok(record.clone())
    }

    pub async fn delete_node(
        &self,
        project_id: Uuid,
        vm_type: &str,
        vm_id: Uuid,
    ) -> Result<(), ComputeError> {
        let vm_type = self.enabled_emulator(vm_type)?;
        let mut guard = self.store.write().await;
        let project = guard
            .projects
            .get_mut(&project_id)
            .ok_or(ComputeError::ProjectNotFound(project_id))?;
        match project.nodes.get(&vm_id) {
            Some(record) if record.vm_type == vm_type => {
                project.nodes.remove(&vm_id);
                info!(
                    "{} removed node vm_id={vm_id} project_id={project_id}",
                    category_node()
                );
                Ok(())
            }
            _ => Err(ComputeError::NodeNotFound(vm_id)),
        }
    }

    fn enabled_emulator(&self, raw: &str) -> Result<EmulatorType, ComputeError> {
        raw.parse::<EmulatorType>()
            .ok()
            .filter(|kind| self.config.emulators.contains(kind))
            .ok_or_else(|| ComputeError::UnsupportedEmulatorType(raw.to_string()))
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(key: &str, value: Value) -> Result<T, ComputeError> {
    serde_json::from_value(value)
        .map_err(|err| ComputeError::InvalidRequest(format!("invalid {key}: {err}")))
}

pub fn build_compute_app(state: SharedState) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .route("/capabilities", get(capabilities_handler))
        .route(
            "/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route(
            "/projects/{project_id}",
            get(get_project_handler)
                .put(update_project_handler)
                .delete(delete_project_handler),
        )
        .route("/projects/{project_id}/close", post(close_project_handler))
        .route(
            "/projects/{project_id}/files/{*file_path}",
            get(read_file_handler).post(write_file_handler),
        )
        .route(
            "/projects/{project_id}/{vm_type}/vms",
            post(create_node_handler),
        )
        .route(
            "/projects/{project_id}/{vm_type}/vms/{vm_id}",
            get(get_node_handler)
                .put(update_node_handler)
                .delete(delete_node_handler),
        )
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

async fn version_handler(State(state): State<SharedState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        compute_id: state.config.compute_id.clone(),
    })
}

async fn capabilities_handler(State(state): State<SharedState>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        compute_id: state.config.compute_id.clone(),
        emulators: state.config.emulators.clone(),
    })
}

async fn list_projects_handler(State(state): State<SharedState>) -> Json<Vec<ComputeProjectRecord>> {
    Json(state.list_projects().await)
}

async fn create_project_handler(
    State(state): State<SharedState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ComputeProjectRecord>), ComputeError> {
    let record = state.create_project(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_project_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ComputeProjectRecord>, ComputeError> {
    Ok(Json(state.get_project(project_id).await?))
}

async fn update_project_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<UpdateProjectRequest>,
) -> Result<Json<ComputeProjectRecord>, ComputeError> {
    Ok(Json(state.update_project(project_id, request).await?))
}

async fn close_project_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
) -> Result<StatusCode, ComputeError> {
    state.close_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_project_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
) -> Result<StatusCode, ComputeError> {
    state.delete_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_file_handler(
    State(state): State<SharedState>,
    Path((project_id, file_path)): Path<(Uuid, String)>,
) -> Result<Vec<u8>, ComputeError> {
    state.read_file(project_id, &file_path).await
}

async fn write_file_handler(
    State(state): State<SharedState>,
    Path((project_id, file_path)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<StatusCode, ComputeError> {
    state.write_file(project_id, &file_path, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_node_handler(
    State(state): State<SharedState>,
    Path((project_id, vm_type)): Path<(Uuid, String)>,
    Json(definition): Json<NodeDefinition>,
) -> Result<(StatusCode, Json<ComputeNodeRecord>), ComputeError> {
    let record = state.create_node(project_id, &vm_type, definition).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_node_handler(
    State(state): State<SharedState>,
    Path((project_id, vm_type, vm_id)): Path<(Uuid, String, Uuid)>,
) -> Result<Json<ComputeNodeRecord>, ComputeError> {
    Ok(Json(state.get_node(project_id, &vm_type, vm_id).await?))
}

async fn update_node_handler(
    State(state): State<SharedState>,
    Path((project_id, vm_type, vm_id)): Path<(Uuid, String, Uuid)>,
    Json(changes): Json<Map<String, Value>>,
) -> Result<Json<ComputeNodeRecord>, ComputeError> {
    Ok(Json(
        state
            .update_node(project_id, &vm_type, vm_id, changes)
            .await?,
    ))
}

async fn delete_node_handler(
    State(state): State<SharedState>,
    Path((project_id, vm_type, vm_id)): Path<(Uuid, String, Uuid)>,
) -> Result<StatusCode, ComputeError> {
    state.delete_node(project_id, &vm_type, vm_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn access_log_middleware(request: Request, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis();

    info!(
        "{} {} {} {} {}ms",
        category_access(),
        method_label(method.as_str()),
        status_label(response.status().as_u16()),
        uri,
        elapsed_ms
    );

    response
}
