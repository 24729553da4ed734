use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use compute::{CreateProjectRequest, ProjectFileGuard, ProjectVariable, UpdateProjectRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::{
    compute_link::Compute,
    error::{ControllerError, Result},
    node::Node,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Opened,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub status: ProjectStatus,
    pub variables: Option<Vec<ProjectVariable>>,
    pub node_ids: Vec<Uuid>,
    pub link_ids: Vec<Uuid>,
}

struct ProjectMeta {
    name: String,
    status: ProjectStatus,
    variables: Option<Vec<ProjectVariable>>,
    link_ids: Vec<Uuid>,
}

struct NodeEntry {
    node: Node,
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

/// A project and the nodes it owns. The root directory is fixed when the
/// project is built and every file access goes through its guard.
pub struct Project {
    id: Uuid,
    files: ProjectFileGuard,
    owns_root: bool,
    /// Written only under the node table write lock.
    deleted: AtomicBool,
    meta: RwLock<ProjectMeta>,
    nodes: RwLock<HashMap<Uuid, NodeEntry>>,
    pending: Mutex<HashSet<Uuid>>,
    computes: RwLock<BTreeSet<String>>,
}

impl Project {
    pub fn new(
        id: Uuid,
        name: String,
        path: PathBuf,
        variables: Option<Vec<ProjectVariable>>,
    ) -> Self {
        Self {
            id,
            files: ProjectFileGuard::new(path),
            owns_root: false,
            deleted: AtomicBool::new(false),
            meta: RwLock::new(ProjectMeta {
                name,
                status: ProjectStatus::Opened,
                variables,
                link_ids: Vec::new(),
            }),
            nodes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            computes: RwLock::new(BTreeSet::new()),
        }
    }

    /// Builds the project and creates its root directory. The project owns
    /// the directory only when it did not exist before.
    pub async fn create(
        id: Uuid,
        name: String,
        path: PathBuf,
        variables: Option<Vec<ProjectVariable>>,
    ) -> Result<Self> {
        let mut project = Self::new(id, name, path, variables);
        let owns_root = project.files.create_root().await.map_err(|err| {
            ControllerError::Internal(format!(
                "failed to create project directory {}: {err}",
                project.path().display()
            ))
        })?;
        project.owns_root = owns_root;
        Ok(project)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owns_root(&self) -> bool {
        self.owns_root
    }

    pub fn path(&self) -> &Path {
        self.files.root()
    }

    pub async fn record(&self) -> ProjectRecord {
        let mut node_ids = self.nodes.read().await.keys().copied().collect::<Vec<_>>();
        node_ids.sort_unstable();
        let meta = self.meta.read().await;
        ProjectRecord {
            project_id: self.id,
            name: meta.name.clone(),
            path: self.path().to_path_buf(),
            status: meta.status,
            variables: meta.variables.clone(),
            node_ids,
            link_ids: meta.link_ids.clone(),
        }
    }

    pub async fn status(&self) -> ProjectStatus {
        self.meta.read().await.status
    }

    pub async fn set_status(&self, status: ProjectStatus) {
        self.meta.write().await.status = status;
    }

    pub async fn ensure_open(&self) -> Result<()> {
        match self.status().await {
            ProjectStatus::Opened => Ok(()),
            ProjectStatus::Closed => Err(ControllerError::ProjectClosed(self.id.to_string())),
        }
    }

    /// Applies a name or variables change. Absent fields are left as they are.
    pub async fn update(&self, request: &UpdateProjectRequest) -> Result<()> {
        if let Some(name) = &request.name {
            if name.trim().is_empty() {
                return Err(ControllerError::InvalidRequest(
                    "project name cannot be empty".to_string(),
                ));
            }
        }
        let mut meta = self.meta.write().await;
        if let Some(name) = &request.name {
            meta.name = name.clone();
        }
        if let Some(variables) = &request.variables {
            meta.variables = Some(variables.clone());
        }
        Ok(())
    }

    /// Body that opens this project on a compute.
    pub async fn compute_payload(&self) -> CreateProjectRequest {
        let meta = self.meta.read().await;
        CreateProjectRequest {
            name: meta.name.clone(),
            project_id: Some(self.id),
            path: None,
            variables: meta.variables.clone(),
        }
    }

    /// Opens the project on `compute`. Computes treat a repeated open as a
    /// no-op, so this runs before every node placement.
    pub async fn ensure_on_compute(&self, compute: &Compute) -> Result<()> {
        let payload = serde_json::to_value(self.compute_payload().await)
            .map_err(|err| ControllerError::Internal(err.to_string()))?;
        compute.post("projects", &payload).await?;
        self.computes.write().await.insert(compute.id().to_string());
        Ok(())
    }

    /// Ids of the computes this project was opened on.
    pub async fn compute_ids(&self) -> Vec<String> {
        self.computes.read().await.iter().cloned().collect()
    }

    /// Reserves `node_id` for an in-flight create. The id is unavailable to
    /// other creates until the returned guard is committed or dropped.
    pub async fn claim_node_id(&self, node_id: Uuid) -> Result<PendingNode<'_>> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(ControllerError::not_found(format!("project {}", self.id)));
        }
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !pending.insert(node_id) {
                return Err(ControllerError::AlreadyExists(format!("node {node_id}")));
            }
        }
        let claim = PendingNode {
            project: self,
            node_id,
        };
        if self.nodes.read().await.contains_key(&node_id) {
            return Err(ControllerError::AlreadyExists(format!("node {node_id}")));
        }
        Ok(claim)
    }

    pub async fn node(&self, node_id: Uuid) -> Result<Node> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .map(|entry| entry.node.clone())
            .ok_or_else(|| ControllerError::not_found(format!("node {node_id}")))
    }

    pub async fn nodes(&self) -> Vec<Node> {
        let mut nodes = self
            .nodes
            .read()
            .await
            .values()
            .map(|entry| entry.node.clone())
            .collect::<Vec<_>>();
        nodes.sort_by_key(Node::id);
        nodes
    }

    /// Serialises update and delete of one node. The node table lock is not
    /// held while waiting.
    pub async fn lock_node(&self, node_id: Uuid) -> Result<OwnedMutexGuard<()>> {
        let op_lock = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .map(|entry| Arc::clone(&entry.op_lock))
            .ok_or_else(|| ControllerError::not_found(format!("node {node_id}")))?;
        Ok(op_lock.lock_owned().await)
    }

    /// Writes back an updated node. Returns false when the node was removed
    /// in the meantime.
    pub async fn replace_node(&self, node: Node) -> bool {
        match self.nodes.write().await.get_mut(&node.id()) {
            Some(entry) => {
                entry.node = node;
                true
            }
            None => false,
        }
    }

    pub async fn remove_node(&self, node_id: Uuid) -> Option<Node> {
        self.nodes
            .write()
            .await
            .remove(&node_id)
            .map(|entry| entry.node)
    }

    /// Marks the project deleted and hands back every committed node. A
    /// create still in flight can no longer commit afterwards.
    pub async fn seal(&self) -> Vec<Node> {
        let mut nodes = self.nodes.write().await;
        self.deleted.store(true, Ordering::Release);
        nodes.drain().map(|(_, entry)| entry.node).collect()
    }

    pub async fn read_file(&self, file_path: &str) -> Result<Vec<u8>> {
        Ok(self.files.read(file_path).await?)
    }

    pub async fn write_file(&self, file_path: &str, contents: &[u8]) -> Result<()> {
        Ok(self.files.write(file_path, contents).await?)
    }
}

/// An id claimed by [`Project::claim_node_id`].
pub struct PendingNode<'a> {
    project: &'a Project,
    node_id: Uuid,
}

impl PendingNode<'_> {
    /// Adds the node to the project and counts it on its compute. Hands the
    /// node back when the project was sealed in the meantime.
    pub async fn commit(self, node: Node) -> std::result::Result<(), Node> {
        let mut nodes = self.project.nodes.write().await;
        if self.project.deleted.load(Ordering::Acquire) {
            return Err(node);
        }
        node.compute().node_added();
        nodes.insert(
            self.node_id,
            NodeEntry {
                node,
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(())
    }
}

impl Drop for PendingNode<'_> {
    fn drop(&mut self) {
        self.project
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use compute::{ConsoleType, EmulatorType};

    use super::*;
    use crate::node::NodeSpec;

    fn project() -> Project {
        Project::new(
            Uuid::new_v4(),
            "test".to_string(),
            std::env::temp_dir().join(format!("nl-controller-project-{}", Uuid::new_v4())),
            None,
        )
    }

    fn node(project: &Project, node_id: Uuid) -> Node {
        Node::new(
            project.id(),
            node_id,
            Compute::detached("local", vec![EmulatorType::Vpcs]),
            NodeSpec {
                node_id: Some(node_id),
                compute_id: None,
                node_type: EmulatorType::Vpcs,
                name: "PC1".to_string(),
                console: None,
                console_type: ConsoleType::None,
                properties: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn a_claimed_id_cannot_be_claimed_twice() {
        let project = project();
        let node_id = Uuid::new_v4();
        let claim = project.claim_node_id(node_id).await.expect("first claim");
        let err = project
            .claim_node_id(node_id)
            .await
            .err()
            .expect("second claim must fail");
        assert!(matches!(err, ControllerError::AlreadyExists(_)));

        drop(claim);
        assert!(project.claim_node_id(node_id).await.is_ok());
    }

    #[tokio::test]
    async fn committed_node_blocks_new_claims() {
        let project = project();
        let node_id = Uuid::new_v4();
        let claim = project.claim_node_id(node_id).await.expect("claim");
        assert!(claim.commit(node(&project, node_id)).await.is_ok());

        let err = project
            .claim_node_id(node_id)
            .await
            .err()
            .expect("id is taken");
        assert!(matches!(err, ControllerError::AlreadyExists(_)));
        assert_eq!(project.record().await.node_ids, vec![node_id]);
    }

    #[tokio::test]
    async fn replace_after_removal_is_refused() {
        let project = project();
        let node_id = Uuid::new_v4();
        let claim = project.claim_node_id(node_id).await.expect("claim");
        assert!(claim.commit(node(&project, node_id)).await.is_ok());
        let current = project.node(node_id).await.expect("node exists");
        assert!(project.remove_node(node_id).await.is_some());
        assert!(!project.replace_node(current).await);
        assert!(project.node(node_id).await.is_err());
    }

    #[tokio::test]
    async fn null_variables_stay_absent_and_updates_replace_the_list() {
        let project = project();
        assert!(project.record().await.variables.is_none());

        project
            .update(&UpdateProjectRequest {
                name: None,
                variables: Some(vec![ProjectVariable {
                    name: "TEST1".to_string(),
                    value: "VAL1".to_string(),
                }]),
            })
            .await
            .expect("update");
        let record = project.record().await;
        assert_eq!(record.name, "test");
        assert_eq!(
            record.variables,
            Some(vec![ProjectVariable {
                name: "TEST1".to_string(),
                value: "VAL1".to_string(),
            }])
        );
    }

    #[tokio::test]
    async fn closed_project_refuses_new_work() {
        let project = project();
        project.set_status(ProjectStatus::Closed).await;
        let err = project.ensure_open().await.expect_err("closed");
        assert!(matches!(err, ControllerError::ProjectClosed(_)));
        project.set_status(ProjectStatus::Opened).await;
        assert!(project.ensure_open().await.is_ok());
    }

    #[tokio::test]
    async fn sealed_project_refuses_in_flight_commits() {
        let project = project();
        let committed = Uuid::new_v4();
        let claim = project.claim_node_id(committed).await.expect("claim");
        assert!(claim.commit(node(&project, committed)).await.is_ok());

        let in_flight = Uuid::new_v4();
        let claim = project.claim_node_id(in_flight).await.expect("claim");
        let drained = project.seal().await;
        assert_eq!(drained.iter().map(Node::id).collect::<Vec<_>>(), vec![committed]);

        let orphan = node(&project, in_flight);
        let compute = Arc::clone(orphan.compute());
        let returned = claim.commit(orphan).await.expect_err("project is sealed");
        assert_eq!(returned.id(), in_flight);
        assert_eq!(compute.node_count(), 0);
        assert!(project.nodes().await.is_empty());

        let err = project
            .claim_node_id(Uuid::new_v4())
            .await
            .err()
            .expect("sealed project takes no new claims");
        assert!(matches!(err, ControllerError::NotFound(_)));
    }

    #[tokio::test]
    async fn created_project_owns_only_a_new_directory() {
        let root = std::env::temp_dir().join(format!("nl-controller-owned-{}", Uuid::new_v4()));
        let fresh = Project::create(Uuid::new_v4(), "fresh".to_string(), root.clone(), None)
            .await
            .expect("create");
        assert!(fresh.owns_root());
        assert!(root.is_dir());

        let adopted = Project::create(Uuid::new_v4(), "adopted".to_string(), root.clone(), None)
            .await
            .expect("adopt");
        assert!(!adopted.owns_root());
        let _ = std::fs::remove_dir_all(root);
    }
}
