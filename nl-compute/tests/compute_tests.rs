use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use compute::{
    ComputeConfig, ComputeNodeRecord, ComputeProjectRecord, EmulatorType, SharedState,
    build_compute_app,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

static TEST_DIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unique_projects_path(test_name: &str) -> PathBuf {
    let seq = TEST_DIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "nl-compute-{test_name}-{}-{seq}",
        std::process::id()
    ))
}

async fn spawn_compute(test_name: &str) -> (SocketAddr, JoinHandle<()>, PathBuf) {
    let projects_path = unique_projects_path(test_name);
    let state = SharedState::new(ComputeConfig {
        compute_id: format!("compute-{test_name}"),
        projects_path: projects_path.clone(),
        emulators: EmulatorType::ALL.to_vec(),
        local: false,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, build_compute_app(state))
            .await
            .expect("compute should run");
    });
    (addr, handle, projects_path)
}

async fn create_project(client: &reqwest::Client, addr: SocketAddr, project_id: &str) {
    let response = client
        .post(format!("http://{addr}/projects"))
        .json(&serde_json::json!({"name": "test", "project_id": project_id}))
        .send()
        .await
        .expect("create project should complete");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
}

#[tokio::test]
async fn created_project_shows_up_in_listing() {
    let (addr, handle, _) = spawn_compute("listing").await;
    let client = reqwest::Client::new();

    create_project(&client, addr, "51010203-0405-0607-0809-0a0b0c0d0e0f").await;

    let listing = client
        .get(format!("http://{addr}/projects"))
        .send()
        .await
        .expect("listing should complete")
        .json::<Vec<ComputeProjectRecord>>()
        .await
        .expect("listing should decode");
    let ids = listing
        .iter()
        .map(|project| project.project_id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["51010203-0405-0607-0809-0a0b0c0d0e0f".to_string()]);

    let shown = client
        .get(format!(
            "http://{addr}/projects/51010203-0405-0607-0809-0a0b0c0d0e0f"
        ))
        .send()
        .await
        .expect("show should complete")
        .json::<serde_json::Value>()
        .await
        .expect("show should decode");
    assert_eq!(shown["name"], "test");
    assert!(shown["variables"].is_null());

    handle.abort();
}

#[tokio::test]
async fn project_files_are_sandboxed() {
    let (addr, handle, projects_path) = spawn_compute("files").await;
    let client = reqwest::Client::new();
    let project_id = "01010203-0405-0607-0809-0a0b0c0d0e0b";
    create_project(&client, addr, project_id).await;

    let write = client
        .post(format!("http://{addr}/projects/{project_id}/files/hello"))
        .body("world")
        .send()
        .await
        .expect("write should complete");
    assert_eq!(write.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        std::fs::read(projects_path.join(project_id).join("hello")).expect("file should exist"),
        b"world"
    );

    let read = client
        .get(format!("http://{addr}/projects/{project_id}/files/hello"))
        .send()
        .await
        .expect("read should complete");
    assert_eq!(read.status(), reqwest::StatusCode::OK);
    assert_eq!(read.bytes().await.expect("body").as_ref(), b"world");

    let missing = client
        .get(format!("http://{addr}/projects/{project_id}/files/false"))
        .send()
        .await
        .expect("read should complete");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let missing_body = missing.text().await.expect("body");

    // `%2F` keeps the client from collapsing the dot segment before it
    // reaches the server; the handler sees `../hello`.
    let escaped = client
        .get(format!("http://{addr}/projects/{project_id}/files/..%2Fhello"))
        .send()
        .await
        .expect("read should complete");
    assert_eq!(escaped.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(escaped.text().await.expect("body"), missing_body);

    let escaped_write = client
        .post(format!("http://{addr}/projects/{project_id}/files/..%2Fhello"))
        .body("world")
        .send()
        .await
        .expect("write should complete");
    assert_eq!(escaped_write.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(!projects_path.join("hello").exists());

    handle.abort();
}

#[tokio::test]
async fn unknown_project_delete_and_close_are_not_found() {
    let (addr, handle, _) = spawn_compute("unknown").await;
    let client = reqwest::Client::new();
    let project_id = Uuid::new_v4();

    let delete = client
        .delete(format!("http://{addr}/projects/{project_id}"))
        .send()
        .await
        .expect("delete should complete");
    assert_eq!(delete.status(), reqwest::StatusCode::NOT_FOUND);

    let close = client
        .post(format!("http://{addr}/projects/{project_id}/close"))
        .send()
        .await
        .expect("close should complete");
    assert_eq!(close.status(), reqwest::StatusCode::NOT_FOUND);

    let show = client
        .get(format!(
            "http://{addr}/projects/50010203-0405-0607-0809-0a0b0c0d0e42"
        ))
        .send()
        .await
        .expect("show should complete");
    assert_eq!(show.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}

#[tokio::test]
async fn project_variables_update_is_reflected() {
    let (addr, handle, _) = spawn_compute("variables").await;
    let client = reqwest::Client::new();
    let project_id = Uuid::new_v4().to_string();
    create_project(&client, addr, &project_id).await;

    let update = client
        .put(format!("http://{addr}/projects/{project_id}"))
        .json(&serde_json::json!({"variables": [{"name": "TEST1", "value": "VAL1"}]}))
        .send()
        .await
        .expect("update should complete");
    assert_eq!(update.status(), reqwest::StatusCode::OK);
    let body = update
        .json::<serde_json::Value>()
        .await
        .expect("update should decode");
    assert_eq!(
        body["variables"],
        serde_json::json!([{"name": "TEST1", "value": "VAL1"}])
    );

    handle.abort();
}

#[tokio::test]
async fn deleting_project_removes_its_directory() {
    let (addr, handle, projects_path) = spawn_compute("delete").await;
    let client = reqwest::Client::new();
    let project_id = Uuid::new_v4().to_string();
    create_project(&client, addr, &project_id).await;
    assert!(projects_path.join(&project_id).is_dir());

    let delete = client
        .delete(format!("http://{addr}/projects/{project_id}"))
        .send()
        .await
        .expect("delete should complete");
    assert_eq!(delete.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(!projects_path.join(&project_id).exists());

    handle.abort();
}

#[tokio::test]
async fn node_definition_lifecycle() {
    let (addr, handle, _) = spawn_compute("nodes").await;
    let client = reqwest::Client::new();
    let project_id = Uuid::new_v4().to_string();
    create_project(&client, addr, &project_id).await;
    let vm_id = Uuid::new_v4();

    let created = client
        .post(format!("http://{addr}/projects/{project_id}/vpcs/vms"))
        .json(&serde_json::json!({
            "vm_id": vm_id,
            "name": "PC1",
            "console": 5000,
            "console_type": "telnet",
            "startup_script": "ip 10.0.0.1/24"
        }))
        .send()
        .await
        .expect("create should complete");
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    let record = created
        .json::<ComputeNodeRecord>()
        .await
        .expect("record should decode");
    assert_eq!(record.vm_type, EmulatorType::Vpcs);
    assert_eq!(record.definition.console, Some(5000));

    let duplicate = client
        .post(format!("http://{addr}/projects/{project_id}/vpcs/vms"))
        .json(&serde_json::json!({"vm_id": vm_id, "name": "PC1"}))
        .send()
        .await
        .expect("duplicate should complete");
    assert_eq!(duplicate.status(), reqwest::StatusCode::CONFLICT);

    let unknown_type = client
        .post(format!("http://{addr}/projects/{project_id}/bhyve/vms"))
        .json(&serde_json::json!({"vm_id": Uuid::new_v4(), "name": "X"}))
        .send()
        .await
        .expect("unknown type should complete");
    assert_eq!(unknown_type.status(), reqwest::StatusCode::BAD_REQUEST);

    let delete = client
        .delete(format!("http://{addr}/projects/{project_id}/vpcs/vms/{vm_id}"))
        .send()
        .await
        .expect("delete should complete");
    assert_eq!(delete.status(), reqwest::StatusCode::NO_CONTENT);

    let gone = client
        .get(format!("http://{addr}/projects/{project_id}/vpcs/vms/{vm_id}"))
        .send()
        .await
        .expect("get should complete");
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}
