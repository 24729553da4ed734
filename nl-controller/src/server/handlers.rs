use super::*;

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if uri != "/healthz" {
        info!(
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub(super) async fn metrics_handler(State(state): State<ControllerState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.controller.render_metrics().await,
    )
}

pub(super) async fn list_computes_handler(
    State(state): State<ControllerState>,
) -> Json<Vec<ComputeRecord>> {
    Json(state.controller.list_computes().await)
}

pub(super) async fn add_compute_handler(
    State(state): State<ControllerState>,
    payload: std::result::Result<Json<RegisterComputeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ComputeRecord>)> {
    let request = json_body(payload)?;
    let record = state.controller.add_compute(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(super) async fn get_compute_handler(
    State(state): State<ControllerState>,
    Path(compute_id): Path<String>,
) -> Result<Json<ComputeRecord>> {
    Ok(Json(state.controller.compute(&compute_id).await?.record()))
}

pub(super) async fn remove_compute_handler(
    State(state): State<ControllerState>,
    Path(compute_id): Path<String>,
) -> Result<StatusCode> {
    state.controller.remove_compute(&compute_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_projects_handler(
    State(state): State<ControllerState>,
) -> Json<Vec<ProjectRecord>> {
    Json(state.controller.list_projects().await)
}

pub(super) async fn create_project_handler(
    State(state): State<ControllerState>,
    payload: std::result::Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProjectRecord>)> {
    let request = json_body(payload)?;
    let record = state.controller.create_project(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(super) async fn get_project_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>> {
    let project_id = parse_id("project", &project_id)?;
    let project = state.controller.project(project_id).await?;
    Ok(Json(project.record().await))
}

pub(super) async fn update_project_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
    payload: std::result::Result<Json<UpdateProjectRequest>, JsonRejection>,
) -> Result<Json<ProjectRecord>> {
    let project_id = parse_id("project", &project_id)?;
    let request = json_body(payload)?;
    Ok(Json(
        state
            .controller
            .update_project(project_id, request)
            .await?,
    ))
}

pub(super) async fn delete_project_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
) -> Result<StatusCode> {
    let project_id = parse_id("project", &project_id)?;
    state.controller.delete_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn close_project_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>> {
    let project_id = parse_id("project", &project_id)?;
    Ok(Json(state.controller.close_project(project_id).await?))
}

pub(super) async fn open_project_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>> {
    let project_id = parse_id("project", &project_id)?;
    Ok(Json(state.controller.open_project(project_id).await?))
}

pub(super) async fn list_nodes_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<NodeRecord>>> {
    let project_id = parse_id("project", &project_id)?;
    Ok(Json(state.controller.list_nodes(project_id).await?))
}

pub(super) async fn create_node_handler(
    State(state): State<ControllerState>,
    Path(project_id): Path<String>,
    payload: std::result::Result<Json<NodeSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<NodeRecord>)> {
    let project_id = parse_id("project", &project_id)?;
    let spec = json_body(payload)?;
    let record = state.controller.create_node(project_id, spec).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(super) async fn get_node_handler(
    State(state): State<ControllerState>,
    Path((project_id, node_id)): Path<(String, String)>,
) -> Result<Json<NodeRecord>> {
    let project_id = parse_id("project", &project_id)?;
    let node_id = parse_id("node", &node_id)?;
    Ok(Json(state.controller.node(project_id, node_id).await?))
}

pub(super) async fn update_node_handler(
    State(state): State<ControllerState>,
    Path((project_id, node_id)): Path<(String, String)>,
    payload: std::result::Result<Json<NodeUpdate>, JsonRejection>,
) -> Result<Json<NodeRecord>> {
    let project_id = parse_id("project", &project_id)?;
    let node_id = parse_id("node", &node_id)?;
    let update = json_body(payload)?;
    Ok(Json(
        state
            .controller
            .update_node(project_id, node_id, update)
            .await?,
    ))
}

pub(super) async fn delete_node_handler(
    State(state): State<ControllerState>,
    Path((project_id, node_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let project_id = parse_id("project", &project_id)?;
    let node_id = parse_id("node", &node_id)?;
    state.controller.delete_node(project_id, node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn read_file_handler(
    State(state): State<ControllerState>,
    Path((project_id, file_path)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let project_id = parse_id("project", &project_id)?;
    let contents = state
        .controller
        .read_project_file(project_id, &file_path)
        .await?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        contents,
    ))
}

pub(super) async fn write_file_handler(
    State(state): State<ControllerState>,
    Path((project_id, file_path)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode> {
    let project_id = parse_id("project", &project_id)?;
    state
        .controller
        .write_project_file(project_id, &file_path, &body)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
