use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use compute::{CreateProjectRequest, UpdateProjectRequest};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    compute_link::{ComputeRecord, RegisterComputeRequest},
    controller::Controller,
    error::{ControllerError, Result},
    node::{NodeRecord, NodeSpec, NodeUpdate},
    project::ProjectRecord,
};

mod handlers;

use handlers::*;

#[derive(Clone)]
pub struct ControllerState {
    controller: Arc<Controller>,
}

impl ControllerState {
    pub fn new(controller: Controller) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

pub fn build_controller_app(state: ControllerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/v1/computes",
            get(list_computes_handler).post(add_compute_handler),
        )
        .route(
            "/v1/computes/{compute_id}",
            get(get_compute_handler).delete(remove_compute_handler),
        )
        .route(
            "/v1/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route(
            "/v1/projects/{project_id}",
            get(get_project_handler)
                .put(update_project_handler)
                .delete(delete_project_handler),
        )
        .route(
            "/v1/projects/{project_id}/close",
            post(close_project_handler),
        )
        .route("/v1/projects/{project_id}/open", post(open_project_handler))
        .route(
            "/v1/projects/{project_id}/nodes",
            get(list_nodes_handler).post(create_node_handler),
        )
        .route(
            "/v1/projects/{project_id}/nodes/{node_id}",
            get(get_node_handler)
                .put(update_node_handler)
                .delete(delete_node_handler),
        )
        .route(
            "/v1/projects/{project_id}/files/{*file_path}",
            get(read_file_handler).post(write_file_handler),
        )
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

fn parse_id(kind: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ControllerError::InvalidRequest(format!("malformed {kind} id: {raw}")))
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ControllerError::InvalidRequest(rejection.body_text()))
}
