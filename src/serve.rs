use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::NaiveDate;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::upload::{CalendarFile, FileRejection};
use crate::*;

/// Store handle shared by the server; any backend works.
pub type SharedStore = Arc<dyn KeyValueStore + Send + Sync>;

/// Arguments for running the icsflow web server
#[derive(Debug, Clone, Parser)]
#[command(name = "icsflow serve", about = "Serve the event graph workspace as a JSON API.")]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5151)]
    pub port: u16,

    /// Directory holding the persisted workspace.
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Switch the stored build mode to one chain per day under a schedule root.
    #[arg(long)]
    pub grouped: bool,
}

pub struct ServeState {
    workspace: Mutex<Workspace<SharedStore>>,
    uploader: UploadClient,
}

impl ServeState {
    pub fn new(workspace: Workspace<SharedStore>, uploader: UploadClient) -> Arc<Self> {
        Arc::new(Self {
            workspace: Mutex::new(workspace),
            uploader,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspacePayload {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    reference_date: Option<NaiveDate>,
    policy: SelectionPolicy,
    mode: BuildMode,
    can_undo: bool,
    available_dates: Vec<String>,
}

impl WorkspacePayload {
    fn capture(workspace: &Workspace<SharedStore>) -> Result<Self, Response> {
        let snapshot = workspace.snapshot();
        Ok(Self {
            nodes: snapshot.nodes.clone(),
            edges: snapshot.edges.clone(),
            reference_date: workspace.reference_date(),
            policy: workspace.policy(),
            mode: workspace.mode(),
            can_undo: workspace.can_undo(),
            available_dates: workspace.available_dates().map_err(workspace_error)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedNode {
    id: String,
    workspace: WorkspacePayload,
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
struct SelectionUpdate {
    date: Option<NaiveDate>,
    policy: Option<SelectionPolicy>,
}

#[derive(Debug, Deserialize)]
struct ModeUpdate {
    mode: BuildMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeCreateRequest {
    label: String,
    #[serde(default = "default_node_kind")]
    kind: NodeKind,
    parent_id: Option<String>,
}

fn default_node_kind() -> NodeKind {
    NodeKind::Event
}

#[derive(Debug, Deserialize)]
struct LabelUpdate {
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeCreateRequest {
    source_id: String,
    target_id: String,
}

type ApiResult<T> = std::result::Result<T, Response>;

pub fn router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/api/workspace", get(get_workspace))
        .route("/api/workspace/upload", post(post_upload))
        .route("/api/workspace/files", post(post_files))
        .route("/api/workspace/selection", put(put_selection))
        .route("/api/workspace/mode", put(put_mode))
        .route("/api/workspace/days/:date", get(get_day))
        .route("/api/workspace/nodes", post(post_node))
        .route("/api/workspace/nodes/:id", delete(delete_node))
        .route("/api/workspace/nodes/:id/position", put(put_position))
        .route("/api/workspace/nodes/:id/label", put(put_label))
        .route("/api/workspace/edges", post(post_edge))
        .route("/api/workspace/edges/:id", delete(delete_edge))
        .route("/api/workspace/undo", post(post_undo))
        .route("/api/workspace/reset", post(post_reset))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn run_serve(args: ServeArgs, config: WorkspaceConfig) -> Result<()> {
    let config = match args.data_dir.clone() {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    };
    let store = FileStore::open(&config.data_dir)?;
    let uploader = UploadClient::from_config(&config)?;
    let mut workspace = Workspace::open(Arc::new(store) as SharedStore, config.clone())
        .with_context(|| format!("failed to open workspace in '{}'", config.data_dir.display()))?;
    if args.grouped && workspace.mode() != BuildMode::Grouped {
        workspace.set_mode(BuildMode::Grouped)?;
    }

    let app = router(ServeState::new(workspace, uploader));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    println!("icsflow server listening on http://{addr}");
    println!("Press Ctrl+C to stop.");
    tracing::info!(%addr, data_dir = %config.data_dir.display(), "serving workspace");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn get_workspace(State(state): State<Arc<ServeState>>) -> ApiResult<Json<WorkspacePayload>> {
    let workspace = state.workspace.lock().await;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn post_upload(
    State(state): State<Arc<ServeState>>,
    Query(query): Query<UploadQuery>,
    body: String,
) -> ApiResult<Json<WorkspacePayload>> {
    let mut workspace = state.workspace.lock().await;
    workspace
        .ingest_raw(&body, query.append)
        .map_err(workspace_error)?;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn post_files(
    State(state): State<Arc<ServeState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<WorkspacePayload>> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() != Some("ics_files") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let mime = field.content_type().map(str::to_string);
        let contents = field.bytes().await.map_err(bad_request)?;
        let mut file = CalendarFile::new(name, contents.to_vec());
        file.mime = mime;
        files.push(file);
    }

    let payload = state.uploader.upload(&files).await.map_err(workspace_error)?;

    let mut workspace = state.workspace.lock().await;
    let outcome = if query.append {
        workspace.append_upload(payload)
    } else {
        workspace.ingest_upload(payload)
    };
    outcome.map_err(workspace_error)?;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn put_selection(
    State(state): State<Arc<ServeState>>,
    Json(update): Json<SelectionUpdate>,
) -> ApiResult<Json<WorkspacePayload>> {
    let mut workspace = state.workspace.lock().await;
    if let Some(policy) = update.policy {
        workspace.set_policy(policy).map_err(workspace_error)?;
    }
    if let Some(date) = update.date {
        workspace.set_reference_date(date).map_err(workspace_error)?;
    }
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn put_mode(
    State(state): State<Arc<ServeState>>,
    Json(update): Json<ModeUpdate>,
) -> ApiResult<Json<WorkspacePayload>> {
    let mut workspace = state.workspace.lock().await;
    workspace.set_mode(update.mode).map_err(workspace_error)?;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn get_day(
    State(state): State<Arc<ServeState>>,
    AxumPath(date): AxumPath<String>,
) -> ApiResult<Json<WorkspaceSnapshot>> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&date, graph::DAY_KEY_FORMAT))
        .map_err(bad_request)?;
    let workspace = state.workspace.lock().await;
    Ok(Json(workspace.day_view(date).map_err(workspace_error)?))
}

async fn post_node(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<NodeCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    let id = workspace
        .add_node(&request.label, request.kind, request.parent_id.as_deref())
        .map_err(workspace_error)?;
    let created = CreatedNode {
        id,
        workspace: WorkspacePayload::capture(&workspace)?,
    };
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_node(
    State(state): State<Arc<ServeState>>,
    AxumPath(node_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    workspace.remove_node(&node_id).map_err(workspace_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_position(
    State(state): State<Arc<ServeState>>,
    AxumPath(node_id): AxumPath<String>,
    Json(position): Json<Point>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    workspace
        .move_node(&node_id, position)
        .map_err(workspace_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_label(
    State(state): State<Arc<ServeState>>,
    AxumPath(node_id): AxumPath<String>,
    Json(update): Json<LabelUpdate>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    workspace
        .rename_node(&node_id, &update.label)
        .map_err(workspace_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_edge(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<EdgeCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    let created = workspace
        .connect(&request.source_id, &request.target_id)
        .map_err(workspace_error)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(WorkspacePayload::capture(&workspace)?)))
}

async fn delete_edge(
    State(state): State<Arc<ServeState>>,
    AxumPath(edge_id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let mut workspace = state.workspace.lock().await;
    workspace.disconnect(&edge_id).map_err(workspace_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_undo(State(state): State<Arc<ServeState>>) -> ApiResult<Json<WorkspacePayload>> {
    let mut workspace = state.workspace.lock().await;
    workspace.undo().map_err(workspace_error)?;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

async fn post_reset(State(state): State<Arc<ServeState>>) -> ApiResult<Json<WorkspacePayload>> {
    let mut workspace = state.workspace.lock().await;
    workspace.reset().map_err(workspace_error)?;
    Ok(Json(WorkspacePayload::capture(&workspace)?))
}

fn workspace_error(err: WorkspaceError) -> Response {
    if let Some(rejection) = FileRejection::from_error(&err) {
        return (StatusCode::BAD_REQUEST, Json(rejection)).into_response();
    }

    let status = match &err {
        WorkspaceError::UnknownNode(_) | WorkspaceError::UnknownEdge(_) => StatusCode::NOT_FOUND,
        WorkspaceError::UploadTransport(_) | WorkspaceError::UploadRejected { .. } => {
            StatusCode::BAD_GATEWAY
        }
        err if err.is_user_error() => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!(error = %err, "workspace operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
}
