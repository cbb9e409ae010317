//! HTTP routes

use crate::auth::{Authenticated, TokenVerifier};
use crate::problem::Problem;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRef, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleetlink::ssh::{CommandResult, ConnectionHandle, SshSession, TunnelStream};
use fleetlink::{
    containers, files, systemd, FileContents, FleetlinkError, Gateway, LineStream, RemoteFs,
    ServiceManager, ServiceOperation, ServiceStatus,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Connection pool and adapters
    pub gateway: Arc<Gateway>,
    /// Request token verifier
    pub verifier: TokenVerifier,
}

impl FromRef<AppState> for TokenVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/command", get(run_command))
        .route("/containers/json", get(list_containers))
        .route("/containers/{id}/json", get(inspect_container))
        .route("/containers/{id}/stats", get(container_stats))
        .route("/events", get(engine_events))
        .route("/files/read", get(read_file))
        .route("/files/write", post(write_file))
        .route("/files/upsert", post(upsert_file))
        .route("/files/delete", post(delete_file))
        .route("/systemd/service", get(get_service))
        .route("/systemd/service/{operation}", post(control_service))
        .route("/systemd/reload", post(reload_systemd))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type Handle = ConnectionHandle<SshSession>;

/// Cancellation scoped to one request; the token fires when the guard drops
fn request_scope() -> (CancellationToken, DropGuard) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    (cancel, guard)
}

fn required(value: &str, name: &str) -> Result<(), Problem> {
    if value.trim().is_empty() {
        return Err(Problem::invalid_request(format!("{name} must not be empty")));
    }
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CommandQuery {
    command: String,
}

async fn run_command(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    query: Result<Query<CommandQuery>, QueryRejection>,
) -> Result<Json<CommandResult>, Problem> {
    let Query(query) = query?;
    required(&query.command, "command")?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let result = handle
        .run(&query.command, &cancel)
        .await
        .map_err(|source| FleetlinkError::Command {
            command: query.command.clone(),
            source,
        })?;
    Ok(Json(result))
}

fn engine_json(body: Bytes) -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/json")], body)
}

async fn list_containers(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
) -> Result<impl IntoResponse, Problem> {
    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let body = containers::list(handle.engine()?).await?;
    Ok(engine_json(body))
}

async fn inspect_container(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Problem> {
    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let body = containers::inspect(handle.engine()?, &id).await?;
    Ok(engine_json(body))
}

async fn container_stats(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Problem> {
    let (cancel, guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let lines = containers::stats(handle.engine()?, &id, &cancel).await?;
    Ok(event_stream(lines, handle, guard))
}

async fn engine_events(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
) -> Result<impl IntoResponse, Problem> {
    let (cancel, guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let lines = containers::events(handle.engine()?, &cancel).await?;
    Ok(event_stream(lines, handle, guard))
}

/// Server-sent events carrying one JSON document each.
///
/// The session handle and the cancellation guard live as long as the
/// stream, so a client hanging up releases both.
fn event_stream(
    lines: LineStream,
    handle: Handle,
    guard: DropGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold(
        (lines, handle, guard),
        |(mut lines, handle, guard)| async move {
            let event = match lines.recv().await? {
                Ok(line) => Event::default().data(line),
                Err(e) => {
                    warn!("Stream on {} failed: {}", handle.id(), e);
                    Event::default().event("error").data(e.to_string())
                }
            };
            Some((Ok(event), (lines, handle, guard)))
        },
    );
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

async fn read_file(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<FileContents>, Problem> {
    let Query(query) = query?;
    required(&query.path, "path")?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let file = files::read(&*handle, &query.path, state.gateway.read_limit()).await?;
    Ok(Json(file))
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    /// Base64 encoded
    contents: String,
    #[serde(default)]
    create_folder: bool,
}

impl WriteRequest {
    fn decode(&self) -> Result<Vec<u8>, Problem> {
        required(&self.path, "path")?;
        STANDARD
            .decode(&self.contents)
            .map_err(|e| Problem::invalid_request(format!("contents must be base64: {e}")))
    }
}

async fn write_file(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    request: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<(), Problem> {
    let Json(request) = request?;
    let contents = request.decode()?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;

    let existing = handle
        .metadata(&request.path)
        .await
        .map_err(|source| FleetlinkError::FileWrite {
            path: request.path.clone(),
            source,
        })?;
    if existing.is_some_and(|metadata| metadata.is_dir) {
        return Err(FleetlinkError::IsDirectory(request.path).into());
    }
    if request.create_folder {
        files::ensure_directory(&*handle, files::parent_dir(&request.path)).await?;
    }
    files::write(&*handle, &request.path, &contents, &cancel).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct UpsertResponse {
    updated: bool,
}

async fn upsert_file(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    request: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<UpsertResponse>, Problem> {
    let Json(request) = request?;
    let contents = request.decode()?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let updated = files::upsert(
        &*handle,
        &request.path,
        request.create_folder,
        &contents,
        &cancel,
    )
    .await?;
    Ok(Json(UpsertResponse { updated }))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn delete_file(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<DeleteResponse>, Problem> {
    let Query(query) = query?;
    required(&query.path, "path")?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let deleted = files::delete(&*handle, &query.path).await?;
    Ok(Json(DeleteResponse { deleted }))
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    #[serde(alias = "name")]
    id: String,
}

async fn service_manager(
    handle: &Handle,
    cancel: &CancellationToken,
) -> Result<ServiceManager<TunnelStream>, Problem> {
    let bus = handle
        .service_bus(cancel)
        .await
        .map_err(FleetlinkError::ServiceBus)?;
    Ok(ServiceManager::new(bus))
}

async fn get_service(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    query: Result<Query<ServiceQuery>, QueryRejection>,
) -> Result<Json<ServiceStatus>, Problem> {
    let Query(query) = query?;
    required(&query.id, "id")?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let manager = service_manager(&handle, &cancel).await?;
    Ok(Json(manager.get_service(&query.id).await?))
}

fn parse_operation(operation: &str) -> Option<ServiceOperation> {
    match operation {
        "start" => Some(ServiceOperation::Start),
        "stop" => Some(ServiceOperation::Stop),
        "restart" => Some(ServiceOperation::Restart),
        "enable" => Some(ServiceOperation::Enable),
        "disable" => Some(ServiceOperation::Disable),
        _ => None,
    }
}

async fn control_service(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
    Path(operation): Path<String>,
    query: Result<Query<ServiceQuery>, QueryRejection>,
) -> Result<(), Problem> {
    let operation = parse_operation(&operation)
        .ok_or_else(|| Problem::not_found(format!("Unknown service operation {operation}")))?;
    let Query(query) = query?;
    required(&query.id, "id")?;

    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    let manager = service_manager(&handle, &cancel).await?;
    debug!("Service {} requested for {} on {}", operation, query.id, handle.id());
    match operation {
        ServiceOperation::Start => manager.start(&query.id).await?,
        ServiceOperation::Stop => manager.stop(&query.id).await?,
        ServiceOperation::Restart => manager.restart(&query.id).await?,
        ServiceOperation::Enable => manager.enable(&query.id).await?,
        ServiceOperation::Disable => manager.disable(&query.id).await?,
        ServiceOperation::Get | ServiceOperation::Reload => {
            return Err(Problem::not_found(format!("Unknown service operation {operation}")));
        }
    }
    Ok(())
}

async fn reload_systemd(
    State(state): State<AppState>,
    Authenticated(credentials): Authenticated,
) -> Result<(), Problem> {
    let (cancel, _guard) = request_scope();
    let handle = state.gateway.acquire(&credentials, &cancel).await?;
    systemd::reload(&*handle, &cancel).await?;
    Ok(())
}
