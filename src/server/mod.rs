//! HTTP binding of the coordinator's operation surface.
//!
//! Deliberately thin: parse the request, call the coordinator, map the
//! error. Mutating routes answer 202 Accepted before the underlying process
//! transition completes — except `remove`, which is synchronous end to end.

pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::errors::PortalError;
use crate::github::GithubClient;
use crate::jenkins::JenkinsClient;
use crate::jira::{JiraClient, NoopTracker, TicketTracker};
use crate::message::MessageBus;
use crate::poller::CandidatePoller;
use crate::portal::service::{CreatePortal, UpdatePortal};
use crate::portal::{
    CandidateResolver, PortalDeployer, PortalExecutor, PortalFileSystem, PortalId,
    PortalLogService, PortalRepository, PortalService,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<PortalService>,
    pub bus: Arc<MessageBus>,
}

pub type SharedState = Arc<AppState>;

// ── Error mapping ─────────────────────────────────────────────────────

pub struct ApiError(PortalError);

impl From<PortalError> for ApiError {
    fn from(err: PortalError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = self.0.to_string();
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/candidates", get(get_candidates))
        .route("/api/portals", get(list).post(create).delete(remove_all))
        .route(
            "/api/portals/{id}",
            get(get_portal).put(update).delete(remove),
        )
        .route("/api/portals/{id}/status", get(status))
        .route("/api/portals/{id}/log", get(get_log))
        .route("/api/portals/{id}/start", post(start))
        .route("/api/portals/{id}/stop", post(stop))
        .route("/api/portals/{id}/restart", post(restart))
        .route("/portals/{key}", get(redirect))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_candidates(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let candidates = state.service.get_candidates().await?;
    Ok(Json(candidates).into_response())
}

async fn list(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let portals = state.service.list().await?;
    Ok(Json(portals).into_response())
}

async fn get_portal(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    let portal = state.service.get(id).await?;
    Ok(Json(portal).into_response())
}

async fn create(
    State(state): State<SharedState>,
    Json(request): Json<CreatePortal>,
) -> Result<Response, ApiError> {
    let portal = state.service.create(request).await?;
    Ok((StatusCode::ACCEPTED, Json(portal)).into_response())
}

async fn update(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
    Json(request): Json<UpdatePortal>,
) -> Result<Response, ApiError> {
    let portal = state.service.update(id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(portal)).into_response())
}

async fn remove(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    state.service.remove(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn remove_all(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state.service.remove_all().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn status(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    let status = state.service.status(id).await?;
    Ok(Json(status).into_response())
}

async fn get_log(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    let log = state.service.get_log(id).await?;
    Ok(log.into_response())
}

async fn start(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    state.service.start(id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn stop(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    state.service.stop(id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn restart(
    State(state): State<SharedState>,
    Path(id): Path<PortalId>,
) -> Result<Response, ApiError> {
    state.service.restart(id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Mnemonic redirect: `/portals/7` or `/portals/fix-login-bug` sends the
/// browser to the portal's assigned URL.
async fn redirect(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let portal = match key.parse::<PortalId>() {
        Ok(id) => state.service.get(id).await?,
        Err(_) => state.service.get_by_slug(&key).await?,
    };
    let url = portal.url.ok_or(PortalError::NotFound { id: portal.id })?;
    Ok(Redirect::temporary(&url).into_response())
}

// ── Daemon bootstrap ──────────────────────────────────────────────────

/// Wire the registries and collaborators together and serve until shutdown.
pub async fn run(config: ServerConfig) -> Result<()> {
    let fs = PortalFileSystem::new(&config.workspace_dir, &config.artifact_base_name);
    std::fs::create_dir_all(fs.dir()).context("Failed to create workspace directory")?;

    let bus = Arc::new(MessageBus::new());
    let github = Arc::new(GithubClient::new(
        &config.github.repo,
        config.github.token.clone(),
    ));
    let jenkins = Arc::new(JenkinsClient::new(&config.jenkins.host, &config.jenkins.job));
    let tickets: Arc<dyn TicketTracker> = match &config.jira {
        Some(jira) => Arc::new(JiraClient::new(
            &jira.host,
            &jira.user,
            jira.token.as_deref().unwrap_or_default(),
        )),
        None => Arc::new(NoopTracker),
    };

    let resolver = CandidateResolver::new(github.clone(), jenkins.clone(), tickets.clone());
    let repository = PortalRepository::new(fs.clone());
    let deployer = PortalDeployer::new(fs.clone(), jenkins.clone(), config.base_port)
        .context("Failed to initialize deployer")?;
    let executor = PortalExecutor::new(
        fs.clone(),
        bus.clone(),
        config.startup_grace(),
        config.process_poll(),
    );
    let logs = PortalLogService::new(fs, bus.clone());
    logs.start();

    let service = Arc::new(
        PortalService::new(
            &config.public_url,
            resolver,
            repository,
            deployer,
            executor,
            logs.clone(),
            bus.clone(),
            tickets,
        )
        .context("Failed to initialize portal service")?,
    );

    let poller = CandidatePoller::new(github, jenkins, bus.clone(), config.poll_interval()).spawn();

    let state = Arc::new(AppState { service, bus });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "portald listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    poller.abort();
    logs.shutdown();
    info!("portald shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::github::{PullRequest, PullRequestSource};
    use crate::jenkins::{ArtifactFetcher, Build, BuildSource};
    use async_trait::async_trait;

    struct NoPrs;
    #[async_trait]
    impl PullRequestSource for NoPrs {
        async fn pull_requests(&self) -> Result<Vec<PullRequest>> {
            Ok(Vec::new())
        }
    }

    struct NoBuilds;
    #[async_trait]
    impl BuildSource for NoBuilds {
        async fn builds(&self) -> Result<Vec<Build>> {
            Ok(Vec::new())
        }
    }
    #[async_trait]
    impl ArtifactFetcher for NoBuilds {
        async fn fetch_artifact(&self, _build: &Build) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn test_router(dir: &TempDir) -> Router {
        let fs = PortalFileSystem::new(dir.path(), "portal");
        let bus = Arc::new(MessageBus::new());
        let tickets: Arc<dyn TicketTracker> = Arc::new(NoopTracker);
        let resolver = CandidateResolver::new(Arc::new(NoPrs), Arc::new(NoBuilds), tickets.clone());
        let repository = PortalRepository::new(fs.clone());
        let deployer = PortalDeployer::new(fs.clone(), Arc::new(NoBuilds), 9000).unwrap();
        let executor = PortalExecutor::new(
            fs.clone(),
            bus.clone(),
            std::time::Duration::from_millis(50),
            std::time::Duration::from_millis(50),
        );
        let logs = PortalLogService::new(fs, bus.clone());
        let service = Arc::new(
            PortalService::new(
                "http://localhost",
                resolver,
                repository,
                deployer,
                executor,
                logs,
                bus.clone(),
                tickets,
            )
            .unwrap(),
        );
        build_router(Arc::new(AppState { service, bus }))
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_is_empty_on_fresh_workspace() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/portals")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn unknown_portal_is_404() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/portals/99")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("99"));
    }

    #[tokio::test]
    async fn create_with_bad_slug_is_400() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/portals")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"pr_number": 7, "slug": "My Slug"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("my-slug"));
    }

    #[tokio::test]
    async fn create_for_unknown_pr_is_404() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/portals")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({"pr_number": 7}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_slug_redirect_is_404() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/portals/no-such-portal")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_of_unknown_portal_is_404() {
        let dir = TempDir::new().unwrap();
        let app = test_router(&dir);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/portals/1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
