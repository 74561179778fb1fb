//! segloop-server library interface
//!
//! Exposes the router, state and workflows for the binary and for
//! integration testing.

pub mod api;
pub mod convert;
pub mod db;
pub mod error;
pub mod services;
pub mod workspace;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, TimeDelta, Utc};
use segloop_common::config::TomlConfig;
use segloop_common::DatasetRegistry;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::services::cvat_client::{AnnotationPlatform, PlatformSession};
use crate::services::nnunet::Nnunet;
use crate::services::poller::PollPolicy;
use crate::services::tool_runner::ToolRunner;
use crate::workspace::Workspace;

/// Multipart framing on top of the archive itself
const UPLOAD_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Sessions unused for this many hours are dropped
pub const SESSION_IDLE_HOURS: i64 = 12;

/// A logged-in user, keyed by session token
#[derive(Debug, Clone)]
pub struct UserSession {
    pub username: String,
    pub platform: PlatformSession,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl UserSession {
    pub fn new(username: String, platform: PlatformSession, now: DateTime<Utc>) -> Self {
        Self {
            username,
            platform,
            created_at: now,
            last_seen: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen > TimeDelta::hours(SESSION_IDLE_HOURS)
    }
}

/// Drop idle sessions, returning how many were removed
pub fn prune_expired_sessions(sessions: &mut HashMap<String, UserSession>, now: DateTime<Utc>) -> usize {
    let before = sessions.len();
    sessions.retain(|_, session| !session.is_expired(now));
    before - sessions.len()
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub config: Arc<TomlConfig>,
    /// Built-in and configured dataset descriptors
    pub registry: Arc<DatasetRegistry>,
    pub workspace: Workspace,
    pub nnunet: Arc<Nnunet>,
    /// Annotation platform (CVAT in production)
    pub platform: Arc<dyn AnnotationPlatform>,
    /// Runs nnU-Net executables
    pub runner: Arc<dyn ToolRunner>,
    /// Open sessions by token
    pub sessions: Arc<RwLock<HashMap<String, UserSession>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        config: TomlConfig,
        workspace: Workspace,
        platform: Arc<dyn AnnotationPlatform>,
        runner: Arc<dyn ToolRunner>,
    ) -> segloop_common::Result<Self> {
        let registry = DatasetRegistry::new(config.datasets.clone(), &config.default_dataset)?;
        let nnunet = Nnunet::new(config.nnunet.clone(), workspace.root());
        Ok(Self {
            db,
            config: Arc::new(config),
            registry: Arc::new(registry),
            workspace,
            nnunet: Arc::new(nnunet),
            platform,
            runner,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        })
    }

    /// Remember a failure for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from(&self.config.cvat.poll)
    }

    /// Base URL clients use to reach this server
    pub fn public_base_url(&self) -> String {
        self.config
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.config.bind, self.config.port))
            .trim_end_matches('/')
            .to_string()
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes.saturating_add(UPLOAD_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .merge(api::root_routes())
        .merge(api::health_routes())
        .merge(api::auth_routes())
        .merge(api::inference_routes())
        .merge(api::cvat_routes())
        .merge(api::training_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
