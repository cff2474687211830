//! HTTP trigger: `POST /hook/build`.

pub mod function;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
};
use buildmgr_common::BuildPatch;

use crate::builder::BuildEngine;
use crate::config::build_dir;
use crate::env::EnvManager;
use crate::loader::ScriptSlot;
use crate::runner::RunSupervisor;
use crate::store::Store;
pub use function::{
    ScriptWebhookFunction, WebhookContext, WebhookDecision, WebhookFunction, WebhookRequest,
};

pub struct AppState {
    pub store: Store,
    pub engine: BuildEngine,
    pub runner: RunSupervisor,
    pub env: Arc<EnvManager>,
    pub build_root: PathBuf,
    pub webhook: ScriptSlot<dyn WebhookFunction>,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/hook/build",
            post(hook_build).fallback(|| async { StatusCode::NOT_FOUND }),
        )
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

async fn hook_build(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let record = state.engine.create_build().await.map_err(|e| {
        tracing::error!("cannot create build: {}", e);
        ApiError::Internal(e.to_string())
    })?;
    let build_id = record.id;

    let webhook = state.webhook.get().map_err(|e| {
        tracing::error!(build_id = %build_id, "webhook function unavailable: {}", e);
        ApiError::Internal(e.to_string())
    })?;

    let dir = build_dir(&state.build_root, &build_id);
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        tracing::error!(build_id = %build_id, "cannot create build directory: {}", e);
        ApiError::Internal(e.to_string())
    })?;

    let ctx = WebhookContext {
        request: WebhookRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: header_map(&headers),
            body: String::from_utf8_lossy(&body).into_owned(),
        },
        env: state.env.build_env(),
        build_dir: dir,
    };
    let decision = webhook.handle(ctx).await.map_err(|e| {
        tracing::error!(build_id = %build_id, "webhook failed: {:#}", e);
        ApiError::Internal(format!("{:#}", e))
    })?;

    match decision {
        WebhookDecision::Build { param, autorun } => {
            let runner = state.runner.clone();
            let id = build_id.clone();
            state
                .engine
                .enqueue(
                    &build_id,
                    param,
                    Box::new(move |ok| {
                        if ok && autorun {
                            runner.enqueue(&id);
                        }
                    }),
                )
                .await
                .map_err(|e| {
                    tracing::error!(build_id = %build_id, "{:#}", e);
                    ApiError::Internal(format!("{:#}", e))
                })?;
            tracing::info!(build_id = %build_id, autorun, "webhook accepted");
        }
        WebhookDecision::Skip => {
            state
                .store
                .update_build_record(&build_id, BuildPatch::Stopped)
                .await
                .map_err(|e| {
                    tracing::error!(build_id = %build_id, "{}", e);
                    ApiError::Internal(e.to_string())
                })?;
            tracing::info!(build_id = %build_id, "webhook declined");
        }
    }
    Ok(StatusCode::OK)
}

/// Serve the webhook endpoint on `port` until `shutdown` resolves.
pub async fn serve(
    state: SharedState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("webhook listening on http://{}/hook/build", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Webhook server error")
}
