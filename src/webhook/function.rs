//! The webhook function contract and its script-backed implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::env::EnvMap;

pub const WEBHOOK_SCRIPT: &str = "webhook.sh";

/// The incoming HTTP request as seen by the webhook function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookRequest {
    pub method: String,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookContext {
    pub request: WebhookRequest,
    pub env: EnvMap,
    pub build_dir: PathBuf,
}

/// What to do with a webhook call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawDecision")]
pub enum WebhookDecision {
    Build {
        param: serde_json::Value,
        autorun: bool,
    },
    Skip,
}

#[derive(Deserialize)]
struct RawDecision {
    build: bool,
    #[serde(default)]
    param: serde_json::Value,
    #[serde(default)]
    autorun: bool,
}

impl From<RawDecision> for WebhookDecision {
    fn from(raw: RawDecision) -> Self {
        if raw.build {
            Self::Build {
                param: raw.param,
                autorun: raw.autorun,
            }
        } else {
            Self::Skip
        }
    }
}

/// Decides whether a webhook call should produce a build.
#[async_trait]
pub trait WebhookFunction: Send + Sync {
    async fn handle(&self, ctx: WebhookContext) -> Result<WebhookDecision>;
}

#[async_trait]
impl<F, Fut> WebhookFunction for F
where
    F: Fn(WebhookContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WebhookDecision>> + Send,
{
    async fn handle(&self, ctx: WebhookContext) -> Result<WebhookDecision> {
        self(ctx).await
    }
}

/// Runs `script/webhook.sh`.
///
/// The context goes to stdin as JSON, the build environment is set on the
/// process, and the decision is read from stdout:
/// `{"build": true, "param": {...}, "autorun": true}` or `{"build": false}`.
pub struct ScriptWebhookFunction {
    path: PathBuf,
}

impl ScriptWebhookFunction {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WebhookFunction for ScriptWebhookFunction {
    async fn handle(&self, ctx: WebhookContext) -> Result<WebhookDecision> {
        let input = serde_json::to_vec(&ctx).context("Failed to serialize webhook context")?;

        let mut child = Command::new(&self.path)
            .current_dir(&ctx.build_dir)
            .envs(&ctx.env)
            .env("BUILDMGR_BUILD_DIR", &ctx.build_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.path.display()))?;

        // Feed stdin while the output is collected; a script may answer
        // without reading its input at all.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("Failed to wait for webhook script")?;
        fed.context("Failed to write context to webhook stdin")?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::warn!(script = %self.path.display(), "{}", stderr.trim());
        }
        if !output.status.success() {
            anyhow::bail!(
                "Webhook script exited with code {}",
                output.status.code().unwrap_or(-1)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim())
            .with_context(|| format!("Webhook script printed an invalid decision: {}", stdout.trim()))
    }
}
