//! The build function contract and its script-backed implementation.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use buildmgr_common::LaunchDescriptor;
use serde::{Deserialize, Serialize};

use super::spawn::{SpawnOptions, Spawner};
use crate::env::EnvMap;
use crate::errors::BuildFailure;
use crate::log_store::LogChannel;

pub const BUILD_SCRIPT: &str = "build.sh";
pub const RESULT_FILE: &str = ".buildmgr-result.json";

/// Everything a build function is given for one build.
pub struct BuildContext {
    pub build_id: String,
    pub env: EnvMap,
    pub param: serde_json::Value,
    pub spawner: Spawner,
    pub build_dir: PathBuf,
    pub console: LogChannel,
}

/// What a successful build returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    pub starting: LaunchDescriptor,
}

/// A user-supplied build step. Returning an error marks the build failed.
#[async_trait]
pub trait BuildFunction: Send + Sync {
    async fn build(&self, ctx: BuildContext) -> Result<BuildOutput, BuildFailure>;
}

#[async_trait]
impl<F, Fut> BuildFunction for F
where
    F: Fn(BuildContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BuildOutput, BuildFailure>> + Send,
{
    async fn build(&self, ctx: BuildContext) -> Result<BuildOutput, BuildFailure> {
        self(ctx).await
    }
}

/// Runs `script/build.sh` inside the build directory.
///
/// The script receives the context as JSON on stdin
/// (`{buildId, env, param, buildDir}`), the build environment as process
/// environment, and `BUILDMGR_BUILD_ID`, `BUILDMGR_BUILD_DIR` and
/// `BUILDMGR_RESULT_FILE`. It must exit 0 and write
/// `{"result": ..., "starting": {"script": ...}}` to the result file.
pub struct ScriptBuildFunction {
    path: PathBuf,
}

impl ScriptBuildFunction {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScriptInput<'a> {
    build_id: &'a str,
    env: &'a EnvMap,
    param: &'a serde_json::Value,
    build_dir: &'a Path,
}

#[async_trait]
impl BuildFunction for ScriptBuildFunction {
    async fn build(&self, ctx: BuildContext) -> Result<BuildOutput, BuildFailure> {
        let result_file = ctx.build_dir.join(RESULT_FILE);
        let _ = tokio::fs::remove_file(&result_file).await;

        let input = serde_json::to_vec(&ScriptInput {
            build_id: &ctx.build_id,
            env: &ctx.env,
            param: &ctx.param,
            build_dir: &ctx.build_dir,
        })
        .map_err(|e| BuildFailure::Other(e.into()))?;

        let mut env = ctx.env.clone();
        env.insert("BUILDMGR_BUILD_ID".into(), ctx.build_id.clone());
        env.insert("BUILDMGR_BUILD_DIR".into(), ctx.build_dir.display().to_string());
        env.insert("BUILDMGR_RESULT_FILE".into(), result_file.display().to_string());

        let code = ctx
            .spawner
            .spawn(
                vec![self.path.display().to_string()],
                SpawnOptions {
                    cwd: None,
                    stdin: Some(input),
                    env,
                },
            )
            .await?;
        if code != 0 {
            return Err(BuildFailure::ScriptExit { code });
        }

        let raw = tokio::fs::read_to_string(&result_file).await.map_err(|e| {
            BuildFailure::InvalidResult(format!("cannot read {}: {}", result_file.display(), e))
        })?;
        let _ = tokio::fs::remove_file(&result_file).await;
        serde_json::from_str(&raw).map_err(|e| BuildFailure::InvalidResult(e.to_string()))
    }
}
