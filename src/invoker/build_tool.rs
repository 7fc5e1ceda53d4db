use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use super::ProcessTracker;

/// One build of a prepared project folder.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub project_folder: PathBuf,
    /// Identity the build runs on behalf of, exposed to the tests.
    pub principal: Option<String>,
    pub max_memory_mb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocationResult {
    pub exit_code: i32,
    pub output_lines: Vec<String>,
    pub expired_by_timeout: bool,
}

impl BuildInvocationResult {
    pub fn expired(output_lines: Vec<String>) -> Self {
        Self {
            exit_code: -1,
            output_lines,
            expired_by_timeout: true,
        }
    }

    pub fn too_much_output(&self, threshold: usize) -> bool {
        self.output_lines.len() >= threshold
    }
}

/// Seam between the pipeline and the external build tool.
///
/// Implementations must register the spawned process with `tracker` and report
/// `expired_by_timeout` instead of an error once the tracker was terminated.
/// Non-zero exit codes are part of the result, not errors.
#[async_trait]
pub trait BuildTool: Send + Sync {
    async fn run(
        &self,
        request: &InvocationRequest,
        tracker: &ProcessTracker,
    ) -> Result<BuildInvocationResult>;
}
