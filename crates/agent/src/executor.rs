use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relay_core::model::TaskPayload;

use crate::deploy::{self, DeployError};
use crate::ssh::SshSession;

/// Runs one decoded task payload and returns report details.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: TaskPayload) -> anyhow::Result<serde_json::Value>;
}

/// Executes tasks over SSH/SFTP on a blocking worker thread.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TaskExecutor for SshExecutor {
    async fn execute(&self, payload: TaskPayload) -> anyhow::Result<serde_json::Value> {
        let timeout = self.timeout;
        let details = tokio::task::spawn_blocking(move || run_blocking(payload, timeout))
            .await
            .context("ssh worker aborted")??;
        Ok(details)
    }
}

fn run_blocking(payload: TaskPayload, timeout: Duration) -> Result<serde_json::Value, DeployError> {
    // `session` outlives `fs`, so the SFTP channel closes before the disconnect.
    match payload {
        TaskPayload::DeployFiles(p) => {
            for f in &p.files {
                deploy::validate_file_name(&f.name)?;
            }
            let session = SshSession::connect(&p.connection, timeout)?;
            let mut fs = session.sftp()?;
            let report = deploy::deploy_files(&mut fs, &p.target_path, &p.files)?;
            tracing::info!(host = %p.connection.host, files = report.files.len(), "files deployed");
            Ok(serde_json::json!(report))
        }
        TaskPayload::RemoveFiles(p) => {
            for name in &p.file_names {
                deploy::validate_file_name(name)?;
            }
            let session = SshSession::connect(&p.connection, timeout)?;
            let mut fs = session.sftp()?;
            let report = deploy::remove_files(&mut fs, &p.target_path, &p.file_names)?;
            tracing::info!(
                host = %p.connection.host,
                removed = report.removed.len(),
                already_absent = report.already_absent.len(),
                "files removed"
            );
            Ok(serde_json::json!(report))
        }
    }
}
