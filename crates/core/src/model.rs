use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque record identifier (ULID string).
pub type Id = String;

/// Unix epoch milliseconds.
pub type EpochMs = i64;

/// Lifecycle state of a task.
///
/// `pending -> claimed -> {completed | pending (retry) | failed}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of operation a task performs on its target.
///
/// Anything an older agent does not recognise decodes as `Unsupported`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DeployFiles,
    RemoveFiles,
    #[serde(other)]
    Unsupported,
}

/// A file to place on the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub content: String,
}

/// What the requester asked for. Contains no secrets and lives for the
/// whole lifetime of the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    DeployFiles { files: Vec<FileEntry> },
    RemoveFiles { file_names: Vec<String> },
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::DeployFiles { .. } => TaskKind::DeployFiles,
            Self::RemoveFiles { .. } => TaskKind::RemoveFiles,
        }
    }
}

/// SSH connection details for a target, including the decrypted secret.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub secret: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployPayload {
    pub connection: Connection,
    pub target_path: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovePayload {
    pub connection: Connection,
    pub target_path: String,
    pub file_names: Vec<String>,
}

/// Transient, secret-bearing execution data for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    DeployFiles(DeployPayload),
    RemoveFiles(RemovePayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::DeployFiles(_) => TaskKind::DeployFiles,
            Self::RemoveFiles(_) => TaskKind::RemoveFiles,
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to `pending` for another claim.
    Retry,
    /// Finalised as `failed`.
    Terminal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task is {0}, expected claimed")]
    NotClaimed(TaskStatus),
    #[error("task is held by another agent")]
    NotOwner,
}

/// Persistent task record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: Id,
    pub kind: TaskKind,
    pub target_id: Id,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    #[serde(default)]
    pub agent_id: Option<Id>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub payload: Option<TaskPayload>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at_ms: EpochMs,
    #[serde(default)]
    pub last_attempt_at_ms: Option<EpochMs>,
    #[serde(default)]
    pub completed_at_ms: Option<EpochMs>,
    /// Liveness clock for stale-claim detection.
    pub updated_at_ms: EpochMs,
}

impl Task {
    pub fn new(task_id: Id, target_id: Id, spec: TaskSpec, max_attempts: u32, now: EpochMs) -> Self {
        Self {
            task_id,
            kind: spec.kind(),
            target_id,
            spec,
            status: TaskStatus::Pending,
            agent_id: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            payload: None,
            result: None,
            error_message: None,
            created_at_ms: now,
            last_attempt_at_ms: None,
            completed_at_ms: None,
            updated_at_ms: now,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Claimed and not touched since `cutoff`.
    pub fn is_stale(&self, cutoff: EpochMs) -> bool {
        self.status == TaskStatus::Claimed && self.updated_at_ms < cutoff
    }

    pub fn is_held_by(&self, agent_id: &str) -> bool {
        self.status == TaskStatus::Claimed && self.agent_id.as_deref() == Some(agent_id)
    }

    /// Takes exclusive ownership. Returns false when the task is not pending.
    pub fn claim(&mut self, agent_id: &str, now: EpochMs) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Claimed;
        self.agent_id = Some(agent_id.to_string());
        self.attempts += 1;
        self.last_attempt_at_ms = Some(now);
        self.updated_at_ms = now;
        true
    }

    pub fn attach_payload(
        &mut self,
        agent_id: &str,
        payload: TaskPayload,
        now: EpochMs,
    ) -> Result<(), TransitionError> {
        self.ensure_held_by(agent_id)?;
        self.payload = Some(payload);
        self.updated_at_ms = now;
        Ok(())
    }

    pub fn complete(
        &mut self,
        agent_id: &str,
        result: Option<serde_json::Value>,
        now: EpochMs,
    ) -> Result<(), TransitionError> {
        self.ensure_held_by(agent_id)?;
        self.status = TaskStatus::Completed;
        self.payload = None;
        self.result = result;
        self.error_message = None;
        self.completed_at_ms = Some(now);
        self.updated_at_ms = now;
        Ok(())
    }

    /// Records a failed attempt; retries until `max_attempts` claims were used.
    pub fn fail(
        &mut self,
        agent_id: &str,
        error: &str,
        now: EpochMs,
    ) -> Result<FailureOutcome, TransitionError> {
        self.ensure_held_by(agent_id)?;
        self.error_message = Some(error.to_string());
        Ok(self.release(now))
    }

    /// Configuration errors skip the retry path.
    pub fn fail_terminal(&mut self, agent_id: &str, error: &str, now: EpochMs) -> Result<(), TransitionError> {
        self.ensure_held_by(agent_id)?;
        self.error_message = Some(error.to_string());
        self.finalize_failed(now);
        Ok(())
    }

    /// Returns an abandoned claim to `pending` for any agent. Callers check
    /// [`Task::is_stale`] first. The retry bound is applied when a claim
    /// reports failure, not here.
    pub fn recover_stale(&mut self, now: EpochMs) {
        self.requeue(now);
    }

    fn release(&mut self, now: EpochMs) -> FailureOutcome {
        if self.retries_exhausted() {
            self.finalize_failed(now);
            FailureOutcome::Terminal
        } else {
            self.requeue(now);
            FailureOutcome::Retry
        }
    }

    fn requeue(&mut self, now: EpochMs) {
        self.status = TaskStatus::Pending;
        self.agent_id = None;
        self.payload = None;
        self.updated_at_ms = now;
    }

    fn finalize_failed(&mut self, now: EpochMs) {
        self.status = TaskStatus::Failed;
        self.payload = None;
        self.completed_at_ms = Some(now);
        self.updated_at_ms = now;
    }

    fn ensure_held_by(&self, agent_id: &str) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Claimed {
            return Err(TransitionError::NotClaimed(self.status));
        }
        if self.agent_id.as_deref() != Some(agent_id) {
            return Err(TransitionError::NotOwner);
        }
        Ok(())
    }
}

/// Denormalized deployment status mirrored onto a target resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    NotDeployed,
    Deployed,
    Failed,
}

/// Identity resolved from an agent's bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: Id,
    pub name: String,
}
