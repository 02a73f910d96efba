use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    DeployPayload, EpochMs, Id, RemovePayload, ResourceStatus, Task, TaskKind, TaskPayload, TaskSpec,
    TaskStatus,
};

/// Route paths shared by the daemon router and the agent client.
pub mod routes {
    pub const HEALTHZ: &str = "/healthz";
    pub const AGENT_HEARTBEAT: &str = "/v1/agent/heartbeat";
    pub const AGENT_POLL: &str = "/v1/agent/poll";
    pub const AGENT_REPORT: &str = "/v1/agent/tasks/{task_id}/report";
    pub const ADMIN_TASKS: &str = "/v1/admin/tasks";
    pub const ADMIN_TASK: &str = "/v1/admin/tasks/{task_id}";
    pub const ADMIN_TARGET: &str = "/v1/admin/targets/{target_id}";
    pub const ADMIN_AGENTS: &str = "/v1/admin/agents";

    /// Concrete report path for one task.
    pub fn agent_report(task_id: &str) -> String {
        AGENT_REPORT.replace("{task_id}", task_id)
    }
}

/// Agent heartbeat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub version: Option<String>,
}

/// Agent heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_time_ms: EpochMs,
}

/// A claimed task handed to its agent.
///
/// `payload` is kept as raw JSON on the wire so that an agent can still
/// report an unknown `type` instead of failing to decode the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Id,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target_id: Id,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported task type")]
    UnsupportedKind,
    #[error("malformed {kind:?} payload: {source}")]
    MalformedPayload {
        kind: TaskKind,
        #[source]
        source: serde_json::Error,
    },
}

impl TaskAssignment {
    pub fn new(task_id: Id, target_id: Id, payload: &TaskPayload) -> Result<Self, serde_json::Error> {
        let body = match payload {
            TaskPayload::DeployFiles(p) => serde_json::to_value(p)?,
            TaskPayload::RemoveFiles(p) => serde_json::to_value(p)?,
        };
        Ok(Self {
            task_id,
            kind: payload.kind(),
            target_id,
            payload: body,
        })
    }

    /// Decodes the payload for the declared `type`.
    pub fn decode_payload(&self) -> Result<TaskPayload, ProtocolError> {
        let malformed = |source| ProtocolError::MalformedPayload {
            kind: self.kind,
            source,
        };
        match self.kind {
            TaskKind::DeployFiles => serde_json::from_value::<DeployPayload>(self.payload.clone())
                .map(TaskPayload::DeployFiles)
                .map_err(malformed),
            TaskKind::RemoveFiles => serde_json::from_value::<RemovePayload>(self.payload.clone())
                .map(TaskPayload::RemoveFiles)
                .map_err(malformed),
            TaskKind::Unsupported => Err(ProtocolError::UnsupportedKind),
        }
    }
}

/// Outcome reported by the agent that owns a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl ReportRequest {
    pub fn succeeded(details: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            error: None,
            details,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            details: None,
        }
    }
}

/// Report acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub ok: bool,
    pub status: TaskStatus,
}

/// JSON error body returned by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Admin: create a pending task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub target_id: Id,
    #[serde(flatten)]
    pub spec: TaskSpec,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Task record as shown to administrators. Never carries the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Id,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target_id: Id,
    pub status: TaskStatus,
    pub agent_id: Option<Id>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at_ms: EpochMs,
    pub last_attempt_at_ms: Option<EpochMs>,
    pub completed_at_ms: Option<EpochMs>,
    pub updated_at_ms: EpochMs,
}

impl From<&Task> for TaskView {
    fn from(t: &Task) -> Self {
        Self {
            task_id: t.task_id.clone(),
            kind: t.kind,
            target_id: t.target_id.clone(),
            status: t.status,
            agent_id: t.agent_id.clone(),
            attempts: t.attempts,
            max_attempts: t.max_attempts,
            result: t.result.clone(),
            error_message: t.error_message.clone(),
            created_at_ms: t.created_at_ms,
            last_attempt_at_ms: t.last_attempt_at_ms,
            completed_at_ms: t.completed_at_ms,
            updated_at_ms: t.updated_at_ms,
        }
    }
}

/// Admin: register or update a target appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertTargetRequest {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Encrypted SSH password, opaque to the daemon until dispatch.
    #[serde(default)]
    pub secret_ciphertext: Option<String>,
    #[serde(default)]
    pub target_path: Option<String>,
}

/// Admin view of a target. The secret is never echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetView {
    pub target_id: Id,
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssh_user: Option<String>,
    pub has_secret: bool,
    pub target_path: Option<String>,
    pub deploy_status: ResourceStatus,
    pub deployed_at_ms: Option<EpochMs>,
    pub status_message: Option<String>,
}

/// Admin: provision a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionAgentRequest {
    pub name: String,
}

/// The token is shown once; only its hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionAgentResponse {
    pub agent_id: Id,
    pub token: String,
}
