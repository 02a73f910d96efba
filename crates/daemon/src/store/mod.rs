//! Persistence seams for the daemon.
//!
//! The task store owns the task state machine. Every transition is a
//! conditional update guarded by the task's current status (and owner, where
//! relevant); a guard that matches nothing yields `None` instead of an error.

use async_trait::async_trait;
use relay_core::api::{TargetView, UpsertTargetRequest};
use relay_core::model::{AgentIdentity, EpochMs, Id, ResourceStatus, Task, TaskPayload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod memory;
mod surreal;

pub use memory::MemoryStore;
pub use surreal::SurrealStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()>;

    async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<Task>>;

    /// Returns claims whose `updated_at_ms` is older than `cutoff` to
    /// `pending`, clearing owner and payload. Returns the requeued tasks.
    async fn recover_stale(&self, cutoff: EpochMs, now: EpochMs) -> anyhow::Result<Vec<Task>>;

    /// The task currently claimed by `agent_id`, if any.
    async fn held_by(&self, agent_id: &str) -> anyhow::Result<Option<Task>>;

    /// Oldest pending task by creation time.
    async fn oldest_pending(&self) -> anyhow::Result<Option<Task>>;

    /// Claims `task_id` only if it is still pending.
    async fn try_claim(&self, task_id: &str, agent_id: &str, now: EpochMs) -> anyhow::Result<Option<Task>>;

    async fn attach_payload(
        &self,
        task_id: &str,
        agent_id: &str,
        payload: &TaskPayload,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>>;

    async fn complete(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Option<serde_json::Value>,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>>;

    /// Failed attempt: back to pending, or failed once attempts are used up.
    async fn fail(&self, task_id: &str, agent_id: &str, error: &str, now: EpochMs) -> anyhow::Result<Option<Task>>;

    /// Failure that no retry can fix.
    async fn fail_terminal(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &str,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>>;
}

/// Agent record. Provisioned out of band, never deleted by the task protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: Id,
    pub name: String,
    pub token_hash: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_heartbeat_ms: Option<EpochMs>,
    #[serde(default)]
    pub last_ip: Option<String>,
    pub created_at_ms: EpochMs,
}

/// Liveness metadata captured from an authenticated request.
#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub ip: Option<String>,
    pub version: Option<String>,
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn authenticate(&self, bearer: &str) -> anyhow::Result<Option<AgentIdentity>>;

    /// Updates `last_heartbeat_ms` / `last_ip` (and version when declared).
    async fn touch(&self, agent_id: &str, contact: &Contact, now: EpochMs) -> anyhow::Result<()>;

    async fn insert_agent(&self, agent: &AgentRecord) -> anyhow::Result<()>;

    async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentRecord>>;
}

/// Target appliance as the daemon sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_id: Id,
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub secret_ciphertext: Option<String>,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub deploy_status: ResourceStatus,
    #[serde(default)]
    pub deployed_at_ms: Option<EpochMs>,
    #[serde(default)]
    pub status_message: Option<String>,
    pub updated_at_ms: EpochMs,
}

impl Target {
    pub fn from_request(target_id: &str, req: UpsertTargetRequest, now: EpochMs) -> Self {
        Self {
            target_id: target_id.to_string(),
            name: req.name,
            host: req.host,
            port: req.port,
            ssh_user: req.ssh_user,
            secret_ciphertext: req.secret_ciphertext,
            target_path: req.target_path,
            deploy_status: ResourceStatus::NotDeployed,
            deployed_at_ms: None,
            status_message: None,
            updated_at_ms: now,
        }
    }

    /// Overwrites connection fields, keeps the mirrored deployment status.
    pub fn merge_request(&mut self, req: UpsertTargetRequest, now: EpochMs) {
        self.name = req.name;
        self.host = req.host;
        self.port = req.port;
        self.ssh_user = req.ssh_user;
        self.secret_ciphertext = req.secret_ciphertext;
        self.target_path = req.target_path;
        self.updated_at_ms = now;
    }

    pub fn view(&self) -> TargetView {
        TargetView {
            target_id: self.target_id.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            ssh_user: self.ssh_user.clone(),
            has_secret: self.secret_ciphertext.is_some(),
            target_path: self.target_path.clone(),
            deploy_status: self.deploy_status,
            deployed_at_ms: self.deployed_at_ms,
            status_message: self.status_message.clone(),
        }
    }
}

#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn get_target(&self, target_id: &str) -> anyhow::Result<Option<Target>>;

    async fn upsert_target(&self, target_id: &str, req: UpsertTargetRequest, now: EpochMs) -> anyhow::Result<Target>;
}

/// Denormalized status written back onto the target resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ResourceStatus,
    pub message: Option<String>,
    pub at_ms: EpochMs,
}

#[async_trait]
pub trait ResourceStatusSink: Send + Sync {
    async fn record_status(&self, target_id: &str, update: &StatusUpdate) -> anyhow::Result<()>;
}

/// Hex SHA-256 of a bearer token; the only form in which tokens are stored.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
