use std::sync::Arc;

use relay_core::{
    api::{
        CreateTaskRequest, HeartbeatResponse, ProvisionAgentResponse, ReportRequest, ReportResponse,
        TargetView, TaskAssignment, TaskView, UpsertTargetRequest,
    },
    model::{AgentIdentity, EpochMs, ResourceStatus, Task, TaskKind, TaskSpec, TaskStatus},
    new_id, now_ms,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Dispatch, Dispatcher};
use crate::secrets::SecretStore;
use crate::store::{
    token_hash, AgentRecord, AgentRegistry, Contact, ResourceStatusSink, StatusUpdate, TargetDirectory,
    TaskStore,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("task is held by another agent")]
    NotOwner,
    #[error("task is {0}, expected claimed")]
    NotClaimed(TaskStatus),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The collaborators the service runs against.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub agents: Arc<dyn AgentRegistry>,
    pub targets: Arc<dyn TargetDirectory>,
    pub sink: Arc<dyn ResourceStatusSink>,
}

impl Stores {
    /// One backend serving every seam.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: TaskStore + AgentRegistry + TargetDirectory + ResourceStatusSink + 'static,
    {
        Self {
            tasks: store.clone(),
            agents: store.clone(),
            targets: store.clone(),
            sink: store,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub liveness_window_ms: EpochMs,
    pub default_max_attempts: u32,
}

/// Server side of the relay protocol: claims, payload delivery, reports.
pub struct RelayService {
    tasks: Arc<dyn TaskStore>,
    agents: Arc<dyn AgentRegistry>,
    targets: Arc<dyn TargetDirectory>,
    sink: Arc<dyn ResourceStatusSink>,
    dispatcher: Dispatcher,
    config: ServiceConfig,
}

impl RelayService {
    pub fn new(stores: Stores, secrets: Arc<dyn SecretStore>, config: ServiceConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(stores.targets.clone(), secrets),
            tasks: stores.tasks,
            agents: stores.agents,
            targets: stores.targets,
            sink: stores.sink,
            config,
        }
    }

    /// Resolves a bearer token and records the contact on the agent.
    pub async fn authenticate(&self, bearer: &str, contact: &Contact) -> anyhow::Result<Option<AgentIdentity>> {
        let Some(agent) = self.agents.authenticate(bearer).await? else {
            return Ok(None);
        };
        self.agents.touch(&agent.agent_id, contact, now_ms()).await?;
        Ok(Some(agent))
    }

    pub async fn heartbeat(&self, agent: &AgentIdentity, version: Option<String>) -> anyhow::Result<HeartbeatResponse> {
        let now = now_ms();
        if version.is_some() {
            let contact = Contact { ip: None, version };
            self.agents.touch(&agent.agent_id, &contact, now).await?;
        }
        Ok(HeartbeatResponse { server_time_ms: now })
    }

    pub async fn recover_stale(&self) -> anyhow::Result<usize> {
        self.recover_stale_at(now_ms()).await
    }

    pub async fn recover_stale_at(&self, now: EpochMs) -> anyhow::Result<usize> {
        let cutoff = now.saturating_sub(self.config.liveness_window_ms);
        let recovered = self.tasks.recover_stale(cutoff, now).await?;
        for task in &recovered {
            warn!(
                task_id = %task.task_id,
                attempts = task.attempts,
                max_attempts = task.max_attempts,
                "requeued stale claim"
            );
        }
        Ok(recovered.len())
    }

    /// Hands `agent` its next task, or `None` when there is nothing it may run.
    pub async fn poll(&self, agent: &AgentIdentity) -> Result<Option<TaskAssignment>, ServiceError> {
        let now = now_ms();
        self.recover_stale_at(now).await?;

        if let Some(held) = self.tasks.held_by(&agent.agent_id).await? {
            info!(task_id = %held.task_id, agent_id = %agent.agent_id, "resuming held task");
            return match &held.payload {
                Some(payload) => Ok(Some(assignment(&held, payload)?)),
                None => self.deliver(agent, held, now).await,
            };
        }

        let Some(candidate) = self.tasks.oldest_pending().await? else {
            return Ok(None);
        };
        let Some(claimed) = self.tasks.try_claim(&candidate.task_id, &agent.agent_id, now).await? else {
            debug!(task_id = %candidate.task_id, agent_id = %agent.agent_id, "claim lost to another agent");
            return Ok(None);
        };
        info!(
            task_id = %claimed.task_id,
            agent_id = %agent.agent_id,
            attempts = claimed.attempts,
            "task claimed"
        );
        self.deliver(agent, claimed, now).await
    }

    async fn deliver(
        &self,
        agent: &AgentIdentity,
        task: Task,
        now: EpochMs,
    ) -> Result<Option<TaskAssignment>, ServiceError> {
        match self.dispatcher.assemble(&task).await? {
            Dispatch::Ready(payload) => {
                let Some(task) = self
                    .tasks
                    .attach_payload(&task.task_id, &agent.agent_id, &payload, now)
                    .await?
                else {
                    warn!(task_id = %task.task_id, "claim lost before payload delivery");
                    return Ok(None);
                };
                Ok(Some(assignment(&task, &payload)?))
            }
            Dispatch::Misconfigured(msg) => {
                warn!(task_id = %task.task_id, target_id = %task.target_id, error = %msg, "task misconfigured");
                if let Some(failed) = self
                    .tasks
                    .fail_terminal(&task.task_id, &agent.agent_id, &msg, now)
                    .await?
                {
                    self.mirror_status(&failed).await;
                }
                Ok(None)
            }
            Dispatch::Unavailable(msg) => {
                warn!(task_id = %task.task_id, error = %msg, "payload assembly failed");
                if let Some(failed) = self.tasks.fail(&task.task_id, &agent.agent_id, &msg, now).await? {
                    self.mirror_status(&failed).await;
                }
                Ok(None)
            }
        }
    }

    pub async fn report(
        &self,
        agent: &AgentIdentity,
        task_id: &str,
        req: ReportRequest,
    ) -> Result<ReportResponse, ServiceError> {
        let now = now_ms();
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("task {task_id}")))?;
        check_owner(&task, &agent.agent_id)?;

        let updated = if req.success {
            self.tasks
                .complete(task_id, &agent.agent_id, req.details, now)
                .await?
        } else {
            let error = req
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "agent reported failure without a message".to_string());
            self.tasks.fail(task_id, &agent.agent_id, &error, now).await?
        };

        let Some(task) = updated else {
            // Lost a race with stale recovery between the read and the write.
            let current = self
                .tasks
                .get_task(task_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("task {task_id}")))?;
            check_owner(&current, &agent.agent_id)?;
            return Err(ServiceError::NotClaimed(current.status));
        };

        info!(
            task_id = %task.task_id,
            agent_id = %agent.agent_id,
            success = req.success,
            status = %task.status,
            attempts = task.attempts,
            "task reported"
        );
        self.mirror_status(&task).await;
        Ok(ReportResponse {
            ok: true,
            status: task.status,
        })
    }

    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<TaskView, ServiceError> {
        match &req.spec {
            TaskSpec::DeployFiles { files } if files.is_empty() => {
                return Err(ServiceError::Invalid("files must not be empty".into()))
            }
            TaskSpec::RemoveFiles { file_names } if file_names.is_empty() => {
                return Err(ServiceError::Invalid("file_names must not be empty".into()))
            }
            _ => {}
        }
        if req.target_id.trim().is_empty() {
            return Err(ServiceError::Invalid("target_id must not be empty".into()));
        }
        let max_attempts = req.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(ServiceError::Invalid("max_attempts must be at least 1".into()));
        }

        let task = Task::new(new_id(), req.target_id, req.spec, max_attempts, now_ms());
        self.tasks.insert_task(&task).await?;
        info!(task_id = %task.task_id, target_id = %task.target_id, kind = ?task.kind, "task created");
        Ok(TaskView::from(&task))
    }

    pub async fn task(&self, task_id: &str) -> Result<TaskView, ServiceError> {
        self.tasks
            .get_task(task_id)
            .await?
            .map(|t| TaskView::from(&t))
            .ok_or_else(|| ServiceError::NotFound(format!("task {task_id}")))
    }

    pub async fn upsert_target(&self, target_id: &str, req: UpsertTargetRequest) -> Result<TargetView, ServiceError> {
        if req.name.trim().is_empty() {
            return Err(ServiceError::Invalid("name must not be empty".into()));
        }
        let target = self.targets.upsert_target(target_id, req, now_ms()).await?;
        Ok(target.view())
    }

    pub async fn target(&self, target_id: &str) -> Result<TargetView, ServiceError> {
        self.targets
            .get_target(target_id)
            .await?
            .map(|t| t.view())
            .ok_or_else(|| ServiceError::NotFound(format!("target {target_id}")))
    }

    /// Creates an agent and returns its one-time bearer token.
    pub async fn provision_agent(&self, name: String) -> Result<ProvisionAgentResponse, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Invalid("name must not be empty".into()));
        }
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let agent = AgentRecord {
            agent_id: new_id(),
            name,
            token_hash: token_hash(&token),
            version: None,
            last_heartbeat_ms: None,
            last_ip: None,
            created_at_ms: now_ms(),
        };
        self.agents.insert_agent(&agent).await?;
        info!(agent_id = %agent.agent_id, name = %agent.name, "agent provisioned");
        Ok(ProvisionAgentResponse {
            agent_id: agent.agent_id,
            token,
        })
    }

    /// Writes the task's outcome onto its target. Errors are logged only:
    /// the task itself is already final.
    async fn mirror_status(&self, task: &Task) {
        let Some(update) = resource_status(task) else {
            return;
        };
        if let Err(e) = self.sink.record_status(&task.target_id, &update).await {
            warn!(task_id = %task.task_id, target_id = %task.target_id, "status mirror failed: {e:?}");
        }
    }
}

fn assignment(task: &Task, payload: &relay_core::model::TaskPayload) -> anyhow::Result<TaskAssignment> {
    Ok(TaskAssignment::new(
        task.task_id.clone(),
        task.target_id.clone(),
        payload,
    )?)
}

fn check_owner(task: &Task, agent_id: &str) -> Result<(), ServiceError> {
    if task.status != TaskStatus::Claimed {
        return Err(ServiceError::NotClaimed(task.status));
    }
    if task.agent_id.as_deref() != Some(agent_id) {
        return Err(ServiceError::NotOwner);
    }
    Ok(())
}

/// Denormalized target status for a task that just reached a terminal state.
fn resource_status(task: &Task) -> Option<StatusUpdate> {
    let (status, message) = match (task.status, task.kind) {
        (TaskStatus::Completed, TaskKind::DeployFiles) => (ResourceStatus::Deployed, None),
        (TaskStatus::Completed, TaskKind::RemoveFiles) => (ResourceStatus::NotDeployed, None),
        (TaskStatus::Failed, TaskKind::DeployFiles | TaskKind::RemoveFiles) => {
            (ResourceStatus::Failed, task.error_message.clone())
        }
        _ => return None,
    };
    Some(StatusUpdate {
        status,
        message,
        at_ms: task.completed_at_ms.unwrap_or(task.updated_at_ms),
    })
}
