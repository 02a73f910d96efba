use std::collections::HashMap;

use async_trait::async_trait;
use relay_core::api::UpsertTargetRequest;
use relay_core::model::{AgentIdentity, EpochMs, ResourceStatus, Task, TaskPayload, TaskStatus};
use tokio::sync::Mutex;

use super::{
    token_hash, AgentRecord, AgentRegistry, Contact, ResourceStatusSink, StatusUpdate, Target,
    TargetDirectory, TaskStore,
};

/// In-memory storage for tests. Not durable.
///
/// A single lock around all tables makes every conditional update atomic,
/// which is what the SurrealDB store gets from per-statement transactions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    agents: HashMap<String, AgentRecord>,
    targets: HashMap<String, Target>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `f` to a task and returns the updated copy when `f` accepted it.
    async fn update_task<F>(&self, task_id: &str, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(task_id)?;
        let mut next = task.clone();
        if f(&mut next) {
            *task = next.clone();
            Some(next)
        } else {
            None
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.task_id) {
            anyhow::bail!("task {} already exists", task.task_id);
        }
        inner.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(task_id).cloned())
    }

    async fn recover_stale(&self, cutoff: EpochMs, now: EpochMs) -> anyhow::Result<Vec<Task>> {
        let mut inner = self.inner.lock().await;
        let mut recovered = Vec::new();
        for task in inner.tasks.values_mut().filter(|t| t.is_stale(cutoff)) {
            task.recover_stale(now);
            recovered.push(task.clone());
        }
        Ok(recovered)
    }

    async fn held_by(&self, agent_id: &str) -> anyhow::Result<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.is_held_by(agent_id))
            .min_by_key(|t| t.created_at_ms)
            .cloned())
    }

    async fn oldest_pending(&self) -> anyhow::Result<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.task_id.cmp(&b.task_id))
            })
            .cloned())
    }

    async fn try_claim(&self, task_id: &str, agent_id: &str, now: EpochMs) -> anyhow::Result<Option<Task>> {
        Ok(self.update_task(task_id, |t| t.claim(agent_id, now)).await)
    }

    async fn attach_payload(
        &self,
        task_id: &str,
        agent_id: &str,
        payload: &TaskPayload,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        let payload = payload.clone();
        Ok(self
            .update_task(task_id, |t| t.attach_payload(agent_id, payload, now).is_ok())
            .await)
    }

    async fn complete(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Option<serde_json::Value>,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        Ok(self
            .update_task(task_id, |t| t.complete(agent_id, result, now).is_ok())
            .await)
    }

    async fn fail(&self, task_id: &str, agent_id: &str, error: &str, now: EpochMs) -> anyhow::Result<Option<Task>> {
        Ok(self
            .update_task(task_id, |t| t.fail(agent_id, error, now).is_ok())
            .await)
    }

    async fn fail_terminal(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &str,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        Ok(self
            .update_task(task_id, |t| t.fail_terminal(agent_id, error, now).is_ok())
            .await)
    }
}

#[async_trait]
impl AgentRegistry for MemoryStore {
    async fn authenticate(&self, bearer: &str) -> anyhow::Result<Option<AgentIdentity>> {
        let hash = token_hash(bearer);
        let inner = self.inner.lock().await;
        Ok(inner
            .agents
            .values()
            .find(|a| a.token_hash == hash)
            .map(|a| AgentIdentity {
                agent_id: a.agent_id.clone(),
                name: a.name.clone(),
            }))
    }

    async fn touch(&self, agent_id: &str, contact: &Contact, now: EpochMs) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            agent.last_heartbeat_ms = Some(now);
            if contact.ip.is_some() {
                agent.last_ip = contact.ip.clone();
            }
            if contact.version.is_some() {
                agent.version = contact.version.clone();
            }
        }
        Ok(())
    }

    async fn insert_agent(&self, agent: &AgentRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.agents.insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentRecord>> {
        Ok(self.inner.lock().await.agents.get(agent_id).cloned())
    }
}

#[async_trait]
impl TargetDirectory for MemoryStore {
    async fn get_target(&self, target_id: &str) -> anyhow::Result<Option<Target>> {
        Ok(self.inner.lock().await.targets.get(target_id).cloned())
    }

    async fn upsert_target(&self, target_id: &str, req: UpsertTargetRequest, now: EpochMs) -> anyhow::Result<Target> {
        let mut inner = self.inner.lock().await;
        let target = match inner.targets.get_mut(target_id) {
            Some(existing) => {
                existing.merge_request(req, now);
                existing.clone()
            }
            None => {
                let created = Target::from_request(target_id, req, now);
                inner.targets.insert(target_id.to_string(), created.clone());
                created
            }
        };
        Ok(target)
    }
}

#[async_trait]
impl ResourceStatusSink for MemoryStore {
    async fn record_status(&self, target_id: &str, update: &StatusUpdate) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(target) = inner.targets.get_mut(target_id) {
            apply_status(target, update);
        }
        Ok(())
    }
}

pub(crate) fn apply_status(target: &mut Target, update: &StatusUpdate) {
    target.deploy_status = update.status;
    target.status_message = update.message.clone();
    target.updated_at_ms = update.at_ms;
    match update.status {
        ResourceStatus::Deployed => target.deployed_at_ms = Some(update.at_ms),
        ResourceStatus::NotDeployed => target.deployed_at_ms = None,
        ResourceStatus::Failed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::model::TaskSpec;

    fn task(id: &str, created: EpochMs) -> Task {
        Task::new(
            id.into(),
            "pbx-1".into(),
            TaskSpec::RemoveFiles {
                file_names: vec!["a.conf".into()],
            },
            3,
            created,
        )
    }

    #[tokio::test]
    async fn test_oldest_pending_is_fifo_by_creation() {
        let store = MemoryStore::new();
        store.insert_task(&task("b", 20)).await.unwrap();
        store.insert_task(&task("a", 10)).await.unwrap();
        store.insert_task(&task("c", 30)).await.unwrap();

        let oldest = store.oldest_pending().await.unwrap().unwrap();
        assert_eq!(oldest.task_id, "a");

        store.try_claim("a", "agent-1", 40).await.unwrap().unwrap();
        let next = store.oldest_pending().await.unwrap().unwrap();
        assert_eq!(next.task_id, "b");
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert_task(&task("a", 10)).await.unwrap();
        assert!(store.insert_task(&task("a", 11)).await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_updates_return_none_on_mismatch() {
        let store = MemoryStore::new();
        store.insert_task(&task("a", 10)).await.unwrap();

        assert!(store.complete("a", "agent-1", None, 20).await.unwrap().is_none());
        store.try_claim("a", "agent-1", 20).await.unwrap().unwrap();
        assert!(store.try_claim("a", "agent-2", 21).await.unwrap().is_none());
        assert!(store.fail("a", "agent-2", "boom", 22).await.unwrap().is_none());

        let stored = store.get_task("a").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Claimed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_upsert_target_keeps_deploy_status() {
        let store = MemoryStore::new();
        let req = UpsertTargetRequest {
            name: "pbx".into(),
            host: Some("10.0.0.5".into()),
            port: None,
            ssh_user: Some("admin".into()),
            secret_ciphertext: Some("enc".into()),
            target_path: Some("/etc/pbx/".into()),
        };
        store.upsert_target("pbx-1", req.clone(), 1).await.unwrap();
        store
            .record_status(
                "pbx-1",
                &StatusUpdate {
                    status: ResourceStatus::Deployed,
                    message: None,
                    at_ms: 5,
                },
            )
            .await
            .unwrap();

        let updated = store.upsert_target("pbx-1", req, 9).await.unwrap();
        assert_eq!(updated.deploy_status, ResourceStatus::Deployed);
        assert_eq!(updated.deployed_at_ms, Some(5));
    }
}
