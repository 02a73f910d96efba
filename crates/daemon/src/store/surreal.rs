use anyhow::Context;
use async_trait::async_trait;
use relay_core::api::UpsertTargetRequest;
use relay_core::model::{AgentIdentity, EpochMs, ResourceStatus, Task, TaskPayload};

use super::{
    token_hash, AgentRecord, AgentRegistry, Contact, ResourceStatusSink, StatusUpdate, Target,
    TargetDirectory, TaskStore,
};
use crate::db::Db;

/// SurrealDB-backed implementation of every store seam.
#[derive(Clone)]
pub struct SurrealStore {
    db: Db,
}

impl SurrealStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Runs a single guarded `UPDATE ... RETURN AFTER` and returns the record
    /// when the guard matched.
    async fn update_task(
        &self,
        sql: &'static str,
        task_id: &str,
        agent_id: &str,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(sql)
            .bind(("id", task_id.to_string()))
            .bind(("agent", agent_id.to_string()))
            .bind(("now", now))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }
}

/// Concurrent writers to one record surface as a retryable commit conflict:
/// the datastore error `Db::TxRetryable` ("Failed to commit transaction due
/// to a read or write conflict. This transaction can be retried") or
/// SurrealKV's transaction write conflict. Both are matched on the rendered
/// message.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    is_conflict_message(&err.to_string())
}

fn is_conflict_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("conflict")
}

#[async_trait]
impl TaskStore for SurrealStore {
    async fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        self.db
            .inner()
            .query(r#"CREATE type::thing("task", $id) CONTENT $task RETURN NONE;"#)
            .bind(("id", task.task_id.clone()))
            .bind(("task", task.clone()))
            .await?
            .check()
            .with_context(|| format!("creating task {}", task.task_id))?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(r#"SELECT * FROM type::thing("task", $id);"#)
            .bind(("id", task_id.to_string()))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn recover_stale(&self, cutoff: EpochMs, now: EpochMs) -> anyhow::Result<Vec<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"UPDATE task
                   SET status = "pending",
                       agent_id = NONE,
                       payload = NONE,
                       updated_at_ms = $now
                   WHERE status = "claimed" AND updated_at_ms < $cutoff
                   RETURN AFTER;"#,
            )
            .bind(("cutoff", cutoff))
            .bind(("now", now))
            .await?;
        Ok(resp.take(0)?)
    }

    async fn held_by(&self, agent_id: &str) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"SELECT * FROM task
                   WHERE status = "claimed" AND agent_id = $agent
                   ORDER BY created_at_ms ASC
                   LIMIT 1;"#,
            )
            .bind(("agent", agent_id.to_string()))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn oldest_pending(&self) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"SELECT * FROM task
                   WHERE status = "pending"
                   ORDER BY created_at_ms ASC, task_id ASC
                   LIMIT 1;"#,
            )
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn try_claim(&self, task_id: &str, agent_id: &str, now: EpochMs) -> anyhow::Result<Option<Task>> {
        let q = r#"
            UPDATE type::thing("task", $id)
            SET status = "claimed",
                agent_id = $agent,
                attempts += 1,
                last_attempt_at_ms = $now,
                updated_at_ms = $now
            WHERE status = "pending"
            RETURN AFTER;
        "#;
        match self.update_task(q, task_id, agent_id, now).await {
            Ok(claimed) => Ok(claimed),
            Err(e) => match e.downcast_ref::<surrealdb::Error>() {
                Some(db_err) if is_write_conflict(db_err) => {
                    tracing::debug!(task_id, agent_id, "claim lost to a concurrent writer");
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    async fn attach_payload(
        &self,
        task_id: &str,
        agent_id: &str,
        payload: &TaskPayload,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"UPDATE type::thing("task", $id)
                   SET payload = $payload, updated_at_ms = $now
                   WHERE status = "claimed" AND agent_id = $agent
                   RETURN AFTER;"#,
            )
            .bind(("id", task_id.to_string()))
            .bind(("agent", agent_id.to_string()))
            .bind(("payload", payload.clone()))
            .bind(("now", now))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn complete(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Option<serde_json::Value>,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"UPDATE type::thing("task", $id)
                   SET status = "completed",
                       payload = NONE,
                       result = $result,
                       error_message = NONE,
                       completed_at_ms = $now,
                       updated_at_ms = $now
                   WHERE status = "claimed" AND agent_id = $agent
                   RETURN AFTER;"#,
            )
            .bind(("id", task_id.to_string()))
            .bind(("agent", agent_id.to_string()))
            .bind(("result", result))
            .bind(("now", now))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fail(&self, task_id: &str, agent_id: &str, error: &str, now: EpochMs) -> anyhow::Result<Option<Task>> {
        // Same guard twice: the first statement only matches the final
        // attempt, after which the second no longer sees a claimed task.
        let q = r#"
            UPDATE type::thing("task", $id)
            SET status = "failed",
                payload = NONE,
                error_message = $error,
                completed_at_ms = $now,
                updated_at_ms = $now
            WHERE status = "claimed" AND agent_id = $agent AND attempts >= max_attempts
            RETURN AFTER;

            UPDATE type::thing("task", $id)
            SET status = "pending",
                agent_id = NONE,
                payload = NONE,
                error_message = $error,
                updated_at_ms = $now
            WHERE status = "claimed" AND agent_id = $agent
            RETURN AFTER;
        "#;
        let mut resp = self
            .db
            .inner()
            .query(q)
            .bind(("id", task_id.to_string()))
            .bind(("agent", agent_id.to_string()))
            .bind(("error", error.to_string()))
            .bind(("now", now))
            .await?;
        let terminal: Vec<Task> = resp.take(0)?;
        let retried: Vec<Task> = resp.take(1)?;
        Ok(terminal.into_iter().chain(retried).next())
    }

    async fn fail_terminal(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &str,
        now: EpochMs,
    ) -> anyhow::Result<Option<Task>> {
        let mut resp = self
            .db
            .inner()
            .query(
                r#"UPDATE type::thing("task", $id)
                   SET status = "failed",
                       payload = NONE,
                       error_message = $error,
                       completed_at_ms = $now,
                       updated_at_ms = $now
                   WHERE status = "claimed" AND agent_id = $agent
                   RETURN AFTER;"#,
            )
            .bind(("id", task_id.to_string()))
            .bind(("agent", agent_id.to_string()))
            .bind(("error", error.to_string()))
            .bind(("now", now))
            .await?;
        let rows: Vec<Task> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl AgentRegistry for SurrealStore {
    async fn authenticate(&self, bearer: &str) -> anyhow::Result<Option<AgentIdentity>> {
        let mut resp = self
            .db
            .inner()
            .query("SELECT * FROM agent WHERE token_hash = $hash LIMIT 1;")
            .bind(("hash", token_hash(bearer)))
            .await?;
        let rows: Vec<AgentRecord> = resp.take(0)?;
        Ok(rows.into_iter().next().map(|a| AgentIdentity {
            agent_id: a.agent_id,
            name: a.name,
        }))
    }

    async fn touch(&self, agent_id: &str, contact: &Contact, now: EpochMs) -> anyhow::Result<()> {
        let mut sets = vec!["last_heartbeat_ms = $now"];
        if contact.ip.is_some() {
            sets.push("last_ip = $ip");
        }
        if contact.version.is_some() {
            sets.push("version = $version");
        }
        let q = format!(
            r#"UPDATE type::thing("agent", $id) SET {} RETURN NONE;"#,
            sets.join(", ")
        );
        self.db
            .inner()
            .query(q)
            .bind(("id", agent_id.to_string()))
            .bind(("now", now))
            .bind(("ip", contact.ip.clone()))
            .bind(("version", contact.version.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn insert_agent(&self, agent: &AgentRecord) -> anyhow::Result<()> {
        self.db
            .inner()
            .query(r#"CREATE type::thing("agent", $id) CONTENT $agent RETURN NONE;"#)
            .bind(("id", agent.agent_id.clone()))
            .bind(("agent", agent.clone()))
            .await?
            .check()
            .with_context(|| format!("creating agent {}", agent.agent_id))?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentRecord>> {
        let mut resp = self
            .db
            .inner()
            .query(r#"SELECT * FROM type::thing("agent", $id);"#)
            .bind(("id", agent_id.to_string()))
            .await?;
        let rows: Vec<AgentRecord> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl TargetDirectory for SurrealStore {
    async fn get_target(&self, target_id: &str) -> anyhow::Result<Option<Target>> {
        let mut resp = self
            .db
            .inner()
            .query(r#"SELECT * FROM type::thing("target", $id);"#)
            .bind(("id", target_id.to_string()))
            .await?;
        let rows: Vec<Target> = resp.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_target(&self, target_id: &str, req: UpsertTargetRequest, now: EpochMs) -> anyhow::Result<Target> {
        let target = match self.get_target(target_id).await? {
            Some(mut existing) => {
                existing.merge_request(req, now);
                existing
            }
            None => Target::from_request(target_id, req, now),
        };
        self.db
            .inner()
            .query(r#"UPSERT type::thing("target", $id) CONTENT $target RETURN NONE;"#)
            .bind(("id", target_id.to_string()))
            .bind(("target", target.clone()))
            .await?
            .check()
            .with_context(|| format!("upserting target {target_id}"))?;
        Ok(target)
    }
}

#[async_trait]
impl ResourceStatusSink for SurrealStore {
    async fn record_status(&self, target_id: &str, update: &StatusUpdate) -> anyhow::Result<()> {
        let deployed_at = match update.status {
            ResourceStatus::Deployed => ", deployed_at_ms = $at",
            ResourceStatus::NotDeployed => ", deployed_at_ms = NONE",
            ResourceStatus::Failed => "",
        };
        let q = format!(
            r#"UPDATE type::thing("target", $id)
               SET deploy_status = $status, status_message = $message, updated_at_ms = $at{deployed_at}
               RETURN NONE;"#
        );
        self.db
            .inner()
            .query(q)
            .bind(("id", target_id.to_string()))
            .bind(("status", update.status))
            .bind(("message", update.message.clone()))
            .bind(("at", update.at_ms))
            .await?
            .check()
            .with_context(|| format!("recording status for target {target_id}"))?;
        Ok(())
    }
}
