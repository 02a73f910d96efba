use std::sync::Arc;

use relay_core::model::{Connection, DeployPayload, RemovePayload, Task, TaskPayload, TaskSpec};

use crate::secrets::{SecretError, SecretStore};
use crate::store::{Target, TargetDirectory};

/// Result of assembling the payload for a claimed task.
#[derive(Debug)]
pub enum Dispatch {
    Ready(TaskPayload),
    /// Missing or undecryptable configuration. The task cannot succeed.
    Misconfigured(String),
    /// The secret store could not be reached. Worth another attempt.
    Unavailable(String),
}

/// Builds execution payloads from a task spec plus its target's connection
/// details. Secrets are decrypted here and nowhere else.
pub struct Dispatcher {
    targets: Arc<dyn TargetDirectory>,
    secrets: Arc<dyn SecretStore>,
}

impl Dispatcher {
    pub fn new(targets: Arc<dyn TargetDirectory>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { targets, secrets }
    }

    pub async fn assemble(&self, task: &Task) -> anyhow::Result<Dispatch> {
        let Some(target) = self.targets.get_target(&task.target_id).await? else {
            return Ok(Dispatch::Misconfigured(format!(
                "target {} is not registered",
                task.target_id
            )));
        };

        let (host, username, ciphertext, target_path) = match required_fields(&target) {
            Ok(fields) => fields,
            Err(missing) => {
                return Ok(Dispatch::Misconfigured(format!(
                    "target {} is missing {}",
                    target.target_id,
                    missing.join(", ")
                )))
            }
        };

        let secret = match self.secrets.decrypt(ciphertext).await {
            Ok(secret) => secret,
            Err(SecretError::Invalid(msg)) => {
                return Ok(Dispatch::Misconfigured(format!(
                    "credentials for target {} could not be decrypted: {msg}",
                    target.target_id
                )))
            }
            Err(e @ SecretError::Unavailable(_)) => return Ok(Dispatch::Unavailable(e.to_string())),
        };

        let connection = Connection {
            host: host.to_string(),
            port: target.port.unwrap_or(22),
            username: username.to_string(),
            secret,
        };
        let target_path = target_path.to_string();

        let payload = match &task.spec {
            TaskSpec::DeployFiles { files } => TaskPayload::DeployFiles(DeployPayload {
                connection,
                target_path,
                files: files.clone(),
            }),
            TaskSpec::RemoveFiles { file_names } => TaskPayload::RemoveFiles(RemovePayload {
                connection,
                target_path,
                file_names: file_names.clone(),
            }),
        };
        Ok(Dispatch::Ready(payload))
    }
}

/// Connection fields every task type needs, or the names of the absent ones.
fn required_fields(target: &Target) -> Result<(&str, &str, &str, &str), Vec<&'static str>> {
    fn present(v: &Option<String>) -> Option<&str> {
        v.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    let host = present(&target.host);
    let user = present(&target.ssh_user);
    let secret = present(&target.secret_ciphertext);
    let path = present(&target.target_path);

    match (host, user, secret, path) {
        (Some(h), Some(u), Some(s), Some(p)) => Ok((h, u, s, p)),
        _ => {
            let mut missing = Vec::new();
            if host.is_none() {
                missing.push("host");
            }
            if user.is_none() {
                missing.push("ssh user");
            }
            if secret.is_none() {
                missing.push("credentials");
            }
            if path.is_none() {
                missing.push("target path");
            }
            Err(missing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::api::UpsertTargetRequest;
    use relay_core::model::FileEntry;

    use crate::store::MemoryStore;

    struct Rot13;

    #[async_trait]
    impl SecretStore for Rot13 {
        async fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
            match ciphertext {
                "broken" => Err(SecretError::Invalid("bad mac".into())),
                "offline" => Err(SecretError::Unavailable(anyhow::anyhow!("kms down"))),
                other => Ok(other
                    .chars()
                    .map(|c| match c {
                        'a'..='m' => (c as u8 + 13) as char,
                        'n'..='z' => (c as u8 - 13) as char,
                        _ => c,
                    })
                    .collect()),
            }
        }
    }

    fn request(secret: Option<&str>) -> UpsertTargetRequest {
        UpsertTargetRequest {
            name: "pbx".into(),
            host: Some("10.0.0.5".into()),
            port: Some(2222),
            ssh_user: Some("admin".into()),
            secret_ciphertext: secret.map(str::to_string),
            target_path: Some("/etc/pbx/".into()),
        }
    }

    async fn dispatcher(secret: Option<&str>) -> Dispatcher {
        let store = Arc::new(MemoryStore::new());
        store.upsert_target("pbx-1", request(secret), 1).await.unwrap();
        Dispatcher::new(store, Arc::new(Rot13))
    }

    fn deploy_task() -> Task {
        Task::new(
            "t1".into(),
            "pbx-1".into(),
            TaskSpec::DeployFiles {
                files: vec![FileEntry {
                    name: "extensions.conf".into(),
                    content: "[default]".into(),
                }],
            },
            3,
            1,
        )
    }

    #[tokio::test]
    async fn test_assembles_deploy_payload_with_decrypted_secret() {
        let d = dispatcher(Some("uhagre")).await;
        let Dispatch::Ready(TaskPayload::DeployFiles(p)) = d.assemble(&deploy_task()).await.unwrap() else {
            panic!("expected deploy payload");
        };
        assert_eq!(p.connection.secret, "hunter");
        assert_eq!(p.connection.port, 2222);
        assert_eq!(p.target_path, "/etc/pbx/");
        assert_eq!(p.files.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_misconfigured() {
        let d = dispatcher(None).await;
        let Dispatch::Misconfigured(msg) = d.assemble(&deploy_task()).await.unwrap() else {
            panic!("expected misconfiguration");
        };
        assert!(msg.contains("credentials"), "{msg}");
    }

    #[tokio::test]
    async fn test_unknown_target_is_misconfigured() {
        let d = dispatcher(Some("x")).await;
        let mut task = deploy_task();
        task.target_id = "pbx-404".into();
        assert!(matches!(
            d.assemble(&task).await.unwrap(),
            Dispatch::Misconfigured(_)
        ));
    }

    #[tokio::test]
    async fn test_secret_errors_are_classified() {
        let d = dispatcher(Some("broken")).await;
        assert!(matches!(
            d.assemble(&deploy_task()).await.unwrap(),
            Dispatch::Misconfigured(_)
        ));

        let d = dispatcher(Some("offline")).await;
        assert!(matches!(
            d.assemble(&deploy_task()).await.unwrap(),
            Dispatch::Unavailable(_)
        ));
    }
}
