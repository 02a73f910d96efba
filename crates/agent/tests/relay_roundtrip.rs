//! Agent runtime and HTTP client against an in-process daemon.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_agent::client::HttpRelayClient;
use relay_agent::executor::TaskExecutor;
use relay_agent::runtime::{CycleOutcome, Runtime};
use relay_core::api::{CreateTaskRequest, UpsertTargetRequest};
use relay_core::model::{FileEntry, ResourceStatus, TaskPayload, TaskSpec, TaskStatus};
use relay_daemon::http::{router, AppState};
use relay_daemon::secrets::{SecretError, SecretStore};
use relay_daemon::service::{RelayService, ServiceConfig, Stores};
use relay_daemon::store::{AgentRegistry, MemoryStore};

struct Plaintext;

#[async_trait]
impl SecretStore for Plaintext {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        Ok(ciphertext.to_string())
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<TaskPayload>>,
}

#[async_trait]
impl TaskExecutor for Recorder {
    async fn execute(&self, payload: TaskPayload) -> anyhow::Result<serde_json::Value> {
        self.seen.lock().unwrap().push(payload);
        Ok(serde_json::json!({ "files": 1 }))
    }
}

struct Daemon {
    url: String,
    svc: Arc<RelayService>,
    store: Arc<MemoryStore>,
}

async fn spawn_daemon() -> Daemon {
    let store = Arc::new(MemoryStore::new());
    let svc = Arc::new(RelayService::new(
        Stores::shared(store.clone()),
        Arc::new(Plaintext),
        ServiceConfig {
            liveness_window_ms: 300_000,
            default_max_attempts: 3,
        },
    ));
    let app = router(AppState::new(svc.clone(), None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    Daemon {
        url: format!("http://{addr}"),
        svc,
        store,
    }
}

fn client(d: &Daemon, token: &str) -> Arc<HttpRelayClient> {
    Arc::new(HttpRelayClient::new(&d.url, token.to_string(), Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_startup_rejects_unknown_token() {
    let d = spawn_daemon().await;
    let rt = Runtime::new(client(&d, "bogus"), Arc::new(Recorder::default()));
    let err = rt.startup().await.unwrap_err();
    assert!(format!("{err:#}").contains("401"), "{err:#}");
}

#[tokio::test]
async fn test_startup_heartbeat_records_agent_contact() {
    let d = spawn_daemon().await;
    let agent = d.svc.provision_agent("branch".into()).await.unwrap();
    let rt = Runtime::new(client(&d, &agent.token), Arc::new(Recorder::default()));

    rt.startup().await.unwrap();

    let record = d.store.get_agent(&agent.agent_id).await.unwrap().unwrap();
    assert_eq!(record.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    assert_eq!(record.last_ip.as_deref(), Some("127.0.0.1"));
    assert!(record.last_heartbeat_ms.is_some());
}

#[tokio::test]
async fn test_cycle_executes_and_reports_over_http() {
    let d = spawn_daemon().await;
    let agent = d.svc.provision_agent("branch".into()).await.unwrap();
    d.svc
        .upsert_target(
            "pbx-1",
            UpsertTargetRequest {
                name: "front office".into(),
                host: Some("192.168.1.20".into()),
                port: Some(22),
                ssh_user: Some("admin".into()),
                secret_ciphertext: Some("pw".into()),
                target_path: Some("/etc/asterisk/".into()),
            },
        )
        .await
        .unwrap();
    let task = d
        .svc
        .create_task(CreateTaskRequest {
            target_id: "pbx-1".into(),
            spec: TaskSpec::DeployFiles {
                files: vec![FileEntry {
                    name: "extensions_custom.conf".into(),
                    content: "[ctx]\n".into(),
                }],
            },
            max_attempts: None,
        })
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let rt = Runtime::new(client(&d, &agent.token), recorder.clone());

    let outcome = rt.run_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Ran {
            task_id: task.task_id.clone(),
            success: true,
            reported: true,
        }
    );

    let seen = recorder.seen.lock().unwrap().clone();
    let TaskPayload::DeployFiles(payload) = &seen[0] else {
        panic!("expected deploy payload");
    };
    assert_eq!(payload.connection.secret, "pw");
    assert_eq!(payload.files[0].name, "extensions_custom.conf");

    let view = d.svc.task(&task.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.result, Some(serde_json::json!({ "files": 1 })));
    assert_eq!(
        d.svc.target("pbx-1").await.unwrap().deploy_status,
        ResourceStatus::Deployed
    );

    assert_eq!(rt.run_cycle().await, CycleOutcome::Idle);
}
