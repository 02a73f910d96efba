//! Integration tests for the core crate.

use relay_core::api::{CreateTaskRequest, ProtocolError, TaskAssignment};
use relay_core::model::{
    Connection, DeployPayload, FailureOutcome, FileEntry, RemovePayload, Task, TaskKind,
    TaskPayload, TaskSpec, TaskStatus, TransitionError,
};

fn connection() -> Connection {
    Connection {
        host: "10.0.0.5".into(),
        port: 22,
        username: "admin".into(),
        secret: "hunter2".into(),
    }
}

fn deploy_payload() -> TaskPayload {
    TaskPayload::DeployFiles(DeployPayload {
        connection: connection(),
        target_path: "/etc/pbx/".into(),
        files: vec![FileEntry {
            name: "extensions.conf".into(),
            content: "[default]".into(),
        }],
    })
}

fn pending_task(max_attempts: u32) -> Task {
    Task::new(
        "task-1".into(),
        "pbx-1".into(),
        TaskSpec::RemoveFiles {
            file_names: vec!["a.conf".into()],
        },
        max_attempts,
        1_000,
    )
}

#[test]
fn test_task_status_serde() {
    let serialized = serde_json::to_string(&TaskStatus::Claimed).unwrap();
    assert_eq!(serialized, r#""claimed""#);
    let deserialized: TaskStatus = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, TaskStatus::Claimed);
    assert!(TaskStatus::Completed.is_terminal());
    assert!(!TaskStatus::Pending.is_terminal());
}

#[test]
fn test_unknown_task_kind_decodes_as_unsupported() {
    let kind: TaskKind = serde_json::from_str(r#""reboot_appliance""#).unwrap();
    assert_eq!(kind, TaskKind::Unsupported);

    let assignment: TaskAssignment = serde_json::from_value(serde_json::json!({
        "task_id": "t1",
        "type": "reboot_appliance",
        "target_id": "pbx-1",
        "payload": {}
    }))
    .unwrap();
    assert!(matches!(
        assignment.decode_payload(),
        Err(ProtocolError::UnsupportedKind)
    ));
}

#[test]
fn test_assignment_wire_shape() {
    let assignment = TaskAssignment::new("t1".into(), "pbx-1".into(), &deploy_payload()).unwrap();
    let wire = serde_json::to_value(&assignment).unwrap();
    assert_eq!(wire["type"], "deploy_files");
    assert_eq!(wire["payload"]["target_path"], "/etc/pbx/");
    assert_eq!(wire["payload"]["connection"]["username"], "admin");
    assert!(wire["payload"].get("type").is_none());

    let decoded = assignment.decode_payload().unwrap();
    assert_eq!(decoded, deploy_payload());
}

#[test]
fn test_malformed_payload_is_reported() {
    let assignment: TaskAssignment = serde_json::from_value(serde_json::json!({
        "task_id": "t1",
        "type": "remove_files",
        "target_id": "pbx-1",
        "payload": { "target_path": "/tmp/" }
    }))
    .unwrap();
    let err = assignment.decode_payload().unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::MalformedPayload {
            kind: TaskKind::RemoveFiles,
            ..
        }
    ));
}

#[test]
fn test_connection_debug_redacts_secret() {
    let rendered = format!("{:?}", deploy_payload());
    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn test_connection_port_defaults_to_22() {
    let conn: Connection =
        serde_json::from_str(r#"{"host":"h","username":"u","secret":"s"}"#).unwrap();
    assert_eq!(conn.port, 22);
}

#[test]
fn test_create_task_request_flattens_spec() {
    let req: CreateTaskRequest = serde_json::from_value(serde_json::json!({
        "target_id": "pbx-1",
        "type": "remove_files",
        "file_names": ["a.conf", "b.conf"]
    }))
    .unwrap();
    assert_eq!(req.spec.kind(), TaskKind::RemoveFiles);
    assert_eq!(req.max_attempts, None);
}

#[test]
fn test_claim_increments_attempts_once_per_claim() {
    let mut task = pending_task(3);
    assert!(task.claim("agent-a", 2_000));
    assert_eq!(task.attempts, 1);
    assert_eq!(task.agent_id.as_deref(), Some("agent-a"));
    assert_eq!(task.last_attempt_at_ms, Some(2_000));

    // A second claimant loses.
    assert!(!task.claim("agent-b", 2_001));
    assert_eq!(task.attempts, 1);
    assert_eq!(task.agent_id.as_deref(), Some("agent-a"));
}

#[test]
fn test_failure_retries_until_max_attempts() {
    let mut task = pending_task(3);
    for attempt in 1..=2 {
        assert!(task.claim("agent-a", 2_000));
        task.attach_payload("agent-a", deploy_payload(), 2_000).unwrap();
        let outcome = task.fail("agent-a", "ssh: connection refused", 3_000).unwrap();
        assert_eq!(outcome, FailureOutcome::Retry, "attempt {attempt}");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.agent_id, None);
        assert_eq!(task.payload, None);
    }

    assert!(task.claim("agent-b", 4_000));
    let outcome = task.fail("agent-b", "ssh: connection refused", 5_000).unwrap();
    assert_eq!(outcome, FailureOutcome::Terminal);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.completed_at_ms, Some(5_000));
    assert_eq!(task.payload, None);
}

#[test]
fn test_success_on_last_attempt_completes() {
    let mut task = pending_task(3);
    for _ in 0..2 {
        task.claim("agent-a", 2_000);
        task.fail("agent-a", "boom", 2_500).unwrap();
    }
    task.claim("agent-a", 3_000);
    task.attach_payload("agent-a", deploy_payload(), 3_000).unwrap();
    task.complete("agent-a", Some(serde_json::json!({"files": 1})), 3_500)
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.payload, None);
    assert_eq!(task.completed_at_ms, Some(3_500));
}

#[test]
fn test_transitions_require_ownership() {
    let mut task = pending_task(3);
    assert_eq!(
        task.complete("agent-a", None, 1_500),
        Err(TransitionError::NotClaimed(TaskStatus::Pending))
    );
    task.claim("agent-a", 2_000);
    assert_eq!(
        task.fail("agent-b", "boom", 2_500),
        Err(TransitionError::NotOwner)
    );
    assert_eq!(task.status, TaskStatus::Claimed);
}

#[test]
fn test_stale_recovery_clears_owner_and_payload() {
    let mut task = pending_task(3);
    task.claim("agent-a", 2_000);
    task.attach_payload("agent-a", deploy_payload(), 2_000).unwrap();
    assert!(task.is_stale(2_001));
    assert!(!task.is_stale(2_000));

    task.recover_stale(400_000);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.agent_id, None);
    assert_eq!(task.payload, None);
    assert_eq!(task.attempts, 1);
}

#[test]
fn test_stale_claim_on_last_attempt_is_reclaimable() {
    let mut task = pending_task(1);
    task.claim("agent-a", 2_000);
    task.attach_payload("agent-a", deploy_payload(), 2_000).unwrap();

    task.recover_stale(400_000);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.agent_id, None);
    assert_eq!(task.payload, None);
    assert_eq!(task.completed_at_ms, None);

    assert!(task.claim("agent-b", 400_001));
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.agent_id.as_deref(), Some("agent-b"));
    assert_eq!(task.attempts, 2);

    // Past the bound, the next reported failure is terminal.
    assert_eq!(task.fail("agent-b", "ssh: timeout", 400_002).unwrap(), FailureOutcome::Terminal);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.payload, None);
}

#[test]
fn test_configuration_failure_skips_retries() {
    let mut task = pending_task(5);
    task.claim("agent-a", 2_000);
    task.fail_terminal("agent-a", "missing credentials", 2_100).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error_message.as_deref(), Some("missing credentials"));
}

#[test]
fn test_remove_payload_roundtrip_through_task_record() {
    let payload = TaskPayload::RemoveFiles(RemovePayload {
        connection: connection(),
        target_path: "/etc/pbx".into(),
        file_names: vec!["a.conf".into()],
    });
    let stored = serde_json::to_value(&payload).unwrap();
    assert_eq!(stored["type"], "remove_files");
    let back: TaskPayload = serde_json::from_value(stored).unwrap();
    assert_eq!(back.kind(), TaskKind::RemoveFiles);
}
