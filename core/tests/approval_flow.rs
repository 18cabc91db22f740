//! End-to-end approval flow: free commands run untouched, privileged
//! commands defer into signed envelopes, and every tampered or replayed
//! submission is rejected with its stable error code.

#![allow(clippy::unwrap_used)]

mod common;

use autopoiesis_core::AutopoiesisErr;
use autopoiesis_core::approval::ApprovalScope;
use autopoiesis_core::approval::ApprovalStore;
use autopoiesis_core::approval::ApprovalStoreConfig;
use autopoiesis_core::approval::EnvelopeState;
use autopoiesis_core::approval::SignedDecision;
use autopoiesis_core::approval::VerificationErrorCode;
use autopoiesis_core::approval::keys::ApprovalKeyManager;
use autopoiesis_core::worker::process_work_item;
use autopoiesis_protocol::DeferredRequestsPayload;
use autopoiesis_protocol::ToolCallRequest;
use common::continuation_item;
use common::prompt_item;
use common::scripted_runtime;
use common::shell_turn;
use common::text_turn;

const PASSPHRASE: &str = "correct horse battery staple";

fn sign_submission(
    rt: &autopoiesis_core::runtime::Runtime,
    payload: &DeferredRequestsPayload,
    approvals: &[(bool, Option<&str>)],
) -> String {
    let signed: Vec<SignedDecision> = payload
        .requests
        .iter()
        .zip(approvals)
        .map(|(req, (approved, _))| SignedDecision {
            tool_call_id: req.tool_call_id.clone(),
            approved: *approved,
        })
        .collect();
    rt.key_manager.unlock(PASSPHRASE).unwrap();
    rt.approval_store
        .store_signed_approval(&payload.nonce, &signed, &rt.key_manager)
        .unwrap();

    let decisions: Vec<serde_json::Value> = payload
        .requests
        .iter()
        .zip(approvals)
        .map(|(req, (approved, denial))| {
            serde_json::json!({
                "tool_call_id": req.tool_call_id,
                "approved": approved,
                "denial_message": denial,
            })
        })
        .collect();
    serde_json::json!({"nonce": payload.nonce, "decisions": decisions}).to_string()
}

#[tokio::test]
async fn free_command_runs_without_touching_the_envelope_store() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![shell_turn("c1", "pwd"), text_turn("you are home")],
    );

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "where am I?"), None)
        .await
        .unwrap();

    assert_eq!(out.text.as_deref(), Some("you are home"));
    assert!(out.deferred_tool_requests_json.is_none());
    // The shell ran in alpha's workspace.
    assert!(out.message_history_json.contains("agents/alpha/workspace"));
    // Turn completed: no checkpoint left behind.
    assert!(rt.checkpoints.load("w1").unwrap().is_none());
}

#[tokio::test]
async fn approve_tier_command_defers_with_a_pending_envelope() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![shell_turn("c1", "rm /tmp/foo")],
    );
    rt.key_manager.create_initial_key(PASSPHRASE).unwrap();

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "clean up"), None)
        .await
        .unwrap();

    assert!(out.text.is_none());
    let payload: DeferredRequestsPayload =
        serde_json::from_str(out.deferred_tool_requests_json.as_deref().unwrap()).unwrap();
    assert_eq!(payload.plan_hash_prefix.len(), 8);
    assert_eq!(payload.requests.len(), 1);
    assert_eq!(payload.requests[0].tool_name, "shell");
    assert_eq!(
        rt.approval_store.envelope_state(&payload.nonce).unwrap(),
        Some(EnvelopeState::Pending)
    );
    // Deferred turn leaves a checkpoint for the continuation.
    assert!(rt.checkpoints.load("w1").unwrap().is_some());
}

#[tokio::test]
async fn full_approval_round_trip_executes_and_consumes() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![shell_turn("c1", "rm marker.txt"), text_turn("removed")],
    );
    rt.key_manager.create_initial_key(PASSPHRASE).unwrap();
    std::fs::write(rt.paths.workspace.join("marker.txt"), "delete me").unwrap();

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "remove it"), None)
        .await
        .unwrap();
    let payload: DeferredRequestsPayload =
        serde_json::from_str(out.deferred_tool_requests_json.as_deref().unwrap()).unwrap();

    let submission = sign_submission(&rt, &payload, &[(true, None)]);
    let out = process_work_item(
        rt.clone(),
        continuation_item("w1", "alpha", "w1", &submission),
        None,
    )
    .await
    .unwrap();

    assert_eq!(out.text.as_deref(), Some("removed"));
    assert_eq!(
        rt.approval_store.envelope_state(&payload.nonce).unwrap(),
        Some(EnvelopeState::Consumed)
    );
    // The approved command actually ran.
    assert!(!rt.paths.workspace.join("marker.txt").exists());
    // Completion clears the checkpoint.
    assert!(rt.checkpoints.load("w1").unwrap().is_none());
}

#[tokio::test]
async fn replaying_a_consumed_envelope_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![
            shell_turn("c1", "rm /tmp/foo"),
            text_turn("done"),
        ],
    );
    rt.key_manager.create_initial_key(PASSPHRASE).unwrap();

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "go"), None)
        .await
        .unwrap();
    let payload: DeferredRequestsPayload =
        serde_json::from_str(out.deferred_tool_requests_json.as_deref().unwrap()).unwrap();
    let submission = sign_submission(&rt, &payload, &[(true, None)]);

    process_work_item(
        rt.clone(),
        continuation_item("w1", "alpha", "w1", &submission),
        None,
    )
    .await
    .unwrap();

    // Same signed decisions again: fail-closed, no re-execution.
    let err = process_work_item(
        rt.clone(),
        continuation_item("w1", "alpha", "w1", &submission),
        None,
    )
    .await
    .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::ExpiredOrUnknown);
        }
        other => panic!("expected verification error, got {other}"),
    }
}

#[tokio::test]
async fn replay_into_a_different_scope_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![shell_turn("c1", "rm /tmp/foo")],
    );
    rt.key_manager.create_initial_key(PASSPHRASE).unwrap();

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "go"), None)
        .await
        .unwrap();
    let payload: DeferredRequestsPayload =
        serde_json::from_str(out.deferred_tool_requests_json.as_deref().unwrap()).unwrap();
    let submission = sign_submission(&rt, &payload, &[(true, None)]);

    // Intercepted while pending, replayed against a different work item.
    let err = process_work_item(
        rt.clone(),
        continuation_item("w-other", "alpha", "w-other", &submission),
        None,
    )
    .await
    .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::ScopeMismatch);
        }
        other => panic!("expected scope mismatch, got {other}"),
    }
    // Envelope untouched by the failed replay.
    assert_eq!(
        rt.approval_store.envelope_state(&payload.nonce).unwrap(),
        Some(EnvelopeState::Pending)
    );
}

#[tokio::test]
async fn denied_decision_reaches_the_model_as_a_tool_return() {
    let home = tempfile::tempdir().unwrap();
    let rt = scripted_runtime(
        home.path(),
        "alpha",
        vec![
            shell_turn("c1", "rm /tmp/foo"),
            text_turn("understood, leaving it alone"),
        ],
    );
    rt.key_manager.create_initial_key(PASSPHRASE).unwrap();

    let out = process_work_item(rt.clone(), prompt_item("w1", "alpha", "go"), None)
        .await
        .unwrap();
    let payload: DeferredRequestsPayload =
        serde_json::from_str(out.deferred_tool_requests_json.as_deref().unwrap()).unwrap();
    let submission = sign_submission(&rt, &payload, &[(false, Some("too risky"))]);

    let out = process_work_item(
        rt.clone(),
        continuation_item("w1", "alpha", "w1", &submission),
        None,
    )
    .await
    .unwrap();

    assert_eq!(out.text.as_deref(), Some("understood, leaving it alone"));
    assert!(out.message_history_json.contains("too risky"));
}

// Store-level checks that do not need a full worker round trip.

struct StoreFixture {
    _dir: tempfile::TempDir,
    store: ApprovalStore,
    keys: ApprovalKeyManager,
    scope: ApprovalScope,
}

fn store_fixture(config: ApprovalStoreConfig) -> StoreFixture {
    let dir = tempfile::tempdir().unwrap();
    let store = ApprovalStore::open_with_config(dir.path().join("approval.sqlite"), config).unwrap();
    let keys = ApprovalKeyManager::open(dir.path().join("keys")).unwrap();
    keys.create_initial_key(PASSPHRASE).unwrap();
    let scope = ApprovalScope {
        workspace_root: "/srv/agent/workspace".to_string(),
        work_item_id: "w1".to_string(),
        agent_name: "alpha".to_string(),
    };
    StoreFixture {
        _dir: dir,
        store,
        keys,
        scope,
    }
}

fn two_calls() -> Vec<ToolCallRequest> {
    vec![
        ToolCallRequest {
            tool_call_id: "c1".to_string(),
            tool_name: "shell".to_string(),
            args: serde_json::json!({"command": "rm a"}),
        },
        ToolCallRequest {
            tool_call_id: "c2".to_string(),
            tool_name: "shell".to_string(),
            args: serde_json::json!({"command": "rm b"}),
        },
    ]
}

#[test]
fn reordered_decisions_fail_the_bijection_check() {
    let fx = store_fixture(ApprovalStoreConfig::default());
    let (nonce, _) = fx
        .store
        .create_envelope(&fx.scope, &two_calls(), &fx.keys.current_key_id().unwrap())
        .unwrap();
    let signed = vec![
        SignedDecision {
            tool_call_id: "c2".to_string(),
            approved: true,
        },
        SignedDecision {
            tool_call_id: "c1".to_string(),
            approved: true,
        },
    ];
    fx.store
        .store_signed_approval(&nonce, &signed, &fx.keys)
        .unwrap();

    let submission = serde_json::json!({
        "nonce": nonce,
        "decisions": [
            {"tool_call_id": "c2", "approved": true},
            {"tool_call_id": "c1", "approved": true},
        ]
    })
    .to_string();
    let err = fx
        .store
        .verify_and_consume(&submission, &fx.scope, &fx.keys)
        .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::BijectionMismatch);
        }
        other => panic!("expected bijection mismatch, got {other}"),
    }
}

#[test]
fn signed_payload_must_cover_the_submitted_decisions() {
    let fx = store_fixture(ApprovalStoreConfig::default());
    let (nonce, _) = fx
        .store
        .create_envelope(&fx.scope, &two_calls(), &fx.keys.current_key_id().unwrap())
        .unwrap();
    // Signed as approve-all, submitted as deny c2.
    let signed = vec![
        SignedDecision {
            tool_call_id: "c1".to_string(),
            approved: true,
        },
        SignedDecision {
            tool_call_id: "c2".to_string(),
            approved: true,
        },
    ];
    fx.store
        .store_signed_approval(&nonce, &signed, &fx.keys)
        .unwrap();

    let submission = serde_json::json!({
        "nonce": nonce,
        "decisions": [
            {"tool_call_id": "c1", "approved": true},
            {"tool_call_id": "c2", "approved": false},
        ]
    })
    .to_string();
    let err = fx
        .store
        .verify_and_consume(&submission, &fx.scope, &fx.keys)
        .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::BijectionMismatch);
        }
        other => panic!("expected bijection mismatch, got {other}"),
    }
}

#[test]
fn unsigned_envelope_fails_signature_stage() {
    let fx = store_fixture(ApprovalStoreConfig::default());
    let (nonce, _) = fx
        .store
        .create_envelope(&fx.scope, &two_calls(), &fx.keys.current_key_id().unwrap())
        .unwrap();
    let submission = serde_json::json!({
        "nonce": nonce,
        "decisions": [
            {"tool_call_id": "c1", "approved": true},
            {"tool_call_id": "c2", "approved": true},
        ]
    })
    .to_string();
    let err = fx
        .store
        .verify_and_consume(&submission, &fx.scope, &fx.keys)
        .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::InvalidSignature);
        }
        other => panic!("expected invalid signature, got {other}"),
    }
}

#[test]
fn expired_envelopes_sweep_and_reject() {
    let fx = store_fixture(ApprovalStoreConfig {
        ttl: std::time::Duration::ZERO,
        clock_skew: std::time::Duration::ZERO,
        nonce_retention: std::time::Duration::from_secs(7 * 24 * 3600),
    });
    let calls = two_calls();
    let (nonce, _) = fx
        .store
        .create_envelope(&fx.scope, &calls, &fx.keys.current_key_id().unwrap())
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(1100));
    let submission = serde_json::json!({
        "nonce": nonce,
        "decisions": [
            {"tool_call_id": "c1", "approved": true},
            {"tool_call_id": "c2", "approved": true},
        ]
    })
    .to_string();
    let err = fx
        .store
        .verify_and_consume(&submission, &fx.scope, &fx.keys)
        .unwrap_err();
    match err {
        AutopoiesisErr::ApprovalVerification(e) => {
            assert_eq!(e.code, VerificationErrorCode::ExpiredOrUnknown);
        }
        other => panic!("expected expired_or_unknown, got {other}"),
    }

    assert_eq!(fx.store.sweep_expired().unwrap(), 1);
    assert_eq!(
        fx.store.envelope_state(&nonce).unwrap(),
        Some(EnvelopeState::Expired)
    );
}

#[test]
fn empty_submission_shapes_are_invalid_not_panics() {
    let fx = store_fixture(ApprovalStoreConfig::default());
    for bad in [
        "",
        "{}",
        r#"{"nonce": "", "decisions": []}"#,
        r#"{"nonce": "x"}"#,
        r#"{"decisions": []}"#,
    ] {
        let err = fx
            .store
            .verify_and_consume(bad, &fx.scope, &fx.keys)
            .unwrap_err();
        match err {
            AutopoiesisErr::ApprovalVerification(e) => {
                assert_eq!(
                    e.code,
                    VerificationErrorCode::InvalidSubmission,
                    "input: {bad}"
                );
            }
            other => panic!("expected invalid submission for {bad}, got {other}"),
        }
    }
}
