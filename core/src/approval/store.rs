//! Durable approval envelopes: create on turn-defer, sign locally on user
//! decision, verify and consume on continuation, expire by TTL sweep.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use autopoiesis_protocol::Decision;
use autopoiesis_protocol::ToolCallRequest;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::approval::ApprovalScope;
use crate::approval::ApprovalVerificationError;
use crate::approval::SIGNED_OBJECT_CONTEXT;
use crate::approval::SignedDecision;
use crate::approval::VerificationErrorCode;
use crate::approval::canonical::canonical_json;
use crate::approval::canonical::canonical_sha256;
use crate::approval::keys::ApprovalKeyManager;
use crate::error::Result;
use crate::util::utc_now_epoch;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApprovalStoreConfig {
    /// How long a pending envelope stays answerable.
    pub ttl: Duration,
    /// Tolerated skew between the issuing and consuming clock.
    pub clock_skew: Duration,
    /// How long consumed/expired nonces are retained to reject replays.
    pub nonce_retention: Duration,
}

impl Default for ApprovalStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            clock_skew: Duration::from_secs(30),
            nonce_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Pending,
    Consumed,
    Expired,
}

impl EnvelopeState {
    fn as_str(self) -> &'static str {
        match self {
            EnvelopeState::Pending => "pending",
            EnvelopeState::Consumed => "consumed",
            EnvelopeState::Expired => "expired",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EnvelopeState::Pending),
            "consumed" => Some(EnvelopeState::Consumed),
            "expired" => Some(EnvelopeState::Expired),
            _ => None,
        }
    }
}

struct EnvelopeRow {
    nonce: String,
    scope_json: String,
    tool_calls_json: String,
    plan_hash: String,
    key_id: String,
    signed_object_json: Option<String>,
    signature_hex: Option<String>,
    state: String,
    expires_at: i64,
}

pub struct ApprovalStore {
    conn: Mutex<Connection>,
    config: ApprovalStoreConfig,
}

impl ApprovalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, ApprovalStoreConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: ApprovalStoreConfig) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS approval_envelopes (
                envelope_id TEXT PRIMARY KEY,
                nonce TEXT UNIQUE NOT NULL,
                scope_json TEXT NOT NULL,
                tool_calls_json TEXT NOT NULL,
                plan_hash TEXT NOT NULL,
                key_id TEXT NOT NULL,
                signed_object_json TEXT,
                signature_hex TEXT,
                state TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                consumed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_approval_envelopes_state
                ON approval_envelopes(state);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Persist a new pending envelope for `tool_calls` in `scope`. Returns
    /// the fresh nonce and the full plan hash.
    pub fn create_envelope(
        &self,
        scope: &ApprovalScope,
        tool_calls: &[ToolCallRequest],
        key_id: &str,
    ) -> Result<(String, String)> {
        let scope_json = canonical_json(scope)?;
        let tool_calls_json = canonical_json(&tool_calls)?;
        let plan_hash = canonical_sha256(&serde_json::json!({
            "scope": scope,
            "tool_calls": tool_calls,
        }))?;

        // 128-bit random nonce, hex-encoded.
        let nonce_bytes: [u8; 16] = {
            use rand::Rng;
            rand::rng().random()
        };
        let nonce = hex::encode(nonce_bytes);

        let now = utc_now_epoch();
        let expires_at = now + self.config.ttl.as_secs() as i64;
        self.lock_conn().execute(
            "INSERT INTO approval_envelopes (
                envelope_id, nonce, scope_json, tool_calls_json, plan_hash, key_id,
                signed_object_json, signature_hex, state, issued_at, expires_at, consumed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8, ?9, NULL)",
            params![
                Uuid::new_v4().to_string(),
                nonce,
                scope_json,
                tool_calls_json,
                plan_hash,
                key_id,
                EnvelopeState::Pending.as_str(),
                now,
                expires_at,
            ],
        )?;
        debug!(nonce, plan_hash, "approval envelope created");
        Ok((nonce, plan_hash))
    }

    /// Sign the approver's decisions for a pending envelope and persist the
    /// signed object. State stays `pending` until the continuation consumes
    /// it.
    pub fn store_signed_approval(
        &self,
        nonce: &str,
        decisions: &[SignedDecision],
        key_manager: &ApprovalKeyManager,
    ) -> Result<()> {
        let row = self
            .fetch_row(nonce)?
            .ok_or_else(|| expired_or_unknown("Approval envelope not found for signing."))?;

        let signed_object = serde_json::json!({
            "ctx": SIGNED_OBJECT_CONTEXT,
            "nonce": row.nonce,
            "plan_hash": row.plan_hash,
            "key_id": row.key_id,
            "decisions": decisions,
        });
        let signed_object_json = canonical_json(&signed_object)?;
        let signature_hex = key_manager.sign(signed_object_json.as_bytes())?;

        self.lock_conn().execute(
            "UPDATE approval_envelopes
             SET signed_object_json = ?1, signature_hex = ?2
             WHERE nonce = ?3",
            params![signed_object_json, signature_hex, nonce],
        )?;
        Ok(())
    }

    /// Run the full verification ladder over a decisions submission, then
    /// atomically transition the envelope `pending → consumed`.
    ///
    /// Stages, cheapest first: parse, nonce lookup + TTL, scope binding,
    /// signature, signed-object binding, bijection, signed-payload
    /// consistency.
    pub fn verify_and_consume(
        &self,
        submission_json: &str,
        live_scope: &ApprovalScope,
        key_manager: &ApprovalKeyManager,
    ) -> Result<Vec<Decision>> {
        // Stage 1: parse.
        let (nonce, decisions) = parse_submission(submission_json)?;

        // Stage 2: lookup + TTL (skew-widened).
        let row = self
            .fetch_row(&nonce)?
            .ok_or_else(|| expired_or_unknown("Approval envelope not found."))?;
        if row.state != EnvelopeState::Pending.as_str() {
            return Err(expired_or_unknown("Approval envelope is no longer pending.").into());
        }
        let now = utc_now_epoch();
        if now > row.expires_at + self.config.clock_skew.as_secs() as i64 {
            return Err(expired_or_unknown("Approval envelope has expired.").into());
        }

        // Stage 3: scope binding.
        let live_scope_json = canonical_json(live_scope)?;
        if row.scope_json != live_scope_json {
            return Err(ApprovalVerificationError::new(
                VerificationErrorCode::ScopeMismatch,
                "Approval envelope is bound to a different scope.",
            )
            .into());
        }

        // Stage 4: signature.
        verify_signature_stage(&row, key_manager)?;

        // Stage 5: signed-object binding.
        let signed_decisions = verify_signed_object(&row)?;

        // Stage 6: bijection against the envelope's call order.
        let tool_calls: Vec<ToolCallRequest> = serde_json::from_str(&row.tool_calls_json)?;
        let expected_ids: Vec<&str> = tool_calls.iter().map(|c| c.tool_call_id.as_str()).collect();
        let submitted_ids: Vec<&str> = decisions.iter().map(|d| d.tool_call_id.as_str()).collect();
        if expected_ids != submitted_ids {
            return Err(ApprovalVerificationError::new(
                VerificationErrorCode::BijectionMismatch,
                "Approval decisions do not match requested tool calls.",
            )
            .into());
        }

        // Stage 7: signed payload covers exactly the submitted decisions.
        let normalised: Vec<SignedDecision> = decisions
            .iter()
            .map(|d| SignedDecision {
                tool_call_id: d.tool_call_id.clone(),
                approved: d.approved,
            })
            .collect();
        if canonical_json(&signed_decisions)? != canonical_json(&normalised)? {
            return Err(ApprovalVerificationError::new(
                VerificationErrorCode::BijectionMismatch,
                "Submitted approvals do not match signed decisions.",
            )
            .into());
        }

        // Consume atomically: the state predicate rejects a lost race.
        let updated = self.lock_conn().execute(
            "UPDATE approval_envelopes
             SET state = ?1, consumed_at = ?2
             WHERE nonce = ?3 AND state = ?4",
            params![
                EnvelopeState::Consumed.as_str(),
                now,
                nonce,
                EnvelopeState::Pending.as_str(),
            ],
        )?;
        if updated != 1 {
            return Err(expired_or_unknown("Approval envelope was already consumed.").into());
        }
        debug!(nonce, "approval envelope consumed");
        Ok(decisions)
    }

    /// Transition pending rows past their (skew-widened) expiry to
    /// `expired`, and drop consumed/expired rows older than the nonce
    /// retention window. Returns how many rows were expired.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = utc_now_epoch();
        let skew = self.config.clock_skew.as_secs() as i64;
        let conn = self.lock_conn();
        let expired = conn.execute(
            "UPDATE approval_envelopes
             SET state = ?1
             WHERE state = ?2 AND expires_at + ?3 < ?4",
            params![
                EnvelopeState::Expired.as_str(),
                EnvelopeState::Pending.as_str(),
                skew,
                now,
            ],
        )?;
        let retention_cutoff = now - self.config.nonce_retention.as_secs() as i64;
        conn.execute(
            "DELETE FROM approval_envelopes
             WHERE state != ?1 AND expires_at < ?2",
            params![EnvelopeState::Pending.as_str(), retention_cutoff],
        )?;
        Ok(expired)
    }

    /// Current state of an envelope, if the nonce is known.
    pub fn envelope_state(&self, nonce: &str) -> Result<Option<EnvelopeState>> {
        let state: Option<String> = self
            .lock_conn()
            .query_row(
                "SELECT state FROM approval_envelopes WHERE nonce = ?1",
                params![nonce],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.and_then(|s| EnvelopeState::parse(&s)))
    }

    fn fetch_row(&self, nonce: &str) -> Result<Option<EnvelopeRow>> {
        let row = self
            .lock_conn()
            .query_row(
                "SELECT nonce, scope_json, tool_calls_json, plan_hash, key_id,
                        signed_object_json, signature_hex, state, expires_at
                 FROM approval_envelopes WHERE nonce = ?1",
                params![nonce],
                |row| {
                    Ok(EnvelopeRow {
                        nonce: row.get(0)?,
                        scope_json: row.get(1)?,
                        tool_calls_json: row.get(2)?,
                        plan_hash: row.get(3)?,
                        key_id: row.get(4)?,
                        signed_object_json: row.get(5)?,
                        signature_hex: row.get(6)?,
                        state: row.get(7)?,
                        expires_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // Poisoned mutex means a panic mid-statement; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

fn expired_or_unknown(message: &str) -> ApprovalVerificationError {
    ApprovalVerificationError::new(VerificationErrorCode::ExpiredOrUnknown, message)
}

fn invalid_submission(message: &str) -> ApprovalVerificationError {
    ApprovalVerificationError::new(VerificationErrorCode::InvalidSubmission, message)
}

fn invalid_signature(message: &str) -> ApprovalVerificationError {
    ApprovalVerificationError::new(VerificationErrorCode::InvalidSignature, message)
}

/// Stage 1: parse the submission into a nonce and normalised decisions,
/// emitting `invalid_submission` for every malformed shape.
fn parse_submission(
    submission_json: &str,
) -> std::result::Result<(String, Vec<Decision>), ApprovalVerificationError> {
    let loaded: Value = serde_json::from_str(submission_json)
        .map_err(|_| invalid_submission("Approval submission is not valid JSON."))?;
    let payload = loaded
        .as_object()
        .ok_or_else(|| invalid_submission("Approval submission must be a JSON object."))?;

    let nonce = payload
        .get("nonce")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_submission("Approval submission nonce is missing."))?;

    let decisions = payload
        .get("decisions")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid_submission("Approval submission decisions are missing."))?;

    let normalised = decisions
        .iter()
        .map(validate_submitted_decision)
        .collect::<std::result::Result<Vec<Decision>, ApprovalVerificationError>>()?;
    Ok((nonce.to_string(), normalised))
}

fn validate_submitted_decision(
    raw: &Value,
) -> std::result::Result<Decision, ApprovalVerificationError> {
    let item = raw
        .as_object()
        .ok_or_else(|| invalid_submission("Approval decision entry must be an object."))?;
    let tool_call_id = item
        .get("tool_call_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_submission("Approval decision tool_call_id is invalid."))?;
    let approved = item
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid_submission("Approval decision approved must be boolean."))?;
    let denial_message = match item.get("denial_message") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(invalid_submission(
                "Approval decision denial_message must be string or null.",
            ));
        }
    };
    Ok(Decision {
        tool_call_id: tool_call_id.to_string(),
        approved,
        denial_message,
    })
}

/// Stage 4: signature metadata present, key resolvable, signature valid
/// over the stored signed-object bytes.
fn verify_signature_stage(
    row: &EnvelopeRow,
    key_manager: &ApprovalKeyManager,
) -> std::result::Result<(), ApprovalVerificationError> {
    if row.key_id.is_empty() {
        return Err(ApprovalVerificationError::new(
            VerificationErrorCode::UnknownKeyId,
            "Approval envelope key id is missing.",
        ));
    }
    let signed_payload = row
        .signed_object_json
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_signature("Approval signature payload is missing."))?;
    let signature_hex = row
        .signature_hex
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_signature("Approval signature is missing."))?;
    if key_manager.resolve_public_key(&row.key_id).is_none() {
        return Err(ApprovalVerificationError::new(
            VerificationErrorCode::UnknownKeyId,
            "Verification key not found.",
        ));
    }
    if !key_manager.verify_signature(&row.key_id, signed_payload.as_bytes(), signature_hex) {
        return Err(invalid_signature("Approval signature verification failed."));
    }
    Ok(())
}

/// Stage 5: the signed object binds to this envelope's context, nonce, plan
/// hash and key. Returns the signed decisions for stage 7.
fn verify_signed_object(
    row: &EnvelopeRow,
) -> std::result::Result<Vec<SignedDecision>, ApprovalVerificationError> {
    let signed_payload = row
        .signed_object_json
        .as_deref()
        .ok_or_else(|| invalid_signature("Signed payload missing."))?;
    let loaded: Value = serde_json::from_str(signed_payload)
        .map_err(|_| invalid_signature("Signed payload JSON is invalid."))?;
    let signed_object = loaded
        .as_object()
        .ok_or_else(|| invalid_signature("Signed payload shape is invalid."))?;

    if signed_object.get("ctx").and_then(Value::as_str) != Some(SIGNED_OBJECT_CONTEXT) {
        return Err(invalid_signature("Signed payload context is invalid."));
    }
    if signed_object.get("nonce").and_then(Value::as_str) != Some(row.nonce.as_str()) {
        return Err(invalid_signature("Signed payload nonce mismatch."));
    }
    if signed_object.get("plan_hash").and_then(Value::as_str) != Some(row.plan_hash.as_str()) {
        return Err(invalid_signature("Signed payload plan_hash mismatch."));
    }
    if signed_object.get("key_id").and_then(Value::as_str) != Some(row.key_id.as_str()) {
        return Err(invalid_signature("Signed payload key_id mismatch."));
    }

    let decisions = signed_object
        .get("decisions")
        .cloned()
        .ok_or_else(|| invalid_signature("Signed payload decisions are invalid."))?;
    serde_json::from_value(decisions)
        .map_err(|_| invalid_signature("Signed payload decisions are invalid."))
}
