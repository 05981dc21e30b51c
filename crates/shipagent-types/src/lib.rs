//! # Types
//!
//! Core domain types shared across ShipAgent: [`Job`], [`JobRow`], [`AuditEntry`],
//! [`FilterSpec`], and [`ShipperProfile`].
//!
//! ## Serialization
//!
//! All types here implement `Serialize`/`Deserialize` for persistence in the
//! state store and for event payloads crossing the Event Bus. Money is always
//! an integer count of minor units (cents); durations cross the wire as
//! millisecond counts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Status of a [`Job`]. See the state machine in the coordinator crate for the
/// allowed transition DAG; this type only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Previewing,
    Previewed,
    Approved,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never accept another transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Status of one [`JobRow`]. Transitions are driven exclusively by the batch
/// engine and are always a compare-and-set against the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Rated,
    Shipping,
    Shipped,
    Voided,
    Failed,
    Skipped,
}

impl RowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RowStatus::Shipped | RowStatus::Voided | RowStatus::Failed | RowStatus::Skipped
        )
    }
}

/// Who caused an [`AuditEntry`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User,
    Hook,
}

/// A structured, stable error record attached to a failed row or a failed job.
///
/// `code` is an E-code from the error taxonomy (e.g. `"E-2001"`); `raw` carries
/// the untranslated carrier or data-source message verbatim for support
/// escalation, never shown to the end user directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub title: String,
    pub message: String,
    pub remediation: String,
    pub raw: Option<String>,
    pub retryable: bool,
}

/// Static shipper identity and account, loaded once at startup and shared
/// read-only for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperProfile {
    pub account_number: String,
    pub client_id: String,
    /// Never serialized in Debug output of callers that log this struct at
    /// the wrong level; kept as a plain String here because redaction is the
    /// auth crate's job, not this one's.
    pub client_secret: String,
    pub base_url: String,
}

/// One user command and everything the coordinator tracks about it.
///
/// Invariants upheld by the coordinator and state store, not by this type:
/// at most one `Job` is `Running` per process; `approved_at.is_some()`
/// implies the stored approval-token hash matches; `cost_minor_units` is the
/// sum of `rated_cost` over rows that reached `Shipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command_text: String,
    pub source_signature: String,
    pub filter: Option<FilterSpec>,
    pub service_code: String,
    pub status: JobStatus,
    pub total_rows: u32,
    pub succeeded_rows: u32,
    pub failed_rows: u32,
    pub skipped_rows: u32,
    pub cost_minor_units: i64,
    pub generation: u32,
    pub approval_token_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// `total == succeeded + failed + skipped + (rows still in flight)`. On a
    /// terminal job the in-flight term must be zero; this helper computes it
    /// so callers can assert the invariant without re-deriving the formula.
    pub fn rows_in_flight(&self) -> u32 {
        self.total_rows
            .saturating_sub(self.succeeded_rows + self.failed_rows + self.skipped_rows)
    }
}

/// One input record within a job, identified by `(job_id, row_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: Uuid,
    pub row_number: u32,
    pub checksum: String,
    pub order_record: serde_json::Value,
    pub payload_snapshot: Option<serde_json::Value>,
    pub status: RowStatus,
    pub rated_cost: Option<i64>,
    pub tracking_number: Option<String>,
    pub label_ref: Option<String>,
    pub error: Option<ErrorRecord>,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

/// SHA-256 of the canonical (key-sorted, compact) JSON serialization of a
/// row. Computed once at fetch time; never recomputed or mutated afterward.
pub fn content_checksum(order_record: &serde_json::Value) -> String {
    let canonical = canonical_json(order_record);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Re-serializes a `Value` with object keys sorted, so the same logical row
/// always hashes the same way regardless of source column order.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).expect("sorted map always serializes")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).expect("canonicalized value always serializes")
}

/// Append-only record of a single state transition, scoped either to a row
/// (`row_number.is_some()`) or to the job itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub job_id: Uuid,
    pub row_number: Option<u32>,
    pub kind: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    /// SHA-256 of the payload involved in this transition, never the payload
    /// itself — audit rows must never leak address or payment data.
    pub payload_digest: Option<String>,
}

/// A compiled, HMAC-signed WHERE fragment plus its human-readable summary.
///
/// `signature` is over the canonical serialization of every field except
/// itself; see `shipagent-filter` for signing/verification. A `FilterSpec`
/// that fails verification must never reach the data gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub source_signature: String,
    pub where_sql: String,
    pub summary: String,
    pub signature: String,
}

/// One input row as returned by the data gateway, before it becomes a
/// [`JobRow`]. Kept distinct so the gateway crate does not need to depend on
/// job-lifecycle fields it has no business touching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub row_number: u32,
    pub record: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_under_key_reordering() {
        let a = serde_json::json!({"zip": "94105", "name": "Ada"});
        let b = serde_json::json!({"name": "Ada", "zip": "94105"});
        assert_eq!(content_checksum(&a), content_checksum(&b));
    }

    #[test]
    fn checksum_changes_with_value() {
        let a = serde_json::json!({"zip": "94105"});
        let b = serde_json::json!({"zip": "94106"});
        assert_ne!(content_checksum(&a), content_checksum(&b));
    }

    proptest::proptest! {
        #[test]
        fn checksum_is_stable_under_any_key_permutation(
            a in "[a-z]{1,8}", b in "[a-z]{1,8}", c in "[a-z]{1,8}",
            va in proptest::prelude::any::<i32>(),
            vb in proptest::prelude::any::<i32>(),
            vc in proptest::prelude::any::<i32>(),
        ) {
            proptest::prop_assume!(a != b && b != c && a != c);
            let forward = serde_json::json!({ a.clone(): va, b.clone(): vb, c.clone(): vc });
            let reordered = serde_json::json!({ c: vc, a: va, b: vb });
            proptest::prop_assert_eq!(content_checksum(&forward), content_checksum(&reordered));
        }
    }

    #[test]
    fn rows_in_flight_is_zero_when_all_terminal() {
        let job = Job {
            id: Uuid::new_v4(),
            command_text: "ship all CA orders".into(),
            source_signature: "sig".into(),
            filter: None,
            service_code: "03".into(),
            status: JobStatus::Completed,
            total_rows: 3,
            succeeded_rows: 2,
            failed_rows: 1,
            skipped_rows: 0,
            cost_minor_units: 2400,
            generation: 0,
            approval_token_hash: None,
            created_at: Utc::now(),
            approved_at: None,
            started_at: None,
            completed_at: None,
        };
        assert_eq!(job.rows_in_flight(), 0);
    }

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
    }
}
