//! Stable error codes (§7 of the design: data, validation, carrier, system,
//! auth) with retryability and a user-facing remediation string attached to
//! every variant. The carrier client and batch engine are the only
//! consumers that need to branch on the enum itself; everything else should
//! treat a [`ShipAgentError`] as an opaque [`ErrorRecord`](shipagent_types::ErrorRecord).

use shipagent_types::ErrorRecord;
use thiserror::Error;

/// E-1xxx. Source unreadable, schema mismatch, signature drift. Always
/// fatal to the current batch.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("data source unreadable: {0}")]
    SourceUnreadable(String),
    #[error("schema mismatch: expected column `{column}` of type `{expected}`, found `{found}`")]
    SchemaMismatch {
        column: String,
        expected: String,
        found: String,
    },
    #[error("source signature drift: job was previewed against `{expected}`, current source is `{actual}`")]
    SignatureDrift { expected: String, actual: String },
    #[error("filter signature does not verify: {0}")]
    FilterRejected(String),
}

/// E-2xxx. A single row fails schema requirements. Never fatal to the
/// batch by itself; the engine decides whether to trip fail-fast.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing or malformed ZIP code: {0:?}")]
    InvalidZip(Option<String>),
    #[error("package weight {weight_lbs} lbs exceeds carrier maximum {max_lbs} lbs")]
    OversizeWeight { weight_lbs: f64, max_lbs: f64 },
    #[error("HS code is required for international shipments but was not provided")]
    MissingHsCode,
    #[error("requested service code `{0}` is domestic and forbidden on international lanes")]
    DomesticCodeOnInternationalLane(String),
}

/// E-3xxx. Errors surfaced by the carrier, after retry policy has already
/// run its course for retryable classes.
#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier rejected the request: {code} {message}")]
    Rejected { code: String, message: String },
    #[error("carrier call timed out after the request body was sent; outcome unknown")]
    FailedIndeterminate,
    #[error("carrier returned an unrecognized code `{code}`: {message}")]
    Unknown { code: String, message: String },
}

/// E-4xxx. State store or subprocess transport failures. Always fatal.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("state store error: {0}")]
    Store(String),
    #[error("stale transition: row/job was expected to be in `{expected}` but is in `{actual}`")]
    StaleTransition { expected: String, actual: String },
    #[error("subprocess transport error: {0}")]
    Transport(String),
    #[error("another worker process already holds the state store lock (pid {pid} on {host})")]
    LockHeld { pid: u32, host: String },
}

/// E-5xxx. Carrier OAuth or REST API-key failures. Always fatal.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("carrier credentials rejected")]
    CarrierUnauthorized,
    #[error("missing required credential: {0}")]
    MissingCredential(String),
    #[error("REST API key missing or invalid")]
    ApiKeyInvalid,
}

/// Top-level error type every component converts into before it crosses a
/// row/job boundary. Each class knows its own E-code prefix and whether a
/// caller may retry.
#[derive(Debug, Error)]
pub enum ShipAgentError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Carrier(#[from] CarrierError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ShipAgentError {
    /// Stable E-code, e.g. `"E-2001"`. Codes within a class are assigned in
    /// declaration order; renumbering a variant is a breaking change for any
    /// consumer that matches on the string.
    pub fn code(&self) -> &'static str {
        match self {
            ShipAgentError::Data(DataError::SourceUnreadable(_)) => "E-1001",
            ShipAgentError::Data(DataError::SchemaMismatch { .. }) => "E-1002",
            ShipAgentError::Data(DataError::SignatureDrift { .. }) => "E-1003",
            ShipAgentError::Data(DataError::FilterRejected(_)) => "E-1004",
            ShipAgentError::Validation(ValidationError::InvalidZip(_)) => "E-2001",
            ShipAgentError::Validation(ValidationError::OversizeWeight { .. }) => "E-2002",
            ShipAgentError::Validation(ValidationError::MissingHsCode) => "E-2003",
            ShipAgentError::Validation(ValidationError::DomesticCodeOnInternationalLane(_)) => {
                "E-2004"
            }
            ShipAgentError::Carrier(CarrierError::Rejected { .. }) => "E-3001",
            ShipAgentError::Carrier(CarrierError::FailedIndeterminate) => "E-3002",
            ShipAgentError::Carrier(CarrierError::Unknown { .. }) => "E-3999",
            ShipAgentError::System(SystemError::Store(_)) => "E-4001",
            ShipAgentError::System(SystemError::StaleTransition { .. }) => "E-4002",
            ShipAgentError::System(SystemError::Transport(_)) => "E-4003",
            ShipAgentError::System(SystemError::LockHeld { .. }) => "E-4004",
            ShipAgentError::Auth(AuthError::CarrierUnauthorized) => "E-5001",
            ShipAgentError::Auth(AuthError::MissingCredential(_)) => "E-5002",
            ShipAgentError::Auth(AuthError::ApiKeyInvalid) => "E-5003",
        }
    }

    /// Whether the Carrier Client's retry policy considers this class of
    /// failure retryable. Validation, system, and auth errors are never
    /// retried automatically; carrier errors depend on the specific variant.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShipAgentError::Carrier(CarrierError::Rejected { code, .. }) => {
                matches!(code.as_str(), "429" | "500" | "502" | "503" | "504")
            }
            _ => false,
        }
    }

    /// Short, user-safe remediation string. Never includes raw carrier
    /// payloads — those live in [`ErrorRecord::raw`].
    pub fn remediation(&self) -> String {
        match self {
            ShipAgentError::Data(DataError::SourceUnreadable(_)) => {
                "Reconnect the data source and retry.".into()
            }
            ShipAgentError::Data(DataError::SchemaMismatch { .. }) => {
                "The source schema changed; re-run the filter against the current schema.".into()
            }
            ShipAgentError::Data(DataError::SignatureDrift { .. }) => {
                "The data source changed since this job was previewed. Re-preview before approving.".into()
            }
            ShipAgentError::Data(DataError::FilterRejected(_)) => {
                "This filter was not signed by this installation and was rejected. Recompile it through the facade.".into()
            }
            ShipAgentError::Validation(ValidationError::InvalidZip(_)) => {
                "Correct the ZIP code on this row and re-run.".into()
            }
            ShipAgentError::Validation(ValidationError::OversizeWeight { .. }) => {
                "Split this shipment or select a freight service.".into()
            }
            ShipAgentError::Validation(ValidationError::MissingHsCode) => {
                "Add an HS code for this international shipment.".into()
            }
            ShipAgentError::Validation(ValidationError::DomesticCodeOnInternationalLane(_)) => {
                "Choose an international service code for this destination.".into()
            }
            ShipAgentError::Carrier(CarrierError::Rejected { .. }) => {
                "The carrier rejected this request; see the raw carrier message.".into()
            }
            ShipAgentError::Carrier(CarrierError::FailedIndeterminate) => {
                "Outcome unknown — check the carrier dashboard before retrying manually.".into()
            }
            ShipAgentError::Carrier(CarrierError::Unknown { .. }) => {
                "Unrecognized carrier response; contact support with the raw code.".into()
            }
            ShipAgentError::System(_) => {
                "Internal error; the batch has halted and can be resumed after restart.".into()
            }
            ShipAgentError::Auth(_) => {
                "Check carrier and API credentials in the environment.".into()
            }
        }
    }

    /// Builds the full [`ErrorRecord`] attached to a row or job, preserving
    /// the raw carrier text when one is available.
    pub fn to_record(&self, raw: Option<String>) -> ErrorRecord {
        ErrorRecord {
            code: self.code().to_string(),
            title: self.to_string(),
            message: self.to_string(),
            remediation: self.remediation(),
            raw,
            retryable: self.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_carrier_code_falls_back_to_3999() {
        let err = ShipAgentError::Carrier(CarrierError::Unknown {
            code: "X-WEIRD".into(),
            message: "never seen before".into(),
        });
        assert_eq!(err.code(), "E-3999");
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limited_carrier_error_is_retryable() {
        let err = ShipAgentError::Carrier(CarrierError::Rejected {
            code: "429".into(),
            message: "too many requests".into(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn failed_indeterminate_is_never_retryable() {
        let err = ShipAgentError::Carrier(CarrierError::FailedIndeterminate);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "E-3002");
    }

    #[test]
    fn system_errors_never_retry() {
        let err = ShipAgentError::System(SystemError::StaleTransition {
            expected: "pending".into(),
            actual: "shipping".into(),
        });
        assert!(!err.is_retryable());
    }
}
