//! Data Gateway (§4.3): a typed wrapper over the data-source subprocess.
//! Its one hard constraint is signature stability — `get_source_info`'s
//! `signature` must not change for the lifetime of an unchanged source, and
//! every caller that compares a job's recorded signature against a fresh
//! one is relying on that contract to detect drift before execute.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use shipagent_auth::Secret;
use shipagent_errors::{DataError, ShipAgentError};
use shipagent_filter::SchemaColumn;
use shipagent_process::Subprocess;
use shipagent_types::{FilterSpec, SourceRow};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `get_source_info()` result. `row_count` is advisory; `signature` is the
/// value compared for drift detection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceInfo {
    pub source_type: String,
    pub signature: String,
    pub row_count: u32,
}

pub struct DataGateway {
    subprocess: Arc<Subprocess>,
    filter_secret: Secret,
}

impl DataGateway {
    pub fn new(subprocess: Arc<Subprocess>, filter_secret: Secret) -> Self {
        Self { subprocess, filter_secret }
    }

    /// Verifies `filter`'s HMAC signature and returns its `where_sql`.
    /// `None` means "no filter" — an unconditional query is always allowed;
    /// there is nothing to forge. A filter that fails verification is
    /// rejected outright rather than degraded into an unconditional query,
    /// since that would be a *wider* query than the caller asked for.
    fn verified_where_sql(&self, filter: Option<&FilterSpec>) -> Result<String, ShipAgentError> {
        match filter {
            None => Ok(String::new()),
            Some(spec) => {
                shipagent_filter::verify(spec, self.filter_secret.expose().as_bytes())
                    .map_err(|e| ShipAgentError::Data(DataError::FilterRejected(e.to_string())))?;
                Ok(spec.where_sql.clone())
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn get_schema(&self) -> Result<Vec<SchemaColumn>, ShipAgentError> {
        let response = self.call("get_schema", Value::Null)?;
        serde_json::from_value(response).map_err(|e| {
            ShipAgentError::Data(DataError::SchemaMismatch {
                column: "<root>".into(),
                expected: "array of columns".into(),
                found: e.to_string(),
            })
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn get_source_info(&self) -> Result<SourceInfo, ShipAgentError> {
        let response = self.call("get_source_info", Value::Null)?;
        serde_json::from_value(response)
            .map_err(|e| ShipAgentError::Data(DataError::SourceUnreadable(e.to_string())))
    }

    /// Blocks execution with an unambiguous [`DataError::SignatureDrift`] if
    /// the source has changed since `expected` was recorded on the job.
    pub fn assert_signature_unchanged(&self, expected: &str) -> Result<(), ShipAgentError> {
        let info = self.get_source_info()?;
        if info.signature != expected {
            return Err(ShipAgentError::Data(DataError::SignatureDrift {
                expected: expected.to_string(),
                actual: info.signature,
            }));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, filter))]
    pub fn query_rows(&self, filter: Option<&FilterSpec>) -> Result<Vec<SourceRow>, ShipAgentError> {
        let where_sql = self.verified_where_sql(filter)?;
        let response = self.call("query_rows", serde_json::json!({ "whereSql": where_sql }))?;
        serde_json::from_value(response)
            .map_err(|e| ShipAgentError::Data(DataError::SourceUnreadable(e.to_string())))
    }

    #[tracing::instrument(skip(self))]
    pub fn get_row(&self, row_number: u32) -> Result<SourceRow, ShipAgentError> {
        let response = self.call("get_row", serde_json::json!({ "rowNumber": row_number }))?;
        serde_json::from_value(response)
            .map_err(|e| ShipAgentError::Data(DataError::SourceUnreadable(e.to_string())))
    }

    #[tracing::instrument(skip(self, filter))]
    pub fn count_rows(&self, filter: Option<&FilterSpec>) -> Result<u32, ShipAgentError> {
        let where_sql = self.verified_where_sql(filter)?;
        let response = self.call("count_rows", serde_json::json!({ "whereSql": where_sql }))?;
        response
            .as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| ShipAgentError::Data(DataError::SourceUnreadable("count_rows did not return an integer".into())))
    }

    #[tracing::instrument(skip(self))]
    pub fn write_tracking(
        &self,
        row_number: u32,
        tracking_number: &str,
        service_code: &str,
        cost_minor_units: i64,
    ) -> Result<(), ShipAgentError> {
        self.call(
            "write_tracking",
            serde_json::json!({
                "rowNumber": row_number,
                "trackingNumber": tracking_number,
                "serviceCode": service_code,
                "costMinorUnits": cost_minor_units,
            }),
        )?;
        Ok(())
    }

    fn call(&self, tool: &str, args: Value) -> Result<Value, ShipAgentError> {
        self.subprocess
            .call(tool, args, CALL_TIMEOUT)
            .map_err(|e| ShipAgentError::Data(DataError::SourceUnreadable(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_info_round_trips_through_json() {
        let value = serde_json::json!({
            "source_type": "csv",
            "signature": "abc123",
            "row_count": 42,
        });
        let info: SourceInfo = serde_json::from_value(value).unwrap();
        assert_eq!(info.signature, "abc123");
        assert_eq!(info.row_count, 42);
    }

    #[test]
    fn source_row_round_trips_through_json() {
        let value = serde_json::json!({ "row_number": 1, "record": { "zip": "94105" } });
        let row: SourceRow = serde_json::from_value(value).unwrap();
        assert_eq!(row.row_number, 1);
    }

    fn gateway_with_secret(secret: &str) -> DataGateway {
        // `cat` is never actually called in these tests; a signature check
        // that fails verification returns before the subprocess is touched.
        let subprocess = Arc::new(Subprocess::spawn("gateway-test", "cat", &[], &[]).unwrap());
        DataGateway::new(subprocess, Secret::from(secret.to_string()))
    }

    #[test]
    fn no_filter_resolves_to_unconditional_query() {
        let gateway = gateway_with_secret("shh");
        let where_sql = gateway.verified_where_sql(None).unwrap();
        assert_eq!(where_sql, "");
    }

    #[test]
    fn verified_filter_yields_its_where_sql() {
        let secret = b"test-secret";
        let spec = shipagent_filter::sign("sig-1", "state = 'CA'", "CA orders", secret);
        let gateway = gateway_with_secret("test-secret");
        let where_sql = gateway.verified_where_sql(Some(&spec)).unwrap();
        assert_eq!(where_sql, "state = 'CA'");
    }

    #[test]
    fn tampered_filter_is_rejected_before_querying() {
        let secret = b"test-secret";
        let mut spec = shipagent_filter::sign("sig-1", "state = 'CA'", "CA orders", secret);
        spec.where_sql = "1=1".to_string();
        let gateway = gateway_with_secret("test-secret");
        let err = gateway.verified_where_sql(Some(&spec)).unwrap_err();
        assert!(matches!(err, ShipAgentError::Data(DataError::FilterRejected(_))));
    }

    #[test]
    fn filter_signed_with_a_different_secret_is_rejected() {
        let spec = shipagent_filter::sign("sig-1", "state = 'CA'", "CA orders", b"other-secret");
        let gateway = gateway_with_secret("test-secret");
        let err = gateway.verified_where_sql(Some(&spec)).unwrap_err();
        assert!(matches!(err, ShipAgentError::Data(DataError::FilterRejected(_))));
    }
}
