//! Carrier Client (§4.2): a typed wrapper over the carrier subprocess.
//! Every method assembles a request (via `shipagent-payload` for
//! `get_rate`/`create_shipment`), calls the Subprocess Supervisor,
//! normalizes the response into a stable shape, translates errors through
//! the error taxonomy, and applies its operation's retry policy.
//!
//! Response normalization and retry are kept in one place so no caller can
//! accidentally see a carrier-shaped response or bypass the retry contract.

use std::thread;
use std::time::Duration;

use serde_json::Value;
use shipagent_errors::{CarrierError, ShipAgentError, SystemError};
use shipagent_payload::{rate_body, ship_body, OrderRecord};
use shipagent_process::Subprocess;
use shipagent_retry::{calculate_delay, is_retryable_signal, is_upstream_infrastructure_rejection, CarrierOperation};
use shipagent_types::ShipperProfile;
use std::sync::Arc;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalized rate quote. `total_minor_units` prefers the negotiated total
/// and falls back to the list total, matching invariant 4 of the Payload
/// Builder (§4.4).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateQuote {
    pub total_minor_units: i64,
    pub currency: String,
    pub service_code: String,
}

/// Normalized shipment-creation result. `request_body` is the exact JSON
/// this call sent to the carrier — the §3 Data Model requires a row's
/// `payload_snapshot` to be what was actually dispatched, not the source
/// record it was built from.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShipmentResult {
    pub tracking_numbers: Vec<String>,
    pub label_data: Vec<String>,
    pub total_minor_units: i64,
    pub currency: String,
    pub request_body: Value,
}

/// Normalized address-validation result.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AddressValidation {
    pub status: String,
    pub candidates: Vec<Value>,
}

pub struct CarrierClient {
    subprocess: Arc<Subprocess>,
    profile: ShipperProfile,
}

impl CarrierClient {
    pub fn new(subprocess: Arc<Subprocess>, profile: ShipperProfile) -> Self {
        Self { subprocess, profile }
    }

    #[tracing::instrument(skip(self, order), fields(op = "get_rate"))]
    pub fn get_rate(&self, order: &OrderRecord, service_code: &str) -> Result<RateQuote, ShipAgentError> {
        let body = rate_body(order, service_code, &self.profile)?;
        let response = self.invoke(CarrierOperation::GetRate, "get_rate", body)?;
        Ok(normalize_rate(&response))
    }

    #[tracing::instrument(skip(self, order), fields(op = "create_shipment"))]
    pub fn create_shipment(
        &self,
        order: &OrderRecord,
        service_code: &str,
        idempotency_key: &str,
    ) -> Result<ShipmentResult, ShipAgentError> {
        let mut body = ship_body(order, service_code, &self.profile)?;
        body["idempotencyKey"] = Value::String(idempotency_key.to_string());
        let response = self.invoke(CarrierOperation::CreateShipment, "create_shipment", body.clone())?;
        Ok(normalize_shipment(&response, body))
    }

    #[tracing::instrument(skip(self))]
    pub fn void_shipment(&self, tracking_number: &str) -> Result<(), ShipAgentError> {
        let body = serde_json::json!({ "trackingNumber": tracking_number });
        self.invoke(CarrierOperation::VoidShipment, "void_shipment", body)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, args))]
    pub fn validate_address(&self, args: Value) -> Result<AddressValidation, ShipAgentError> {
        let response = self.invoke(CarrierOperation::ValidateAddress, "validate_address", args)?;
        Ok(AddressValidation {
            status: response
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            candidates: response
                .get("candidates")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn track(&self, tracking_number: &str) -> Result<Value, ShipAgentError> {
        let body = serde_json::json!({ "trackingNumber": tracking_number });
        self.invoke(CarrierOperation::Track, "track", body)
    }

    #[tracing::instrument(skip(self, args))]
    pub fn upload_document(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::UploadDocument, "upload_document", args)
    }

    #[tracing::instrument(skip(self, args))]
    pub fn attach_document(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::AttachDocument, "attach_document", args)
    }

    #[tracing::instrument(skip(self, args))]
    pub fn schedule_pickup(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::SchedulePickup, "schedule_pickup", args)
    }

    #[tracing::instrument(skip(self))]
    pub fn cancel_pickup(&self, pickup_id: &str) -> Result<(), ShipAgentError> {
        let body = serde_json::json!({ "pickupId": pickup_id });
        self.invoke(CarrierOperation::CancelPickup, "cancel_pickup", body)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, args))]
    pub fn rate_pickup(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::RatePickup, "rate_pickup", args)
    }

    #[tracing::instrument(skip(self, args))]
    pub fn get_landed_cost(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::GetLandedCost, "get_landed_cost", args)
    }

    #[tracing::instrument(skip(self, args))]
    pub fn find_locations(&self, args: Value) -> Result<Value, ShipAgentError> {
        self.invoke(CarrierOperation::FindLocations, "find_locations", args)
    }

    #[tracing::instrument(skip(self))]
    pub fn get_pickup_status(&self, pickup_id: &str) -> Result<Value, ShipAgentError> {
        let body = serde_json::json!({ "pickupId": pickup_id });
        self.invoke(CarrierOperation::GetPickupStatus, "get_pickup_status", body)
    }

    #[tracing::instrument(skip(self))]
    pub fn get_political_divisions(&self, country: &str) -> Result<Value, ShipAgentError> {
        let body = serde_json::json!({ "country": country });
        self.invoke(
            CarrierOperation::GetPoliticalDivisions,
            "get_political_divisions",
            body,
        )
    }

    #[tracing::instrument(skip(self))]
    pub fn get_service_center_facilities(&self, country: &str) -> Result<Value, ShipAgentError> {
        let body = serde_json::json!({ "country": country });
        self.invoke(
            CarrierOperation::GetServiceCenterFacilities,
            "get_service_center_facilities",
            body,
        )
    }

    /// Central dispatch: calls the subprocess, and on a retryable signal
    /// retries per the operation's class (§4.2's strict retry contract),
    /// including the single narrow `create_shipment` exception for a proven
    /// upstream infrastructure rejection.
    fn invoke(&self, op: CarrierOperation, tool: &str, args: Value) -> Result<Value, ShipAgentError> {
        let config = op.retry_class().config();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.subprocess.call(tool, args.clone(), CALL_TIMEOUT) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let message = e.to_string();
                    let (status, carrier_code) = extract_status(&message);

                    let may_retry = if attempt <= config.max_attempts {
                        is_retryable_signal(status, &message)
                    } else if op == CarrierOperation::CreateShipment
                        && attempt == 1
                        && is_upstream_infrastructure_rejection(status, &message)
                    {
                        true
                    } else {
                        false
                    };

                    if may_retry {
                        tracing::warn!(op = ?op, attempt, error = %message, "retrying carrier call");
                        let delay = calculate_delay(&config, attempt);
                        thread::sleep(delay);
                        continue;
                    }

                    return Err(translate_error(op, status, carrier_code, &message));
                }
            }
        }
    }
}

/// The subprocess supervisor reports failures as plain strings; this
/// extracts a best-effort status code if the child encoded one, since the
/// wire protocol carries only a message, not a structured status.
fn extract_status(message: &str) -> (Option<u16>, Option<String>) {
    for token in message.split(|c: char| !c.is_ascii_digit()) {
        if token.len() == 3 {
            if let Ok(code) = token.parse::<u16>() {
                if (100..=599).contains(&code) {
                    return (Some(code), Some(token.to_string()));
                }
            }
        }
    }
    (None, None)
}

fn translate_error(
    op: CarrierOperation,
    status: Option<u16>,
    carrier_code: Option<String>,
    message: &str,
) -> ShipAgentError {
    let is_mutating = op.retry_class() == shipagent_retry::RetryClass::Mutating;
    if is_mutating && message.to_ascii_lowercase().contains("timeout") {
        return ShipAgentError::Carrier(CarrierError::FailedIndeterminate);
    }
    match (status, carrier_code) {
        (Some(_), Some(raw_code)) => ShipAgentError::Carrier(CarrierError::Rejected {
            code: raw_code,
            message: message.to_string(),
        }),
        _ => ShipAgentError::System(SystemError::Transport(message.to_string())),
    }
}

fn normalize_rate(response: &Value) -> RateQuote {
    let negotiated = response
        .get("totalCharges")
        .and_then(|tc| tc.get("negotiatedAmount"))
        .and_then(Value::as_i64);
    let list = response
        .get("totalCharges")
        .and_then(|tc| tc.get("amount"))
        .and_then(Value::as_i64);
    RateQuote {
        total_minor_units: negotiated.or(list).unwrap_or(0),
        currency: response
            .get("totalCharges")
            .and_then(|tc| tc.get("currency"))
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_string(),
        service_code: response
            .get("serviceCode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn normalize_shipment(response: &Value, request_body: Value) -> ShipmentResult {
    let tracking_numbers = response
        .get("trackingNumbers")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let label_data = response
        .get("labelData")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let rate = normalize_rate(response);
    ShipmentResult {
        tracking_numbers,
        label_data,
        total_minor_units: rate.total_minor_units,
        currency: rate.currency,
        request_body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rate_prefers_negotiated_total() {
        let response = serde_json::json!({
            "totalCharges": { "amount": 5000, "negotiatedAmount": 4200, "currency": "USD" },
            "serviceCode": "03",
        });
        let quote = normalize_rate(&response);
        assert_eq!(quote.total_minor_units, 4200);
    }

    #[test]
    fn normalize_rate_falls_back_to_list_total() {
        let response = serde_json::json!({
            "totalCharges": { "amount": 5000, "currency": "USD" },
        });
        let quote = normalize_rate(&response);
        assert_eq!(quote.total_minor_units, 5000);
    }

    #[test]
    fn extract_status_finds_three_digit_code() {
        let (status, code) = extract_status("carrier returned 503 no healthy upstream");
        assert_eq!(status, Some(503));
        assert_eq!(code.as_deref(), Some("503"));
    }

    #[test]
    fn extract_status_returns_none_without_a_code() {
        let (status, code) = extract_status("connection reset by peer");
        assert_eq!(status, None);
        assert_eq!(code, None);
    }

    #[test]
    fn mutating_timeout_is_failed_indeterminate() {
        let err = translate_error(CarrierOperation::CreateShipment, None, None, "request timeout");
        assert!(matches!(
            err,
            ShipAgentError::Carrier(CarrierError::FailedIndeterminate)
        ));
    }

    #[test]
    fn normalize_shipment_collects_tracking_and_labels() {
        let response = serde_json::json!({
            "trackingNumbers": ["1Z999"],
            "labelData": ["base64-label"],
            "totalCharges": { "amount": 1200, "currency": "USD" },
        });
        let request_body = serde_json::json!({ "idempotencyKey": "job:1:0" });
        let result = normalize_shipment(&response, request_body.clone());
        assert_eq!(result.tracking_numbers, vec!["1Z999".to_string()]);
        assert_eq!(result.label_data, vec!["base64-label".to_string()]);
        assert_eq!(result.total_minor_units, 1200);
        assert_eq!(result.request_body, request_body);
    }

    #[test]
    fn normalize_shipment_snapshot() {
        let response = serde_json::json!({
            "trackingNumbers": ["1Z999", "1Z998"],
            "labelData": ["base64-label-a", "base64-label-b"],
            "totalCharges": { "amount": 1800, "negotiatedAmount": 1550, "currency": "USD" },
            "serviceCode": "03",
        });
        let request_body = serde_json::json!({ "idempotencyKey": "job:7:2", "serviceCode": "03" });
        let result = normalize_shipment(&response, request_body);
        insta::assert_yaml_snapshot!(result);
    }
}
