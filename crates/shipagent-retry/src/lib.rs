//! Per-operation retry classes for the Carrier Client (§4.2).
//!
//! Two classes: read-only operations get a short doubling backoff; mutating
//! operations get none, with a single narrow exception for
//! [`CarrierOperation::CreateShipment`] on a proven upstream infrastructure
//! rejection. This module only computes delays and classifies operations —
//! it does not perform I/O or decide retryability from a response body;
//! that judgment lives in `shipagent-carrier`, which is the only crate that
//! can see the raw carrier error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every named carrier operation from §4.2. Kept as a sum type rather than a
/// string so a new operation is a compile-time addition, never a runtime
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierOperation {
    GetRate,
    CreateShipment,
    VoidShipment,
    ValidateAddress,
    Track,
    UploadDocument,
    AttachDocument,
    DeleteDocument,
    SchedulePickup,
    CancelPickup,
    RatePickup,
    GetLandedCost,
    FindLocations,
    GetPickupStatus,
    GetPoliticalDivisions,
    GetServiceCenterFacilities,
}

impl CarrierOperation {
    /// Read-only operations retry twice with a 200ms-doubling backoff;
    /// mutating operations retry zero times by default (see
    /// [`CarrierOperation::create_shipment_retry_exception`] for the one
    /// carve-out).
    pub fn retry_class(self) -> RetryClass {
        use CarrierOperation::*;
        match self {
            GetRate | ValidateAddress | Track | RatePickup | GetLandedCost | FindLocations
            | GetPickupStatus | GetPoliticalDivisions | GetServiceCenterFacilities => {
                RetryClass::ReadOnly
            }
            CreateShipment | VoidShipment | SchedulePickup | CancelPickup | UploadDocument
            | AttachDocument | DeleteDocument => RetryClass::Mutating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    ReadOnly,
    Mutating,
}

impl RetryClass {
    pub fn config(self) -> RetryConfig {
        match self {
            RetryClass::ReadOnly => RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(200),
                strategy: RetryStrategy::ExponentialDoubling,
            },
            RetryClass::Mutating => RetryConfig {
                max_attempts: 0,
                base_delay: Duration::ZERO,
                strategy: RetryStrategy::Immediate,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate,
    ExponentialDoubling,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(skip)]
    pub strategy: RetryStrategy,
}

/// Pattern the carrier client's raw error text is checked against to decide
/// whether `create_shipment` may retry its single permitted time. Only an
/// upstream infrastructure rejection qualifies — never a 4xx, never a
/// timeout taken after the request body was already on the wire.
pub fn is_upstream_infrastructure_rejection(status: Option<u16>, raw_message: &str) -> bool {
    status == Some(503) && raw_message.to_ascii_lowercase().contains("no healthy upstream")
}

/// `attempt` is 1-indexed, matching the carrier client's call-site counting.
/// Delay is capped so a doubling read-only retry never exceeds one second
/// even with a deliberately inflated attempt number.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategy::Immediate => Duration::ZERO,
        RetryStrategy::ExponentialDoubling => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
    };
    delay.min(Duration::from_secs(1))
}

/// Whether the raw carrier-layer signal (HTTP-style status plus message)
/// counts as retryable at all, independent of operation class. The carrier
/// client ANDs this with [`CarrierOperation::retry_class`] before retrying.
pub fn is_retryable_signal(status: Option<u16>, raw_message: &str) -> bool {
    match status {
        Some(429) | Some(500..=599) => true,
        _ => {
            let lower = raw_message.to_ascii_lowercase();
            lower.contains("timeout")
                || lower.contains("reconnect")
                || lower.contains("rate limit")
                || lower.contains("temporarily unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_ops_get_two_retries() {
        assert_eq!(CarrierOperation::GetRate.retry_class(), RetryClass::ReadOnly);
        assert_eq!(RetryClass::ReadOnly.config().max_attempts, 2);
    }

    #[test]
    fn mutating_ops_get_zero_retries_by_default() {
        assert_eq!(
            CarrierOperation::CreateShipment.retry_class(),
            RetryClass::Mutating
        );
        assert_eq!(RetryClass::Mutating.config().max_attempts, 0);
    }

    #[test]
    fn delay_doubles_and_is_capped() {
        let config = RetryClass::ReadOnly.config();
        assert_eq!(calculate_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(calculate_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(calculate_delay(&config, 20), Duration::from_secs(1));
    }

    #[test]
    fn infrastructure_rejection_pattern_is_narrow() {
        assert!(is_upstream_infrastructure_rejection(
            Some(503),
            "no healthy upstream"
        ));
        assert!(!is_upstream_infrastructure_rejection(Some(400), "bad request"));
        assert!(!is_upstream_infrastructure_rejection(None, "timeout"));
    }

    #[test]
    fn retryable_signal_patterns() {
        assert!(is_retryable_signal(Some(429), ""));
        assert!(is_retryable_signal(Some(503), ""));
        assert!(is_retryable_signal(None, "connection timeout"));
        assert!(!is_retryable_signal(Some(404), "not found"));
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_one_second(attempt in 0u32..1000) {
            let config = RetryClass::ReadOnly.config();
            let delay = calculate_delay(&config, attempt);
            proptest::prop_assert!(delay <= Duration::from_secs(1));
        }
    }
}
