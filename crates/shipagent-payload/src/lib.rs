//! Payload Builder (§4.4). Pure functions only — no I/O, no clock reads, no
//! retry concerns. Given a canonical order record, a requested service
//! code, and a [`ShipperProfile`], produces the two request bodies the
//! carrier client sends over the subprocess.
//!
//! The rate/ship packaging-key split and the international service-code
//! upgrade rule are discovered contracts from the carrier's own behavior;
//! both are encoded here so no caller can accidentally bypass them.

use serde_json::{Value, json};
use shipagent_errors::{ShipAgentError, ValidationError};
use shipagent_types::ShipperProfile;

const GRAMS_PER_POUND: f64 = 453.592;
const MAX_REFERENCE_LEN: usize = 35;

/// Canonical order record fields this builder reads. Upstream adapters are
/// responsible for normalizing into this shape before a row reaches the
/// batch engine.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub weight_grams: f64,
    pub length_cm: f64,
    pub width_cm: f64,
    pub height_cm: f64,
    pub destination_country: String,
    pub destination_zip: String,
    pub reference_number: String,
    pub hs_code: Option<String>,
}

fn grams_to_lbs(grams: f64) -> f64 {
    grams / GRAMS_PER_POUND
}

fn cm_to_in(cm: f64) -> f64 {
    cm / 2.54
}

fn validate_record(order: &OrderRecord) -> Result<(), ShipAgentError> {
    if order.destination_zip.trim().is_empty()
        || !order
            .destination_zip
            .chars()
            .all(|c| c.is_ascii_digit() || c == '-')
    {
        return Err(ShipAgentError::Validation(ValidationError::InvalidZip(
            Some(order.destination_zip.clone()),
        )));
    }
    if grams_to_lbs(order.weight_grams) > 150.0 {
        return Err(ShipAgentError::Validation(ValidationError::OversizeWeight {
            weight_lbs: grams_to_lbs(order.weight_grams),
            max_lbs: 150.0,
        }));
    }
    if is_international(&order.destination_country) && order.hs_code.is_none() {
        return Err(ShipAgentError::Validation(ValidationError::MissingHsCode));
    }
    Ok(())
}

fn is_international(country: &str) -> bool {
    !country.eq_ignore_ascii_case("US")
}

/// International service-code upgrade (§4.4 invariant 6): CA/MX get the
/// "international standard" code, any other non-domestic destination gets
/// "international express saver". A domestic code is never forwarded as-is
/// on an international lane.
pub fn resolve_service_code(
    requested: &str,
    destination_country: &str,
) -> Result<String, ShipAgentError> {
    if !is_international(destination_country) {
        return Ok(requested.to_string());
    }
    if is_international_service_code(requested) {
        return Ok(requested.to_string());
    }
    let upgraded = if destination_country.eq_ignore_ascii_case("CA")
        || destination_country.eq_ignore_ascii_case("MX")
    {
        "international_standard"
    } else {
        "international_express_saver"
    };
    Ok(upgraded.to_string())
}

fn is_international_service_code(code: &str) -> bool {
    code.starts_with("international_")
}

fn truncated_reference(reference: &str) -> String {
    reference.chars().take(MAX_REFERENCE_LEN).collect()
}

/// `get_rate` body. Uses packaging-key variant A; never share this function
/// with [`ship_body`]'s key shape even when the two look similar.
pub fn rate_body(
    order: &OrderRecord,
    service_code: &str,
    profile: &ShipperProfile,
) -> Result<Value, ShipAgentError> {
    validate_record(order)?;
    let resolved_service = resolve_service_code(service_code, &order.destination_country)?;
    if !is_international(&order.destination_country) && is_international_service_code(service_code)
    {
        return Err(ShipAgentError::Validation(
            ValidationError::DomesticCodeOnInternationalLane(service_code.to_string()),
        ));
    }

    Ok(json!({
        "shipperAccountNumber": profile.account_number,
        "serviceCode": resolved_service,
        "negotiatedRatesIndicator": true,
        "packaging": {
            "weightLbs": grams_to_lbs(order.weight_grams),
            "dimensions": {
                "lengthIn": cm_to_in(order.length_cm),
                "widthIn": cm_to_in(order.width_cm),
                "heightIn": cm_to_in(order.height_cm),
            },
        },
        "destination": {
            "country": order.destination_country,
            "zip": order.destination_zip,
        },
    }))
}

/// `create_shipment` body. Uses packaging-key variant B, a single-charge
/// payment-information array, and package-level reference numbers (§4.4
/// invariants 3–5).
pub fn ship_body(
    order: &OrderRecord,
    service_code: &str,
    profile: &ShipperProfile,
) -> Result<Value, ShipAgentError> {
    validate_record(order)?;
    let resolved_service = resolve_service_code(service_code, &order.destination_country)?;
    if !is_international(&order.destination_country) && is_international_service_code(service_code)
    {
        return Err(ShipAgentError::Validation(
            ValidationError::DomesticCodeOnInternationalLane(service_code.to_string()),
        ));
    }

    let mut package = json!({
        "weightLbs": grams_to_lbs(order.weight_grams),
        "dimensionsIn": {
            "length": cm_to_in(order.length_cm),
            "width": cm_to_in(order.width_cm),
            "height": cm_to_in(order.height_cm),
        },
        "referenceNumbers": [truncated_reference(&order.reference_number)],
    });
    if let Some(hs_code) = &order.hs_code {
        package["hsCode"] = json!(hs_code);
    }

    Ok(json!({
        "shipperAccountNumber": profile.account_number,
        "serviceCode": resolved_service,
        "negotiatedRatesIndicator": true,
        "labelSpecification": {
            "format": "PDF",
            "size": "4x6",
        },
        "paymentInformation": [{
            "type": "sender",
            "shipperAccountNumber": profile.account_number,
        }],
        "package": package,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ShipperProfile {
        ShipperProfile {
            account_number: "ACC-1".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            base_url: "https://example.test".into(),
        }
    }

    fn order() -> OrderRecord {
        OrderRecord {
            weight_grams: 907.0, // ~2.0 lbs
            length_cm: 10.0,
            width_cm: 10.0,
            height_cm: 10.0,
            destination_country: "US".into(),
            destination_zip: "94105".into(),
            reference_number: "ORDER-1".into(),
            hs_code: None,
        }
    }

    #[test]
    fn grams_convert_to_pounds() {
        let lbs = grams_to_lbs(453.592);
        assert!((lbs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn domestic_service_code_passes_through() {
        let resolved = resolve_service_code("03", "US").unwrap();
        assert_eq!(resolved, "03");
    }

    #[test]
    fn canada_upgrades_domestic_code_to_international_standard() {
        let resolved = resolve_service_code("03", "CA").unwrap();
        assert_eq!(resolved, "international_standard");
    }

    #[test]
    fn other_country_upgrades_to_express_saver() {
        let resolved = resolve_service_code("03", "DE").unwrap();
        assert_eq!(resolved, "international_express_saver");
    }

    #[test]
    fn already_international_code_is_untouched() {
        let resolved = resolve_service_code("international_standard", "CA").unwrap();
        assert_eq!(resolved, "international_standard");
    }

    #[test]
    fn rate_body_and_ship_body_use_different_packaging_keys() {
        let order = order();
        let rate = rate_body(&order, "03", &profile()).unwrap();
        let ship = ship_body(&order, "03", &profile()).unwrap();
        assert!(rate.get("packaging").is_some());
        assert!(rate.get("package").is_none());
        assert!(ship.get("package").is_some());
        assert!(ship.get("packaging").is_none());
    }

    #[test]
    fn ship_body_truncates_long_reference_numbers() {
        let mut order = order();
        order.reference_number = "X".repeat(50);
        let ship = ship_body(&order, "03", &profile()).unwrap();
        let refs = ship["package"]["referenceNumbers"][0].as_str().unwrap();
        assert_eq!(refs.len(), 35);
    }

    #[test]
    fn international_shipment_without_hs_code_is_rejected() {
        let mut order = order();
        order.destination_country = "DE".into();
        let err = ship_body(&order, "03", &profile()).unwrap_err();
        assert!(matches!(
            err,
            ShipAgentError::Validation(ValidationError::MissingHsCode)
        ));
    }

    #[test]
    fn invalid_zip_is_rejected() {
        let mut order = order();
        order.destination_zip = "ABCDE".into();
        let err = rate_body(&order, "03", &profile()).unwrap_err();
        assert!(matches!(
            err,
            ShipAgentError::Validation(ValidationError::InvalidZip(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn negotiated_indicator_always_present(weight in 1.0f64..50000.0) {
            let mut order = order();
            order.weight_grams = weight;
            if let Ok(body) = rate_body(&order, "03", &profile()) {
                proptest::prop_assert_eq!(body["negotiatedRatesIndicator"].as_bool(), Some(true));
            }
        }
    }
}
