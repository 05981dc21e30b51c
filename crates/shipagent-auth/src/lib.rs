//! Credential resolution for ShipAgent's two subprocess services.
//!
//! Carrier and data-source credentials arrive via environment only (§6);
//! the CLI never accepts them as flags and the config file never stores
//! them. `Secret` exists so a derived `Debug` impl elsewhere in the tree
//! cannot accidentally print a resolved value into a log line.
//!
//! # Example
//!
//! ```
//! use shipagent_auth::{resolve_carrier_credentials, TokenSource};
//!
//! temp_env::with_vars(
//!     [
//!         ("SHIPAGENT_CARRIER_CLIENT_ID", Some("id-123")),
//!         ("SHIPAGENT_CARRIER_CLIENT_SECRET", Some("shh")),
//!         ("SHIPAGENT_CARRIER_ACCOUNT_NUMBER", Some("acct-9")),
//!     ],
//!     || {
//!         let creds = resolve_carrier_credentials().unwrap();
//!         assert_eq!(creds.source, TokenSource::Environment);
//!     },
//! );
//! ```

use std::env;
use std::fmt;

use anyhow::{Result, bail};

pub const CARRIER_CLIENT_ID_ENV: &str = "SHIPAGENT_CARRIER_CLIENT_ID";
pub const CARRIER_CLIENT_SECRET_ENV: &str = "SHIPAGENT_CARRIER_CLIENT_SECRET";
pub const CARRIER_ACCOUNT_NUMBER_ENV: &str = "SHIPAGENT_CARRIER_ACCOUNT_NUMBER";
pub const DATA_SOURCE_TOKEN_ENV: &str = "SHIPAGENT_DATA_SOURCE_TOKEN";
pub const FILTER_TOKEN_SECRET_ENV: &str = "SHIPAGENT_FILTER_TOKEN_SECRET";

/// A credential value that never prints itself.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted, {} bytes>)", self.0.len())
    }
}

/// Where a resolved credential came from. Currently always `Environment` —
/// kept as an enum, mirroring the teacher's `TokenSource`, so a future
/// source (e.g. an OS keychain) is an additive variant rather than a
/// breaking change to the return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
}

#[derive(Debug, Clone)]
pub struct CarrierCredentials {
    pub client_id: Secret,
    pub client_secret: Secret,
    pub account_number: Secret,
    pub source: TokenSource,
}

/// Resolves all three carrier credentials from environment variables.
/// Fails closed: any one missing is an `AuthError`-worthy failure for the
/// caller, not a partially-resolved struct.
pub fn resolve_carrier_credentials() -> Result<CarrierCredentials> {
    Ok(CarrierCredentials {
        client_id: required_env(CARRIER_CLIENT_ID_ENV)?,
        client_secret: required_env(CARRIER_CLIENT_SECRET_ENV)?,
        account_number: required_env(CARRIER_ACCOUNT_NUMBER_ENV)?,
        source: TokenSource::Environment,
    })
}

/// Data-source subprocess credential, if the adapter behind it needs one.
/// Unlike the carrier, a data source may legitimately need none (e.g. a
/// local CSV reader), so this returns `Option` rather than failing.
pub fn resolve_data_source_token() -> Option<Secret> {
    env::var(DATA_SOURCE_TOKEN_ENV).ok().map(Secret)
}

/// HMAC key for FilterSpec signing (§4.5, §6). Must be at least 32 bytes.
pub fn resolve_filter_token_secret() -> Result<Secret> {
    let secret = required_env(FILTER_TOKEN_SECRET_ENV)?;
    if secret.expose().len() < 32 {
        bail!(
            "{} must be at least 32 bytes, got {}",
            FILTER_TOKEN_SECRET_ENV,
            secret.expose().len()
        );
    }
    Ok(secret)
}

fn required_env(name: &str) -> Result<Secret> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(Secret(value)),
        _ => bail!("missing required environment variable {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_never_leaks_value() {
        let secret = Secret("super-sensitive".into());
        let debug = format!("{secret:?}");
        assert!(!debug.contains("super-sensitive"));
    }

    #[test]
    fn missing_any_carrier_var_fails_closed() {
        temp_env::with_vars_unset(
            [
                CARRIER_CLIENT_ID_ENV,
                CARRIER_CLIENT_SECRET_ENV,
                CARRIER_ACCOUNT_NUMBER_ENV,
            ],
            || {
                assert!(resolve_carrier_credentials().is_err());
            },
        );
    }

    #[test]
    fn resolves_all_three_when_present() {
        temp_env::with_vars(
            [
                (CARRIER_CLIENT_ID_ENV, Some("id")),
                (CARRIER_CLIENT_SECRET_ENV, Some("secret")),
                (CARRIER_ACCOUNT_NUMBER_ENV, Some("acct")),
            ],
            || {
                let creds = resolve_carrier_credentials().unwrap();
                assert_eq!(creds.client_id.expose(), "id");
                assert_eq!(creds.source, TokenSource::Environment);
            },
        );
    }

    #[test]
    fn filter_secret_rejects_short_keys() {
        temp_env::with_var(FILTER_TOKEN_SECRET_ENV, Some("too-short"), || {
            assert!(resolve_filter_token_secret().is_err());
        });
    }

    #[test]
    fn filter_secret_accepts_32_bytes() {
        temp_env::with_var(
            FILTER_TOKEN_SECRET_ENV,
            Some("a".repeat(32).as_str()),
            || {
                assert!(resolve_filter_token_secret().is_ok());
            },
        );
    }
}
