//! # ShipAgent Core
//!
//! The facade library behind the `shipagent` CLI: wires configuration,
//! credential resolution, the runtime lock, the state store, the two
//! subprocess services, the carrier client, the data gateway, the batch
//! engine, and the job coordinator into one handle.
//!
//! ## Pipeline
//!
//! 1. [`ShipAgent::open`] acquires the runtime lock, loads config, resolves
//!    credentials, opens the state store, and spawns the carrier and
//!    data-source subprocesses.
//! 2. [`ShipAgent::coordinator`] exposes the job state machine: `submit`,
//!    `preview`, `approve`, `execute`, `cancel`, `refine`.
//! 3. [`ShipAgent::subscribe`] hands out an Event Bus subscriber for a
//!    CLI or REST layer to tail.
//!
//! ## Modules
//!
//! - [`shipagent_config`] — `.shipagent.toml` loading and merging
//! - [`shipagent_auth`] — carrier/data-source credential resolution
//! - [`shipagent_lock`] — single-writer runtime lock
//! - [`shipagent_store`] — durable job/row/audit persistence
//! - [`shipagent_process`] — subprocess supervisor
//! - [`shipagent_carrier`] — carrier client
//! - [`shipagent_gateway`] — data gateway
//! - [`shipagent_engine`] — batch engine
//! - [`shipagent_coordinator`] — job coordinator state machine

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use shipagent_auth::Secret;
use shipagent_carrier::CarrierClient;
use shipagent_config::Config;
use shipagent_coordinator::Coordinator;
use shipagent_engine::BatchEngine;
use shipagent_events::{EventBus, Subscriber};
use shipagent_gateway::DataGateway;
use shipagent_lock::LockFile;
use shipagent_process::Subprocess;
use shipagent_store::StateStore;
use shipagent_types::{FilterSpec, ShipperProfile};

pub use shipagent_auth as auth;
pub use shipagent_carrier as carrier;
pub use shipagent_config as config;
pub use shipagent_coordinator as coordinator;
pub use shipagent_engine as engine;
pub use shipagent_errors as errors;
pub use shipagent_events as events;
pub use shipagent_filter as filter;
pub use shipagent_gateway as gateway;
pub use shipagent_store as store;
pub use shipagent_types as types;

const EVENT_BUS_DEFAULT_CAPACITY: usize = 256;

/// Everything the CLI (or any other front-end) needs to drive ShipAgent
/// from a single state directory. `_lock` is held for the lifetime of this
/// handle and released on drop.
pub struct ShipAgent {
    _lock: LockFile,
    config: Config,
    bus: EventBus,
    coordinator: Coordinator,
    gateway: Arc<DataGateway>,
    filter_secret: Secret,
}

/// Paths and process configuration needed to stand up the two external
/// services. The carrier and data-source programs are arbitrary
/// executables speaking the framed-JSON protocol (§4.10); this struct only
/// carries how to launch them.
pub struct LaunchSpec {
    pub carrier_program: String,
    pub carrier_args: Vec<String>,
    pub data_source_program: String,
    pub data_source_args: Vec<String>,
}

impl ShipAgent {
    /// Acquires the runtime lock, loads configuration, resolves
    /// credentials, opens the state store, and spawns both subprocess
    /// services. Fails closed: any missing credential or unreachable
    /// subprocess aborts startup rather than degrading partially.
    pub fn open(state_dir: &Path, config_dir: &Path, launch: LaunchSpec) -> Result<Self> {
        let lock = LockFile::acquire(state_dir).context("acquiring runtime lock")?;
        let config = shipagent_config::load_config(config_dir).context("loading config")?;

        let carrier_creds =
            shipagent_auth::resolve_carrier_credentials().context("resolving carrier credentials")?;
        let filter_secret =
            shipagent_auth::resolve_filter_token_secret().context("resolving filter signing secret")?;
        let profile = ShipperProfile {
            account_number: carrier_creds.account_number.expose().to_string(),
            client_id: carrier_creds.client_id.expose().to_string(),
            client_secret: carrier_creds.client_secret.expose().to_string(),
            base_url: config
                .carrier
                .base_url
                .clone()
                .unwrap_or_else(|| "https://carrier.invalid".to_string()),
        };

        let store_path = state_dir.join("shipagent.db");
        let store = Arc::new(Mutex::new(
            StateStore::open(&store_path).context("opening state store")?,
        ));
        let bus = EventBus::new(EVENT_BUS_DEFAULT_CAPACITY);

        let carrier_env = vec![
            ("SHIPAGENT_CARRIER_CLIENT_ID".to_string(), profile.client_id.clone()),
            (
                "SHIPAGENT_CARRIER_CLIENT_SECRET".to_string(),
                profile.client_secret.clone(),
            ),
        ];
        let carrier_subprocess = Subprocess::spawn(
            "carrier",
            &launch.carrier_program,
            &launch.carrier_args.iter().map(String::as_str).collect::<Vec<_>>(),
            &carrier_env,
        )
        .context("spawning carrier subprocess")?;

        let data_source_env = shipagent_auth::resolve_data_source_token()
            .map(|token| vec![("SHIPAGENT_DATA_SOURCE_TOKEN".to_string(), token.expose().to_string())])
            .unwrap_or_default();
        let data_source_subprocess = Subprocess::spawn(
            "data-source",
            &launch.data_source_program,
            &launch
                .data_source_args
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>(),
            &data_source_env,
        )
        .context("spawning data-source subprocess")?;

        let carrier_client = Arc::new(CarrierClient::new(carrier_subprocess, profile));
        let gateway = Arc::new(DataGateway::new(data_source_subprocess, filter_secret.clone()));

        let engine = BatchEngine::new(
            store.clone(),
            bus.clone(),
            carrier_client,
            gateway.clone(),
            config.clone(),
        );
        let coordinator = Coordinator::new(store, bus.clone(), gateway.clone(), engine);

        Ok(Self {
            _lock: lock,
            config,
            bus,
            coordinator,
            gateway,
            filter_secret,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    /// Validates `where_sql` against the live source schema and signs it
    /// with the process filter secret, producing a [`FilterSpec`] that
    /// [`Coordinator::submit`]/[`Coordinator::refine`] will accept. A
    /// front-end must go through this rather than constructing a
    /// `FilterSpec` by hand — only this facade holds the signing secret.
    pub fn compile_filter(&self, where_sql: &str, summary: &str) -> Result<FilterSpec> {
        let schema = self.gateway.get_schema().context("fetching source schema")?;
        let canonical =
            shipagent_filter::validate(where_sql, &schema).context("validating filter")?;
        let source_info = self.gateway.get_source_info().context("fetching source info")?;
        Ok(shipagent_filter::sign(
            &source_info.signature,
            &canonical,
            summary,
            self.filter_secret.expose().as_bytes(),
        ))
    }
}

/// `SHIPAGENT_STATE_DIR` if set, else `./.shipagent`.
pub fn default_state_dir() -> PathBuf {
    std::env::var_os("SHIPAGENT_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".shipagent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_dir_respects_env_override() {
        temp_env::with_var("SHIPAGENT_STATE_DIR", Some("/tmp/custom-dir"), || {
            assert_eq!(default_state_dir(), PathBuf::from("/tmp/custom-dir"));
        });
    }

    #[test]
    fn default_state_dir_falls_back_when_unset() {
        temp_env::with_var("SHIPAGENT_STATE_DIR", None::<&str>, || {
            assert_eq!(default_state_dir(), PathBuf::from(".shipagent"));
        });
    }
}
