//! Job Coordinator (§4.7): drives a [`Job`] through its state machine.
//! Every non-terminal transition goes through
//! `StateStore::update_job_status` with an explicit from/to pair; this
//! crate never mutates a job's status column any other way.
//!
//! ```text
//!           created ──(preview)──▶ previewing ──(rows ok)──▶ previewed
//!              │                       │                        │
//!              │                       └──(error)──▶ failed     ├──(refine)──▶ created'
//!              │                                                ├──(approve)─▶ approved
//!              │                                                └──(cancel)──▶ cancelled
//!                                                    approved ──(execute)─▶ running
//!                                                     running ──┬──(all ok)──▶ completed
//!                                                               ├──(fail-fast trip)──▶ failed
//!                                                               ├──(cancel)──▶ cancelled
//!                                                               └──(crash, on restart)──▶ running (resume)
//! ```

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use shipagent_errors::{CarrierError, ShipAgentError};
use shipagent_events::{Event, EventBus, EventKind};
use shipagent_gateway::DataGateway;
use shipagent_store::{JobStatusUpdate, RowStatusUpdate, StateStore};
use shipagent_types::{FilterSpec, Job, JobStatus, RowStatus};
use uuid::Uuid;

pub struct Coordinator {
    store: Arc<Mutex<StateStore>>,
    bus: EventBus,
    gateway: Arc<DataGateway>,
    engine: shipagent_engine::BatchEngine,
}

impl Coordinator {
    pub fn new(
        store: Arc<Mutex<StateStore>>,
        bus: EventBus,
        gateway: Arc<DataGateway>,
        engine: shipagent_engine::BatchEngine,
    ) -> Self {
        Self {
            store,
            bus,
            gateway,
            engine,
        }
    }

    /// Initial state: a freshly submitted command, not yet previewed.
    #[tracing::instrument(skip(self, command_text, filter))]
    pub fn submit(
        &self,
        command_text: &str,
        service_code: &str,
        filter: Option<FilterSpec>,
    ) -> Result<Job, ShipAgentError> {
        let source_info = self.gateway.get_source_info()?;
        let job = Job {
            id: Uuid::new_v4(),
            command_text: command_text.to_string(),
            source_signature: source_info.signature,
            filter,
            service_code: service_code.to_string(),
            status: JobStatus::Created,
            total_rows: 0,
            succeeded_rows: 0,
            failed_rows: 0,
            skipped_rows: 0,
            cost_minor_units: 0,
            generation: 0,
            approval_token_hash: None,
            created_at: Utc::now(),
            approved_at: None,
            started_at: None,
            completed_at: None,
        };
        self.store.lock().unwrap().create_job(&job)?;
        self.bus.publish(Event::new(
            EventKind::JobStatus,
            job.id,
            None,
            serde_json::json!({ "status": "created" }),
        ));
        Ok(job)
    }

    /// `created -> previewing -> {previewed, failed}`.
    #[tracing::instrument(skip(self))]
    pub fn preview(&self, job_id: Uuid) -> Result<Job, ShipAgentError> {
        let job = self.store.lock().unwrap().get_job(job_id)?;
        let job = self.store.lock().unwrap().update_job_status(
            job.id,
            JobStatus::Created,
            JobStatus::Previewing,
            JobStatusUpdate::default(),
        )?;

        match self.engine.preview(&job) {
            Ok(summary) => {
                let job = self.store.lock().unwrap().update_job_status(
                    job.id,
                    JobStatus::Previewing,
                    JobStatus::Previewed,
                    JobStatusUpdate {
                        total_rows: Some(summary.total_rows),
                        ..Default::default()
                    },
                )?;
                self.bus.publish(Event::new(
                    EventKind::JobStatus,
                    job.id,
                    None,
                    serde_json::json!({ "status": "previewed" }),
                ));
                Ok(job)
            }
            Err(e) => {
                let job = self.store.lock().unwrap().update_job_status(
                    job.id,
                    JobStatus::Previewing,
                    JobStatus::Failed,
                    JobStatusUpdate {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.bus.publish(Event::new(
                    EventKind::JobFailed,
                    job.id,
                    None,
                    serde_json::json!({ "error": e.to_string() }),
                ));
                Err(e)
            }
        }
    }

    /// `previewed -> created'`: bumps the generation and discards the
    /// previous preview sample, so a refined filter re-materializes from
    /// scratch rather than merging with stale rated rows. The command text
    /// itself is immutable once a job exists; a genuinely new command is a
    /// new job via [`Coordinator::submit`].
    #[tracing::instrument(skip(self))]
    pub fn refine(&self, job_id: Uuid, filter: Option<FilterSpec>) -> Result<Job, ShipAgentError> {
        let job = self.store.lock().unwrap().get_job(job_id)?;
        self.store
            .lock()
            .unwrap()
            .update_job_status(
                job.id,
                JobStatus::Previewed,
                JobStatus::Created,
                JobStatusUpdate {
                    generation: Some(job.generation + 1),
                    total_rows: Some(0),
                    succeeded_rows: Some(0),
                    failed_rows: Some(0),
                    skipped_rows: Some(0),
                    cost_minor_units: Some(0),
                    filter,
                    ..Default::default()
                },
            )
            .map_err(Into::into)
    }

    /// `previewed -> approved`. Issues a single-use approval token; only
    /// its SHA-256 hash is persisted.
    #[tracing::instrument(skip(self))]
    pub fn approve(&self, job_id: Uuid) -> Result<(Job, String), ShipAgentError> {
        let token = generate_token();
        let hash = hash_token(&token);
        let job = self.store.lock().unwrap().update_job_status(
            job_id,
            JobStatus::Previewed,
            JobStatus::Approved,
            JobStatusUpdate {
                approval_token_hash: Some(hash),
                approved_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        self.bus.publish(Event::new(
            EventKind::JobStatus,
            job.id,
            None,
            serde_json::json!({ "status": "approved" }),
        ));
        Ok((job, token))
    }

    /// `approved -> running -> {completed, failed}`. Preconditions: job
    /// status is `approved`, the supplied token matches the stored hash
    /// (and is then consumed), the source signature has not drifted, and
    /// the generation is still current.
    #[tracing::instrument(skip(self, token))]
    pub fn execute(&self, job_id: Uuid, token: &str, fail_fast: bool) -> Result<Job, ShipAgentError> {
        let job = self.store.lock().unwrap().get_job(job_id)?;

        let expected_hash = job
            .approval_token_hash
            .as_deref()
            .ok_or(ShipAgentError::Auth(shipagent_errors::AuthError::MissingCredential(
                "approval_token".into(),
            )))?;
        if hash_token(token) != expected_hash {
            return Err(ShipAgentError::Auth(shipagent_errors::AuthError::CarrierUnauthorized));
        }

        self.gateway.assert_signature_unchanged(&job.source_signature)?;

        let job = self.store.lock().unwrap().update_job_status(
            job.id,
            JobStatus::Approved,
            JobStatus::Running,
            JobStatusUpdate {
                started_at: Some(Utc::now()),
                approval_token_hash: None,
                ..Default::default()
            },
        )?;
        self.bus.publish(Event::new(
            EventKind::JobStatus,
            job.id,
            None,
            serde_json::json!({ "status": "running" }),
        ));

        self.finish_run(job, fail_fast)
    }

    fn finish_run(&self, job: Job, fail_fast: bool) -> Result<Job, ShipAgentError> {
        let summary = self.engine.execute(&job, fail_fast)?;
        let to_status = if summary.failed_rows > 0 && fail_fast {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        let job = self.store.lock().unwrap().update_job_status(
            job.id,
            JobStatus::Running,
            to_status,
            JobStatusUpdate {
                completed_at: Some(Utc::now()),
                succeeded_rows: Some(summary.succeeded_rows),
                failed_rows: Some(summary.failed_rows),
                skipped_rows: Some(summary.skipped_rows),
                cost_minor_units: Some(summary.cost_minor_units),
                ..Default::default()
            },
        )?;
        self.bus.publish(Event::new(
            if to_status == JobStatus::Completed {
                EventKind::JobCompleted
            } else {
                EventKind::JobFailed
            },
            job.id,
            None,
            serde_json::json!({ "status": format!("{to_status:?}") }),
        ));
        Ok(job)
    }

    /// Cancels a job from any non-terminal state. In `running`, in-flight
    /// rows complete normally (the engine itself enforces no-new-dispatch);
    /// this only flips the job's own status once the engine call returns.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&self, job_id: Uuid) -> Result<Job, ShipAgentError> {
        let job = self.store.lock().unwrap().get_job(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let job = self.store.lock().unwrap().update_job_status(
            job.id,
            job.status,
            JobStatus::Cancelled,
            JobStatusUpdate {
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        self.bus.publish(Event::new(
            EventKind::JobStatus,
            job.id,
            None,
            serde_json::json!({ "status": "cancelled" }),
        ));
        Ok(job)
    }

    /// Crash recovery (§4.6): scans for jobs left in a non-terminal status
    /// at the previous process's exit and resumes or blocks each.
    #[tracing::instrument(skip(self))]
    pub fn recover(&self) -> Result<Vec<Job>, ShipAgentError> {
        let mut recovered = Vec::new();
        let running = self.store.lock().unwrap().list_jobs(Some(JobStatus::Running))?;
        for job in running {
            if self.gateway.assert_signature_unchanged(&job.source_signature).is_err() {
                tracing::warn!(job_id = %job.id, "refusing to auto-resume job with drifted source");
                continue;
            }
            self.fail_indeterminate_shipping_rows(job.id)?;
            recovered.push(self.finish_run(job, true)?);
        }

        let approved = self.store.lock().unwrap().list_jobs(Some(JobStatus::Approved))?;
        for job in approved {
            if job.total_rows == 0 {
                tracing::info!(job_id = %job.id, "re-materializing approved job with no rows");
                let _ = self.engine.preview(&job);
            }
        }
        Ok(recovered)
    }

    /// A row caught mid-dispatch by a crash has an unknown carrier outcome:
    /// the request may have reached the carrier before the process died.
    /// Resolves each to `failed` with [`CarrierError::FailedIndeterminate`]
    /// before the job's own run is resumed, so no row is left in
    /// `shipping` — a status [`BatchEngine::execute`] never dispatches from.
    fn fail_indeterminate_shipping_rows(&self, job_id: Uuid) -> Result<(), ShipAgentError> {
        let stranded = self.store.lock().unwrap().iter_rows(job_id, Some(RowStatus::Shipping))?;
        for row in stranded {
            let error = ShipAgentError::Carrier(CarrierError::FailedIndeterminate);
            let mut store = self.store.lock().unwrap();
            store.transition_row(
                job_id,
                row.row_number,
                RowStatus::Shipping,
                RowStatus::Failed,
                RowStatusUpdate {
                    error: Some(error.to_record(None)),
                    ..Default::default()
                },
            )?;
            drop(store);
            tracing::warn!(job_id = %job_id, row_number = row.row_number, "row stranded in shipping at crash, marked failed-indeterminate");
            self.bus.publish(Event::new(
                EventKind::RowFailed,
                job_id,
                Some(row.row_number),
                serde_json::json!({ "error": error.to_string() }),
            ));
        }
        Ok(())
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipagent_auth::Secret;
    use shipagent_carrier::CarrierClient;
    use shipagent_config::Config;
    use shipagent_engine::BatchEngine;
    use shipagent_process::Subprocess;
    use shipagent_store::StateStore;
    use shipagent_types::{JobRow, ShipperProfile};

    fn test_coordinator(store: Arc<Mutex<StateStore>>) -> Coordinator {
        let bus = EventBus::new(8);
        let data_source = Arc::new(Subprocess::spawn("test-source", "cat", &[], &[]).unwrap());
        let gateway = Arc::new(DataGateway::new(data_source, Secret::from("test-secret-test-secret-test-sec".to_string())));
        let carrier_sub = Arc::new(Subprocess::spawn("test-carrier", "cat", &[], &[]).unwrap());
        let profile = ShipperProfile {
            account_number: "acct".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            base_url: "https://carrier.invalid".into(),
        };
        let carrier = Arc::new(CarrierClient::new(carrier_sub, profile));
        let engine = BatchEngine::new(store.clone(), bus.clone(), carrier, gateway.clone(), Config::new());
        Coordinator::new(store, bus, gateway, engine)
    }

    fn sample_row(job_id: Uuid, row_number: u32, status: RowStatus) -> JobRow {
        JobRow {
            job_id,
            row_number,
            checksum: "c".into(),
            order_record: serde_json::json!({}),
            payload_snapshot: None,
            status,
            rated_cost: None,
            tracking_number: None,
            label_ref: None,
            error: None,
            attempt: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn recover_fails_rows_stranded_in_shipping() {
        let store = Arc::new(Mutex::new(StateStore::open_in_memory().unwrap()));
        let coordinator = test_coordinator(store.clone());
        let job_id = Uuid::new_v4();

        let row = sample_row(job_id, 1, RowStatus::Pending);
        store.lock().unwrap().insert_rows(job_id, std::slice::from_ref(&row)).unwrap();
        store
            .lock()
            .unwrap()
            .transition_row(job_id, 1, RowStatus::Pending, RowStatus::Shipping, RowStatusUpdate::default())
            .unwrap();

        coordinator.fail_indeterminate_shipping_rows(job_id).unwrap();

        let failed = store.lock().unwrap().iter_rows(job_id, Some(RowStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].row_number, 1);
        assert!(failed[0].error.is_some());

        let still_shipping = store.lock().unwrap().iter_rows(job_id, Some(RowStatus::Shipping)).unwrap();
        assert!(still_shipping.is_empty());
    }

    #[test]
    fn token_hash_is_deterministic() {
        let token = "abc";
        assert_eq!(hash_token(token), hash_token(token));
    }

    #[test]
    fn different_tokens_hash_differently() {
        assert_ne!(hash_token("abc"), hash_token("xyz"));
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
