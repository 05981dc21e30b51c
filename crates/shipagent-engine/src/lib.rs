//! Batch Engine (§4.6): the concurrent heart of the system. Preview mode
//! rates every sampled row; execute mode ships them. Both modes dispatch
//! row work under a bounded counting semaphore so at most
//! `batch.concurrency` carrier calls are ever in flight at once.
//!
//! The semaphore here is a genuine per-task slot: a permit is acquired
//! immediately before a row's carrier call and released the instant that
//! row's own work finishes, not a chunk-wait-then-join-the-whole-chunk
//! pattern. Built on `std::sync::{Mutex, Condvar}` in the same
//! no-async-runtime idiom used throughout this tree.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use chrono::Utc;
use shipagent_carrier::CarrierClient;
use shipagent_config::{Config, WarningRowsPolicy};
use shipagent_errors::ShipAgentError;
use shipagent_events::{Event, EventBus, EventKind};
use shipagent_gateway::DataGateway;
use shipagent_payload::OrderRecord;
use shipagent_store::{RowStatusUpdate, StateStore};
use shipagent_types::{content_checksum, Job, JobRow, RowStatus};
use uuid::Uuid;

/// A true counting semaphore: `acquire()` blocks until a permit is free,
/// `release()` (via the returned guard's `Drop`) always returns it even on
/// panic unwind through a dispatched thread.
pub struct Semaphore {
    state: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(permits),
            condvar: Condvar::new(),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> SemaphoreGuard {
        let mut count = self.state.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
        SemaphoreGuard { sem: self.clone() }
    }
}

pub struct SemaphoreGuard {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let mut count = self.sem.state.lock().unwrap();
        *count += 1;
        self.sem.condvar.notify_one();
    }
}

/// Errors a row's carrier call can fail with that are safe to skip past in
/// fail-fast mode — address-level validation problems rather than a
/// systemic carrier or infrastructure failure.
fn is_skip_safe(error: &ShipAgentError) -> bool {
    matches!(
        error,
        ShipAgentError::Validation(_)
    )
}

pub struct BatchEngine {
    store: Arc<Mutex<StateStore>>,
    bus: EventBus,
    carrier: Arc<CarrierClient>,
    gateway: Arc<DataGateway>,
    config: Config,
}

/// Summary returned after a preview or execute run completes or halts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub total_rows: u32,
    pub succeeded_rows: u32,
    pub failed_rows: u32,
    pub skipped_rows: u32,
    pub cost_minor_units: i64,
}

impl BatchEngine {
    pub fn new(
        store: Arc<Mutex<StateStore>>,
        bus: EventBus,
        carrier: Arc<CarrierClient>,
        gateway: Arc<DataGateway>,
        config: Config,
    ) -> Self {
        Self {
            store,
            bus,
            carrier,
            gateway,
            config,
        }
    }

    /// Preview mode (§4.6): materialize rows from the gateway, cap the
    /// rated sample at `preview-max-rows`, rate each sampled row under the
    /// concurrency semaphore, and emit a preview-ready event.
    #[tracing::instrument(skip(self, job))]
    pub fn preview(&self, job: &Job) -> Result<RunSummary, ShipAgentError> {
        let source_rows = self.gateway.query_rows(job.filter.as_ref())?;

        let rows: Vec<JobRow> = source_rows
            .iter()
            .map(|sr| JobRow {
                job_id: job.id,
                row_number: sr.row_number,
                checksum: content_checksum(&sr.record),
                order_record: sr.record.clone(),
                payload_snapshot: None,
                status: RowStatus::Pending,
                rated_cost: None,
                tracking_number: None,
                label_ref: None,
                error: None,
                attempt: 0,
                updated_at: Utc::now(),
            })
            .collect();

        {
            let mut store = self.store.lock().unwrap();
            store.insert_rows(job.id, &rows)?;
        }

        let preview_max = self.config.preview_max_rows();
        let sample: Vec<&JobRow> = if preview_max == 0 {
            rows.iter().collect()
        } else {
            rows.iter().take(preview_max).collect()
        };

        let semaphore = Semaphore::new(self.config.batch_concurrency().max(1));
        let results: Vec<(u32, Result<i64, ShipAgentError>)> = thread::scope(|scope| {
            let handles: Vec<_> = sample
                .iter()
                .map(|row| {
                    let permit = semaphore.acquire();
                    let carrier = self.carrier.clone();
                    let store = self.store.clone();
                    let bus = self.bus.clone();
                    let job_id = job.id;
                    let service_code = job.service_code.clone();
                    let row_number = row.row_number;
                    let order_record = row.order_record.clone();
                    let policy = self.config.warning_rows_policy();
                    scope.spawn(move || {
                        let _permit = permit;
                        let outcome = rate_row(&carrier, &order_record, &service_code);
                        apply_preview_outcome(&store, &bus, job_id, row_number, &outcome, policy);
                        (row_number, outcome)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut cost_minor_units = 0i64;
        let mut failed = 0u32;
        for (_, outcome) in &results {
            match outcome {
                Ok(cost) => cost_minor_units += cost,
                Err(_) => failed += 1,
            }
        }

        self.bus.publish(Event::new(
            EventKind::PreviewReady,
            job.id,
            None,
            serde_json::json!({
                "sampled": results.len(),
                "cost_minor_units": cost_minor_units,
                "warnings": failed,
            }),
        ));

        Ok(RunSummary {
            total_rows: rows.len() as u32,
            succeeded_rows: (results.len() as u32).saturating_sub(failed),
            failed_rows: failed,
            skipped_rows: 0,
            cost_minor_units,
        })
    }

    /// Execute mode (§4.6): preconditions are checked by the coordinator
    /// before this is called. Dispatches every `pending`/`rated` row under
    /// the semaphore; fail-fast mode stops new dispatches on the first
    /// non-skip-safe failure and marks the remainder `skipped`.
    #[tracing::instrument(skip(self, job))]
    pub fn execute(&self, job: &Job, fail_fast: bool) -> Result<RunSummary, ShipAgentError> {
        let dispatchable = {
            let store = self.store.lock().unwrap();
            let mut rows = store.iter_rows(job.id, Some(RowStatus::Pending))?;
            rows.extend(store.iter_rows(job.id, Some(RowStatus::Rated))?);
            rows.sort_by_key(|r| r.row_number);
            rows
        };

        let tripped = Arc::new(Mutex::new(false));
        let semaphore = Semaphore::new(self.config.batch_concurrency().max(1));

        let results: Vec<(u32, Result<(), ShipAgentError>)> = thread::scope(|scope| {
            let mut handles = Vec::new();
            for row in &dispatchable {
                if fail_fast && *tripped.lock().unwrap() {
                    break;
                }
                let permit = semaphore.acquire();
                let carrier = self.carrier.clone();
                let store = self.store.clone();
                let bus = self.bus.clone();
                let tripped = tripped.clone();
                let job_id = job.id;
                let generation = job.generation;
                let service_code = job.service_code.clone();
                let row_number = row.row_number;
                let from_status = row.status;
                let order_record = row.order_record.clone();
                handles.push(scope.spawn(move || {
                    let _permit = permit;
                    let outcome = ship_row(
                        &store,
                        &bus,
                        &carrier,
                        job_id,
                        row_number,
                        from_status,
                        &order_record,
                        &service_code,
                        generation,
                    );
                    if let Err(e) = &outcome {
                        if fail_fast && !is_skip_safe(e) {
                            *tripped.lock().unwrap() = true;
                        }
                    }
                    (row_number, outcome)
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let dispatched_numbers: std::collections::HashSet<u32> =
            results.iter().map(|(n, _)| *n).collect();
        let skipped_rows: Vec<&JobRow> = dispatchable
            .iter()
            .filter(|r| !dispatched_numbers.contains(&r.row_number))
            .collect();
        {
            let mut store = self.store.lock().unwrap();
            for row in &skipped_rows {
                let _ = store.transition_row(
                    job.id,
                    row.row_number,
                    row.status,
                    RowStatus::Skipped,
                    RowStatusUpdate::default(),
                );
                self.bus.publish(Event::new(
                    EventKind::RowSkipped,
                    job.id,
                    Some(row.row_number),
                    serde_json::json!({}),
                ));
            }
        }

        let mut succeeded = 0u32;
        let mut failed = 0u32;
        let mut cost_minor_units = 0i64;
        for (row_number, outcome) in &results {
            match outcome {
                Ok(()) => succeeded += 1,
                Err(_) => failed += 1,
            }
            let _ = row_number;
        }
        if let Ok(store) = self.store.lock() {
            for row in store.iter_rows(job.id, Some(RowStatus::Shipped))? {
                cost_minor_units += row.rated_cost.unwrap_or(0);
            }
        }

        Ok(RunSummary {
            total_rows: dispatchable.len() as u32,
            succeeded_rows: succeeded,
            failed_rows: failed,
            skipped_rows: skipped_rows.len() as u32,
            cost_minor_units,
        })
    }
}

fn rate_row(
    carrier: &CarrierClient,
    record: &serde_json::Value,
    service_code: &str,
) -> Result<i64, ShipAgentError> {
    let order = order_from_record(record)?;
    let quote = carrier.get_rate(&order, service_code)?;
    Ok(quote.total_minor_units)
}

/// Applies a rating outcome to a row's state. A skip-safe (validation)
/// rating failure is a *warning*, not a hard failure, and `policy` decides
/// what happens to it: `skip`/`ask` leave the row `failed` and out of the
/// execute dispatch set (an `ask` confirmation channel is not wired up
/// yet — see DESIGN.md), while `process` rates the row anyway so it still
/// ships.
fn apply_preview_outcome(
    store: &Arc<Mutex<StateStore>>,
    bus: &EventBus,
    job_id: Uuid,
    row_number: u32,
    outcome: &Result<i64, ShipAgentError>,
    policy: WarningRowsPolicy,
) {
    let mut store = store.lock().unwrap();
    match outcome {
        Ok(cost) => {
            let fields = RowStatusUpdate {
                rated_cost: Some(*cost),
                ..Default::default()
            };
            let _ = store.transition_row(job_id, row_number, RowStatus::Pending, RowStatus::Rated, fields);
            bus.publish(Event::new(
                EventKind::RowRated,
                job_id,
                Some(row_number),
                serde_json::json!({ "cost_minor_units": cost }),
            ));
        }
        Err(e) if is_skip_safe(e) && matches!(policy, WarningRowsPolicy::Process) => {
            let fields = RowStatusUpdate {
                rated_cost: Some(0),
                error: Some(e.to_record(None)),
                ..Default::default()
            };
            let _ = store.transition_row(job_id, row_number, RowStatus::Pending, RowStatus::Rated, fields);
            bus.publish(Event::new(
                EventKind::RowRated,
                job_id,
                Some(row_number),
                serde_json::json!({ "warning": e.to_string() }),
            ));
        }
        Err(e) => {
            let fields = RowStatusUpdate {
                error: Some(e.to_record(None)),
                ..Default::default()
            };
            let _ = store.transition_row(job_id, row_number, RowStatus::Pending, RowStatus::Failed, fields);
            bus.publish(Event::new(
                EventKind::RowFailed,
                job_id,
                Some(row_number),
                serde_json::json!({ "error": e.to_string() }),
            ));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ship_row(
    store: &Arc<Mutex<StateStore>>,
    bus: &EventBus,
    carrier: &CarrierClient,
    job_id: Uuid,
    row_number: u32,
    from_status: RowStatus,
    record: &serde_json::Value,
    service_code: &str,
    generation: u32,
) -> Result<(), ShipAgentError> {
    bus.publish(Event::new(
        EventKind::RowStart,
        job_id,
        Some(row_number),
        serde_json::json!({}),
    ));

    {
        let mut store = store.lock().unwrap();
        let fields = RowStatusUpdate {
            bump_attempt: true,
            ..Default::default()
        };
        store.transition_row(job_id, row_number, from_status, RowStatus::Shipping, fields)?;
    }

    let order = order_from_record(record)?;
    let idempotency_key = format!("{job_id}:{row_number}:{generation}");
    let outcome = carrier.create_shipment(&order, service_code, &idempotency_key);

    let mut store_guard = store.lock().unwrap();
    match outcome {
        Ok(result) => {
            let fields = RowStatusUpdate {
                tracking_number: result.tracking_numbers.first().cloned(),
                label_ref: result.label_data.first().cloned(),
                rated_cost: Some(result.total_minor_units),
                payload_snapshot: Some(result.request_body.clone()),
                ..Default::default()
            };
            store_guard.transition_row(job_id, row_number, RowStatus::Shipping, RowStatus::Shipped, fields)?;
            drop(store_guard);
            bus.publish(Event::new(
                EventKind::RowShipped,
                job_id,
                Some(row_number),
                serde_json::json!({ "tracking_number": result.tracking_numbers.first() }),
            ));
            Ok(())
        }
        Err(e) => {
            let fields = RowStatusUpdate {
                error: Some(e.to_record(None)),
                ..Default::default()
            };
            let _ = store_guard.transition_row(job_id, row_number, RowStatus::Shipping, RowStatus::Failed, fields);
            drop(store_guard);
            bus.publish(Event::new(
                EventKind::RowFailed,
                job_id,
                Some(row_number),
                serde_json::json!({ "error": e.to_string() }),
            ));
            Err(e)
        }
    }
}

fn order_from_record(record: &serde_json::Value) -> Result<OrderRecord, ShipAgentError> {
    serde_json::from_value::<RawOrder>(record.clone())
        .map(Into::into)
        .map_err(|e| {
            ShipAgentError::Data(shipagent_errors::DataError::SchemaMismatch {
                column: "<row>".into(),
                expected: "order record".into(),
                found: e.to_string(),
            })
        })
}

#[derive(serde::Deserialize)]
struct RawOrder {
    weight_grams: f64,
    length_cm: f64,
    width_cm: f64,
    height_cm: f64,
    destination_country: String,
    destination_zip: String,
    reference_number: String,
    hs_code: Option<String>,
}

impl From<RawOrder> for OrderRecord {
    fn from(raw: RawOrder) -> Self {
        OrderRecord {
            weight_grams: raw.weight_grams,
            length_cm: raw.length_cm,
            width_cm: raw.width_cm,
            height_cm: raw.height_cm,
            destination_country: raw.destination_country,
            destination_zip: raw.destination_zip,
            reference_number: raw.reference_number,
            hs_code: raw.hs_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn semaphore_limits_concurrent_holders() {
        let sem = Semaphore::new(2);
        let _a = sem.acquire();
        let _b = sem.acquire();
        let sem2 = sem.clone();
        let acquired = Arc::new(Mutex::new(false));
        let acquired2 = acquired.clone();
        let handle = thread::spawn(move || {
            let _c = sem2.acquire();
            *acquired2.lock().unwrap() = true;
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!*acquired.lock().unwrap());
        drop(_a);
        handle.join().unwrap();
        assert!(*acquired.lock().unwrap());
    }

    #[test]
    fn semaphore_releases_on_guard_drop() {
        let sem = Semaphore::new(1);
        {
            let _permit = sem.acquire();
        }
        let _permit2 = sem.acquire();
    }

    #[test]
    fn process_policy_rates_a_skip_safe_warning_instead_of_failing_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(StateStore::open(dir.path().join("t.db")).unwrap()));
        let job_id = Uuid::new_v4();
        let row = JobRow {
            job_id,
            row_number: 1,
            checksum: "c".into(),
            order_record: serde_json::json!({}),
            payload_snapshot: None,
            status: RowStatus::Pending,
            rated_cost: None,
            tracking_number: None,
            label_ref: None,
            error: None,
            attempt: 0,
            updated_at: Utc::now(),
        };
        store.lock().unwrap().insert_rows(job_id, std::slice::from_ref(&row)).unwrap();

        let bus = EventBus::new(8);
        let err = ShipAgentError::Validation(shipagent_errors::ValidationError::MissingHsCode);
        apply_preview_outcome(&store, &bus, job_id, 1, &Err(err), WarningRowsPolicy::Process);

        let stored = store
            .lock()
            .unwrap()
            .iter_rows(job_id, Some(RowStatus::Rated))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rated_cost, Some(0));
    }

    #[test]
    fn is_skip_safe_classifies_validation_errors() {
        let err = ShipAgentError::Validation(shipagent_errors::ValidationError::MissingHsCode);
        assert!(is_skip_safe(&err));
        let err = ShipAgentError::System(shipagent_errors::SystemError::Transport("x".into()));
        assert!(!is_skip_safe(&err));
    }

    #[test]
    fn order_from_record_parses_canonical_shape() {
        let record = serde_json::json!({
            "weight_grams": 907.0,
            "length_cm": 10.0,
            "width_cm": 10.0,
            "height_cm": 10.0,
            "destination_country": "US",
            "destination_zip": "94105",
            "reference_number": "ORDER-1",
            "hs_code": null,
        });
        let order = order_from_record(&record).unwrap();
        assert_eq!(order.destination_country, "US");
    }
}
