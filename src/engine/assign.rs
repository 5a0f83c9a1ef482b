use std::collections::BTreeMap;
use std::time::Instant;

use crate::model::*;
use crate::observability::{
    ASSIGN_ABORTS_TOTAL, ASSIGN_DURATION_SECONDS, ASSIGN_RETRIES_TOTAL, ASSIGNMENTS_TOTAL,
    LOCK_WAIT_SECONDS,
};
use crate::store::SlotTransaction;

use super::overlap::resolve_by_manager;
use super::validate::validate_request;
use super::{Engine, EngineError};

/// How far a single assignment attempt got before it committed or aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignPhase {
    Started,
    Locked,
    Validated,
    CandidateSelected,
    Committed,
}

impl AssignPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignPhase::Started => "started",
            AssignPhase::Locked => "locked",
            AssignPhase::Validated => "validated",
            AssignPhase::CandidateSelected => "candidate_selected",
            AssignPhase::Committed => "committed",
        }
    }
}

/// First slot starting exactly at `desired_start`, scanning managers in
/// ascending id. The lowest manager id wins ties.
pub fn select_candidate(valid: &BTreeMap<ManagerId, Vec<Slot>>, desired_start: Ms) -> Option<Slot> {
    valid
        .values()
        .find_map(|slots| slots.iter().find(|s| s.start() == desired_start).copied())
}

impl Engine {
    /// Book one slot for `request` and return the new booking id.
    ///
    /// Transient store failures are retried in a fresh transaction, up to
    /// `max_attempts` in total. NotFound and Conflict are returned at once.
    pub async fn assign(&self, request: &BookingRequest) -> Result<BookingId, EngineError> {
        validate_request(request)?;
        let started = Instant::now();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;

        let result = loop {
            match self.assign_once(request).await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!(attempt, error = %e, "assignment hit a transient failure, retrying");
                    metrics::counter!(ASSIGN_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(ASSIGNMENTS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(ASSIGN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    /// One transaction: lock, resolve, select, write, then commit or roll back.
    async fn assign_once(&self, request: &BookingRequest) -> Result<BookingId, EngineError> {
        let mut phase = AssignPhase::Started;
        let mut tx = self.store.begin().await?;

        let protocol = run_protocol(tx.as_mut(), request, &mut phase).await;
        let result = match protocol {
            Ok(booking_id) => match tx.commit().await {
                Ok(()) => {
                    phase = AssignPhase::Committed;
                    Ok(booking_id)
                }
                Err(e) => Err(EngineError::from(e)),
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("rollback failed: {rollback_err}");
                }
                Err(e)
            }
        };

        match &result {
            Ok(booking_id) => tracing::info!(
                booking_id,
                phase = phase.as_str(),
                customer_id = request.customer_id,
                start = %format_instant(request.desired_start),
                "booking assigned"
            ),
            Err(e) => {
                tracing::info!(phase = phase.as_str(), error = %e, "assignment aborted");
                metrics::counter!(ASSIGN_ABORTS_TOTAL, "phase" => phase.as_str()).increment(1);
            }
        }
        result
    }
}

async fn run_protocol(
    tx: &mut dyn SlotTransaction,
    request: &BookingRequest,
    phase: &mut AssignPhase,
) -> Result<BookingId, EngineError> {
    let lock_start = Instant::now();
    let rows = tx.query_for_update(&request.criteria).await?;
    metrics::histogram!(LOCK_WAIT_SECONDS).record(lock_start.elapsed().as_secs_f64());
    *phase = AssignPhase::Locked;
    if rows.is_empty() {
        return Err(EngineError::NotFound);
    }

    let valid = resolve_by_manager(&rows);
    *phase = AssignPhase::Validated;

    let candidate = select_candidate(&valid, request.desired_start).ok_or(EngineError::Conflict {
        desired_start: request.desired_start,
    })?;
    *phase = AssignPhase::CandidateSelected;

    tx.mark_booked(candidate.id).await?;
    let booking_id = tx
        .insert_booking(&NewBooking::for_slot(&candidate, request.customer_id))
        .await?;
    tx.increment_load(candidate.manager_id).await?;
    Ok(booking_id)
}
