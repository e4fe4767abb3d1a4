//! Voiding & reversal engine.
//!
//! The only writer of the `Voided` and `Stopped` states. A void reverses
//! advance deductions and batch-item status inside one transaction, so a
//! partial reversal is never observable. Bulk voiding processes each entity
//! in its own transaction and reports per-entity results instead of aborting
//! the run.

use crate::engine::advances;
use crate::error::PayError;
use crate::models::{
    AuditEvent, AuditKind, BatchStatus, Instrument, InstrumentKind, ItemStatus, LifecycleState,
    OpContext,
};
use crate::store::{PaymentStore, StoreTx};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Command to void one instrument. The reversal path is resolved from the
/// instrument's stored kind, so mixed-kind bulk selections need no caller-side
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidRequest {
    pub instrument_id: String,
    pub reason: String,
    /// Re-credit every advance this instrument's distribution netted.
    pub reverse_deductions: bool,
    /// Revert covered batch items to `Pending` so the grower becomes eligible
    /// for a future distribution.
    pub restore_batch_status: bool,
}

/// Per-entity outcome. Bulk callers receive one of these per request; a
/// failure is data here, never a propagated error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidResult {
    pub instrument_id: String,
    pub success: bool,
    pub message: String,
}

/// Aggregate outcome of a bulk void.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidOutcome {
    pub results: Vec<VoidResult>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Apply one void inside the caller's transaction. Any error rolls the whole
/// void back with it.
pub fn apply_void(
    tx: &StoreTx<'_>,
    req: &VoidRequest,
    ctx: &OpContext,
) -> Result<Instrument, PayError> {
    let mut inst = tx
        .get_instrument(&req.instrument_id)?
        .ok_or_else(|| PayError::not_found("instrument", &req.instrument_id))?;

    if !inst.status.allows_void() {
        return Err(PayError::invalid_state(
            "instrument",
            &req.instrument_id,
            inst.status.as_str(),
            "void",
        ));
    }

    match inst.kind {
        InstrumentKind::Regular | InstrumentKind::Consolidated => {
            if req.reverse_deductions {
                let restored =
                    advances::reverse_instrument_deductions(tx, &inst.id, ctx)?;
                if !restored.is_empty() {
                    tx.insert_audit(&AuditEvent {
                        id: Uuid::new_v4().to_string(),
                        ts: ctx.ts(),
                        actor: ctx.actor.clone(),
                        instrument_id: Some(inst.id.clone()),
                        event: AuditKind::AdvanceReversed,
                        detail: format!("advances restored: {}", restored.join(",")),
                    })?;
                }
            }

            let item_id = inst
                .item_id
                .clone()
                .ok_or_else(|| PayError::not_found("distribution item for", &inst.id))?;
            let item = tx
                .get_distribution_item(&item_id)?
                .ok_or_else(|| PayError::not_found("distribution item", &item_id))?;

            if req.restore_batch_status {
                for batch_item in
                    tx.items_for_grower_in_batches(inst.grower_no, &item.sources)?
                {
                    if batch_item.status == ItemStatus::Completed {
                        tx.set_batch_item_status(&batch_item.id, ItemStatus::Pending)?;
                    }
                }
                for batch_id in &item.sources {
                    if !tx.batch_has_completed_items(batch_id)? {
                        tx.set_batch_status(batch_id, BatchStatus::Open)?;
                    }
                }
            }

            tx.set_distribution_state(&item_id, LifecycleState::Voided)?;
        }
        InstrumentKind::Advance => {
            let advance_id = inst
                .advance_id
                .clone()
                .ok_or_else(|| PayError::not_found("advance for", &inst.id))?;
            advances::void_advance(tx, &advance_id, ctx)?;
        }
    }

    inst.status = LifecycleState::Voided;
    inst.voided_at = Some(ctx.ts());
    inst.voided_by = Some(ctx.actor.clone());
    inst.void_reason = Some(req.reason.clone());
    tx.update_instrument(&inst)?;

    tx.insert_audit(&AuditEvent {
        id: Uuid::new_v4().to_string(),
        ts: ctx.ts(),
        actor: ctx.actor.clone(),
        instrument_id: Some(inst.id.clone()),
        event: AuditKind::Voided,
        detail: req.reason.clone(),
    })?;

    Ok(inst)
}

/// Block payment on a printed cheque without reversing advance netting or
/// batch state. Terminal.
pub fn apply_stop_payment(
    tx: &StoreTx<'_>,
    instrument_id: &str,
    ctx: &OpContext,
) -> Result<Instrument, PayError> {
    let mut inst = tx
        .get_instrument(instrument_id)?
        .ok_or_else(|| PayError::not_found("instrument", instrument_id))?;

    if !inst.status.allows_stop() {
        return Err(PayError::invalid_state(
            "instrument",
            instrument_id,
            inst.status.as_str(),
            "stop payment",
        ));
    }

    inst.status = LifecycleState::Stopped;
    tx.update_instrument(&inst)?;
    if let Some(item_id) = inst.item_id.as_deref() {
        tx.set_distribution_state(item_id, LifecycleState::Stopped)?;
    }

    tx.insert_audit(&AuditEvent {
        id: Uuid::new_v4().to_string(),
        ts: ctx.ts(),
        actor: ctx.actor.clone(),
        instrument_id: Some(inst.id.clone()),
        event: AuditKind::Stopped,
        detail: "stop payment".into(),
    })?;

    Ok(inst)
}

/// Void a set of instruments, one transaction per entity. An entity's failure
/// is recorded in its result and never rolls back or aborts its siblings.
pub async fn void_many(
    store: &PaymentStore,
    requests: &[VoidRequest],
    ctx: &OpContext,
) -> VoidOutcome {
    let mut results = Vec::with_capacity(requests.len());
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for req in requests {
        let outcome = store.with_tx(|tx| apply_void(tx, req, ctx)).await;
        match outcome {
            Ok(inst) => {
                info!(instrument = %inst.id, reason = %req.reason, "voided");
                succeeded += 1;
                results.push(VoidResult {
                    instrument_id: req.instrument_id.clone(),
                    success: true,
                    message: format!("voided: {}", req.reason),
                });
            }
            Err(e) => {
                warn!(instrument = %req.instrument_id, error = %e, "void failed");
                failed += 1;
                results.push(VoidResult {
                    instrument_id: req.instrument_id.clone(),
                    success: false,
                    message: e.to_string(),
                });
            }
        }
    }

    VoidOutcome {
        results,
        succeeded,
        failed,
    }
}
