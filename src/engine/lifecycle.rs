//! Cheque lifecycle manager.
//!
//! Owns every instrument state change except `Voided`/`Stopped`, which are
//! only ever driven through the voiding engine so reversal side effects cannot
//! be skipped. The distribution item mirrors its instrument's state; printing
//! a regular or consolidated cheque completes the covered batch items.

use crate::error::PayError;
use crate::models::{
    AuditEvent, AuditKind, Instrument, ItemStatus, LifecycleState, OpContext,
};
use crate::store::StoreTx;
use uuid::Uuid;

/// Status is `Generated` and the cheque is worth printing.
pub fn can_be_printed(inst: &Instrument) -> bool {
    inst.status.allows_print() && inst.amount > 0
}

pub fn can_be_delivered(inst: &Instrument) -> bool {
    inst.status.allows_deliver()
}

fn load(tx: &StoreTx<'_>, id: &str) -> Result<Instrument, PayError> {
    tx.get_instrument(id)?
        .ok_or_else(|| PayError::not_found("instrument", id))
}

fn audit(
    tx: &StoreTx<'_>,
    instrument_id: &str,
    event: AuditKind,
    detail: String,
    ctx: &OpContext,
) -> Result<(), PayError> {
    tx.insert_audit(&AuditEvent {
        id: Uuid::new_v4().to_string(),
        ts: ctx.ts(),
        actor: ctx.actor.clone(),
        instrument_id: Some(instrument_id.to_string()),
        event,
        detail,
    })
}

/// `Generated -> Printed`. Records who printed and when, mirrors the state
/// onto the distribution item, and completes the covered batch items.
/// Advance instruments never touch batch state.
pub fn print_instrument(
    tx: &StoreTx<'_>,
    id: &str,
    ctx: &OpContext,
) -> Result<Instrument, PayError> {
    let mut inst = load(tx, id)?;
    if !can_be_printed(&inst) {
        return Err(PayError::invalid_state(
            "instrument",
            id,
            inst.status.as_str(),
            "print",
        ));
    }

    inst.status = LifecycleState::Printed;
    inst.printed_at = Some(ctx.ts());
    inst.printed_by = Some(ctx.actor.clone());
    tx.update_instrument(&inst)?;

    if inst.kind.touches_batch_items() {
        if let Some(item_id) = inst.item_id.as_deref() {
            tx.set_distribution_state(item_id, LifecycleState::Printed)?;
            let item = tx
                .get_distribution_item(item_id)?
                .ok_or_else(|| PayError::not_found("distribution item", item_id))?;
            for batch_item in
                tx.items_for_grower_in_batches(inst.grower_no, &item.sources)?
            {
                if batch_item.status == ItemStatus::Pending {
                    tx.set_batch_item_status(&batch_item.id, ItemStatus::Completed)?;
                }
            }
        }
    }

    audit(tx, id, AuditKind::Printed, format!("amount {}", inst.amount), ctx)?;
    Ok(inst)
}

/// Regenerate the printable artifact for an already-printed cheque. Allowed
/// any number of times; lifecycle state is unchanged and the reprint is logged
/// as its own audit event.
pub fn reprint_instrument(
    tx: &StoreTx<'_>,
    id: &str,
    ctx: &OpContext,
) -> Result<Instrument, PayError> {
    let inst = load(tx, id)?;
    if inst.status != LifecycleState::Printed {
        return Err(PayError::invalid_state(
            "instrument",
            id,
            inst.status.as_str(),
            "reprint",
        ));
    }
    audit(tx, id, AuditKind::Reprinted, format!("amount {}", inst.amount), ctx)?;
    Ok(inst)
}

/// `Printed -> Delivered` (terminal). Records the delivery method and actor.
pub fn deliver_instrument(
    tx: &StoreTx<'_>,
    id: &str,
    method: &str,
    ctx: &OpContext,
) -> Result<Instrument, PayError> {
    let mut inst = load(tx, id)?;
    if !can_be_delivered(&inst) {
        return Err(PayError::invalid_state(
            "instrument",
            id,
            inst.status.as_str(),
            "deliver",
        ));
    }

    inst.status = LifecycleState::Delivered;
    inst.delivered_at = Some(ctx.ts());
    inst.delivered_by = Some(ctx.actor.clone());
    inst.delivery_method = Some(method.to_string());
    tx.update_instrument(&inst)?;

    if let Some(item_id) = inst.item_id.as_deref() {
        tx.set_distribution_state(item_id, LifecycleState::Delivered)?;
    }

    audit(tx, id, AuditKind::Delivered, format!("via {method}"), ctx)?;
    Ok(inst)
}
