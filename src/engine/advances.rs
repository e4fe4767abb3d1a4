//! Advance ledger: outstanding cash advances and their netting state.
//!
//! The ledger is the only writer of advance balances. Every deduction writes a
//! `DeductionLink` row alongside the balance change, so a later reversal
//! restores exactly the recorded amounts, never a recomputation. Reversal is
//! idempotent under retry: links flip to `reversed` once and a second pass
//! finds nothing to undo.

use crate::error::PayError;
use crate::models::{
    Amount, AdvanceRecord, AdvanceStatus, DeductionLink, GrowerNo, LifecycleState, OpContext,
};
use crate::store::StoreTx;

/// Active advances with outstanding balance, oldest first (FIFO deduction
/// policy).
pub fn outstanding_advances(
    tx: &StoreTx<'_>,
    grower_no: GrowerNo,
) -> Result<Vec<AdvanceRecord>, PayError> {
    tx.active_advances_for_grower(grower_no)
}

/// Sum of remaining balances across a grower's active advances.
pub fn outstanding_total(tx: &StoreTx<'_>, grower_no: GrowerNo) -> Result<Amount, PayError> {
    let advances = tx.active_advances_for_grower(grower_no)?;
    Ok(advances.iter().map(|a| a.remaining()).sum())
}

/// Net `amount` of one advance against `instrument_id`.
///
/// Fails with `InvalidState` unless the advance is `Active`, and with
/// `InsufficientAdvanceBalance` if `amount` exceeds the remaining balance.
/// The advance flips to `Deducted` only when fully consumed; a partial
/// deduction leaves it `Active` with the remainder outstanding for the next
/// distribution.
pub fn mark_deducted(
    tx: &StoreTx<'_>,
    advance_id: &str,
    instrument_id: &str,
    amount: Amount,
    ctx: &OpContext,
) -> Result<AdvanceRecord, PayError> {
    let mut adv = tx
        .get_advance(advance_id)?
        .ok_or_else(|| PayError::not_found("advance", advance_id))?;

    if adv.status != AdvanceStatus::Active {
        return Err(PayError::invalid_state(
            "advance",
            advance_id,
            adv.status.as_str(),
            "deduct",
        ));
    }
    if amount <= 0 || amount > adv.remaining() {
        return Err(PayError::InsufficientAdvanceBalance {
            advance_id: advance_id.to_string(),
            requested: amount,
            remaining: adv.remaining(),
        });
    }

    adv.deducted_amount += amount;
    adv.deducted_at = Some(ctx.ts());
    adv.deducted_against = Some(instrument_id.to_string());
    if adv.deducted_amount == adv.amount {
        adv.status = AdvanceStatus::Deducted;
    }

    tx.insert_deduction_link(&DeductionLink {
        instrument_id: instrument_id.to_string(),
        advance_id: advance_id.to_string(),
        amount,
        reversed: false,
    })?;
    tx.update_advance(&adv)?;
    Ok(adv)
}

/// Restore an advance to `Active`, undoing its unreversed deduction links.
///
/// The manual correction path. A link is only undone when its backing
/// instrument is `Voided` (or gone); netting behind a live cheque stands until
/// that cheque is voided, which reverses through
/// [`reverse_instrument_deductions`] instead. Fails with `InvalidState` when
/// every unreversed link is still backed by a live instrument, and for
/// `Cancelled`/`Voided` advances. Idempotent: an already-`Active` advance with
/// nothing left to undo is a no-op, so retried reversal commands are safe.
pub fn reverse_deduction(
    tx: &StoreTx<'_>,
    advance_id: &str,
    _ctx: &OpContext,
) -> Result<AdvanceRecord, PayError> {
    let mut adv = tx
        .get_advance(advance_id)?
        .ok_or_else(|| PayError::not_found("advance", advance_id))?;

    match adv.status {
        AdvanceStatus::Cancelled | AdvanceStatus::Voided => {
            return Err(PayError::invalid_state(
                "advance",
                advance_id,
                adv.status.as_str(),
                "reverse deduction",
            ));
        }
        AdvanceStatus::Active | AdvanceStatus::Deducted => {}
    }

    let links = tx.unreversed_links_for_advance(advance_id)?;
    if links.is_empty() {
        // Nothing to undo; already restored.
        return Ok(adv);
    }

    let mut reversed_any = false;
    for link in &links {
        let live = match tx.get_instrument(&link.instrument_id)? {
            Some(inst) => inst.status != LifecycleState::Voided,
            None => false,
        };
        if live {
            continue;
        }
        adv.deducted_amount -= link.amount;
        tx.mark_link_reversed(&link.instrument_id, &link.advance_id)?;
        reversed_any = true;
    }
    if !reversed_any {
        return Err(PayError::invalid_state(
            "advance",
            advance_id,
            adv.status.as_str(),
            "reverse a deduction backed by a live instrument",
        ));
    }

    adv.status = AdvanceStatus::Active;
    if adv.deducted_amount == 0 {
        adv.deducted_at = None;
        adv.deducted_against = None;
    }
    tx.update_advance(&adv)?;
    Ok(adv)
}

/// Reverse every deduction one instrument netted, restoring the exact recorded
/// amounts. Returns the ids of the advances touched. Used by the voiding
/// engine; idempotent through the per-link `reversed` flag.
pub fn reverse_instrument_deductions(
    tx: &StoreTx<'_>,
    instrument_id: &str,
    _ctx: &OpContext,
) -> Result<Vec<String>, PayError> {
    let links = tx.links_for_instrument(instrument_id)?;
    let mut restored = Vec::new();

    for link in links.iter().filter(|l| !l.reversed) {
        let mut adv = tx
            .get_advance(&link.advance_id)?
            .ok_or_else(|| PayError::not_found("advance", &link.advance_id))?;

        adv.deducted_amount -= link.amount;
        adv.status = AdvanceStatus::Active;
        if adv.deducted_against.as_deref() == Some(instrument_id) {
            adv.deducted_against = None;
            adv.deducted_at = None;
        }
        tx.update_advance(&adv)?;
        tx.mark_link_reversed(instrument_id, &link.advance_id)?;
        restored.push(link.advance_id.clone());
    }

    Ok(restored)
}

/// Void the advance record behind an advance-kind instrument. Unlike a
/// deduction reversal this terminates the advance itself.
pub fn void_advance(
    tx: &StoreTx<'_>,
    advance_id: &str,
    ctx: &OpContext,
) -> Result<AdvanceRecord, PayError> {
    let mut adv = tx
        .get_advance(advance_id)?
        .ok_or_else(|| PayError::not_found("advance", advance_id))?;

    if matches!(adv.status, AdvanceStatus::Cancelled | AdvanceStatus::Voided) {
        return Err(PayError::invalid_state(
            "advance",
            advance_id,
            adv.status.as_str(),
            "void",
        ));
    }

    adv.status = AdvanceStatus::Voided;
    adv.deducted_at = Some(ctx.ts());
    tx.update_advance(&adv)?;
    Ok(adv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{to_amount, Instrument, InstrumentKind};
    use crate::store::PaymentStore;
    use chrono::Utc;

    fn ctx() -> OpContext {
        OpContext::new("tester", Utc::now())
    }

    fn instrument(id: &str, grower: GrowerNo, dollars: f64, status: LifecycleState) -> Instrument {
        Instrument {
            id: id.into(),
            item_id: None,
            advance_id: None,
            grower_no: grower,
            amount: to_amount(dollars),
            kind: InstrumentKind::Regular,
            status,
            created_at: 0,
            created_by: "tester".into(),
            printed_at: None,
            printed_by: None,
            delivered_at: None,
            delivered_by: None,
            delivery_method: None,
            voided_at: None,
            voided_by: None,
            void_reason: None,
        }
    }

    fn advance(id: &str, grower: GrowerNo, dollars: f64, issued_at: i64) -> AdvanceRecord {
        AdvanceRecord {
            id: id.into(),
            grower_no: grower,
            amount: to_amount(dollars),
            deducted_amount: 0,
            reason: "pre-harvest".into(),
            status: AdvanceStatus::Active,
            issued_at,
            deducted_at: None,
            deducted_against: None,
        }
    }

    #[tokio::test]
    async fn test_outstanding_fifo_order_and_total() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a-new", 7, 100.0, 200))?;
                tx.insert_advance(&advance("a-old", 7, 50.0, 100))?;
                tx.insert_advance(&advance("a-other", 8, 75.0, 50))?;
                Ok(())
            })
            .await
            .unwrap();

        store
            .with_read(|tx| {
                let list = outstanding_advances(tx, 7)?;
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].id, "a-old"); // oldest first
                assert_eq!(list[1].id, "a-new");
                assert_eq!(outstanding_total(tx, 7)?, to_amount(150.0));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_partial_deduction_stays_active() {
        let store = PaymentStore::in_memory().unwrap();
        let adv = store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(120.0), &ctx())
            })
            .await
            .unwrap();

        assert_eq!(adv.status, AdvanceStatus::Active);
        assert_eq!(adv.remaining(), to_amount(80.0));
        assert_eq!(adv.deducted_against.as_deref(), Some("chq-1"));

        let total = store
            .with_read(|tx| outstanding_total(tx, 7))
            .await
            .unwrap();
        assert_eq!(total, to_amount(80.0));
    }

    #[tokio::test]
    async fn test_full_deduction_flips_to_deducted() {
        let store = PaymentStore::in_memory().unwrap();
        let adv = store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(200.0), &ctx())
            })
            .await
            .unwrap();
        assert_eq!(adv.status, AdvanceStatus::Deducted);
        assert_eq!(adv.remaining(), 0);
    }

    #[tokio::test]
    async fn test_deduction_over_remaining_rejected() {
        let store = PaymentStore::in_memory().unwrap();
        let err = store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 100.0, 100))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(150.0), &ctx())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayError::InsufficientAdvanceBalance { .. }
        ));
    }

    #[tokio::test]
    async fn test_deduction_on_non_active_rejected() {
        let store = PaymentStore::in_memory().unwrap();
        let err = store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 100.0, 100))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(100.0), &ctx())?;
                // fully deducted; any further deduction is invalid
                mark_deducted(tx, "a1", "chq-2", to_amount(1.0), &ctx())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reverse_deduction_restores_and_is_idempotent() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(200.0), &ctx())?;
                Ok(())
            })
            .await
            .unwrap();

        let adv = store
            .with_tx(|tx| reverse_deduction(tx, "a1", &ctx()))
            .await
            .unwrap();
        assert_eq!(adv.status, AdvanceStatus::Active);
        assert_eq!(adv.remaining(), to_amount(200.0));
        assert!(adv.deducted_against.is_none());

        // second reversal is a no-op, not an error
        let again = store
            .with_tx(|tx| reverse_deduction(tx, "a1", &ctx()))
            .await
            .unwrap();
        assert_eq!(again.status, AdvanceStatus::Active);
        assert_eq!(again.remaining(), to_amount(200.0));
    }

    #[tokio::test]
    async fn test_reverse_deduction_refuses_live_instrument() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                tx.insert_instrument(&instrument("chq-1", 7, 200.0, LifecycleState::Printed))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(200.0), &ctx())?;
                Ok(())
            })
            .await
            .unwrap();

        // the cheque stands, so its netting must stand too
        let err = store
            .with_tx(|tx| reverse_deduction(tx, "a1", &ctx()))
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::InvalidState { .. }));

        let adv = store
            .with_read(|tx| tx.get_advance("a1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(adv.status, AdvanceStatus::Deducted);
        assert_eq!(adv.remaining(), 0);
    }

    #[tokio::test]
    async fn test_reverse_deduction_allowed_once_instrument_voided() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                tx.insert_instrument(&instrument("chq-1", 7, 200.0, LifecycleState::Printed))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(200.0), &ctx())?;
                // cheque voided without the reversal flag; links stay unreversed
                let mut inst = tx.get_instrument("chq-1")?.unwrap();
                inst.status = LifecycleState::Voided;
                tx.update_instrument(&inst)?;
                Ok(())
            })
            .await
            .unwrap();

        let adv = store
            .with_tx(|tx| reverse_deduction(tx, "a1", &ctx()))
            .await
            .unwrap();
        assert_eq!(adv.status, AdvanceStatus::Active);
        assert_eq!(adv.remaining(), to_amount(200.0));
    }

    #[tokio::test]
    async fn test_reverse_deduction_rejects_voided() {
        let store = PaymentStore::in_memory().unwrap();
        let err = store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 100.0, 100))?;
                void_advance(tx, "a1", &ctx())?;
                reverse_deduction(tx, "a1", &ctx())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reverse_instrument_deductions_exact_amounts() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_advance(&advance("a1", 7, 150.0, 100))?;
                tx.insert_advance(&advance("a2", 7, 80.0, 200))?;
                mark_deducted(tx, "a1", "chq-1", to_amount(150.0), &ctx())?;
                mark_deducted(tx, "a2", "chq-1", to_amount(30.0), &ctx())?;
                Ok(())
            })
            .await
            .unwrap();

        let restored = store
            .with_tx(|tx| reverse_instrument_deductions(tx, "chq-1", &ctx()))
            .await
            .unwrap();
        assert_eq!(restored, vec!["a1".to_string(), "a2".to_string()]);

        store
            .with_read(|tx| {
                let a1 = tx.get_advance("a1")?.unwrap();
                let a2 = tx.get_advance("a2")?.unwrap();
                assert_eq!(a1.status, AdvanceStatus::Active);
                assert_eq!(a1.remaining(), to_amount(150.0));
                assert_eq!(a2.status, AdvanceStatus::Active);
                assert_eq!(a2.remaining(), to_amount(80.0));
                Ok(())
            })
            .await
            .unwrap();

        // retried reversal finds every link already reversed
        let restored = store
            .with_tx(|tx| reverse_instrument_deductions(tx, "chq-1", &ctx()))
            .await
            .unwrap();
        assert!(restored.is_empty());
    }
}
