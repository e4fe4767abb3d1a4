//! Consolidation engine: one net-payable line per grower per run.
//!
//! A run is planned as a pure value (draft lines + the exact FIFO netting each
//! line will apply) and committed atomically: items persist as `Generated`,
//! one instrument per item, advances marked deducted per the plan, batches
//! flipped to `Processed`. Either everything lands or nothing does.

use crate::engine::{advances, aggregator};
use crate::error::PayError;
use crate::models::{
    Amount, AuditEvent, AuditKind, BatchStatus, DistributionItem, GrowerNo, Instrument,
    InstrumentKind, LifecycleState, OpContext, PaymentMethod,
};
use crate::store::StoreTx;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One advance deduction a planned line will apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedDeduction {
    pub advance_id: String,
    pub amount: Amount,
}

/// Draft net-payable line for one grower, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedItem {
    pub grower_no: GrowerNo,
    pub gross: Amount,
    pub advance_netted: Amount,
    pub net: Amount,
    pub sources: Vec<String>,
    pub deductions: Vec<PlannedDeduction>,
}

/// A full draft run. Rebuilt inside the commit transaction so the duplicate
/// check and the writes observe the same state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub batch_ids: Vec<String>,
    pub payment_method: PaymentMethod,
    pub items: Vec<PlannedItem>,
}

impl DistributionPlan {
    pub fn total_gross(&self) -> Amount {
        self.items.iter().map(|i| i.gross).sum()
    }

    pub fn total_netted(&self) -> Amount {
        self.items.iter().map(|i| i.advance_netted).sum()
    }

    pub fn total_net(&self) -> Amount {
        self.items.iter().map(|i| i.net).sum()
    }
}

/// One committed line, reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionLine {
    pub item_id: String,
    pub instrument_id: String,
    pub grower_no: GrowerNo,
    pub gross: Amount,
    pub advance_netted: Amount,
    pub net: Amount,
    pub sources: Vec<String>,
}

/// Result value for a committed run. Plain data; presentation belongs to the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub batch_ids: Vec<String>,
    pub lines: Vec<DistributionLine>,
    pub total_gross: Amount,
    pub total_netted: Amount,
    pub total_net: Amount,
    pub created_at: i64,
    pub created_by: String,
}

/// Build the draft run for `batch_ids`: aggregate payables, then net each
/// grower's outstanding advances oldest-first. `net = max(0, gross -
/// outstanding)`; when outstanding exceeds gross the excess stays outstanding
/// for a future run, so nets are never negative.
///
/// Fails with `DuplicateDistribution` if any target batch already carries a
/// non-voided distribution, and `NotFound` for an unknown batch id.
pub fn plan_distribution(
    tx: &StoreTx<'_>,
    batch_ids: &[String],
    payment_method: PaymentMethod,
) -> Result<DistributionPlan, PayError> {
    for batch_id in batch_ids {
        if tx.get_batch(batch_id)?.is_none() {
            return Err(PayError::not_found("batch", batch_id));
        }
    }
    if let Some(batch_id) = tx.batches_with_live_distribution(batch_ids)?.into_iter().next() {
        return Err(PayError::DuplicateDistribution { batch_id });
    }

    let payables = aggregator::aggregate_payables(tx, batch_ids)?;
    let mut items = Vec::with_capacity(payables.len());

    for (grower_no, payable) in payables {
        let outstanding = advances::outstanding_advances(tx, grower_no)?;
        let (netted, deductions) = plan_netting(&outstanding, payable.gross);
        items.push(PlannedItem {
            grower_no,
            gross: payable.gross,
            advance_netted: netted,
            net: payable.gross - netted,
            sources: payable.sources,
            deductions,
        });
    }

    Ok(DistributionPlan {
        batch_ids: batch_ids.to_vec(),
        payment_method,
        items,
    })
}

/// FIFO netting: consume oldest advances first, splitting the last one when
/// the gross runs out. Never nets more than the gross payable.
fn plan_netting(
    outstanding: &[crate::models::AdvanceRecord],
    gross: Amount,
) -> (Amount, Vec<PlannedDeduction>) {
    let mut need = gross;
    let mut deductions = Vec::new();
    for adv in outstanding {
        if need == 0 {
            break;
        }
        let take = need.min(adv.remaining());
        if take > 0 {
            deductions.push(PlannedDeduction {
                advance_id: adv.id.clone(),
                amount: take,
            });
            need -= take;
        }
    }
    (gross - need, deductions)
}

/// Persist a planned run: items become `Generated`, one instrument per item,
/// advances marked deducted per the plan, source batches `Processed`. Runs
/// inside the caller's transaction; any failure rolls back the whole run.
///
/// An empty plan fails with `EmptyDistribution`. Committing it would flip the
/// batches to `Processed` with no distribution item referencing them, leaving
/// nothing for the duplicate guard to see on the next run.
pub fn commit_distribution(
    tx: &StoreTx<'_>,
    batch_ids: &[String],
    payment_method: PaymentMethod,
    ctx: &OpContext,
) -> Result<DistributionSummary, PayError> {
    let plan = plan_distribution(tx, batch_ids, payment_method)?;
    if plan.items.is_empty() {
        return Err(PayError::EmptyDistribution {
            batch_ids: batch_ids.join(","),
        });
    }
    let mut lines = Vec::with_capacity(plan.items.len());

    for planned in &plan.items {
        let item_id = Uuid::new_v4().to_string();
        let instrument_id = Uuid::new_v4().to_string();

        tx.insert_distribution_item(&DistributionItem {
            id: item_id.clone(),
            grower_no: planned.grower_no,
            gross: planned.gross,
            advance_netted: planned.advance_netted,
            net: planned.net,
            payment_method,
            status: LifecycleState::Generated,
            sources: planned.sources.clone(),
            created_at: ctx.ts(),
            created_by: ctx.actor.clone(),
        })?;

        let kind = if planned.sources.len() > 1 {
            InstrumentKind::Consolidated
        } else {
            InstrumentKind::Regular
        };
        tx.insert_instrument(&Instrument {
            id: instrument_id.clone(),
            item_id: Some(item_id.clone()),
            advance_id: None,
            grower_no: planned.grower_no,
            amount: planned.net,
            kind,
            status: LifecycleState::Generated,
            created_at: ctx.ts(),
            created_by: ctx.actor.clone(),
            printed_at: None,
            printed_by: None,
            delivered_at: None,
            delivered_by: None,
            delivery_method: None,
            voided_at: None,
            voided_by: None,
            void_reason: None,
        })?;

        for d in &planned.deductions {
            advances::mark_deducted(tx, &d.advance_id, &instrument_id, d.amount, ctx)?;
        }

        tx.insert_audit(&AuditEvent {
            id: Uuid::new_v4().to_string(),
            ts: ctx.ts(),
            actor: ctx.actor.clone(),
            instrument_id: Some(instrument_id.clone()),
            event: AuditKind::Generated,
            detail: format!(
                "grower {} gross {} netted {} net {} from [{}]",
                planned.grower_no,
                planned.gross,
                planned.advance_netted,
                planned.net,
                planned.sources.join(",")
            ),
        })?;

        lines.push(DistributionLine {
            item_id,
            instrument_id,
            grower_no: planned.grower_no,
            gross: planned.gross,
            advance_netted: planned.advance_netted,
            net: planned.net,
            sources: planned.sources.clone(),
        });
    }

    for batch_id in batch_ids {
        tx.set_batch_status(batch_id, BatchStatus::Processed)?;
    }

    Ok(DistributionSummary {
        batch_ids: batch_ids.to_vec(),
        total_gross: plan.total_gross(),
        total_netted: plan.total_netted(),
        total_net: plan.total_net(),
        lines,
        created_at: ctx.ts(),
        created_by: ctx.actor.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        to_amount, AdvanceRecord, AdvanceStatus, BatchItem, BatchKind, ItemStatus, PaymentBatch,
    };
    use crate::store::PaymentStore;
    use chrono::Utc;

    fn ctx() -> OpContext {
        OpContext::new("tester", Utc::now())
    }

    fn batch(id: &str) -> PaymentBatch {
        PaymentBatch {
            id: id.into(),
            kind: BatchKind::AllPending,
            batch_date: "2026-08-01".into(),
            crop_year: 2026,
            status: BatchStatus::Open,
        }
    }

    fn item(id: &str, batch_id: &str, grower: GrowerNo, dollars: f64) -> BatchItem {
        BatchItem {
            id: id.into(),
            batch_id: batch_id.into(),
            grower_no: grower,
            amount: to_amount(dollars),
            status: ItemStatus::Pending,
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

    async fn seed_scenario(store: &PaymentStore) {
        // Grower 7: $150 in b1 + $100 in b2, $200 active advance.
        store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                tx.insert_batch(&batch("b2"))?;
                tx.insert_batch_item(&item("i1", "b1", 7, 150.0))?;
                tx.insert_batch_item(&item("i2", "b2", 7, 100.0))?;
                tx.insert_advance(&advance("a1", 7, 200.0, 100))?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_plan_nets_advances_fifo() {
        let store = PaymentStore::in_memory().unwrap();
        seed_scenario(&store).await;

        let plan = store
            .with_read(|tx| {
                plan_distribution(
                    tx,
                    &["b1".to_string(), "b2".to_string()],
                    PaymentMethod::Cheque,
                )
            })
            .await
            .unwrap();

        assert_eq!(plan.items.len(), 1);
        let line = &plan.items[0];
        assert_eq!(line.gross, to_amount(250.0));
        assert_eq!(line.advance_netted, to_amount(200.0));
        assert_eq!(line.net, to_amount(50.0));
        assert_eq!(line.sources, vec!["b1".to_string(), "b2".to_string()]);
        assert_eq!(line.deductions.len(), 1);
        assert_eq!(line.deductions[0].advance_id, "a1");
        assert_eq!(line.deductions[0].amount, to_amount(200.0));
    }

    #[tokio::test]
    async fn test_net_never_negative_excess_stays_outstanding() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                tx.insert_batch_item(&item("i1", "b1", 7, 100.0))?;
                tx.insert_advance(&advance("a1", 7, 250.0, 100))?;
                Ok(())
            })
            .await
            .unwrap();

        let summary = store
            .with_tx(|tx| {
                commit_distribution(tx, &["b1".to_string()], PaymentMethod::Cheque, &ctx())
            })
            .await
            .unwrap();

        assert_eq!(summary.lines[0].net, 0);
        assert_eq!(summary.lines[0].advance_netted, to_amount(100.0));

        // $150 excess remains outstanding for the next run
        let remaining = store
            .with_read(|tx| advances::outstanding_total(tx, 7))
            .await
            .unwrap();
        assert_eq!(remaining, to_amount(150.0));
    }

    #[tokio::test]
    async fn test_fifo_splits_newest_touched_advance() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                tx.insert_batch_item(&item("i1", "b1", 7, 120.0))?;
                tx.insert_advance(&advance("a-old", 7, 100.0, 100))?;
                tx.insert_advance(&advance("a-new", 7, 100.0, 200))?;
                Ok(())
            })
            .await
            .unwrap();

        let plan = store
            .with_read(|tx| {
                plan_distribution(tx, &["b1".to_string()], PaymentMethod::Cheque)
            })
            .await
            .unwrap();

        let d = &plan.items[0].deductions;
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].advance_id, "a-old");
        assert_eq!(d[0].amount, to_amount(100.0)); // consumed fully
        assert_eq!(d[1].advance_id, "a-new");
        assert_eq!(d[1].amount, to_amount(20.0)); // split, $80 remains
    }

    #[tokio::test]
    async fn test_commit_creates_one_instrument_per_grower() {
        let store = PaymentStore::in_memory().unwrap();
        seed_scenario(&store).await;
        store
            .with_tx(|tx| {
                tx.insert_batch_item(&item("i3", "b1", 12, 80.0))?;
                Ok(())
            })
            .await
            .unwrap();

        let summary = store
            .with_tx(|tx| {
                commit_distribution(
                    tx,
                    &["b1".to_string(), "b2".to_string()],
                    PaymentMethod::Cheque,
                    &ctx(),
                )
            })
            .await
            .unwrap();

        assert_eq!(summary.lines.len(), 2);
        assert_eq!(summary.total_gross, to_amount(330.0));
        assert_eq!(summary.total_netted, to_amount(200.0));
        assert_eq!(summary.total_net, to_amount(130.0));

        store
            .with_read(|tx| {
                for line in &summary.lines {
                    let inst = tx.get_instrument(&line.instrument_id)?.unwrap();
                    assert_eq!(inst.status, LifecycleState::Generated);
                    assert_eq!(inst.amount, line.net);
                    let it = tx.get_distribution_item(&line.item_id)?.unwrap();
                    assert_eq!(it.status, LifecycleState::Generated);
                }
                // grower 7 spans two batches -> consolidated; grower 12 -> regular
                let g7 = summary.lines.iter().find(|l| l.grower_no == 7).unwrap();
                let g12 = summary.lines.iter().find(|l| l.grower_no == 12).unwrap();
                assert_eq!(
                    tx.get_instrument(&g7.instrument_id)?.unwrap().kind,
                    InstrumentKind::Consolidated
                );
                assert_eq!(
                    tx.get_instrument(&g12.instrument_id)?.unwrap().kind,
                    InstrumentKind::Regular
                );
                assert_eq!(
                    tx.get_batch("b1")?.unwrap().status,
                    BatchStatus::Processed
                );
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_run_fails_duplicate() {
        let store = PaymentStore::in_memory().unwrap();
        seed_scenario(&store).await;
        let ids = vec!["b1".to_string(), "b2".to_string()];

        store
            .with_tx(|tx| commit_distribution(tx, &ids, PaymentMethod::Cheque, &ctx()))
            .await
            .unwrap();

        let err = store
            .with_tx(|tx| commit_distribution(tx, &ids, PaymentMethod::Cheque, &ctx()))
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::DuplicateDistribution { .. }));

        // overlapping selection is also rejected
        let err = store
            .with_tx(|tx| {
                commit_distribution(tx, &["b2".to_string()], PaymentMethod::Cheque, &ctx())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::DuplicateDistribution { .. }));
    }

    #[tokio::test]
    async fn test_empty_run_commits_nothing() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| tx.insert_batch(&batch("b1")))
            .await
            .unwrap();

        // batch with no pending items: both attempts fail, status untouched
        for _ in 0..2 {
            let err = store
                .with_tx(|tx| {
                    commit_distribution(tx, &["b1".to_string()], PaymentMethod::Cheque, &ctx())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PayError::EmptyDistribution { .. }));
        }
        let b1 = store.with_read(|tx| tx.get_batch("b1")).await.unwrap().unwrap();
        assert_eq!(b1.status, BatchStatus::Open);

        // same once every item is already completed
        store
            .with_tx(|tx| {
                tx.insert_batch_item(&item("i1", "b1", 7, 50.0))?;
                tx.set_batch_item_status("i1", ItemStatus::Completed)
            })
            .await
            .unwrap();
        let err = store
            .with_tx(|tx| {
                commit_distribution(tx, &["b1".to_string()], PaymentMethod::Cheque, &ctx())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::EmptyDistribution { .. }));
        let b1 = store.with_read(|tx| tx.get_batch("b1")).await.unwrap().unwrap();
        assert_eq!(b1.status, BatchStatus::Open);
    }

    #[tokio::test]
    async fn test_unknown_batch_rejected() {
        let store = PaymentStore::in_memory().unwrap();
        let err = store
            .with_read(|tx| {
                plan_distribution(tx, &["missing".to_string()], PaymentMethod::Cheque)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::NotFound { .. }));
    }
}
