//! Payment engine.
//!
//! Data flows in one direction: batch items feed the aggregator, the
//! aggregator feeds consolidation, consolidation nets the advance ledger and
//! emits instruments, and the lifecycle/voiding modules own every instrument
//! state change from there. The submodules are transaction-scoped functions
//! over [`StoreTx`](crate::store::StoreTx); `PaymentEngine` is the async
//! facade that wraps each operation in exactly one transaction.

pub mod advances;
pub mod aggregator;
pub mod consolidation;
pub mod lifecycle;
pub mod voiding;


use crate::error::PayError;
use crate::models::{
    AdvanceRecord, AdvanceStatus, Amount, AuditEvent, AuditKind, GrowerNo, Instrument,
    InstrumentKind, LifecycleState, OpContext, PaymentMethod,
};
use crate::store::PaymentStore;
use consolidation::{DistributionPlan, DistributionSummary};
use tracing::info;
use uuid::Uuid;
use voiding::{VoidOutcome, VoidRequest};

/// Async facade over the payment store. Every method runs in a single
/// transaction; bulk voiding is the one exception, which runs one transaction
/// per entity on purpose.
#[derive(Clone)]
pub struct PaymentEngine {
    store: PaymentStore,
}

impl PaymentEngine {
    pub fn new(store: PaymentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PaymentStore {
        &self.store
    }

    /// Draft a distribution without persisting anything.
    pub async fn preview_distribution(
        &self,
        batch_ids: &[String],
        method: PaymentMethod,
    ) -> Result<DistributionPlan, PayError> {
        self.store
            .with_read(|tx| consolidation::plan_distribution(tx, batch_ids, method))
            .await
    }

    /// Plan and commit a distribution atomically.
    pub async fn build_distribution(
        &self,
        batch_ids: &[String],
        method: PaymentMethod,
        ctx: &OpContext,
    ) -> Result<DistributionSummary, PayError> {
        let summary = self
            .store
            .with_tx(|tx| consolidation::commit_distribution(tx, batch_ids, method, ctx))
            .await?;
        info!(
            batches = summary.batch_ids.len(),
            lines = summary.lines.len(),
            gross = summary.total_gross,
            netted = summary.total_netted,
            net = summary.total_net,
            "distribution committed"
        );
        Ok(summary)
    }

    /// Record a new advance and cut its payout instrument in one transaction.
    pub async fn issue_advance(
        &self,
        grower_no: GrowerNo,
        amount: Amount,
        reason: &str,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        if amount <= 0 {
            return Err(PayError::invalid_state(
                "advance",
                "(new)",
                "non-positive amount",
                "issue",
            ));
        }
        let advance_id = Uuid::new_v4().to_string();
        let instrument_id = Uuid::new_v4().to_string();
        let reason = reason.to_string();

        let inst = self
            .store
            .with_tx(|tx| {
                tx.insert_advance(&AdvanceRecord {
                    id: advance_id.clone(),
                    grower_no,
                    amount,
                    deducted_amount: 0,
                    reason: reason.clone(),
                    status: AdvanceStatus::Active,
                    issued_at: ctx.ts(),
                    deducted_at: None,
                    deducted_against: None,
                })?;
                let inst = Instrument {
                    id: instrument_id.clone(),
                    item_id: None,
                    advance_id: Some(advance_id.clone()),
                    grower_no,
                    amount,
                    kind: InstrumentKind::Advance,
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
                };
                tx.insert_instrument(&inst)?;
                tx.insert_audit(&AuditEvent {
                    id: Uuid::new_v4().to_string(),
                    ts: ctx.ts(),
                    actor: ctx.actor.clone(),
                    instrument_id: Some(instrument_id.clone()),
                    event: AuditKind::AdvanceIssued,
                    detail: format!("grower {grower_no} amount {amount}: {reason}"),
                })?;
                Ok(inst)
            })
            .await?;
        info!(grower = grower_no, amount, instrument = %inst.id, "advance issued");
        Ok(inst)
    }

    pub async fn outstanding_advances(
        &self,
        grower_no: GrowerNo,
    ) -> Result<Vec<AdvanceRecord>, PayError> {
        self.store
            .with_read(|tx| advances::outstanding_advances(tx, grower_no))
            .await
    }

    pub async fn print_instrument(
        &self,
        id: &str,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        let inst = self
            .store
            .with_tx(|tx| lifecycle::print_instrument(tx, id, ctx))
            .await?;
        info!(instrument = %inst.id, amount = inst.amount, "printed");
        Ok(inst)
    }

    pub async fn reprint_instrument(
        &self,
        id: &str,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        let inst = self
            .store
            .with_tx(|tx| lifecycle::reprint_instrument(tx, id, ctx))
            .await?;
        info!(instrument = %inst.id, "reprinted");
        Ok(inst)
    }

    pub async fn deliver_instrument(
        &self,
        id: &str,
        method: &str,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        let inst = self
            .store
            .with_tx(|tx| lifecycle::deliver_instrument(tx, id, method, ctx))
            .await?;
        info!(instrument = %inst.id, method, "delivered");
        Ok(inst)
    }

    pub async fn void_payment(
        &self,
        req: &VoidRequest,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        let inst = self
            .store
            .with_tx(|tx| voiding::apply_void(tx, req, ctx))
            .await?;
        info!(instrument = %inst.id, reason = %req.reason, "voided");
        Ok(inst)
    }

    pub async fn void_many(&self, requests: &[VoidRequest], ctx: &OpContext) -> VoidOutcome {
        let outcome = voiding::void_many(&self.store, requests, ctx).await;
        info!(
            requested = requests.len(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "bulk void finished"
        );
        outcome
    }

    pub async fn stop_payment(
        &self,
        id: &str,
        ctx: &OpContext,
    ) -> Result<Instrument, PayError> {
        let inst = self
            .store
            .with_tx(|tx| voiding::apply_stop_payment(tx, id, ctx))
            .await?;
        info!(instrument = %inst.id, "stop payment placed");
        Ok(inst)
    }

    /// Manual correction path: put an advance's unreversed deductions back.
    /// Only undoes links whose backing instrument is voided; netting behind a
    /// live cheque is rejected with `InvalidState`.
    pub async fn reverse_deduction(
        &self,
        advance_id: &str,
        ctx: &OpContext,
    ) -> Result<AdvanceRecord, PayError> {
        let adv = self
            .store
            .with_tx(|tx| advances::reverse_deduction(tx, advance_id, ctx))
            .await?;
        info!(advance = %adv.id, "deductions reversed");
        Ok(adv)
    }

    pub async fn instrument(&self, id: &str) -> Result<Option<Instrument>, PayError> {
        self.store.with_read(|tx| tx.get_instrument(id)).await
    }

    pub async fn audit_trail(&self, instrument_id: &str) -> Result<Vec<AuditEvent>, PayError> {
        let id = instrument_id.to_string();
        self.store
            .with_read(|tx| tx.audit_for_instrument(&id))
            .await
    }
}
