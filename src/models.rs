//! Shared domain model for the payment consolidation engine.
//!
//! All monetary values are fixed-point cents (`Amount`) to keep cheque
//! arithmetic exact. Every status field persisted by the store round-trips
//! through the `as_str`/`parse` pairs below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// FIXED-POINT AMOUNT
// =============================================================================

/// Fixed-point money in cents. Avoids floating point errors in payables.
pub type Amount = i64;

/// Conversion factor: $1.00 = 100 units.
pub const AMOUNT_SCALE: i64 = 100;

/// Convert dollars to fixed-point cents.
#[inline]
pub fn to_amount(dollars: f64) -> Amount {
    (dollars * AMOUNT_SCALE as f64).round() as Amount
}

/// Convert fixed-point cents to dollars.
#[inline]
pub fn from_amount(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_SCALE as f64
}

/// Grower membership number. Aggregation output is ordered by this.
pub type GrowerNo = i64;

// =============================================================================
// OPERATION CONTEXT
// =============================================================================

/// Explicit actor + timestamp threaded through every mutating call.
/// Audit fields are never defaulted from ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpContext {
    pub actor: String,
    pub now: DateTime<Utc>,
}

impl OpContext {
    pub fn new(actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            now,
        }
    }

    /// Unix seconds, the store's timestamp representation.
    pub fn ts(&self) -> i64 {
        self.now.timestamp()
    }
}

// =============================================================================
// STATUS ENUMS
// =============================================================================

/// How a payment batch was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    ByGrower,
    ByBatch,
    AllPending,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::ByGrower => "by_grower",
            BatchKind::ByBatch => "by_batch",
            BatchKind::AllPending => "all_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "by_grower" => Some(BatchKind::ByGrower),
            "by_batch" => Some(BatchKind::ByBatch),
            "all_pending" => Some(BatchKind::AllPending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Processed,
    Closed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Processed => "processed",
            BatchStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(BatchStatus::Open),
            "processed" => Some(BatchStatus::Processed),
            "closed" => Some(BatchStatus::Closed),
            _ => None,
        }
    }
}

/// Payable obligation status inside a batch. Flips to `Completed` when the
/// covering instrument prints, and back to `Pending` when a void restores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Completed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "completed" => Some(ItemStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceStatus {
    Active,
    Deducted,
    Cancelled,
    Voided,
}

impl AdvanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvanceStatus::Active => "active",
            AdvanceStatus::Deducted => "deducted",
            AdvanceStatus::Cancelled => "cancelled",
            AdvanceStatus::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AdvanceStatus::Active),
            "deducted" => Some(AdvanceStatus::Deducted),
            "cancelled" => Some(AdvanceStatus::Cancelled),
            "voided" => Some(AdvanceStatus::Voided),
            _ => None,
        }
    }
}

/// Closed instrument kind, resolved once at load time. Reversal paths dispatch
/// on this, never on a free-form entity-type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Regular,
    Advance,
    Consolidated,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Regular => "regular",
            InstrumentKind::Advance => "advance",
            InstrumentKind::Consolidated => "consolidated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(InstrumentKind::Regular),
            "advance" => Some(InstrumentKind::Advance),
            "consolidated" => Some(InstrumentKind::Consolidated),
            _ => None,
        }
    }

    /// Advance instruments never touch batch-item status.
    pub fn touches_batch_items(&self) -> bool {
        !matches!(self, InstrumentKind::Advance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cheque,
    DirectDeposit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cheque => "cheque",
            PaymentMethod::DirectDeposit => "direct_deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cheque" => Some(PaymentMethod::Cheque),
            "direct_deposit" => Some(PaymentMethod::DirectDeposit),
            _ => None,
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A closed set of payable obligations created together by batch generation.
/// Consumed read-only by the aggregator; status maintained by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentBatch {
    pub id: String,
    pub kind: BatchKind,
    pub batch_date: String,
    pub crop_year: i32,
    pub status: BatchStatus,
}

/// One payable obligation to one grower inside one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub batch_id: String,
    pub grower_no: GrowerNo,
    pub amount: Amount,
    pub status: ItemStatus,
}

/// A single cash advance issued to a grower.
///
/// `deducted_amount` accumulates netting against distributions. The record
/// flips to `Deducted` only when fully consumed; a partially netted advance
/// stays `Active` with its remainder outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceRecord {
    pub id: String,
    pub grower_no: GrowerNo,
    pub amount: Amount,
    pub deducted_amount: Amount,
    pub reason: String,
    pub status: AdvanceStatus,
    pub issued_at: i64,
    pub deducted_at: Option<i64>,
    /// Instrument the most recent deduction was netted against.
    pub deducted_against: Option<String>,
}

impl AdvanceRecord {
    /// Balance still outstanding for future netting.
    pub fn remaining(&self) -> Amount {
        self.amount - self.deducted_amount
    }
}

/// Authoritative record of one netting application: exactly how much of one
/// advance was deducted against one instrument. Written at creation time so
/// void reversal restores recorded amounts rather than recomputing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductionLink {
    pub instrument_id: String,
    pub advance_id: String,
    pub amount: Amount,
    pub reversed: bool,
}

/// One net-payable line for one grower in one distribution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionItem {
    pub id: String,
    pub grower_no: GrowerNo,
    pub gross: Amount,
    pub advance_netted: Amount,
    pub net: Amount,
    pub payment_method: PaymentMethod,
    pub status: LifecycleState,
    /// Contributing batch identifiers, persisted via the sources join table.
    pub sources: Vec<String>,
    pub created_at: i64,
    pub created_by: String,
}

/// The printable/payable artifact (cheque), 1:1 with a distribution item or,
/// for advance instruments, with an advance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub item_id: Option<String>,
    pub advance_id: Option<String>,
    pub grower_no: GrowerNo,
    pub amount: Amount,
    pub kind: InstrumentKind,
    pub status: LifecycleState,
    pub created_at: i64,
    pub created_by: String,
    pub printed_at: Option<i64>,
    pub printed_by: Option<String>,
    pub delivered_at: Option<i64>,
    pub delivered_by: Option<String>,
    pub delivery_method: Option<String>,
    pub voided_at: Option<i64>,
    pub voided_by: Option<String>,
    pub void_reason: Option<String>,
}

/// Ephemeral per-grower payable computed by the aggregator. Not persisted;
/// rebuilt on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowerPayable {
    pub grower_no: GrowerNo,
    pub gross: Amount,
    pub sources: Vec<String>,
}

// =============================================================================
// LIFECYCLE STATE
// =============================================================================

/// Instrument / distribution-item lifecycle.
///
/// ```text
/// Draft -> Generated -> Printed -> Delivered   (terminal, success path)
/// Generated|Printed -> Voided                  (terminal, reversed)
/// Printed -> Stopped                           (terminal, blocked post-print)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Generated,
    Printed,
    Delivered,
    Voided,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Generated => "generated",
            LifecycleState::Printed => "printed",
            LifecycleState::Delivered => "delivered",
            LifecycleState::Voided => "voided",
            LifecycleState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(LifecycleState::Draft),
            "generated" => Some(LifecycleState::Generated),
            "printed" => Some(LifecycleState::Printed),
            "delivered" => Some(LifecycleState::Delivered),
            "voided" => Some(LifecycleState::Voided),
            "stopped" => Some(LifecycleState::Stopped),
            _ => None,
        }
    }

    /// Terminal states reject every further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Delivered | LifecycleState::Voided | LifecycleState::Stopped
        )
    }

    pub fn allows_print(&self) -> bool {
        matches!(self, LifecycleState::Generated)
    }

    pub fn allows_deliver(&self) -> bool {
        matches!(self, LifecycleState::Printed)
    }

    pub fn allows_void(&self) -> bool {
        matches!(self, LifecycleState::Generated | LifecycleState::Printed)
    }

    pub fn allows_stop(&self) -> bool {
        matches!(self, LifecycleState::Printed)
    }
}

// =============================================================================
// AUDIT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Generated,
    Printed,
    Reprinted,
    Delivered,
    Voided,
    Stopped,
    AdvanceIssued,
    AdvanceReversed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Generated => "generated",
            AuditKind::Printed => "printed",
            AuditKind::Reprinted => "reprinted",
            AuditKind::Delivered => "delivered",
            AuditKind::Voided => "voided",
            AuditKind::Stopped => "stopped",
            AuditKind::AdvanceIssued => "advance_issued",
            AuditKind::AdvanceReversed => "advance_reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(AuditKind::Generated),
            "printed" => Some(AuditKind::Printed),
            "reprinted" => Some(AuditKind::Reprinted),
            "delivered" => Some(AuditKind::Delivered),
            "voided" => Some(AuditKind::Voided),
            "stopped" => Some(AuditKind::Stopped),
            "advance_issued" => Some(AuditKind::AdvanceIssued),
            "advance_reversed" => Some(AuditKind::AdvanceReversed),
            _ => None,
        }
    }
}

/// Append-only audit trail row. Reprints log as distinct events without
/// changing lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub ts: i64,
    pub actor: String,
    pub instrument_id: Option<String>,
    pub event: AuditKind,
    pub detail: String,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub operator: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./harvestpay.db".to_string());

        let operator = std::env::var("OPERATOR").unwrap_or_else(|_| "office".to_string());

        Ok(Self {
            database_path,
            operator,
        })
    }
}
