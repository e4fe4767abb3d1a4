//! SQLite-backed store for batches, advances, distributions, and instruments.
//!
//! The engine has zero knowledge of schema or SQL dialect outside this module.
//! Every top-level operation runs inside a single `BEGIN IMMEDIATE` transaction
//! obtained through [`PaymentStore::with_tx`], so check-then-act sequences
//! (duplicate-distribution guard, double-void guard) are atomic against
//! concurrent operators sharing the database file.

use crate::error::PayError;
use crate::models::{
    AdvanceRecord, AdvanceStatus, AuditEvent, AuditKind, BatchItem, BatchKind, BatchStatus,
    DeductionLink, DistributionItem, GrowerNo, Instrument, InstrumentKind, ItemStatus,
    LifecycleState, PaymentBatch, PaymentMethod,
};
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct PaymentStore {
    conn: Arc<Mutex<Connection>>,
}

impl PaymentStore {
    pub fn new(db_path: &str) -> Result<Self, PayError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, PayError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), PayError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS batches (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                batch_date  TEXT NOT NULL,
                crop_year   INTEGER NOT NULL,
                status      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS batch_items (
                id          TEXT PRIMARY KEY,
                batch_id    TEXT NOT NULL REFERENCES batches(id),
                grower_no   INTEGER NOT NULL,
                amount      INTEGER NOT NULL,
                status      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_batch_items_batch_grower
                ON batch_items(batch_id, grower_no);
            CREATE INDEX IF NOT EXISTS idx_batch_items_status
                ON batch_items(status);
            CREATE TABLE IF NOT EXISTS advances (
                id               TEXT PRIMARY KEY,
                grower_no        INTEGER NOT NULL,
                amount           INTEGER NOT NULL,
                deducted_amount  INTEGER NOT NULL DEFAULT 0,
                reason           TEXT NOT NULL,
                status           TEXT NOT NULL,
                issued_at        INTEGER NOT NULL,
                deducted_at      INTEGER,
                deducted_against TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_advances_grower_status
                ON advances(grower_no, status);
            CREATE TABLE IF NOT EXISTS deduction_links (
                instrument_id TEXT NOT NULL,
                advance_id    TEXT NOT NULL,
                amount        INTEGER NOT NULL,
                reversed      INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (instrument_id, advance_id)
            );
            CREATE INDEX IF NOT EXISTS idx_deduction_links_advance
                ON deduction_links(advance_id);
            CREATE TABLE IF NOT EXISTS distribution_items (
                id              TEXT PRIMARY KEY,
                grower_no       INTEGER NOT NULL,
                gross           INTEGER NOT NULL,
                advance_netted  INTEGER NOT NULL,
                net             INTEGER NOT NULL,
                payment_method  TEXT NOT NULL,
                status          TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                created_by      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS distribution_sources (
                item_id  TEXT NOT NULL REFERENCES distribution_items(id),
                batch_id TEXT NOT NULL REFERENCES batches(id),
                PRIMARY KEY (item_id, batch_id)
            );
            CREATE INDEX IF NOT EXISTS idx_distribution_sources_batch
                ON distribution_sources(batch_id);
            CREATE TABLE IF NOT EXISTS instruments (
                id              TEXT PRIMARY KEY,
                item_id         TEXT REFERENCES distribution_items(id),
                advance_id      TEXT REFERENCES advances(id),
                grower_no       INTEGER NOT NULL,
                amount          INTEGER NOT NULL,
                kind            TEXT NOT NULL,
                status          TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                created_by      TEXT NOT NULL,
                printed_at      INTEGER,
                printed_by      TEXT,
                delivered_at    INTEGER,
                delivered_by    TEXT,
                delivery_method TEXT,
                voided_at       INTEGER,
                voided_by       TEXT,
                void_reason     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_instruments_item
                ON instruments(item_id);
            CREATE TABLE IF NOT EXISTS audit_log (
                id            TEXT PRIMARY KEY,
                ts            INTEGER NOT NULL,
                actor         TEXT NOT NULL,
                instrument_id TEXT,
                event         TEXT NOT NULL,
                detail        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_instrument_ts
                ON audit_log(instrument_id, ts);",
        )?;
        Ok(())
    }

    /// Run `f` inside one write transaction. Commits on `Ok`, rolls back fully
    /// on `Err`; a failure mid-operation is never partially observable.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T, PayError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, PayError>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stx = StoreTx { tx };
        match f(&mut stx) {
            Ok(value) => {
                stx.tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = stx.tx.rollback();
                Err(e)
            }
        }
    }

    /// Read-only variant for previews and lookups.
    pub async fn with_read<T, F>(&self, f: F) -> Result<T, PayError>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T, PayError>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let stx = StoreTx { tx };
        let out = f(&stx)?;
        let _ = stx.tx.rollback();
        Ok(out)
    }
}

/// Typed CRUD over one open transaction.
pub struct StoreTx<'c> {
    tx: rusqlite::Transaction<'c>,
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized stored value: {value}").into(),
    )
}

fn placeholders(n: usize) -> String {
    let mut s = String::new();
    for i in 1..=n {
        if i > 1 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<PaymentBatch> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    Ok(PaymentBatch {
        id: row.get(0)?,
        kind: BatchKind::parse(&kind).ok_or_else(|| bad_column(1, &kind))?,
        batch_date: row.get(2)?,
        crop_year: row.get(3)?,
        status: BatchStatus::parse(&status).ok_or_else(|| bad_column(4, &status))?,
    })
}

fn row_to_batch_item(row: &Row<'_>) -> rusqlite::Result<BatchItem> {
    let status: String = row.get(4)?;
    Ok(BatchItem {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        grower_no: row.get(2)?,
        amount: row.get(3)?,
        status: ItemStatus::parse(&status).ok_or_else(|| bad_column(4, &status))?,
    })
}

fn row_to_advance(row: &Row<'_>) -> rusqlite::Result<AdvanceRecord> {
    let status: String = row.get(5)?;
    Ok(AdvanceRecord {
        id: row.get(0)?,
        grower_no: row.get(1)?,
        amount: row.get(2)?,
        deducted_amount: row.get(3)?,
        reason: row.get(4)?,
        status: AdvanceStatus::parse(&status).ok_or_else(|| bad_column(5, &status))?,
        issued_at: row.get(6)?,
        deducted_at: row.get(7)?,
        deducted_against: row.get(8)?,
    })
}

fn row_to_instrument(row: &Row<'_>) -> rusqlite::Result<Instrument> {
    let kind: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Instrument {
        id: row.get(0)?,
        item_id: row.get(1)?,
        advance_id: row.get(2)?,
        grower_no: row.get(3)?,
        amount: row.get(4)?,
        kind: InstrumentKind::parse(&kind).ok_or_else(|| bad_column(5, &kind))?,
        status: LifecycleState::parse(&status).ok_or_else(|| bad_column(6, &status))?,
        created_at: row.get(7)?,
        created_by: row.get(8)?,
        printed_at: row.get(9)?,
        printed_by: row.get(10)?,
        delivered_at: row.get(11)?,
        delivered_by: row.get(12)?,
        delivery_method: row.get(13)?,
        voided_at: row.get(14)?,
        voided_by: row.get(15)?,
        void_reason: row.get(16)?,
    })
}

const INSTRUMENT_COLS: &str = "id, item_id, advance_id, grower_no, amount, kind, status, \
     created_at, created_by, printed_at, printed_by, delivered_at, delivered_by, \
     delivery_method, voided_at, voided_by, void_reason";

impl StoreTx<'_> {
    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn insert_batch(&self, batch: &PaymentBatch) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO batches (id, kind, batch_date, crop_year, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &batch.id,
                batch.kind.as_str(),
                &batch.batch_date,
                batch.crop_year,
                batch.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_batch(&self, id: &str) -> Result<Option<PaymentBatch>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, kind, batch_date, crop_year, status FROM batches WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_batch(row)?)),
            None => Ok(None),
        }
    }

    pub fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), PayError> {
        let changed = self.tx.execute(
            "UPDATE batches SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(PayError::not_found("batch", id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch items
    // ------------------------------------------------------------------

    pub fn insert_batch_item(&self, item: &BatchItem) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO batch_items (id, batch_id, grower_no, amount, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &item.id,
                &item.batch_id,
                item.grower_no,
                item.amount,
                item.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Pending payable obligations across the given batches, grower-ascending.
    pub fn pending_items_for_batches(
        &self,
        batch_ids: &[String],
    ) -> Result<Vec<BatchItem>, PayError> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, batch_id, grower_no, amount, status FROM batch_items
             WHERE status = 'pending' AND batch_id IN ({})
             ORDER BY grower_no ASC, batch_id ASC",
            placeholders(batch_ids.len())
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(batch_ids.iter()), row_to_batch_item)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// A grower's items inside a set of batches, whatever their status.
    pub fn items_for_grower_in_batches(
        &self,
        grower_no: GrowerNo,
        batch_ids: &[String],
    ) -> Result<Vec<BatchItem>, PayError> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, batch_id, grower_no, amount, status FROM batch_items
             WHERE grower_no = ?1 AND batch_id IN ({})
             ORDER BY batch_id ASC",
            placeholders_from(2, batch_ids.len())
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Integer(grower_no)];
        for b in batch_ids {
            values.push(rusqlite::types::Value::Text(b.clone()));
        }
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_batch_item)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn set_batch_item_status(&self, id: &str, status: ItemStatus) -> Result<(), PayError> {
        let changed = self.tx.execute(
            "UPDATE batch_items SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(PayError::not_found("batch item", id));
        }
        Ok(())
    }

    /// Whether a batch still has any completed items (drives batch status
    /// restore after voids).
    pub fn batch_has_completed_items(&self, batch_id: &str) -> Result<bool, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT COUNT(*) FROM batch_items WHERE batch_id = ?1 AND status = 'completed'",
        )?;
        let count: i64 = stmt.query_row(params![batch_id], |row| row.get(0))?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Advances
    // ------------------------------------------------------------------

    pub fn insert_advance(&self, adv: &AdvanceRecord) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO advances
             (id, grower_no, amount, deducted_amount, reason, status, issued_at, deducted_at, deducted_against)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &adv.id,
                adv.grower_no,
                adv.amount,
                adv.deducted_amount,
                &adv.reason,
                adv.status.as_str(),
                adv.issued_at,
                adv.deducted_at,
                adv.deducted_against.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn get_advance(&self, id: &str) -> Result<Option<AdvanceRecord>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, grower_no, amount, deducted_amount, reason, status, issued_at, deducted_at, deducted_against
             FROM advances WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_advance(row)?)),
            None => Ok(None),
        }
    }

    /// Active advances with outstanding balance, oldest first (FIFO policy).
    pub fn active_advances_for_grower(
        &self,
        grower_no: GrowerNo,
    ) -> Result<Vec<AdvanceRecord>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, grower_no, amount, deducted_amount, reason, status, issued_at, deducted_at, deducted_against
             FROM advances
             WHERE grower_no = ?1 AND status = 'active' AND deducted_amount < amount
             ORDER BY issued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![grower_no], row_to_advance)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn update_advance(&self, adv: &AdvanceRecord) -> Result<(), PayError> {
        let changed = self.tx.execute(
            "UPDATE advances SET
                deducted_amount = ?2,
                status = ?3,
                deducted_at = ?4,
                deducted_against = ?5
             WHERE id = ?1",
            params![
                &adv.id,
                adv.deducted_amount,
                adv.status.as_str(),
                adv.deducted_at,
                adv.deducted_against.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(PayError::not_found("advance", &adv.id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deduction links
    // ------------------------------------------------------------------

    pub fn insert_deduction_link(&self, link: &DeductionLink) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO deduction_links (instrument_id, advance_id, amount, reversed)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &link.instrument_id,
                &link.advance_id,
                link.amount,
                link.reversed as i64,
            ],
        )?;
        Ok(())
    }

    pub fn links_for_instrument(
        &self,
        instrument_id: &str,
    ) -> Result<Vec<DeductionLink>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT instrument_id, advance_id, amount, reversed
             FROM deduction_links WHERE instrument_id = ?1 ORDER BY advance_id ASC",
        )?;
        let rows = stmt.query_map(params![instrument_id], |row| {
            Ok(DeductionLink {
                instrument_id: row.get(0)?,
                advance_id: row.get(1)?,
                amount: row.get(2)?,
                reversed: row.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn unreversed_links_for_advance(
        &self,
        advance_id: &str,
    ) -> Result<Vec<DeductionLink>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT instrument_id, advance_id, amount, reversed
             FROM deduction_links WHERE advance_id = ?1 AND reversed = 0
             ORDER BY instrument_id ASC",
        )?;
        let rows = stmt.query_map(params![advance_id], |row| {
            Ok(DeductionLink {
                instrument_id: row.get(0)?,
                advance_id: row.get(1)?,
                amount: row.get(2)?,
                reversed: row.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn mark_link_reversed(
        &self,
        instrument_id: &str,
        advance_id: &str,
    ) -> Result<(), PayError> {
        self.tx.execute(
            "UPDATE deduction_links SET reversed = 1
             WHERE instrument_id = ?1 AND advance_id = ?2",
            params![instrument_id, advance_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Distribution items
    // ------------------------------------------------------------------

    pub fn insert_distribution_item(&self, item: &DistributionItem) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO distribution_items
             (id, grower_no, gross, advance_netted, net, payment_method, status, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &item.id,
                item.grower_no,
                item.gross,
                item.advance_netted,
                item.net,
                item.payment_method.as_str(),
                item.status.as_str(),
                item.created_at,
                &item.created_by,
            ],
        )?;
        for batch_id in &item.sources {
            self.tx.execute(
                "INSERT INTO distribution_sources (item_id, batch_id) VALUES (?1, ?2)",
                params![&item.id, batch_id],
            )?;
        }
        Ok(())
    }

    pub fn get_distribution_item(&self, id: &str) -> Result<Option<DistributionItem>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, grower_no, gross, advance_netted, net, payment_method, status, created_at, created_by
             FROM distribution_items WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let method: String = row.get(5)?;
        let status: String = row.get(6)?;
        let mut item = DistributionItem {
            id: row.get(0)?,
            grower_no: row.get(1)?,
            gross: row.get(2)?,
            advance_netted: row.get(3)?,
            net: row.get(4)?,
            payment_method: PaymentMethod::parse(&method)
                .ok_or_else(|| bad_column(5, &method))?,
            status: LifecycleState::parse(&status).ok_or_else(|| bad_column(6, &status))?,
            sources: Vec::new(),
            created_at: row.get(7)?,
            created_by: row.get(8)?,
        };
        drop(rows);
        let mut src_stmt = self.tx.prepare_cached(
            "SELECT batch_id FROM distribution_sources WHERE item_id = ?1 ORDER BY batch_id ASC",
        )?;
        let srcs = src_stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        for s in srcs {
            item.sources.push(s?);
        }
        Ok(Some(item))
    }

    pub fn set_distribution_state(
        &self,
        id: &str,
        state: LifecycleState,
    ) -> Result<(), PayError> {
        let changed = self.tx.execute(
            "UPDATE distribution_items SET status = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        if changed == 0 {
            return Err(PayError::not_found("distribution item", id));
        }
        Ok(())
    }

    /// Batch ids among `batch_ids` already referenced by a non-voided
    /// distribution item. Non-empty result fails a consolidation run.
    pub fn batches_with_live_distribution(
        &self,
        batch_ids: &[String],
    ) -> Result<Vec<String>, PayError> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT s.batch_id
             FROM distribution_sources s
             JOIN distribution_items d ON d.id = s.item_id
             WHERE d.status != 'voided' AND s.batch_id IN ({})
             ORDER BY s.batch_id ASC",
            placeholders(batch_ids.len())
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(batch_ids.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Growers who already hold a non-voided distribution item touching any of
    /// the given batches. They reappear only once that item is voided.
    pub fn growers_with_live_distribution(
        &self,
        batch_ids: &[String],
    ) -> Result<Vec<GrowerNo>, PayError> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT d.grower_no
             FROM distribution_items d
             JOIN distribution_sources s ON s.item_id = d.id
             WHERE d.status != 'voided' AND s.batch_id IN ({})
             ORDER BY d.grower_no ASC",
            placeholders(batch_ids.len())
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(batch_ids.iter()), |row| {
            row.get::<_, GrowerNo>(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Instruments
    // ------------------------------------------------------------------

    pub fn insert_instrument(&self, inst: &Instrument) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO instruments
             (id, item_id, advance_id, grower_no, amount, kind, status, created_at, created_by,
              printed_at, printed_by, delivered_at, delivered_by, delivery_method,
              voided_at, voided_by, void_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                &inst.id,
                inst.item_id.as_deref(),
                inst.advance_id.as_deref(),
                inst.grower_no,
                inst.amount,
                inst.kind.as_str(),
                inst.status.as_str(),
                inst.created_at,
                &inst.created_by,
                inst.printed_at,
                inst.printed_by.as_deref(),
                inst.delivered_at,
                inst.delivered_by.as_deref(),
                inst.delivery_method.as_deref(),
                inst.voided_at,
                inst.voided_by.as_deref(),
                inst.void_reason.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn get_instrument(&self, id: &str) -> Result<Option<Instrument>, PayError> {
        let sql = format!("SELECT {INSTRUMENT_COLS} FROM instruments WHERE id = ?1");
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_instrument(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_instrument(&self, inst: &Instrument) -> Result<(), PayError> {
        let changed = self.tx.execute(
            "UPDATE instruments SET
                status = ?2,
                printed_at = ?3, printed_by = ?4,
                delivered_at = ?5, delivered_by = ?6, delivery_method = ?7,
                voided_at = ?8, voided_by = ?9, void_reason = ?10
             WHERE id = ?1",
            params![
                &inst.id,
                inst.status.as_str(),
                inst.printed_at,
                inst.printed_by.as_deref(),
                inst.delivered_at,
                inst.delivered_by.as_deref(),
                inst.delivery_method.as_deref(),
                inst.voided_at,
                inst.voided_by.as_deref(),
                inst.void_reason.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(PayError::not_found("instrument", &inst.id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub fn insert_audit(&self, ev: &AuditEvent) -> Result<(), PayError> {
        self.tx.execute(
            "INSERT INTO audit_log (id, ts, actor, instrument_id, event, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &ev.id,
                ev.ts,
                &ev.actor,
                ev.instrument_id.as_deref(),
                ev.event.as_str(),
                &ev.detail,
            ],
        )?;
        Ok(())
    }

    pub fn audit_for_instrument(
        &self,
        instrument_id: &str,
    ) -> Result<Vec<AuditEvent>, PayError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, ts, actor, instrument_id, event, detail
             FROM audit_log WHERE instrument_id = ?1 ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![instrument_id], |row| {
            let event: String = row.get(4)?;
            Ok(AuditEvent {
                id: row.get(0)?,
                ts: row.get(1)?,
                actor: row.get(2)?,
                instrument_id: row.get(3)?,
                event: AuditKind::parse(&event).ok_or_else(|| bad_column(4, &event))?,
                detail: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn placeholders_from(start: usize, n: usize) -> String {
    let mut s = String::new();
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&format!("?{}", start + i));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::to_amount;

    fn batch(id: &str) -> PaymentBatch {
        PaymentBatch {
            id: id.into(),
            kind: BatchKind::ByBatch,
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

    #[tokio::test]
    async fn test_batch_and_items_round_trip() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                tx.insert_batch_item(&item("i1", "b1", 10, 150.0))?;
                tx.insert_batch_item(&item("i2", "b1", 7, 100.0))?;
                Ok(())
            })
            .await
            .unwrap();

        let pending = store
            .with_read(|tx| tx.pending_items_for_batches(&["b1".to_string()]))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        // grower-ascending order
        assert_eq!(pending[0].grower_no, 7);
        assert_eq!(pending[1].grower_no, 10);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let store = PaymentStore::in_memory().unwrap();
        let res: Result<(), PayError> = store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                Err(PayError::StoreFailure {
                    message: "boom".into(),
                })
            })
            .await;
        assert!(res.is_err());

        let found = store.with_read(|tx| tx.get_batch("b1")).await.unwrap();
        assert!(found.is_none(), "rolled-back insert must not be visible");
    }

    #[tokio::test]
    async fn test_live_distribution_queries() {
        let store = PaymentStore::in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.insert_batch(&batch("b1"))?;
                tx.insert_batch(&batch("b2"))?;
                tx.insert_distribution_item(&DistributionItem {
                    id: "d1".into(),
                    grower_no: 7,
                    gross: to_amount(250.0),
                    advance_netted: 0,
                    net: to_amount(250.0),
                    payment_method: PaymentMethod::Cheque,
                    status: LifecycleState::Generated,
                    sources: vec!["b1".into()],
                    created_at: 0,
                    created_by: "test".into(),
                })?;
                Ok(())
            })
            .await
            .unwrap();

        let (live_batches, live_growers) = store
            .with_read(|tx| {
                let ids = vec!["b1".to_string(), "b2".to_string()];
                Ok((
                    tx.batches_with_live_distribution(&ids)?,
                    tx.growers_with_live_distribution(&ids)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(live_batches, vec!["b1".to_string()]);
        assert_eq!(live_growers, vec![7]);

        // voiding the item frees the batch and the grower
        store
            .with_tx(|tx| tx.set_distribution_state("d1", LifecycleState::Voided))
            .await
            .unwrap();
        let live_batches = store
            .with_read(|tx| tx.batches_with_live_distribution(&["b1".to_string()]))
            .await
            .unwrap();
        assert!(live_batches.is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pay.db");
        let path = path.to_str().unwrap().to_string();

        {
            let store = PaymentStore::new(&path).unwrap();
            store
                .with_tx(|tx| tx.insert_batch(&batch("b1")))
                .await
                .unwrap();
        }

        let store = PaymentStore::new(&path).unwrap();
        let found = store.with_read(|tx| tx.get_batch("b1")).await.unwrap();
        assert_eq!(found.unwrap().status, BatchStatus::Open);
    }
}
