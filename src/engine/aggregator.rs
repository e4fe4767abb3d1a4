//! Batch aggregator: gross payable per grower across a set of batches.
//!
//! Pure read-side. Payments themselves are never touched here; the output is
//! rebuilt on every consolidation run.

use crate::error::PayError;
use crate::models::{GrowerNo, GrowerPayable};
use crate::store::StoreTx;
use std::collections::{BTreeMap, HashSet};

/// Compute each grower's gross payable across `batch_ids`.
///
/// Sums pending batch items only. Growers who already hold a non-voided
/// distribution item touching any requested batch are excluded; they become
/// eligible again only once that prior instrument is voided. The map is keyed
/// by grower number, so iteration is ascending and downstream processing is
/// deterministic.
pub fn aggregate_payables(
    tx: &StoreTx<'_>,
    batch_ids: &[String],
) -> Result<BTreeMap<GrowerNo, GrowerPayable>, PayError> {
    let excluded: HashSet<GrowerNo> = tx
        .growers_with_live_distribution(batch_ids)?
        .into_iter()
        .collect();

    let mut payables: BTreeMap<GrowerNo, GrowerPayable> = BTreeMap::new();
    for item in tx.pending_items_for_batches(batch_ids)? {
        if excluded.contains(&item.grower_no) {
            continue;
        }
        let entry = payables
            .entry(item.grower_no)
            .or_insert_with(|| GrowerPayable {
                grower_no: item.grower_no,
                gross: 0,
                sources: Vec::new(),
            });
        entry.gross += item.amount;
        if !entry.sources.contains(&item.batch_id) {
            entry.sources.push(item.batch_id.clone());
        }
    }

    Ok(payables)
}
