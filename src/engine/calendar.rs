use std::collections::{BTreeMap, BTreeSet};

use crate::model::*;

use super::overlap::resolve_by_manager;
use super::validate::validate_filter;
use super::{Engine, EngineError};

/// Count distinct managers with a valid slot at each start instant,
/// ascending by instant.
///
/// A manager with several valid slots at the same instant counts once.
pub fn aggregate(rows: &[Slot]) -> Vec<CalendarEntry> {
    let mut by_start: BTreeMap<Ms, BTreeSet<ManagerId>> = BTreeMap::new();
    for (manager_id, valid) in resolve_by_manager(rows) {
        for slot in valid {
            by_start.entry(slot.start()).or_default().insert(manager_id);
        }
    }

    by_start
        .into_iter()
        .map(|(start, managers)| CalendarEntry {
            start,
            available_count: managers.len(),
        })
        .collect()
}

impl Engine {
    /// Read path: one unlocked store read, then overlap resolution and aggregation.
    pub async fn calendar(&self, filter: &SlotFilter) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_filter(filter)?;
        let rows = self.store.query_availability(filter).await?;
        let entries = aggregate(&rows);
        metrics::histogram!(crate::observability::CALENDAR_ENTRIES).record(entries.len() as f64);
        tracing::debug!(
            date = %filter.date,
            rows = rows.len(),
            entries = entries.len(),
            "calendar aggregated"
        );
        Ok(entries)
    }
}
