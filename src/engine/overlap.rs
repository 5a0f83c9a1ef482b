use std::collections::BTreeMap;

use crate::model::*;

// ── Overlap resolution ───────────────────────────────────────────

/// Every slot of `available` that no slot of `booked` overlaps, in input order.
///
/// Overlap is open-interval: a free slot that starts exactly where a booked one
/// ends (or the reverse) stays valid.
pub fn valid_availability(available: &[Slot], booked: &[Slot]) -> Vec<Slot> {
    available
        .iter()
        .filter(|slot| booked.iter().all(|b| !slot.overlaps(b)))
        .copied()
        .collect()
}

/// Split one manager's rows into `(available, booked)`, preserving order.
pub fn partition_booked(slots: &[Slot]) -> (Vec<Slot>, Vec<Slot>) {
    slots.iter().partition(|s| !s.booked)
}

/// Group rows by manager, resolve each group, and drop managers left with
/// nothing. Iteration order of the result is ascending manager id, which is
/// also the lock order of the assignment path.
pub fn resolve_by_manager(rows: &[Slot]) -> BTreeMap<ManagerId, Vec<Slot>> {
    let mut by_manager: BTreeMap<ManagerId, Vec<Slot>> = BTreeMap::new();
    for slot in rows {
        by_manager.entry(slot.manager_id).or_default().push(*slot);
    }

    by_manager
        .into_iter()
        .filter_map(|(manager_id, slots)| {
            let (available, booked) = partition_booked(&slots);
            let valid = valid_availability(&available, &booked);
            (!valid.is_empty()).then_some((manager_id, valid))
        })
        .collect()
}
