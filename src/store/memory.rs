use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::model::*;

use super::{SlotStore, SlotTransaction, StoreError};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Committed state of one manager and the slots it owns.
struct ManagerRow {
    manager: SalesManager,
    /// Sorted by `span.start`.
    slots: Vec<Slot>,
}

impl ManagerRow {
    fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Slots whose start lies inside `day`.
    fn slots_on(&self, day: &Span) -> impl Iterator<Item = &Slot> {
        let from = self.slots.partition_point(|s| s.span.start < day.start);
        let to = self.slots.partition_point(|s| s.span.start < day.end);
        self.slots[from..to].iter()
    }

    fn mark_booked(&mut self, slot_id: SlotId) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.booked = true;
        }
    }
}

struct ManagerEntry {
    /// Stands in for `FOR UPDATE` on the manager row and all of its slot rows.
    row_lock: Arc<Mutex<()>>,
    /// Committed data. Only held for short copies, never across a row-lock wait.
    row: RwLock<ManagerRow>,
}

struct Inner {
    managers: DashMap<ManagerId, Arc<ManagerEntry>>,
    slot_owner: DashMap<SlotId, ManagerId>,
    bookings: RwLock<BTreeMap<BookingId, Booking>>,
    next_booking_id: AtomicI64,
    lock_timeout: Duration,
}

impl Inner {
    fn entry(&self, id: ManagerId) -> Result<Arc<ManagerEntry>, StoreError> {
        self.managers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::MissingRow {
                table: "sales_managers",
                id,
            })
    }

    /// Snapshot of all entries in ascending manager id (the lock order).
    fn sorted_entries(&self) -> Vec<(ManagerId, Arc<ManagerEntry>)> {
        let mut entries: Vec<_> = self
            .managers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

/// Process-local slot store. Each manager carries its own row lock, so
/// transactions touching disjoint managers never contend.
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                managers: DashMap::new(),
                slot_owner: DashMap::new(),
                bookings: RwLock::new(BTreeMap::new()),
                next_booking_id: AtomicI64::new(1),
                lock_timeout,
            }),
        }
    }
}

#[async_trait]
impl SlotStore for InMemoryStore {
    async fn query_availability(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        let day = filter.day_span();
        let mut rows = Vec::new();
        for (_, entry) in self.inner.sorted_entries() {
            let row = entry.row.read().await;
            if row.manager.matches(filter) {
                rows.extend(row.slots_on(&day).copied());
            }
        }
        Ok(rows)
    }

    async fn begin(&self) -> Result<Box<dyn SlotTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            locks: BTreeMap::new(),
            writes: Vec::new(),
        }))
    }

    async fn insert_manager(&self, manager: &SalesManager) -> Result<(), StoreError> {
        match self.inner.managers.entry(manager.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                table: "sales_managers",
                id: manager.id,
            }),
            Entry::Vacant(v) => {
                v.insert(Arc::new(ManagerEntry {
                    row_lock: Arc::new(Mutex::new(())),
                    row: RwLock::new(ManagerRow {
                        manager: manager.clone(),
                        slots: Vec::new(),
                    }),
                }));
                Ok(())
            }
        }
    }

    async fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        let entry = self.inner.entry(slot.manager_id)?;
        match self.inner.slot_owner.entry(slot.id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Duplicate {
                    table: "slots",
                    id: slot.id,
                });
            }
            Entry::Vacant(v) => {
                v.insert(slot.manager_id);
            }
        }
        entry.row.write().await.insert_slot(*slot);
        Ok(())
    }

    async fn list_managers(&self) -> Result<Vec<SalesManager>, StoreError> {
        let mut managers = Vec::new();
        for (_, entry) in self.inner.sorted_entries() {
            managers.push(entry.row.read().await.manager.clone());
        }
        Ok(managers)
    }

    async fn list_slots(&self, manager_id: Option<ManagerId>) -> Result<Vec<Slot>, StoreError> {
        let entries = match manager_id {
            Some(id) => match self.inner.managers.get(&id) {
                Some(e) => vec![(id, e.value().clone())],
                None => Vec::new(),
            },
            None => self.inner.sorted_entries(),
        };
        let mut slots = Vec::new();
        for (_, entry) in entries {
            slots.extend(entry.row.read().await.slots.iter().copied());
        }
        Ok(slots)
    }

    async fn list_bookings(
        &self,
        manager_id: Option<ManagerId>,
    ) -> Result<Vec<Booking>, StoreError> {
        let bookings = self.inner.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|b| manager_id.is_none_or(|id| b.manager_id == id))
            .cloned()
            .collect())
    }
}

enum PendingWrite {
    MarkBooked { slot_id: SlotId, manager_id: ManagerId },
    InsertBooking(Booking),
    IncrementLoad(ManagerId),
}

impl PendingWrite {
    fn manager_id(&self) -> ManagerId {
        match self {
            PendingWrite::MarkBooked { manager_id, .. } | PendingWrite::IncrementLoad(manager_id) => {
                *manager_id
            }
            PendingWrite::InsertBooking(b) => b.manager_id,
        }
    }
}

/// Writes are buffered until commit and applied while the row locks are still held.
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    locks: BTreeMap<ManagerId, OwnedMutexGuard<()>>,
    writes: Vec<PendingWrite>,
}

impl MemoryTransaction {
    /// Acquire the manager's row lock unless this transaction already holds it.
    /// Returns true when the lock was newly taken.
    async fn lock(&mut self, id: ManagerId, entry: &ManagerEntry) -> Result<bool, StoreError> {
        if self.locks.contains_key(&id) {
            return Ok(false);
        }
        let timeout = self.inner.lock_timeout;
        let guard = tokio::time::timeout(timeout, entry.row_lock.clone().lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(timeout))?;
        self.locks.insert(id, guard);
        Ok(true)
    }

    /// Apply this transaction's own uncommitted writes to a row it reads back.
    fn overlay(&self, mut slot: Slot) -> Slot {
        let booked_here = self.writes.iter().any(
            |w| matches!(w, PendingWrite::MarkBooked { slot_id, .. } if *slot_id == slot.id),
        );
        slot.booked |= booked_here;
        slot
    }

    pub fn locked_managers(&self) -> Vec<ManagerId> {
        self.locks.keys().copied().collect()
    }
}

#[async_trait]
impl SlotTransaction for MemoryTransaction {
    async fn query_for_update(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        let day = filter.day_span();
        let mut rows = Vec::new();
        // Ascending manager id, and slots within a manager are kept sorted by start.
        for (id, entry) in self.inner.sorted_entries() {
            // Manager profiles are immutable once inserted, so matching before locking is safe.
            if !entry.row.read().await.manager.matches(filter) {
                continue;
            }
            let newly_locked = self.lock(id, &entry).await?;
            let before = rows.len();
            {
                let row = entry.row.read().await;
                rows.extend(row.slots_on(&day).map(|s| self.overlay(*s)));
            }
            if rows.len() == before && newly_locked {
                // Only rows that are returned stay locked.
                self.locks.remove(&id);
            }
        }
        Ok(rows)
    }

    async fn mark_booked(&mut self, slot_id: SlotId) -> Result<(), StoreError> {
        let manager_id = self
            .inner
            .slot_owner
            .get(&slot_id)
            .map(|e| *e.value())
            .ok_or(StoreError::MissingRow {
                table: "slots",
                id: slot_id,
            })?;
        let entry = self.inner.entry(manager_id)?;
        self.lock(manager_id, &entry).await?;
        self.writes.push(PendingWrite::MarkBooked {
            slot_id,
            manager_id,
        });
        Ok(())
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, StoreError> {
        self.inner.entry(booking.manager_id)?;
        let id = self.inner.next_booking_id.fetch_add(1, Ordering::Relaxed);
        self.writes.push(PendingWrite::InsertBooking(booking.with_id(id)));
        Ok(id)
    }

    async fn increment_load(&mut self, manager_id: ManagerId) -> Result<(), StoreError> {
        let entry = self.inner.entry(manager_id)?;
        self.lock(manager_id, &entry).await?;
        self.writes.push(PendingWrite::IncrementLoad(manager_id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            inner,
            locks,
            writes,
        } = *self;

        // Take every touched row's write guard (ascending id) plus the bookings
        // table before applying anything, so readers see all of it or none of it.
        let mut touched: BTreeMap<ManagerId, Arc<ManagerEntry>> = BTreeMap::new();
        for write in &writes {
            let id = write.manager_id();
            if !touched.contains_key(&id) {
                touched.insert(id, inner.entry(id)?);
            }
        }
        let mut rows = BTreeMap::new();
        for (id, entry) in &touched {
            rows.insert(*id, entry.row.write().await);
        }
        let mut bookings = inner.bookings.write().await;

        for write in writes {
            match write {
                PendingWrite::MarkBooked {
                    slot_id,
                    manager_id,
                } => {
                    if let Some(row) = rows.get_mut(&manager_id) {
                        row.mark_booked(slot_id);
                    }
                }
                PendingWrite::InsertBooking(booking) => {
                    bookings.insert(booking.id, booking);
                }
                PendingWrite::IncrementLoad(manager_id) => {
                    if let Some(row) = rows.get_mut(&manager_id) {
                        row.manager.current_load += 1;
                    }
                }
            }
        }

        drop(bookings);
        drop(rows);
        drop(locks);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Buffered writes and row locks are discarded with the transaction.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const H: Ms = SLOT_DURATION_MS;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 3).unwrap()
    }

    fn at(hour: i64) -> Ms {
        Span::day(day()).start + hour * H
    }

    fn filter() -> SlotFilter {
        SlotFilter {
            date: day(),
            language: "German".into(),
            rating: "Gold".into(),
            products: vec!["SolarPanels".into()],
        }
    }

    fn manager(id: ManagerId, language: &str) -> SalesManager {
        SalesManager::new(
            id,
            None,
            vec![language.into()],
            vec!["SolarPanels".into()],
            vec!["Gold".into()],
        )
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new(Duration::from_millis(200));
        store.insert_manager(&manager(2, "German")).await.unwrap();
        store.insert_manager(&manager(1, "German")).await.unwrap();
        store.insert_manager(&manager(3, "French")).await.unwrap();
        store.insert_slot(&Slot::new(21, 2, at(11), false)).await.unwrap();
        store.insert_slot(&Slot::new(20, 2, at(9), false)).await.unwrap();
        store.insert_slot(&Slot::new(10, 1, at(10), true)).await.unwrap();
        store.insert_slot(&Slot::new(30, 3, at(10), false)).await.unwrap();
        // Next day, outside the filter's date.
        store.insert_slot(&Slot::new(11, 1, at(25), false)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn query_orders_by_manager_then_start() {
        let store = seeded().await;
        let rows = store.query_availability(&filter()).await.unwrap();
        let ids: Vec<SlotId> = rows.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![10, 20, 21]);
    }

    #[tokio::test]
    async fn duplicate_rows_rejected() {
        let store = seeded().await;
        let dup_manager = store.insert_manager(&manager(1, "German")).await;
        assert!(matches!(dup_manager, Err(StoreError::Duplicate { table: "sales_managers", id: 1 })));
        let dup_slot = store.insert_slot(&Slot::new(10, 2, at(12), false)).await;
        assert!(matches!(dup_slot, Err(StoreError::Duplicate { table: "slots", id: 10 })));
        let orphan = store.insert_slot(&Slot::new(99, 42, at(12), false)).await;
        assert!(matches!(orphan, Err(StoreError::MissingRow { table: "sales_managers", id: 42 })));
    }

    #[tokio::test]
    async fn query_for_update_locks_only_returned_managers() {
        let store = seeded().await;
        store.insert_manager(&manager(4, "German")).await.unwrap(); // no slots
        let mut tx = MemoryTransaction {
            inner: store.inner.clone(),
            locks: BTreeMap::new(),
            writes: Vec::new(),
        };
        let rows = tx.query_for_update(&filter()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(tx.locked_managers(), vec![1, 2]);
    }

    #[tokio::test]
    async fn second_locker_times_out() {
        let store = seeded().await;
        let mut first = store.begin().await.unwrap();
        first.query_for_update(&filter()).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let result = second.query_for_update(&filter()).await;
        assert!(matches!(result, Err(StoreError::LockTimeout(_))));
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn plain_reads_do_not_wait_for_row_locks() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.query_for_update(&filter()).await.unwrap();

        let rows = tokio::time::timeout(Duration::from_millis(50), store.query_availability(&filter()))
            .await
            .expect("plain read blocked on a row lock")
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn commit_applies_all_writes() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.query_for_update(&filter()).await.unwrap();
        tx.mark_booked(20).await.unwrap();
        let slot = Slot::new(20, 2, at(9), false);
        let id = tx.insert_booking(&NewBooking::for_slot(&slot, 7)).await.unwrap();
        tx.increment_load(2).await.unwrap();

        // Nothing visible before commit.
        assert!(store.list_bookings(None).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let bookings = store.list_bookings(Some(2)).await.unwrap();
        assert_eq!(bookings, vec![NewBooking::for_slot(&slot, 7).with_id(id)]);
        let slots = store.list_slots(Some(2)).await.unwrap();
        assert!(slots.iter().find(|s| s.id == 20).unwrap().booked);
        let managers = store.list_managers().await.unwrap();
        assert_eq!(managers.iter().find(|m| m.id == 2).unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes_and_releases_locks() {
        let store = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.query_for_update(&filter()).await.unwrap();
            tx.mark_booked(20).await.unwrap();
            tx.increment_load(2).await.unwrap();
        }
        let slots = store.list_slots(Some(2)).await.unwrap();
        assert!(slots.iter().all(|s| !s.booked));

        // Locks are free again.
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.query_for_update(&filter()).await.unwrap().len(), 3);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.mark_booked(21).await.unwrap();
        let rows = tx.query_for_update(&filter()).await.unwrap();
        assert!(rows.iter().find(|s| s.id == 21).unwrap().booked);
    }

    #[tokio::test]
    async fn mark_booked_unknown_slot() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        let result = tx.mark_booked(999).await;
        assert!(matches!(result, Err(StoreError::MissingRow { table: "slots", id: 999 })));
    }
}
