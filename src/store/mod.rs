//! Persistence seam: plain reads, plus a transaction scope with row-locking reads.

mod memory;
mod postgres;

pub use memory::{InMemoryStore, MemoryTransaction};
pub use postgres::{PgSlotStore, PgTransaction};

use std::time::Duration;

use async_trait::async_trait;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("{table} row {id} does not exist")]
    MissingRow { table: &'static str, id: i64 },
    #[error("{table} row {id} already exists")]
    Duplicate { table: &'static str, id: i64 },
    #[error("instant {0} is out of range")]
    InvalidInstant(Ms),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Failures that a fresh transaction may not hit again: lock contention,
    /// statement timeouts, deadlock victims, serialization failures and an
    /// exhausted connection pool.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout(_) => true,
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
            _ => false,
        }
    }
}

/// lock_not_available, query_canceled, deadlock_detected, serialization_failure.
const TRANSIENT_SQLSTATES: &[&str] = &["55P03", "57014", "40P01", "40001"];

/// Read/write access to managers, slots and bookings.
///
/// Implementations must return rows ordered by manager id, then slot start.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Plain read of every slot on `filter.date` owned by a matching manager. Takes no locks.
    async fn query_availability(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError>;

    /// Open a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> Result<Box<dyn SlotTransaction>, StoreError>;

    async fn insert_manager(&self, manager: &SalesManager) -> Result<(), StoreError>;

    async fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError>;

    async fn list_managers(&self) -> Result<Vec<SalesManager>, StoreError>;

    async fn list_slots(&self, manager_id: Option<ManagerId>) -> Result<Vec<Slot>, StoreError>;

    async fn list_bookings(&self, manager_id: Option<ManagerId>)
    -> Result<Vec<Booking>, StoreError>;
}

/// One open transaction. Every lock it holds is released when it commits,
/// rolls back or is dropped.
#[async_trait]
pub trait SlotTransaction: Send {
    /// Same rows as [`SlotStore::query_availability`], each locked exclusively.
    /// Locks are taken in (manager id, start) order.
    async fn query_for_update(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError>;

    async fn mark_booked(&mut self, slot_id: SlotId) -> Result<(), StoreError>;

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, StoreError>;

    async fn increment_load(&mut self, manager_id: ManagerId) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures() {
        assert!(StoreError::LockTimeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::MissingRow { table: "slots", id: 1 }.is_transient());
        assert!(!StoreError::InvalidInstant(i64::MAX).is_transient());
    }
}
