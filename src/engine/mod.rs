mod assign;
mod calendar;
mod error;
mod overlap;
mod validate;

pub use assign::{AssignPhase, select_candidate};
pub use calendar::aggregate;
pub use error::EngineError;
pub use overlap::{partition_booked, resolve_by_manager, valid_availability};

use std::sync::Arc;
use std::time::Duration;

use crate::model::*;
use crate::store::SlotStore;

use validate::{validate_batch, validate_instant, validate_manager};

/// Retry policy for the assignment path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Attempts per assignment, counting the first one.
    pub max_attempts: u32,
    /// Sleep before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Entry point for the calendar and assignment paths.
///
/// Holds no slot state of its own. Every call goes to the injected store.
pub struct Engine {
    store: Arc<dyn SlotStore>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(store: Arc<dyn SlotStore>) -> Self {
        Self::with_settings(store, EngineSettings::default())
    }

    pub fn with_settings(store: Arc<dyn SlotStore>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Insert managers one by one. Rows before a failing one stay inserted.
    pub async fn add_managers(&self, managers: &[SalesManager]) -> Result<usize, EngineError> {
        validate_batch(managers)?;
        for manager in managers {
            validate_manager(manager)?;
        }
        for manager in managers {
            self.store.insert_manager(manager).await?;
        }
        tracing::debug!(count = managers.len(), "managers added");
        Ok(managers.len())
    }

    /// Insert slots one by one. Rows before a failing one stay inserted.
    pub async fn add_slots(&self, slots: &[Slot]) -> Result<usize, EngineError> {
        validate_batch(slots)?;
        for slot in slots {
            validate_instant(slot.span.start)?;
            validate_instant(slot.span.end)?;
        }
        for slot in slots {
            self.store.insert_slot(slot).await?;
        }
        tracing::debug!(count = slots.len(), "slots added");
        Ok(slots.len())
    }

    pub async fn list_managers(&self) -> Result<Vec<SalesManager>, EngineError> {
        Ok(self.store.list_managers().await?)
    }

    pub async fn list_slots(&self, manager_id: Option<ManagerId>) -> Result<Vec<Slot>, EngineError> {
        Ok(self.store.list_slots(manager_id).await?)
    }

    pub async fn list_bookings(
        &self,
        manager_id: Option<ManagerId>,
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_bookings(manager_id).await?)
    }
}
