use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::model::*;

use super::{SlotStore, SlotTransaction, StoreError};

const SLOT_COLUMNS: &str = "s.id::int8, s.sales_manager_id::int8, s.start_date, s.end_date, s.booked";

/// Shared by the plain and the locking read; `FOR UPDATE` is appended for the latter.
const MATCHING_SLOTS: &str = "
    FROM slots s
    JOIN sales_managers sm ON s.sales_manager_id = sm.id
    WHERE s.start_date >= $1 AND s.start_date < $2
      AND $3::varchar = ANY(sm.languages)
      AND $4::varchar = ANY(sm.customer_ratings)
      AND sm.products @> $5::varchar[]
    ORDER BY s.sales_manager_id, s.start_date";

/// PostgreSQL-backed store on a bounded connection pool.
///
/// Each transaction holds one pooled connection until it commits, rolls back
/// or is dropped. A dropped transaction is rolled back before its connection
/// is reused.
pub struct PgSlotStore {
    pool: PgPool,
    lock_timeout: Duration,
    statement_timeout: Duration,
}

impl PgSlotStore {
    /// Open a pool of at most `pool_size` connections. Waiting for a free
    /// connection is bounded by `statement_timeout`.
    pub async fn connect(
        url: &str,
        pool_size: u32,
        lock_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(statement_timeout)
            .idle_timeout(Some(Duration::from_secs(600)))
            .connect(url)
            .await?;
        Ok(Self::with_pool(pool, lock_timeout, statement_timeout))
    }

    pub fn with_pool(pool: PgPool, lock_timeout: Duration, statement_timeout: Duration) -> Self {
        Self {
            pool,
            lock_timeout,
            statement_timeout,
        }
    }

    /// DDL for the tables the store reads and writes.
    pub fn migrations() -> &'static [&'static str] {
        &[r#"
CREATE TABLE IF NOT EXISTS sales_managers (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(250),
    languages VARCHAR(100)[] NOT NULL DEFAULT '{}',
    products VARCHAR(100)[] NOT NULL DEFAULT '{}',
    customer_ratings VARCHAR(100)[] NOT NULL DEFAULT '{}',
    current_load BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS slots (
    id BIGSERIAL PRIMARY KEY,
    start_date TIMESTAMPTZ NOT NULL,
    end_date TIMESTAMPTZ NOT NULL,
    booked BOOLEAN NOT NULL DEFAULT false,
    sales_manager_id BIGINT NOT NULL REFERENCES sales_managers (id)
);
CREATE INDEX IF NOT EXISTS idx_slots_manager_start ON slots (sales_manager_id, start_date);
CREATE TABLE IF NOT EXISTS bookings (
    id BIGSERIAL PRIMARY KEY,
    sales_manager_id BIGINT NOT NULL REFERENCES sales_managers (id),
    start_date TIMESTAMPTZ NOT NULL,
    end_date TIMESTAMPTZ NOT NULL,
    customer_id BIGINT NOT NULL
);
CREATE OR REPLACE VIEW availability_view AS
    SELECT s.id, s.start_date, s.end_date, s.booked, s.sales_manager_id,
           sm.languages, sm.products, sm.customer_ratings
    FROM slots s
    JOIN sales_managers sm ON s.sales_manager_id = sm.id;
"#]
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in Self::migrations() {
            sqlx::raw_sql(statement).execute(&self.pool).await?;
        }
        tracing::info!("postgres schema is up to date");
        Ok(())
    }
}

fn to_timestamp(ms: Ms) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(StoreError::InvalidInstant(ms))
}

fn slot_from_row(row: &PgRow) -> Result<Slot, StoreError> {
    let start: DateTime<Utc> = row.try_get(2)?;
    let end: DateTime<Utc> = row.try_get(3)?;
    Ok(Slot {
        id: row.try_get(0)?,
        manager_id: row.try_get(1)?,
        span: Span::new(start.timestamp_millis(), end.timestamp_millis()),
        booked: row.try_get(4)?,
    })
}

/// Map constraint violations on insert to the store's own row errors.
fn insert_error(
    e: sqlx::Error,
    table: &'static str,
    id: i64,
    parent: Option<(&'static str, i64)>,
) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return StoreError::Duplicate { table, id };
        }
        if let Some((parent_table, parent_id)) = parent
            && db_err.is_foreign_key_violation()
        {
            return StoreError::MissingRow {
                table: parent_table,
                id: parent_id,
            };
        }
    }
    StoreError::Database(e)
}

fn matching_slots_sql(for_update: bool) -> String {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    format!("SELECT {SLOT_COLUMNS}{MATCHING_SLOTS}{lock}")
}

#[async_trait]
impl SlotStore for PgSlotStore {
    async fn query_availability(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        let day = filter.day_span();
        let rows = sqlx::query(&matching_slots_sql(false))
            .bind(to_timestamp(day.start)?)
            .bind(to_timestamp(day.end)?)
            .bind(&filter.language)
            .bind(&filter.rating)
            .bind(&filter.products)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn SlotTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $2, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn insert_manager(&self, manager: &SalesManager) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sales_managers (id, name, languages, products, customer_ratings, current_load)
             VALUES ($1, $2, $3::varchar[], $4::varchar[], $5::varchar[], $6)",
        )
        .bind(manager.id)
        .bind(&manager.name)
        .bind(&manager.languages)
        .bind(&manager.products)
        .bind(&manager.customer_ratings)
        .bind(manager.current_load)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "sales_managers", manager.id, None))?;
        Ok(())
    }

    async fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO slots (id, sales_manager_id, start_date, end_date, booked)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(slot.id)
        .bind(slot.manager_id)
        .bind(to_timestamp(slot.span.start)?)
        .bind(to_timestamp(slot.span.end)?)
        .bind(slot.booked)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "slots", slot.id, Some(("sales_managers", slot.manager_id))))?;
        Ok(())
    }

    async fn list_managers(&self) -> Result<Vec<SalesManager>, StoreError> {
        let rows = sqlx::query(
            "SELECT id::int8, name::text, languages::text[], products::text[],
                    customer_ratings::text[], current_load::int8
             FROM sales_managers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<SalesManager, StoreError> {
                Ok(SalesManager {
                    id: row.try_get(0)?,
                    name: row.try_get(1)?,
                    languages: row.try_get(2)?,
                    products: row.try_get(3)?,
                    customer_ratings: row.try_get(4)?,
                    current_load: row.try_get(5)?,
                })
            })
            .collect()
    }

    async fn list_slots(&self, manager_id: Option<ManagerId>) -> Result<Vec<Slot>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM slots s
             WHERE $1::int8 IS NULL OR s.sales_manager_id = $1::int8
             ORDER BY s.sales_manager_id, s.start_date"
        ))
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn list_bookings(
        &self,
        manager_id: Option<ManagerId>,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query(
            "SELECT id::int8, sales_manager_id::int8, start_date, end_date, customer_id::int8
             FROM bookings
             WHERE $1::int8 IS NULL OR sales_manager_id = $1::int8
             ORDER BY id",
        )
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<Booking, StoreError> {
                let start: DateTime<Utc> = row.try_get(2)?;
                let end: DateTime<Utc> = row.try_get(3)?;
                Ok(Booking {
                    id: row.try_get(0)?,
                    manager_id: row.try_get(1)?,
                    span: Span::new(start.timestamp_millis(), end.timestamp_millis()),
                    customer_id: row.try_get(4)?,
                })
            })
            .collect()
    }
}

/// An open transaction on one pooled connection.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SlotTransaction for PgTransaction {
    async fn query_for_update(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        let day = filter.day_span();
        let rows = sqlx::query(&matching_slots_sql(true))
            .bind(to_timestamp(day.start)?)
            .bind(to_timestamp(day.end)?)
            .bind(&filter.language)
            .bind(&filter.rating)
            .bind(&filter.products)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn mark_booked(&mut self, slot_id: SlotId) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE slots SET booked = true WHERE id = $1")
            .bind(slot_id)
            .execute(&mut *self.tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::MissingRow {
                table: "slots",
                id: slot_id,
            });
        }
        Ok(())
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, StoreError> {
        let row = sqlx::query(
            "INSERT INTO bookings (sales_manager_id, start_date, end_date, customer_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id::int8",
        )
        .bind(booking.manager_id)
        .bind(to_timestamp(booking.span.start)?)
        .bind(to_timestamp(booking.span.end)?)
        .bind(booking.customer_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn increment_load(&mut self, manager_id: ManagerId) -> Result<(), StoreError> {
        let updated =
            sqlx::query("UPDATE sales_managers SET current_load = current_load + 1 WHERE id = $1")
                .bind(manager_id)
                .execute(&mut *self.tx)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::MissingRow {
                table: "sales_managers",
                id: manager_id,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
