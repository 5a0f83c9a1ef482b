//! Runs against a real PostgreSQL when `SLOTMATCH_TEST_DATABASE_URL` is set,
//! and passes trivially otherwise.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;

use slotmatch::engine::{Engine, EngineError};
use slotmatch::model::*;
use slotmatch::store::{PgSlotStore, SlotStore, SlotTransaction, StoreError};

async fn store() -> Option<Arc<PgSlotStore>> {
    store_with_pool(8).await
}

async fn store_with_pool(pool_size: u32) -> Option<Arc<PgSlotStore>> {
    let url = std::env::var("SLOTMATCH_TEST_DATABASE_URL").ok()?;
    let store = PgSlotStore::connect(&url, pool_size, Duration::from_secs(2), Duration::from_secs(5))
        .await
        .unwrap();
    store.migrate().await.unwrap();
    Some(Arc::new(store))
}

/// Id base and a language tag no other run uses, so runs can share a database.
fn run_nonce() -> (i64, String) {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as i64;
    let base = (micros % 1_000_000_000_000) * 100;
    (base, format!("lang-{micros}"))
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 3).unwrap()
}

fn at(hour: u32) -> Ms {
    date().and_hms_opt(hour, 0, 0).unwrap().and_utc().timestamp_millis()
}

fn filter(language: &str) -> SlotFilter {
    SlotFilter {
        date: date(),
        language: language.to_string(),
        rating: "Gold".into(),
        products: vec!["SolarPanels".into()],
    }
}

async fn seed_manager(engine: &Engine, id: ManagerId, language: &str, slots: &[(SlotId, u32, bool)]) {
    engine
        .add_managers(&[SalesManager::new(
            id,
            Some(format!("Seller {id}")),
            vec![language.to_string()],
            vec!["SolarPanels".into(), "Heatpumps".into()],
            vec!["Gold".into()],
        )])
        .await
        .unwrap();
    let slots: Vec<Slot> = slots
        .iter()
        .map(|&(slot_id, hour, booked)| Slot::new(slot_id, id, at(hour), booked))
        .collect();
    engine.add_slots(&slots).await.unwrap();
}

fn load_of(managers: &[SalesManager], id: ManagerId) -> i64 {
    managers.iter().find(|m| m.id == id).unwrap().current_load
}

#[tokio::test]
async fn booking_commits_slot_booking_and_load_together() {
    let Some(store) = store().await else { return };
    let (base, language) = run_nonce();
    let engine = Engine::new(store);
    seed_manager(&engine, base, &language, &[(base, 10, true), (base + 1, 11, false)]).await;

    let calendar = engine.calendar(&filter(&language)).await.unwrap();
    assert_eq!(
        calendar,
        vec![CalendarEntry {
            start: at(11),
            available_count: 1
        }]
    );

    let booking_id = engine
        .assign(&BookingRequest {
            criteria: filter(&language),
            desired_start: at(11),
            customer_id: 77,
        })
        .await
        .unwrap();

    let slots = engine.list_slots(Some(base)).await.unwrap();
    assert!(slots.iter().all(|s| s.booked));

    let bookings = engine.list_bookings(Some(base)).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, booking_id);
    assert_eq!(bookings[0].span, Span::slot_at(at(11)));
    assert_eq!(bookings[0].customer_id, 77);

    assert_eq!(load_of(&engine.list_managers().await.unwrap(), base), 1);
    assert!(engine.calendar(&filter(&language)).await.unwrap().is_empty());
}

#[tokio::test]
async fn booked_start_is_a_conflict_with_no_side_effects() {
    let Some(store) = store().await else { return };
    let (base, language) = run_nonce();
    let engine = Engine::new(store);
    seed_manager(&engine, base, &language, &[(base, 10, true), (base + 1, 11, false)]).await;

    let result = engine
        .assign(&BookingRequest {
            criteria: filter(&language),
            desired_start: at(10),
            customer_id: 5,
        })
        .await;
    assert!(matches!(result, Err(EngineError::Conflict { .. })));

    assert!(engine.list_bookings(Some(base)).await.unwrap().is_empty());
    assert_eq!(load_of(&engine.list_managers().await.unwrap(), base), 0);
    let free: Vec<Slot> = engine
        .list_slots(Some(base))
        .await
        .unwrap()
        .into_iter()
        .filter(|s| !s.booked)
        .collect();
    assert_eq!(free.len(), 1);
}

#[tokio::test]
async fn unmatched_criteria_are_not_found() {
    let Some(store) = store().await else { return };
    let (_, language) = run_nonce();
    let engine = Engine::new(store);

    let result = engine
        .assign(&BookingRequest {
            criteria: filter(&language),
            desired_start: at(10),
            customer_id: 5,
        })
        .await;
    assert!(matches!(result, Err(EngineError::NotFound)));
}

#[tokio::test]
async fn dropped_transaction_releases_locks_and_writes() {
    let Some(store) = store().await else { return };
    let (base, language) = run_nonce();
    let engine = Engine::new(store.clone());
    seed_manager(&engine, base, &language, &[(base, 11, false)]).await;

    {
        let mut tx = store.begin().await.unwrap();
        let locked = tx.query_for_update(&filter(&language)).await.unwrap();
        assert_eq!(locked.len(), 1);
        tx.mark_booked(base).await.unwrap();
    }

    // The lock is gone, so the assignment neither waits out the lock timeout nor fails.
    let booking = tokio::time::timeout(
        Duration::from_secs(5),
        engine.assign(&BookingRequest {
            criteria: filter(&language),
            desired_start: at(11),
            customer_id: 9,
        }),
    )
    .await
    .unwrap();
    assert!(booking.is_ok());
    assert_eq!(engine.list_bookings(Some(base)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_assignments_book_each_slot_once() {
    let Some(store) = store().await else { return };
    let (base, language) = run_nonce();
    let engine = Arc::new(Engine::new(store));
    seed_manager(&engine, base, &language, &[(base, 11, false)]).await;
    seed_manager(&engine, base + 1, &language, &[(base + 10, 11, false)]).await;

    let mut handles = Vec::new();
    for customer in 0..6 {
        let engine = engine.clone();
        let criteria = filter(&language);
        handles.push(tokio::spawn(async move {
            engine
                .assign(&BookingRequest {
                    criteria,
                    desired_start: at(11),
                    customer_id: customer,
                })
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 2);

    let managers = engine.list_managers().await.unwrap();
    assert_eq!(load_of(&managers, base), 1);
    assert_eq!(load_of(&managers, base + 1), 1);
}

#[tokio::test]
async fn transactions_beyond_pool_size_wait_for_a_connection() {
    let Some(store) = store_with_pool(2).await else { return };
    let (base, language) = run_nonce();
    let engine = Arc::new(Engine::new(store));
    let hours: Vec<u32> = (8..14).collect();
    let slots: Vec<(SlotId, u32, bool)> = hours
        .iter()
        .map(|&h| (base + h as i64, h, false))
        .collect();
    seed_manager(&engine, base, &language, &slots).await;

    let mut handles = Vec::new();
    for &hour in &hours {
        let engine = engine.clone();
        let criteria = filter(&language);
        handles.push(tokio::spawn(async move {
            engine
                .assign(&BookingRequest {
                    criteria,
                    desired_start: at(hour),
                    customer_id: hour as i64,
                })
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(engine.list_bookings(Some(base)).await.unwrap().len(), hours.len());
    assert_eq!(load_of(&engine.list_managers().await.unwrap(), base), hours.len() as i64);
}

#[tokio::test]
async fn duplicate_and_orphan_rows_map_to_store_errors() {
    let Some(store) = store().await else { return };
    let (base, language) = run_nonce();
    let engine = Engine::new(store);
    seed_manager(&engine, base, &language, &[(base, 9, false)]).await;

    let dup = engine.add_slots(&[Slot::new(base, base, at(10), false)]).await;
    assert!(matches!(
        dup,
        Err(EngineError::Persistence(StoreError::Duplicate { table: "slots", .. }))
    ));

    let orphan = engine.add_slots(&[Slot::new(base + 1, base + 99, at(10), false)]).await;
    assert!(matches!(
        orphan,
        Err(EngineError::Persistence(StoreError::MissingRow { table: "sales_managers", .. }))
    ));
}
