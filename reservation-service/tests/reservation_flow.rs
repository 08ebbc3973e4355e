use chrono::{Duration, Utc};
use reservation_service::availability::AvailabilityCalculator;
use reservation_service::cart::CartService;
use reservation_service::clock::{Clock, ManualClock};
use reservation_service::error::ReservationError;
use reservation_service::manager::ReservationManager;
use reservation_service::store::{MemoryReservationStore, ReleaseOutcome, ReservationStore};
use reservation_service::sweeper::{ExpirySweeper, SweepSettings};
use shared::{OrderStatus, ReservationStatus, SubjectType};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryReservationStore>,
    clock: Arc<ManualClock>,
    manager: ReservationManager,
    availability: AvailabilityCalculator,
    sweeper: ExpirySweeper,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryReservationStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ReservationManager::new(store.clone(), clock.clone());
        Self {
            availability: AvailabilityCalculator::new(store.clone(), clock.clone()),
            sweeper: ExpirySweeper::new(manager.clone(), SweepSettings::default()),
            store,
            clock,
            manager,
        }
    }

    async fn subject(&self, quantity: i32) -> Uuid {
        let subject_id = Uuid::new_v4();
        self.store
            .upsert_subject(SubjectType::Product, subject_id, quantity, self.clock.now())
            .await
            .unwrap();
        subject_id
    }

    fn cart(&self) -> CartService {
        CartService::new(self.manager.clone(), Duration::minutes(10), Duration::minutes(15))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_oversell() {
    let h = Harness::new();
    let subject_id = h.subject(7).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::minutes(5))
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(ReservationError::InsufficientStock { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 7);
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn three_shoppers_racing_for_five_units() {
    let h = Harness::new();
    let subject_id = h.subject(5).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .reserve(SubjectType::Product, subject_id, 2, Uuid::new_v4(), Duration::minutes(5))
                .await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 2);

    h.manager
        .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 0);
}

#[tokio::test]
async fn release_twice_changes_nothing_the_second_time() {
    let h = Harness::new();
    let subject_id = h.subject(3).await;
    let reservation = h
        .manager
        .reserve(SubjectType::Product, subject_id, 2, Uuid::new_v4(), Duration::minutes(5))
        .await
        .unwrap();

    assert!(matches!(
        h.manager.release(reservation.id).await.unwrap(),
        ReleaseOutcome::Released(_)
    ));
    assert!(matches!(
        h.manager.release(reservation.id).await.unwrap(),
        ReleaseOutcome::AlreadyTerminal(ReservationStatus::Released)
    ));
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 3);
}

#[tokio::test]
async fn lapsed_holds_stop_counting_before_any_sweep() {
    let h = Harness::new();
    let subject_id = h.subject(2).await;
    h.manager
        .reserve(SubjectType::Product, subject_id, 2, Uuid::new_v4(), Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 0);

    h.clock.advance(Duration::seconds(31));

    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 2);
    h.manager
        .reserve(SubjectType::Product, subject_id, 2, Uuid::new_v4(), Duration::seconds(30))
        .await
        .unwrap();
}

#[tokio::test]
async fn commit_decrements_stock_once() {
    let h = Harness::new();
    let subject_id = h.subject(4).await;
    let reservation = h
        .manager
        .reserve(SubjectType::Product, subject_id, 3, Uuid::new_v4(), Duration::minutes(5))
        .await
        .unwrap();

    let committed = h.manager.commit(reservation.id).await.unwrap();
    assert_eq!(committed.status, ReservationStatus::Committed);
    assert_eq!(committed.expires_at, None);

    let snapshot = h.availability.snapshot(subject_id).await.unwrap();
    assert_eq!(snapshot.actual_quantity, 1);
    assert_eq!(snapshot.reserved_quantity, 0);
    assert_eq!(snapshot.quantity_available, 1);

    assert!(matches!(
        h.manager.commit(reservation.id).await,
        Err(ReservationError::InvalidState { .. })
    ));
    assert_eq!(h.availability.snapshot(subject_id).await.unwrap().actual_quantity, 1);
}

#[tokio::test]
async fn sweep_converges_after_one_pass() {
    let h = Harness::new();
    let subject_id = h.subject(10).await;
    for _ in 0..4 {
        h.manager
            .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::seconds(10))
            .await
            .unwrap();
    }
    h.manager
        .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::minutes(10))
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(11));

    let first = h.sweeper.sweep().await;
    assert_eq!(first.released_count, 4);
    assert!(first.failures.is_empty());

    let second = h.sweeper.sweep().await;
    assert_eq!(second.released_count, 0);
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_sweeps_count_each_release_once() {
    let h = Harness::new();
    let subject_id = h.subject(50).await;
    for _ in 0..30 {
        h.manager
            .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::seconds(10))
            .await
            .unwrap();
    }
    h.clock.advance(Duration::seconds(11));

    let sweeps: Vec<_> = (0..4)
        .map(|_| {
            let sweeper = h.sweeper.clone();
            tokio::spawn(async move { sweeper.sweep().await })
        })
        .collect();

    let mut released = 0;
    for sweep in sweeps {
        let report = sweep.await.unwrap();
        assert!(report.failures.is_empty());
        released += report.released_count;
    }

    assert_eq!(released, 30);
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 50);
}

#[tokio::test]
async fn one_second_hold_is_released_by_the_sweep() {
    let h = Harness::new();
    let subject_id = h.subject(1).await;
    let reservation = h
        .manager
        .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), Duration::seconds(1))
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(2));

    let report = h.sweeper.sweep().await;
    assert_eq!(report.released_count, 1);

    let swept = h.store.reservation(reservation.id).await.unwrap().unwrap();
    assert_eq!(swept.status, ReservationStatus::Released);
    assert_eq!(swept.expires_at, None);
}

#[tokio::test]
async fn finalize_is_all_or_nothing() {
    let h = Harness::new();
    let cart = h.cart();
    let owner_id = Uuid::new_v4();
    let plenty = h.subject(10).await;
    let scarce = h.subject(2).await;

    cart.add_item(owner_id, SubjectType::Product, plenty, 3).await.unwrap();
    cart.add_item(owner_id, SubjectType::Product, scarce, 2).await.unwrap();
    let order = cart.place_order(owner_id).await.unwrap();
    assert_eq!(order.lines.len(), 2);

    // stock shrinks underneath the pending order
    h.store
        .upsert_subject(SubjectType::Product, scarce, 1, h.clock.now())
        .await
        .unwrap();

    assert!(matches!(
        cart.finalize_order(order.id).await,
        Err(ReservationError::InsufficientStock { .. })
    ));

    assert_eq!(h.availability.snapshot(plenty).await.unwrap().actual_quantity, 10);
    for line in &order.lines {
        let reservation = h.store.reservation(line.reservation_id).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Active);
    }
    assert_eq!(cart.order(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn unpaid_order_is_cancelled_by_the_sweep() {
    let h = Harness::new();
    let cart = h.cart();
    let owner_id = Uuid::new_v4();
    let subject_id = h.subject(3).await;

    cart.add_item(owner_id, SubjectType::Product, subject_id, 3).await.unwrap();
    let order = cart.place_order(owner_id).await.unwrap();

    // past the cart ttl but inside the payment window
    h.clock.advance(Duration::minutes(12));
    assert_eq!(h.sweeper.sweep().await.released_count, 0);
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 0);

    h.clock.advance(Duration::minutes(4));
    let report = h.sweeper.sweep().await;
    assert_eq!(report.cancelled_order_count, 1);

    assert_eq!(cart.order(order.id).await.unwrap().status, OrderStatus::Cancelled);
    assert_eq!(h.availability.available_quantity(subject_id).await.unwrap(), 3);
    assert_eq!(h.sweeper.sweep().await.cancelled_order_count, 0);
}
