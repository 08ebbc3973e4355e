use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{CartItem, Order, Reservation, Subject, SubjectType};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{
    CancelOutcome, CartLineHold, ExtendOutcome, MemoryReservationStore, NewReservation,
    ReleaseOutcome, ReservationStore, StockLevel,
};
use crate::error::{ReservationError, Result};

/// Memory store with knobs for interleaving and failures.
#[derive(Default)]
pub(crate) struct InstrumentedStore {
    pub inner: MemoryReservationStore,
    /// Sleeps before every call so concurrent callers interleave.
    pub delay: Option<Duration>,
    /// Releasing this id fails as if the connection dropped.
    pub failing_release: Option<Uuid>,
    /// Committed as soon as the next stock read returns.
    pub commit_after_next_read: Mutex<Option<(Vec<Uuid>, DateTime<Utc>)>>,
}

impl InstrumentedStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn after_read(&self) -> Result<()> {
        let pending = self
            .commit_after_next_read
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((ids, now)) = pending {
            self.inner.commit(&ids, now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for InstrumentedStore {
    async fn subject(&self, subject_id: Uuid) -> Result<Option<Subject>> {
        self.pause().await;
        let subject = self.inner.subject(subject_id).await?;
        self.after_read().await?;
        Ok(subject)
    }

    async fn upsert_subject(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity_on_hand: i32,
        now: DateTime<Utc>,
    ) -> Result<Subject> {
        self.pause().await;
        self.inner
            .upsert_subject(subject_type, subject_id, quantity_on_hand, now)
            .await
    }

    async fn restock(&self, subject_id: Uuid, delta: i32, now: DateTime<Utc>) -> Result<Subject> {
        self.pause().await;
        self.inner.restock(subject_id, delta, now).await
    }

    async fn reserved_quantity(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        self.pause().await;
        let reserved = self.inner.reserved_quantity(subject_id, now).await?;
        self.after_read().await?;
        Ok(reserved)
    }

    async fn stock_level(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Option<StockLevel>> {
        self.pause().await;
        let level = self.inner.stock_level(subject_id, now).await?;
        self.after_read().await?;
        Ok(level)
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        self.pause().await;
        self.inner.reservation(id).await
    }

    async fn reserve(
        &self,
        new: NewReservation,
        replaces: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        self.pause().await;
        self.inner.reserve(new, replaces, now).await
    }

    async fn extend(&self, id: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<ExtendOutcome> {
        self.pause().await;
        self.inner.extend(id, expires_at, now).await
    }

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome> {
        self.pause().await;
        if self.failing_release == Some(id) {
            return Err(ReservationError::Storage("connection reset".to_string()));
        }
        self.inner.release(id, now).await
    }

    async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.pause().await;
        self.inner.expire(id, now).await
    }

    async fn commit(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        self.pause().await;
        self.inner.commit(ids, now).await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        self.pause().await;
        self.inner.expired_reservations(now, limit).await
    }

    async fn cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        self.pause().await;
        self.inner.cart(owner_id).await
    }

    async fn cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        self.pause().await;
        self.inner.cart_item(owner_id, subject_id).await
    }

    async fn hold_cart_line(&self, line: CartLineHold, now: DateTime<Utc>) -> Result<CartItem> {
        self.pause().await;
        self.inner.hold_cart_line(line, now).await
    }

    async fn detach_cart_hold(
        &self,
        owner_id: Uuid,
        subject_id: Uuid,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.pause().await;
        self.inner
            .detach_cart_hold(owner_id, subject_id, reservation_id, now)
            .await
    }

    async fn remove_cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        self.pause().await;
        self.inner.remove_cart_item(owner_id, subject_id).await
    }

    async fn clear_cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        self.pause().await;
        self.inner.clear_cart(owner_id).await
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        self.pause().await;
        self.inner.order(id).await
    }

    async fn place_order(
        &self,
        owner_id: Uuid,
        payment_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        self.pause().await;
        self.inner.place_order(owner_id, payment_deadline, now).await
    }

    async fn finalize_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<Order> {
        self.pause().await;
        self.inner.finalize_order(id, now).await
    }

    async fn cancel_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        self.pause().await;
        self.inner.cancel_order(id, now).await
    }

    async fn lapsed_orders(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        self.pause().await;
        self.inner.lapsed_orders(now, limit).await
    }
}
