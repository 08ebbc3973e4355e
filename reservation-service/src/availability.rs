//! Read-side view of stock: raw on-hand minus what live reservations hold.
//!
//! A reservation that is still `active` but past `expires_at` is ignored here
//! even before the sweeper gets to it. The store applies the same rule when
//! it checks capacity, and reads stock and holds at one instant, so what the
//! storefront shows and what can actually be reserved never disagree.

use shared::AvailabilitySnapshot;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ReservationError, Result};
use crate::store::ReservationStore;

#[derive(Clone)]
pub struct AvailabilityCalculator {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
}

impl AvailabilityCalculator {
    pub fn new(store: Arc<dyn ReservationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn available_quantity(&self, subject_id: Uuid) -> Result<i32> {
        Ok(self.snapshot(subject_id).await?.quantity_available)
    }

    pub async fn snapshot(&self, subject_id: Uuid) -> Result<AvailabilitySnapshot> {
        let level = self
            .store
            .stock_level(subject_id, self.clock.now())
            .await?
            .ok_or_else(|| ReservationError::not_found("subject", subject_id))?;

        let on_hand = level.subject.quantity_on_hand;
        let available = (i64::from(on_hand) - level.reserved).max(0);
        Ok(AvailabilitySnapshot {
            subject_id,
            quantity_available: i32::try_from(available).unwrap_or(i32::MAX),
            actual_quantity: on_hand,
            reserved_quantity: level.reserved,
        })
    }
}
