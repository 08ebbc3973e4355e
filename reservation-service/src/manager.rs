use chrono::Duration;
use shared::{Reservation, ReservationStatus, SubjectType};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ReservationError, Result};
use crate::store::{ExtendOutcome, NewReservation, ReleaseOutcome, ReservationStore};

const DEFAULT_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Create, extend, release and commit reservations.
///
/// Holds no state of its own; the store is the only coordination point, so
/// any number of managers may run side by side.
#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    retry_backoff: std::time::Duration,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn ReservationStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn reserve(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity: i32,
        owner_id: Uuid,
        ttl: Duration,
    ) -> Result<Reservation> {
        validate(quantity, ttl)?;

        let reservation = self
            .retry_once("reserve", || {
                let now = self.clock.now();
                let new = NewReservation {
                    subject_type,
                    subject_id,
                    quantity,
                    owner_id,
                    expires_at: now + ttl,
                };
                self.store.reserve(new, None, now)
            })
            .await?;

        info!(
            "Reserved {} of {} for owner {} as {}",
            quantity, subject_id, owner_id, reservation.id
        );
        Ok(reservation)
    }

    /// Swaps an active reservation for one of a different quantity. If the
    /// new quantity does not fit, the original stays exactly as it was.
    pub async fn resize(&self, reservation_id: Uuid, quantity: i32, ttl: Duration) -> Result<Reservation> {
        validate(quantity, ttl)?;

        let current = self
            .store
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("reservation", reservation_id))?;

        let resized = self
            .retry_once("resize", || {
                let now = self.clock.now();
                let new = NewReservation {
                    subject_type: current.subject_type,
                    subject_id: current.subject_id,
                    quantity,
                    owner_id: current.owner_id,
                    expires_at: now + ttl,
                };
                self.store.reserve(new, Some(reservation_id), now)
            })
            .await?;

        info!(
            "Resized reservation {} ({} -> {}) as {}",
            reservation_id, current.quantity, quantity, resized.id
        );
        Ok(resized)
    }

    pub async fn extend(&self, reservation_id: Uuid, ttl: Duration) -> Result<Reservation> {
        if ttl <= Duration::zero() {
            return Err(ReservationError::InvalidInput("ttl must be positive".to_string()));
        }

        let now = self.clock.now();
        match self.store.extend(reservation_id, now + ttl, now).await? {
            ExtendOutcome::Extended(reservation) => {
                debug!("Extended reservation {} until {:?}", reservation_id, reservation.expires_at);
                Ok(reservation)
            }
            ExtendOutcome::Lapsed => {
                info!("Reservation {} lapsed before it could be extended", reservation_id);
                Err(ReservationError::not_found("reservation", reservation_id))
            }
            ExtendOutcome::NotActive(_) => Err(ReservationError::not_found("reservation", reservation_id)),
        }
    }

    /// Idempotent: releasing a reservation that is already terminal is a no-op.
    pub async fn release(&self, reservation_id: Uuid) -> Result<ReleaseOutcome> {
        let outcome = self.store.release(reservation_id, self.clock.now()).await?;
        match &outcome {
            ReleaseOutcome::Released(reservation) => info!(
                "Released reservation {} ({} of {})",
                reservation_id, reservation.quantity, reservation.subject_id
            ),
            ReleaseOutcome::AlreadyTerminal(status) => {
                debug!("Reservation {} already {}, nothing to release", reservation_id, status)
            }
        }
        Ok(outcome)
    }

    /// Turns the hold into a permanent stock decrement.
    pub async fn commit(&self, reservation_id: Uuid) -> Result<Reservation> {
        let now = self.clock.now();
        let current = self
            .store
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("reservation", reservation_id))?;

        if current.status != ReservationStatus::Active {
            return Err(ReservationError::invalid_state(
                reservation_id,
                format!("reservation is {}", current.status),
            ));
        }
        if current.has_lapsed(now) {
            if self.store.expire(reservation_id, now).await? {
                info!("Reservation {} expired at commit time", reservation_id);
            }
            return Err(ReservationError::invalid_state(reservation_id, "reservation has expired"));
        }

        let ids = [reservation_id];
        let committed = self
            .retry_once("commit", || self.store.commit(&ids, self.clock.now()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ReservationError::not_found("reservation", reservation_id))?;

        info!(
            "Committed reservation {} ({} of {})",
            reservation_id, committed.quantity, committed.subject_id
        );
        Ok(committed)
    }

    /// Retries exactly once, after a short pause, when the store reports a
    /// serialization conflict. Any other outcome is returned as is.
    pub(crate) async fn retry_once<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match attempt().await {
            Err(err) if err.is_retryable() => {
                warn!("{} hit a transaction conflict, retrying once", operation);
                tokio::time::sleep(self.retry_backoff).await;
                attempt().await
            }
            other => other,
        }
    }
}

fn validate(quantity: i32, ttl: Duration) -> Result<()> {
    if quantity <= 0 {
        return Err(ReservationError::InvalidInput("quantity must be positive".to_string()));
    }
    if ttl <= Duration::zero() {
        return Err(ReservationError::InvalidInput("ttl must be positive".to_string()));
    }
    Ok(())
}
