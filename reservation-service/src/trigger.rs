//! Callers of [`ExpirySweeper::sweep`].
//!
//! The HTTP trigger, hit by an external scheduler, is the authoritative one.
//! [`SweepTicker`] is an optional in-process timer that only helps while this
//! instance is up; nothing relies on it. Neither holds state or a lock.
//! Overlapping calls are harmless because every sweep step is idempotent.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

use crate::error::{ReservationError, Result};
use crate::secret::{bearer_token, SharedSecret};
use crate::sweeper::{ExpirySweeper, SweepReport};

#[derive(Clone)]
pub struct SweepTrigger {
    sweeper: Arc<ExpirySweeper>,
    secret: SharedSecret,
}

impl SweepTrigger {
    pub fn new(sweeper: Arc<ExpirySweeper>, secret: SharedSecret) -> Self {
        Self { sweeper, secret }
    }

    /// Sweeps only if `authorization` carries the configured bearer token.
    pub async fn trigger(&self, authorization: Option<&str>) -> Result<SweepReport> {
        let authorized = authorization
            .and_then(bearer_token)
            .map_or(false, |token| self.secret.verify(token));
        if !authorized {
            warn!("Rejected sweep trigger with missing or wrong token");
            return Err(ReservationError::Unauthorized);
        }
        Ok(self.sweeper.sweep().await)
    }
}

pub struct SweepTicker {
    sweeper: Arc<ExpirySweeper>,
    period: Duration,
}

impl SweepTicker {
    pub fn new(sweeper: Arc<ExpirySweeper>, period: Duration) -> Self {
        Self { sweeper, period }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!("Advisory sweep ticker running every {:?}", self.period);

        loop {
            interval.tick().await;

            let report = self.sweeper.sweep().await;
            if !report.failures.is_empty() {
                warn!("Ticker sweep finished with {} failures", report.failures.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::manager::ReservationManager;
    use crate::store::{MemoryReservationStore, ReservationStore};
    use crate::sweeper::SweepSettings;
    use chrono::Utc;
    use shared::{ReservationStatus, SubjectType};
    use uuid::Uuid;

    #[tokio::test]
    async fn wrong_token_sweeps_nothing() {
        let store = Arc::new(MemoryReservationStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ReservationManager::new(store.clone(), clock.clone());
        let subject_id = Uuid::new_v4();
        store
            .upsert_subject(SubjectType::Product, subject_id, 1, Utc::now())
            .await
            .unwrap();
        let reservation = manager
            .reserve(SubjectType::Product, subject_id, 1, Uuid::new_v4(), chrono::Duration::seconds(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));

        let trigger = SweepTrigger::new(
            Arc::new(ExpirySweeper::new(manager, SweepSettings::default())),
            SharedSecret::new("cron"),
        );

        assert!(matches!(trigger.trigger(None).await, Err(ReservationError::Unauthorized)));
        assert!(matches!(
            trigger.trigger(Some("Bearer nope")).await,
            Err(ReservationError::Unauthorized)
        ));
        let untouched = store.reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ReservationStatus::Active);

        let report = trigger.trigger(Some("Bearer cron")).await.unwrap();
        assert_eq!(report.released_count, 1);
    }
}
