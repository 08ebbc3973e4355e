//! Administrative operations on stock and reservations.
//!
//! Authorization happens before any of these run. The HTTP layer checks the
//! admin token through [`AdminGate`] and hands over an [`AdminCapability`];
//! the operations only require that value and never look at roles or
//! tokens themselves.

use shared::{Reservation, Subject, SubjectType};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::manager::ReservationManager;
use crate::secret::SharedSecret;
use crate::store::ReleaseOutcome;

/// Proof that the caller was approved as an administrator.
#[derive(Debug, Clone)]
pub struct AdminCapability {
    actor: String,
}

impl AdminCapability {
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

/// The only place an [`AdminCapability`] can be minted.
#[derive(Debug, Clone)]
pub struct AdminGate {
    secret: SharedSecret,
}

impl AdminGate {
    pub fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }

    pub fn authorize(&self, presented: &str, actor: impl Into<String>) -> Result<AdminCapability> {
        let actor = actor.into();
        if !self.secret.verify(presented) {
            warn!("Rejected admin call from {}", actor);
            return Err(ReservationError::Unauthorized);
        }
        Ok(AdminCapability { actor })
    }
}

#[derive(Clone)]
pub struct AdminService {
    manager: ReservationManager,
}

impl AdminService {
    pub fn new(manager: ReservationManager) -> Self {
        Self { manager }
    }

    pub async fn upsert_subject(
        &self,
        cap: &AdminCapability,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity_on_hand: i32,
    ) -> Result<Subject> {
        if quantity_on_hand < 0 {
            return Err(ReservationError::InvalidInput("stock cannot be negative".to_string()));
        }
        let now = self.manager.clock().now();
        let subject = self
            .manager
            .store()
            .upsert_subject(subject_type, subject_id, quantity_on_hand, now)
            .await?;
        info!(
            "{} set stock of {} {} to {}",
            cap.actor(), subject_type, subject_id, quantity_on_hand
        );
        Ok(subject)
    }

    pub async fn restock(&self, cap: &AdminCapability, subject_id: Uuid, quantity: i32) -> Result<Subject> {
        if quantity <= 0 {
            return Err(ReservationError::InvalidInput("restock quantity must be positive".to_string()));
        }
        let now = self.manager.clock().now();
        let subject = self.manager.store().restock(subject_id, quantity, now).await?;
        info!(
            "{} restocked {} by {} (now {})",
            cap.actor(), subject_id, quantity, subject.quantity_on_hand
        );
        Ok(subject)
    }

    /// Idempotent, like every release.
    pub async fn force_release(&self, cap: &AdminCapability, reservation_id: Uuid) -> Result<Reservation> {
        let outcome = self.manager.release(reservation_id).await?;
        if let ReleaseOutcome::Released(_) = outcome {
            info!("{} force-released reservation {}", cap.actor(), reservation_id);
        }
        self.manager
            .store()
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("reservation", reservation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryReservationStore;
    use chrono::Duration;
    use shared::ReservationStatus;
    use std::sync::Arc;

    fn service() -> (AdminService, AdminCapability) {
        let manager = ReservationManager::new(Arc::new(MemoryReservationStore::new()), Arc::new(SystemClock));
        let cap = AdminGate::new(SharedSecret::new("admin"))
            .authorize("admin", "ops@example.test")
            .unwrap();
        (AdminService::new(manager), cap)
    }

    #[test]
    fn gate_rejects_wrong_token() {
        let gate = AdminGate::new(SharedSecret::new("admin"));
        assert!(matches!(gate.authorize("nope", "someone"), Err(ReservationError::Unauthorized)));
        assert_eq!(gate.authorize("admin", "ops").unwrap().actor(), "ops");
    }

    #[tokio::test]
    async fn restock_increments_raw_stock() {
        let (admin, cap) = service();
        let subject_id = Uuid::new_v4();
        admin
            .upsert_subject(&cap, SubjectType::Product, subject_id, 3)
            .await
            .unwrap();
        let subject = admin.restock(&cap, subject_id, 4).await.unwrap();
        assert_eq!(subject.quantity_on_hand, 7);

        assert!(matches!(
            admin.restock(&cap, subject_id, 0).await,
            Err(ReservationError::InvalidInput(_))
        ));
        assert!(matches!(
            admin.restock(&cap, Uuid::new_v4(), 1).await,
            Err(ReservationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn force_release_is_idempotent() {
        let (admin, cap) = service();
        let subject_id = Uuid::new_v4();
        admin
            .upsert_subject(&cap, SubjectType::FlashSaleItem, subject_id, 1)
            .await
            .unwrap();
        let reservation = admin
            .manager
            .reserve(SubjectType::FlashSaleItem, subject_id, 1, Uuid::new_v4(), Duration::minutes(5))
            .await
            .unwrap();

        let first = admin.force_release(&cap, reservation.id).await.unwrap();
        let second = admin.force_release(&cap, reservation.id).await.unwrap();
        assert_eq!(first.status, ReservationStatus::Released);
        assert_eq!(second, first);
    }
}
