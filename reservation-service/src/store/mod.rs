//! Durable state for subjects, reservations, carts and pending orders.
//!
//! Every method that reads and then writes does so as one atomic unit, so
//! callers never need to hold their own locks. Reservations are never
//! deleted; they end in a terminal status and stay for audit.

mod memory;
mod postgres;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryReservationStore;
pub use postgres::{run_migrations, DbPool, PgReservationStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{CartItem, Order, Reservation, ReservationStatus, Subject, SubjectType};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
    pub owner_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// How a cart line's quantity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineQuantity {
    /// Grows the line, creating it if the owner has none for the subject.
    Add(i32),
    /// Sets an existing line to exactly this quantity.
    Set(i32),
}

#[derive(Debug, Clone)]
pub struct CartLineHold {
    pub owner_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: LineQuantity,
    pub expires_at: DateTime<Utc>,
}

/// Raw stock and what live reservations hold, read at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub subject: Subject,
    pub reserved: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// This call moved the reservation from active to released.
    Released(Reservation),
    /// Someone else got there first; nothing changed.
    AlreadyTerminal(ReservationStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(Reservation),
    /// Was active but past its expiry; it has now been marked expired.
    Lapsed,
    NotActive(ReservationStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Order),
    AlreadyCancelled(Order),
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn subject(&self, subject_id: Uuid) -> Result<Option<Subject>>;

    async fn upsert_subject(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity_on_hand: i32,
        now: DateTime<Utc>,
    ) -> Result<Subject>;

    async fn restock(&self, subject_id: Uuid, delta: i32, now: DateTime<Utc>) -> Result<Subject>;

    /// Sum of quantities held by live reservations: active with `expires_at > now`.
    async fn reserved_quantity(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<i64>;

    /// `None` for unknown subjects.
    async fn stock_level(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Option<StockLevel>>;

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>>;

    /// Checks capacity and inserts an active reservation in one step.
    ///
    /// When `replaces` names an active reservation on the same subject, it is
    /// released inside the same step and its quantity does not count against
    /// the new one. A `replaces` that is no longer active is `InvalidState`.
    /// If any check fails nothing changes.
    async fn reserve(
        &self,
        new: NewReservation,
        replaces: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    async fn extend(&self, id: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<ExtendOutcome>;

    /// Compare-and-set `active -> released`. `NotFound` only for unknown ids.
    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome>;

    /// Compare-and-set `active -> expired`, only if the expiry has passed.
    async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Commits every reservation or none: stock is decremented and each
    /// reservation marked committed together.
    async fn commit(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Reservation>>;

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>>;

    async fn cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>>;

    async fn cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>>;

    /// Creates or resizes the owner's line for a subject and swaps its hold
    /// for one of the new total, all in one step. The line's previous hold
    /// does not count against the new one. `Set` on a missing line is
    /// `NotFound`; if the total does not fit nothing changes.
    async fn hold_cart_line(&self, line: CartLineHold, now: DateTime<Utc>) -> Result<CartItem>;

    /// Clears the line's hold only if it still points at `reservation_id`.
    async fn detach_cart_hold(
        &self,
        owner_id: Uuid,
        subject_id: Uuid,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn remove_cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>>;

    async fn clear_cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>>;

    async fn order(&self, id: Uuid) -> Result<Option<Order>>;

    /// Moves every cart item into a pending order and holds its reservation
    /// until `payment_deadline`. Fails without changes if any item has lost
    /// its hold.
    async fn place_order(
        &self,
        owner_id: Uuid,
        payment_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Order>;

    /// Commits all lines and confirms the order, or changes nothing.
    async fn finalize_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<Order>;

    async fn cancel_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome>;

    async fn lapsed_orders(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>>;
}
