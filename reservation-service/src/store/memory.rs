use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    CartItem, Order, OrderLine, OrderStatus, Reservation, ReservationStatus, Subject, SubjectType,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CancelOutcome, CartLineHold, ExtendOutcome, LineQuantity, NewReservation, ReleaseOutcome,
    ReservationStore, StockLevel,
};
use crate::error::{ReservationError, Result};

/// Keeps every table behind one mutex, which serialises writers the way the
/// subject row lock does in Postgres. Used by tests and `--in-memory` runs.
#[derive(Default)]
pub struct MemoryReservationStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    inventory: HashMap<Uuid, Subject>,
    reservations: HashMap<Uuid, Reservation>,
    cart_items: HashMap<(Uuid, Uuid), CartItem>,
    orders: HashMap<Uuid, Order>,
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn live_reserved(&self, subject_id: Uuid, now: DateTime<Utc>, excluding: &[Uuid]) -> i64 {
        self.reservations
            .values()
            .filter(|r| r.subject_id == subject_id && r.is_live(now) && !excluding.contains(&r.id))
            .map(|r| i64::from(r.quantity))
            .sum()
    }

    fn subject(&self, subject_id: Uuid) -> Result<&Subject> {
        self.inventory
            .get(&subject_id)
            .ok_or_else(|| ReservationError::not_found("subject", subject_id))
    }

    fn release(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome> {
        let reservation = self
            .reservations
            .get_mut(&id)
            .ok_or_else(|| ReservationError::not_found("reservation", id))?;

        if reservation.status != ReservationStatus::Active {
            return Ok(ReleaseOutcome::AlreadyTerminal(reservation.status));
        }

        reservation.status = ReservationStatus::Released;
        reservation.expires_at = None;
        reservation.updated_at = now;
        Ok(ReleaseOutcome::Released(reservation.clone()))
    }

    /// Validates every reservation before touching anything.
    fn commit(&mut self, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut needed: HashMap<Uuid, i64> = HashMap::new();
        for id in ids {
            let reservation = self
                .reservations
                .get(id)
                .ok_or_else(|| ReservationError::not_found("reservation", *id))?;
            if reservation.status != ReservationStatus::Active {
                return Err(ReservationError::invalid_state(
                    *id,
                    format!("reservation is {}", reservation.status),
                ));
            }
            if reservation.has_lapsed(now) {
                return Err(ReservationError::invalid_state(*id, "reservation has expired"));
            }
            *needed.entry(reservation.subject_id).or_default() += i64::from(reservation.quantity);
        }

        for (subject_id, requested) in &needed {
            let stock = i64::from(self.subject(*subject_id)?.quantity_on_hand);
            let others = self.live_reserved(*subject_id, now, ids);
            let available = stock - others;
            if *requested > available {
                return Err(ReservationError::InsufficientStock {
                    subject_id: *subject_id,
                    requested: clamp_i32(*requested),
                    available: clamp_i32(available.max(0)),
                });
            }
        }

        for (subject_id, requested) in needed {
            if let Some(subject) = self.inventory.get_mut(&subject_id) {
                subject.quantity_on_hand -= clamp_i32(requested);
                subject.updated_at = now;
            }
        }

        let mut committed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(reservation) = self.reservations.get_mut(id) {
                reservation.status = ReservationStatus::Committed;
                reservation.expires_at = None;
                reservation.updated_at = now;
                committed.push(reservation.clone());
            }
        }
        Ok(committed)
    }
}

fn clamp_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn subject(&self, subject_id: Uuid) -> Result<Option<Subject>> {
        let tables = self.tables.lock().await;
        Ok(tables.inventory.get(&subject_id).cloned())
    }

    async fn upsert_subject(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity_on_hand: i32,
        now: DateTime<Utc>,
    ) -> Result<Subject> {
        let mut tables = self.tables.lock().await;
        let subject = tables
            .inventory
            .entry(subject_id)
            .and_modify(|s| {
                s.subject_type = subject_type;
                s.quantity_on_hand = quantity_on_hand;
                s.updated_at = now;
            })
            .or_insert_with(|| Subject {
                subject_id,
                subject_type,
                quantity_on_hand,
                created_at: now,
                updated_at: now,
            });
        Ok(subject.clone())
    }

    async fn restock(&self, subject_id: Uuid, delta: i32, now: DateTime<Utc>) -> Result<Subject> {
        let mut tables = self.tables.lock().await;
        let subject = tables
            .inventory
            .get_mut(&subject_id)
            .ok_or_else(|| ReservationError::not_found("subject", subject_id))?;
        subject.quantity_on_hand = subject
            .quantity_on_hand
            .checked_add(delta)
            .ok_or_else(|| ReservationError::InvalidInput("stock overflow".to_string()))?;
        subject.updated_at = now;
        Ok(subject.clone())
    }

    async fn reserved_quantity(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.live_reserved(subject_id, now, &[]))
    }

    async fn stock_level(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Option<StockLevel>> {
        let tables = self.tables.lock().await;
        Ok(tables.inventory.get(&subject_id).map(|subject| StockLevel {
            subject: subject.clone(),
            reserved: tables.live_reserved(subject_id, now, &[]),
        }))
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables.reservations.get(&id).cloned())
    }

    async fn reserve(
        &self,
        new: NewReservation,
        replaces: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut tables = self.tables.lock().await;

        let subject = tables.subject(new.subject_id)?;
        if subject.subject_type != new.subject_type {
            return Err(ReservationError::InvalidInput(format!(
                "subject {} is a {}, not a {}",
                new.subject_id, subject.subject_type, new.subject_type
            )));
        }
        let stock = i64::from(subject.quantity_on_hand);

        let mut excluding = Vec::new();
        if let Some(old_id) = replaces {
            let old = tables
                .reservations
                .get(&old_id)
                .ok_or_else(|| ReservationError::not_found("reservation", old_id))?;
            if old.subject_id != new.subject_id || old.owner_id != new.owner_id {
                return Err(ReservationError::InvalidInput(format!(
                    "reservation {} belongs to a different subject or owner",
                    old_id
                )));
            }
            if old.status != ReservationStatus::Active {
                return Err(ReservationError::invalid_state(
                    old_id,
                    format!("reservation is {}", old.status),
                ));
            }
            excluding.push(old_id);
        }

        let available = stock - tables.live_reserved(new.subject_id, now, &excluding);
        if i64::from(new.quantity) > available {
            return Err(ReservationError::InsufficientStock {
                subject_id: new.subject_id,
                requested: new.quantity,
                available: clamp_i32(available.max(0)),
            });
        }

        if let Some(old_id) = replaces {
            tables.release(old_id, now)?;
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            subject_type: new.subject_type,
            subject_id: new.subject_id,
            quantity: new.quantity,
            owner_id: new.owner_id,
            status: ReservationStatus::Active,
            expires_at: Some(new.expires_at),
            created_at: now,
            updated_at: now,
        };
        tables.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn extend(&self, id: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<ExtendOutcome> {
        let mut tables = self.tables.lock().await;
        let reservation = tables
            .reservations
            .get_mut(&id)
            .ok_or_else(|| ReservationError::not_found("reservation", id))?;

        if reservation.status != ReservationStatus::Active {
            return Ok(ExtendOutcome::NotActive(reservation.status));
        }
        if reservation.has_lapsed(now) {
            reservation.status = ReservationStatus::Expired;
            reservation.expires_at = None;
            reservation.updated_at = now;
            return Ok(ExtendOutcome::Lapsed);
        }

        reservation.expires_at = Some(expires_at);
        reservation.updated_at = now;
        Ok(ExtendOutcome::Extended(reservation.clone()))
    }

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome> {
        let mut tables = self.tables.lock().await;
        tables.release(id, now)
    }

    async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.reservations.get_mut(&id) {
            Some(reservation) if reservation.has_lapsed(now) => {
                reservation.status = ReservationStatus::Expired;
                reservation.expires_at = None;
                reservation.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ReservationError::not_found("reservation", id)),
        }
    }

    async fn commit(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut tables = self.tables.lock().await;
        tables.commit(ids, now)
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut lapsed: Vec<&Reservation> = tables
            .reservations
            .values()
            .filter(|r| r.has_lapsed(now))
            .collect();
        lapsed.sort_by_key(|r| r.expires_at);
        Ok(lapsed
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|r| r.id)
            .collect())
    }

    async fn cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        let tables = self.tables.lock().await;
        let mut items: Vec<CartItem> = tables
            .cart_items
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.created_at, item.subject_id));
        Ok(items)
    }

    async fn cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        let tables = self.tables.lock().await;
        Ok(tables.cart_items.get(&(owner_id, subject_id)).cloned())
    }

    async fn hold_cart_line(&self, line: CartLineHold, now: DateTime<Utc>) -> Result<CartItem> {
        let mut tables = self.tables.lock().await;

        let subject = tables.subject(line.subject_id)?;
        if subject.subject_type != line.subject_type {
            return Err(ReservationError::InvalidInput(format!(
                "subject {} is a {}, not a {}",
                line.subject_id, subject.subject_type, line.subject_type
            )));
        }
        let stock = i64::from(subject.quantity_on_hand);

        let key = (line.owner_id, line.subject_id);
        let existing = tables.cart_items.get(&key).cloned();
        let quantity = match (line.quantity, &existing) {
            (LineQuantity::Add(n), Some(item)) => item
                .quantity
                .checked_add(n)
                .ok_or_else(|| ReservationError::InvalidInput("quantity overflow".to_string()))?,
            (LineQuantity::Add(n), None) => n,
            (LineQuantity::Set(n), Some(_)) => n,
            (LineQuantity::Set(_), None) => {
                return Err(ReservationError::not_found("cart item", line.subject_id))
            }
        };

        let previous = existing
            .as_ref()
            .and_then(|item| item.reservation_id)
            .filter(|id| {
                tables
                    .reservations
                    .get(id)
                    .map_or(false, |r| r.status == ReservationStatus::Active)
            });
        let excluding: Vec<Uuid> = previous.into_iter().collect();

        let available = stock - tables.live_reserved(line.subject_id, now, &excluding);
        if i64::from(quantity) > available {
            return Err(ReservationError::InsufficientStock {
                subject_id: line.subject_id,
                requested: quantity,
                available: clamp_i32(available.max(0)),
            });
        }

        if let Some(old_id) = previous {
            tables.release(old_id, now)?;
        }
        let reservation = Reservation {
            id: Uuid::new_v4(),
            subject_type: line.subject_type,
            subject_id: line.subject_id,
            quantity,
            owner_id: line.owner_id,
            status: ReservationStatus::Active,
            expires_at: Some(line.expires_at),
            created_at: now,
            updated_at: now,
        };
        tables.reservations.insert(reservation.id, reservation.clone());

        let item = match existing {
            Some(item) => CartItem {
                quantity,
                reservation_id: Some(reservation.id),
                updated_at: now,
                ..item
            },
            None => CartItem {
                id: Uuid::new_v4(),
                owner_id: line.owner_id,
                subject_type: line.subject_type,
                subject_id: line.subject_id,
                quantity,
                reservation_id: Some(reservation.id),
                created_at: now,
                updated_at: now,
            },
        };
        tables.cart_items.insert(key, item.clone());
        Ok(item)
    }

    async fn detach_cart_hold(
        &self,
        owner_id: Uuid,
        subject_id: Uuid,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.cart_items.get_mut(&(owner_id, subject_id)) {
            Some(item) if item.reservation_id == Some(reservation_id) => {
                item.reservation_id = None;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.cart_items.remove(&(owner_id, subject_id)))
    }

    async fn clear_cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        let mut tables = self.tables.lock().await;
        let keys: Vec<(Uuid, Uuid)> = tables
            .cart_items
            .keys()
            .filter(|(owner, _)| *owner == owner_id)
            .copied()
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| tables.cart_items.remove(&key))
            .collect())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        let tables = self.tables.lock().await;
        Ok(tables.orders.get(&id).cloned())
    }

    async fn place_order(
        &self,
        owner_id: Uuid,
        payment_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut tables = self.tables.lock().await;

        let mut items: Vec<CartItem> = tables
            .cart_items
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect();
        if items.is_empty() {
            return Err(ReservationError::invalid_state(owner_id, "cart is empty"));
        }
        items.sort_by_key(|item| (item.created_at, item.subject_id));

        let mut lines = Vec::with_capacity(items.len());
        for item in &items {
            let held = item
                .reservation_id
                .and_then(|id| tables.reservations.get(&id))
                .filter(|r| r.is_live(now));
            match held {
                Some(reservation) => lines.push(OrderLine {
                    reservation_id: reservation.id,
                    subject_type: reservation.subject_type,
                    subject_id: reservation.subject_id,
                    quantity: reservation.quantity,
                }),
                None => {
                    return Err(ReservationError::invalid_state(
                        item.subject_id,
                        "cart item is no longer reserved",
                    ))
                }
            }
        }

        for line in &lines {
            if let Some(reservation) = tables.reservations.get_mut(&line.reservation_id) {
                reservation.expires_at = Some(payment_deadline);
                reservation.updated_at = now;
            }
        }
        for item in &items {
            tables.cart_items.remove(&(item.owner_id, item.subject_id));
        }

        let order = Order {
            id: Uuid::new_v4(),
            owner_id,
            status: OrderStatus::Pending,
            payment_deadline,
            lines,
            created_at: now,
            updated_at: now,
        };
        tables.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn finalize_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<Order> {
        let mut tables = self.tables.lock().await;
        let order = tables
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| ReservationError::not_found("order", id))?;

        if order.status != OrderStatus::Pending {
            return Err(ReservationError::invalid_state(id, format!("order is {}", order.status)));
        }
        if order.payment_deadline <= now {
            return Err(ReservationError::invalid_state(id, "payment deadline has passed"));
        }

        let ids: Vec<Uuid> = order.lines.iter().map(|line| line.reservation_id).collect();
        tables.commit(&ids, now)?;

        let order = tables
            .orders
            .get_mut(&id)
            .ok_or_else(|| ReservationError::not_found("order", id))?;
        order.status = OrderStatus::Confirmed;
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn cancel_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut tables = self.tables.lock().await;
        let order = tables
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| ReservationError::not_found("order", id))?;

        match order.status {
            OrderStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled(order)),
            OrderStatus::Confirmed => {
                return Err(ReservationError::invalid_state(id, "order is already confirmed"))
            }
            OrderStatus::Pending => {}
        }

        for line in &order.lines {
            tables.release(line.reservation_id, now)?;
        }

        let order = tables
            .orders
            .get_mut(&id)
            .ok_or_else(|| ReservationError::not_found("order", id))?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        Ok(CancelOutcome::Cancelled(order.clone()))
    }

    async fn lapsed_orders(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut lapsed: Vec<&Order> = tables
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.payment_deadline <= now)
            .collect();
        lapsed.sort_by_key(|o| o.payment_deadline);
        Ok(lapsed
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|o| o.id)
            .collect())
    }
}
