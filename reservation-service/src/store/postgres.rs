use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::{
    CartItem, Order, OrderStatus, Reservation, ReservationStatus, Subject, SubjectType,
};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::{
    CancelOutcome, CartLineHold, ExtendOutcome, LineQuantity, NewReservation, ReleaseOutcome,
    ReservationStore, StockLevel,
};
use crate::error::{ReservationError, Result};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations over a short-lived blocking connection.
pub fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = PgConnection::establish(database_url)
        .map_err(|e| ReservationError::Storage(format!("connect for migrations: {}", e)))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| ReservationError::Storage(format!("migration error: {}", e)))?;
    Ok(())
}

const ACTIVE: &str = "active";

/// Lock order inside a transaction is always order row, then inventory rows
/// (ascending subject id), then reservation rows.
#[derive(Clone)]
pub struct PgReservationStore {
    pool: DbPool,
}

impl PgReservationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn lock_subject(conn: &mut AsyncPgConnection, subject_id: Uuid) -> Result<DbInventory> {
    inventory::table
        .find(subject_id)
        .for_update()
        .first::<DbInventory>(conn)
        .await
        .optional()?
        .ok_or_else(|| ReservationError::not_found("subject", subject_id))
}

async fn live_reserved(
    conn: &mut AsyncPgConnection,
    subject_id: Uuid,
    now: DateTime<Utc>,
    excluding: &[Uuid],
) -> Result<i64> {
    let total: Option<i64> = reservations::table
        .filter(reservations::subject_id.eq(subject_id))
        .filter(reservations::status.eq(ACTIVE))
        .filter(reservations::expires_at.gt(now))
        .filter(reservations::id.ne_all(excluding.to_vec()))
        .select(diesel::dsl::sum(reservations::quantity))
        .first(conn)
        .await?;
    Ok(total.unwrap_or(0))
}

async fn find_reservation(conn: &mut AsyncPgConnection, id: Uuid) -> Result<Option<DbReservation>> {
    Ok(reservations::table
        .find(id)
        .first::<DbReservation>(conn)
        .await
        .optional()?)
}

async fn release_row(conn: &mut AsyncPgConnection, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome> {
    let updated = diesel::update(
        reservations::table
            .filter(reservations::id.eq(id))
            .filter(reservations::status.eq(ACTIVE)),
    )
    .set((
        reservations::status.eq(ReservationStatus::Released.as_str()),
        reservations::expires_at.eq(None::<DateTime<Utc>>),
        reservations::updated_at.eq(now),
    ))
    .get_result::<DbReservation>(conn)
    .await
    .optional()?;

    match updated {
        Some(row) => Ok(ReleaseOutcome::Released(row.try_into()?)),
        None => match find_reservation(conn, id).await? {
            Some(row) => Ok(ReleaseOutcome::AlreadyTerminal(row.status.parse()?)),
            None => Err(ReservationError::not_found("reservation", id)),
        },
    }
}

async fn expire_row(conn: &mut AsyncPgConnection, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let affected = diesel::update(
        reservations::table
            .filter(reservations::id.eq(id))
            .filter(reservations::status.eq(ACTIVE))
            .filter(reservations::expires_at.le(now)),
    )
    .set((
        reservations::status.eq(ReservationStatus::Expired.as_str()),
        reservations::expires_at.eq(None::<DateTime<Utc>>),
        reservations::updated_at.eq(now),
    ))
    .execute(conn)
    .await?;
    Ok(affected > 0)
}

/// Runs inside the caller's transaction.
async fn commit_rows(conn: &mut AsyncPgConnection, ids: Vec<Uuid>, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
    let subject_ids: BTreeSet<Uuid> = reservations::table
        .filter(reservations::id.eq_any(ids.clone()))
        .select(reservations::subject_id)
        .load::<Uuid>(conn)
        .await?
        .into_iter()
        .collect();

    let mut stock = BTreeMap::new();
    for subject_id in &subject_ids {
        let row = lock_subject(conn, *subject_id).await?;
        stock.insert(*subject_id, i64::from(row.quantity_on_hand));
    }

    let rows = reservations::table
        .filter(reservations::id.eq_any(ids.clone()))
        .for_update()
        .load::<DbReservation>(conn)
        .await?;

    let mut needed: BTreeMap<Uuid, i64> = BTreeMap::new();
    for id in &ids {
        let row = rows
            .iter()
            .find(|row| row.id == *id)
            .ok_or_else(|| ReservationError::not_found("reservation", *id))?;
        let reservation = Reservation::try_from(row.clone())?;
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
        let on_hand = stock.get(subject_id).copied().unwrap_or(0);
        let available = on_hand - live_reserved(conn, *subject_id, now, &ids).await?;
        if *requested > available {
            return Err(ReservationError::InsufficientStock {
                subject_id: *subject_id,
                requested: i32::try_from(*requested).unwrap_or(i32::MAX),
                available: i32::try_from(available.max(0)).unwrap_or(i32::MAX),
            });
        }
    }

    for (subject_id, requested) in &needed {
        let delta = i32::try_from(*requested)
            .map_err(|_| ReservationError::InvalidInput("quantity overflow".to_string()))?;
        diesel::update(inventory::table.find(*subject_id))
            .set((
                inventory::quantity_on_hand.eq(inventory::quantity_on_hand - delta),
                inventory::updated_at.eq(now),
            ))
            .execute(conn)
            .await?;
    }

    let committed = diesel::update(reservations::table.filter(reservations::id.eq_any(ids)))
        .set((
            reservations::status.eq(ReservationStatus::Committed.as_str()),
            reservations::expires_at.eq(None::<DateTime<Utc>>),
            reservations::updated_at.eq(now),
        ))
        .get_results::<DbReservation>(conn)
        .await?;

    committed
        .into_iter()
        .map(|row| Reservation::try_from(row).map_err(ReservationError::from))
        .collect()
}

async fn load_order(conn: &mut AsyncPgConnection, row: DbOrder) -> Result<Order> {
    let lines = order_lines::table
        .filter(order_lines::order_id.eq(row.id))
        .order(order_lines::id.asc())
        .load::<DbOrderLine>(conn)
        .await?;
    Ok(row.into_order(lines)?)
}

async fn lock_order(conn: &mut AsyncPgConnection, id: Uuid) -> Result<DbOrder> {
    orders::table
        .find(id)
        .for_update()
        .first::<DbOrder>(conn)
        .await
        .optional()?
        .ok_or_else(|| ReservationError::not_found("order", id))
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn subject(&self, subject_id: Uuid) -> Result<Option<Subject>> {
        let mut conn = self.pool.get().await?;
        let row = inventory::table
            .find(subject_id)
            .first::<DbInventory>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Subject::try_from).transpose()?)
    }

    async fn upsert_subject(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity_on_hand: i32,
        now: DateTime<Utc>,
    ) -> Result<Subject> {
        let mut conn = self.pool.get().await?;
        let row = DbInventory {
            subject_id,
            subject_type: subject_type.as_str().to_string(),
            quantity_on_hand,
            created_at: now,
            updated_at: now,
        };
        let saved = diesel::insert_into(inventory::table)
            .values(&row)
            .on_conflict(inventory::subject_id)
            .do_update()
            .set((
                inventory::subject_type.eq(excluded(inventory::subject_type)),
                inventory::quantity_on_hand.eq(excluded(inventory::quantity_on_hand)),
                inventory::updated_at.eq(excluded(inventory::updated_at)),
            ))
            .get_result::<DbInventory>(&mut conn)
            .await?;
        Ok(saved.try_into()?)
    }

    async fn restock(&self, subject_id: Uuid, delta: i32, now: DateTime<Utc>) -> Result<Subject> {
        let mut conn = self.pool.get().await?;
        let row = diesel::update(inventory::table.find(subject_id))
            .set((
                inventory::quantity_on_hand.eq(inventory::quantity_on_hand + delta),
                inventory::updated_at.eq(now),
            ))
            .get_result::<DbInventory>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ReservationError::not_found("subject", subject_id))?;
        Ok(row.try_into()?)
    }

    async fn reserved_quantity(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        live_reserved(&mut conn, subject_id, now, &[]).await
    }

    async fn stock_level(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Option<StockLevel>> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        // Both reads share one snapshot, so a commit cannot land between them.
        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, ReservationError, _>(|conn| {
                Box::pin(async move {
                    let Some(row) = inventory::table
                        .find(subject_id)
                        .first::<DbInventory>(conn)
                        .await
                        .optional()?
                    else {
                        return Ok(None);
                    };
                    let reserved = live_reserved(conn, subject_id, now, &[]).await?;
                    Ok(Some(StockLevel {
                        subject: row.try_into()?,
                        reserved,
                    }))
                })
            })
            .await
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        let mut conn = self.pool.get().await?;
        let row = find_reservation(&mut conn, id).await?;
        Ok(row.map(Reservation::try_from).transpose()?)
    }

    async fn reserve(
        &self,
        new: NewReservation,
        replaces: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move {
                // Serialises every reserver of this subject until commit.
                let subject = lock_subject(conn, new.subject_id).await?;
                if subject.subject_type != new.subject_type.as_str() {
                    return Err(ReservationError::InvalidInput(format!(
                        "subject {} is a {}, not a {}",
                        new.subject_id, subject.subject_type, new.subject_type
                    )));
                }

                let mut excluding = Vec::new();
                if let Some(old_id) = replaces {
                    let old = find_reservation(conn, old_id)
                        .await?
                        .ok_or_else(|| ReservationError::not_found("reservation", old_id))?;
                    if old.subject_id != new.subject_id || old.owner_id != new.owner_id {
                        return Err(ReservationError::InvalidInput(format!(
                            "reservation {} belongs to a different subject or owner",
                            old_id
                        )));
                    }
                    excluding.push(old_id);
                }

                let available = i64::from(subject.quantity_on_hand)
                    - live_reserved(conn, new.subject_id, now, &excluding).await?;
                if i64::from(new.quantity) > available {
                    return Err(ReservationError::InsufficientStock {
                        subject_id: new.subject_id,
                        requested: new.quantity,
                        available: i32::try_from(available.max(0)).unwrap_or(i32::MAX),
                    });
                }

                if let Some(old_id) = replaces {
                    if let ReleaseOutcome::AlreadyTerminal(status) = release_row(conn, old_id, now).await? {
                        return Err(ReservationError::invalid_state(
                            old_id,
                            format!("reservation is {}", status),
                        ));
                    }
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
                diesel::insert_into(reservations::table)
                    .values(&DbReservation::from(&reservation))
                    .execute(conn)
                    .await?;

                Ok(reservation)
            })
        })
        .await
    }

    async fn extend(&self, id: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<ExtendOutcome> {
        let mut conn = self.pool.get().await?;

        let extended = diesel::update(
            reservations::table
                .filter(reservations::id.eq(id))
                .filter(reservations::status.eq(ACTIVE))
                .filter(reservations::expires_at.gt(now)),
        )
        .set((
            reservations::expires_at.eq(Some(expires_at)),
            reservations::updated_at.eq(now),
        ))
        .get_result::<DbReservation>(&mut conn)
        .await
        .optional()?;

        if let Some(row) = extended {
            return Ok(ExtendOutcome::Extended(row.try_into()?));
        }

        let row = find_reservation(&mut conn, id)
            .await?
            .ok_or_else(|| ReservationError::not_found("reservation", id))?;
        let status: ReservationStatus = row.status.parse()?;
        if status != ReservationStatus::Active {
            return Ok(ExtendOutcome::NotActive(status));
        }
        expire_row(&mut conn, id, now).await?;
        Ok(ExtendOutcome::Lapsed)
    }

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReleaseOutcome> {
        let mut conn = self.pool.get().await?;
        release_row(&mut conn, id, now).await
    }

    async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        if expire_row(&mut conn, id, now).await? {
            return Ok(true);
        }
        match find_reservation(&mut conn, id).await? {
            Some(_) => Ok(false),
            None => Err(ReservationError::not_found("reservation", id)),
        }
    }

    async fn commit(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let ids = ids.to_vec();

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move { commit_rows(conn, ids, now).await })
        })
        .await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        let mut conn = self.pool.get().await?;
        Ok(reservations::table
            .filter(reservations::status.eq(ACTIVE))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(i64::from(limit))
            .select(reservations::id)
            .load::<Uuid>(&mut conn)
            .await?)
    }

    async fn cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        let mut conn = self.pool.get().await?;
        let rows = cart_items::table
            .filter(cart_items::owner_id.eq(owner_id))
            .order((cart_items::created_at.asc(), cart_items::subject_id.asc()))
            .load::<DbCartItem>(&mut conn)
            .await?;
        rows.into_iter()
            .map(|row| CartItem::try_from(row).map_err(ReservationError::from))
            .collect()
    }

    async fn cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        let mut conn = self.pool.get().await?;
        let row = cart_items::table
            .filter(cart_items::owner_id.eq(owner_id))
            .filter(cart_items::subject_id.eq(subject_id))
            .first::<DbCartItem>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(CartItem::try_from).transpose()?)
    }

    async fn hold_cart_line(&self, line: CartLineHold, now: DateTime<Utc>) -> Result<CartItem> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move {
                // Two writers of the same line queue here and see each other's result.
                let subject = lock_subject(conn, line.subject_id).await?;
                if subject.subject_type != line.subject_type.as_str() {
                    return Err(ReservationError::InvalidInput(format!(
                        "subject {} is a {}, not a {}",
                        line.subject_id, subject.subject_type, line.subject_type
                    )));
                }

                let existing = cart_items::table
                    .filter(cart_items::owner_id.eq(line.owner_id))
                    .filter(cart_items::subject_id.eq(line.subject_id))
                    .for_update()
                    .first::<DbCartItem>(conn)
                    .await
                    .optional()?;
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

                let mut previous = None;
                if let Some(old_id) = existing.as_ref().and_then(|item| item.reservation_id) {
                    if let Some(old) = find_reservation(conn, old_id).await? {
                        if old.status == ACTIVE {
                            previous = Some(old_id);
                        }
                    }
                }
                let excluding: Vec<Uuid> = previous.into_iter().collect();

                let available = i64::from(subject.quantity_on_hand)
                    - live_reserved(conn, line.subject_id, now, &excluding).await?;
                if i64::from(quantity) > available {
                    return Err(ReservationError::InsufficientStock {
                        subject_id: line.subject_id,
                        requested: quantity,
                        available: i32::try_from(available.max(0)).unwrap_or(i32::MAX),
                    });
                }

                if let Some(old_id) = previous {
                    release_row(conn, old_id, now).await?;
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
                diesel::insert_into(reservations::table)
                    .values(&DbReservation::from(&reservation))
                    .execute(conn)
                    .await?;

                let item = CartItem {
                    id: existing.as_ref().map_or_else(Uuid::new_v4, |item| item.id),
                    owner_id: line.owner_id,
                    subject_type: line.subject_type,
                    subject_id: line.subject_id,
                    quantity,
                    reservation_id: Some(reservation.id),
                    created_at: existing.as_ref().map_or(now, |item| item.created_at),
                    updated_at: now,
                };
                let saved = diesel::insert_into(cart_items::table)
                    .values(&DbCartItem::from(&item))
                    .on_conflict((cart_items::owner_id, cart_items::subject_id))
                    .do_update()
                    .set((
                        cart_items::quantity.eq(excluded(cart_items::quantity)),
                        cart_items::reservation_id.eq(excluded(cart_items::reservation_id)),
                        cart_items::updated_at.eq(excluded(cart_items::updated_at)),
                    ))
                    .get_result::<DbCartItem>(conn)
                    .await?;
                Ok(CartItem::try_from(saved)?)
            })
        })
        .await
    }

    async fn detach_cart_hold(
        &self,
        owner_id: Uuid,
        subject_id: Uuid,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let affected = diesel::update(
            cart_items::table
                .filter(cart_items::owner_id.eq(owner_id))
                .filter(cart_items::subject_id.eq(subject_id))
                .filter(cart_items::reservation_id.eq(reservation_id)),
        )
        .set((
            cart_items::reservation_id.eq(None::<Uuid>),
            cart_items::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(affected > 0)
    }

    async fn remove_cart_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<Option<CartItem>> {
        let mut conn = self.pool.get().await?;
        let row = diesel::delete(
            cart_items::table
                .filter(cart_items::owner_id.eq(owner_id))
                .filter(cart_items::subject_id.eq(subject_id)),
        )
        .get_result::<DbCartItem>(&mut conn)
        .await
        .optional()?;
        Ok(row.map(CartItem::try_from).transpose()?)
    }

    async fn clear_cart(&self, owner_id: Uuid) -> Result<Vec<CartItem>> {
        let mut conn = self.pool.get().await?;
        let rows = diesel::delete(cart_items::table.filter(cart_items::owner_id.eq(owner_id)))
            .get_results::<DbCartItem>(&mut conn)
            .await?;
        rows.into_iter()
            .map(|row| CartItem::try_from(row).map_err(ReservationError::from))
            .collect()
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let row = orders::table
            .find(id)
            .first::<DbOrder>(&mut conn)
            .await
            .optional()?;
        match row {
            Some(row) => Ok(Some(load_order(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn place_order(
        &self,
        owner_id: Uuid,
        payment_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move {
                let items = cart_items::table
                    .filter(cart_items::owner_id.eq(owner_id))
                    .order((cart_items::created_at.asc(), cart_items::subject_id.asc()))
                    .for_update()
                    .load::<DbCartItem>(conn)
                    .await?;
                if items.is_empty() {
                    return Err(ReservationError::invalid_state(owner_id, "cart is empty"));
                }

                let order = DbOrder {
                    id: Uuid::new_v4(),
                    owner_id,
                    status: OrderStatus::Pending.as_str().to_string(),
                    payment_deadline,
                    created_at: now,
                    updated_at: now,
                };
                diesel::insert_into(orders::table)
                    .values(&order)
                    .execute(conn)
                    .await?;

                let mut lines = Vec::with_capacity(items.len());
                for item in &items {
                    let held = match item.reservation_id {
                        Some(reservation_id) => reservations::table
                            .find(reservation_id)
                            .for_update()
                            .first::<DbReservation>(conn)
                            .await
                            .optional()?
                            .map(Reservation::try_from)
                            .transpose()?
                            .filter(|r| r.is_live(now)),
                        None => None,
                    };
                    let reservation = held.ok_or_else(|| {
                        ReservationError::invalid_state(item.subject_id, "cart item is no longer reserved")
                    })?;

                    diesel::update(reservations::table.find(reservation.id))
                        .set((
                            reservations::expires_at.eq(Some(payment_deadline)),
                            reservations::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    lines.push(DbOrderLine {
                        id: Uuid::new_v4(),
                        order_id: order.id,
                        reservation_id: reservation.id,
                        subject_type: reservation.subject_type.as_str().to_string(),
                        subject_id: reservation.subject_id,
                        quantity: reservation.quantity,
                    });
                }

                diesel::insert_into(order_lines::table)
                    .values(&lines)
                    .execute(conn)
                    .await?;
                diesel::delete(cart_items::table.filter(cart_items::owner_id.eq(owner_id)))
                    .execute(conn)
                    .await?;

                Ok(order.into_order(lines)?)
            })
        })
        .await
    }

    async fn finalize_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<Order> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move {
                let order = lock_order(conn, id).await?;
                let status: OrderStatus = order.status.parse()?;
                if status != OrderStatus::Pending {
                    return Err(ReservationError::invalid_state(id, format!("order is {}", status)));
                }
                if order.payment_deadline <= now {
                    return Err(ReservationError::invalid_state(id, "payment deadline has passed"));
                }

                let reservation_ids = order_lines::table
                    .filter(order_lines::order_id.eq(id))
                    .select(order_lines::reservation_id)
                    .load::<Uuid>(conn)
                    .await?;
                commit_rows(conn, reservation_ids, now).await?;

                let confirmed = diesel::update(orders::table.find(id))
                    .set((
                        orders::status.eq(OrderStatus::Confirmed.as_str()),
                        orders::updated_at.eq(now),
                    ))
                    .get_result::<DbOrder>(conn)
                    .await?;
                load_order(conn, confirmed).await
            })
        })
        .await
    }

    async fn cancel_order(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, ReservationError, _>(|conn| {
            Box::pin(async move {
                let order = lock_order(conn, id).await?;
                match order.status.parse::<OrderStatus>()? {
                    OrderStatus::Cancelled => {
                        return Ok(CancelOutcome::AlreadyCancelled(load_order(conn, order).await?))
                    }
                    OrderStatus::Confirmed => {
                        return Err(ReservationError::invalid_state(id, "order is already confirmed"))
                    }
                    OrderStatus::Pending => {}
                }

                let reservation_ids = order_lines::table
                    .filter(order_lines::order_id.eq(id))
                    .select(order_lines::reservation_id)
                    .load::<Uuid>(conn)
                    .await?;
                for reservation_id in reservation_ids {
                    release_row(conn, reservation_id, now).await?;
                }

                let cancelled = diesel::update(orders::table.find(id))
                    .set((
                        orders::status.eq(OrderStatus::Cancelled.as_str()),
                        orders::updated_at.eq(now),
                    ))
                    .get_result::<DbOrder>(conn)
                    .await?;
                Ok(CancelOutcome::Cancelled(load_order(conn, cancelled).await?))
            })
        })
        .await
    }

    async fn lapsed_orders(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        let mut conn = self.pool.get().await?;
        Ok(orders::table
            .filter(orders::status.eq(OrderStatus::Pending.as_str()))
            .filter(orders::payment_deadline.le(now))
            .order(orders::payment_deadline.asc())
            .limit(i64::from(limit))
            .select(orders::id)
            .load::<Uuid>(&mut conn)
            .await?)
    }
}
