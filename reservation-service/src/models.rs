use diesel::prelude::*;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use shared::{CartItem, Order, OrderLine, Reservation, Subject, UnknownVariant};

// Field order follows the column order in schema.rs.

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct DbInventory {
    pub subject_id: Uuid,
    pub subject_type: String,
    pub quantity_on_hand: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: Uuid,
    pub subject_type: String,
    pub subject_id: Uuid,
    pub owner_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct DbCartItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub subject_type: String,
    pub subject_id: Uuid,
    pub quantity: i32,
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: String,
    pub payment_deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct DbOrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub reservation_id: Uuid,
    pub subject_type: String,
    pub subject_id: Uuid,
    pub quantity: i32,
}

impl TryFrom<DbInventory> for Subject {
    type Error = UnknownVariant;

    fn try_from(row: DbInventory) -> Result<Self, Self::Error> {
        Ok(Self {
            subject_id: row.subject_id,
            subject_type: row.subject_type.parse()?,
            quantity_on_hand: row.quantity_on_hand,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&Reservation> for DbReservation {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            subject_type: reservation.subject_type.as_str().to_string(),
            subject_id: reservation.subject_id,
            owner_id: reservation.owner_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            expires_at: reservation.expires_at,
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = UnknownVariant;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            subject_type: row.subject_type.parse()?,
            subject_id: row.subject_id,
            quantity: row.quantity,
            owner_id: row.owner_id,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&CartItem> for DbCartItem {
    fn from(item: &CartItem) -> Self {
        Self {
            id: item.id,
            owner_id: item.owner_id,
            subject_type: item.subject_type.as_str().to_string(),
            subject_id: item.subject_id,
            quantity: item.quantity,
            reservation_id: item.reservation_id,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

impl TryFrom<DbCartItem> for CartItem {
    type Error = UnknownVariant;

    fn try_from(row: DbCartItem) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            owner_id: row.owner_id,
            subject_type: row.subject_type.parse()?,
            subject_id: row.subject_id,
            quantity: row.quantity,
            reservation_id: row.reservation_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<DbOrderLine> for OrderLine {
    type Error = UnknownVariant;

    fn try_from(row: DbOrderLine) -> Result<Self, Self::Error> {
        Ok(Self {
            reservation_id: row.reservation_id,
            subject_type: row.subject_type.parse()?,
            subject_id: row.subject_id,
            quantity: row.quantity,
        })
    }
}

impl DbOrder {
    pub fn into_order(self, lines: Vec<DbOrderLine>) -> Result<Order, UnknownVariant> {
        let lines = lines
            .into_iter()
            .map(OrderLine::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Order {
            id: self.id,
            owner_id: self.owner_id,
            status: self.status.parse()?,
            payment_deadline: self.payment_deadline,
            lines,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
