use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Product,
    AuctionLot,
    FlashSaleItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Committed,
    Released,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// Raised when a status or subject type column holds a value this build
/// does not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

string_enum!(SubjectType, "subject type", {
    Product => "product",
    AuctionLot => "auction_lot",
    FlashSaleItem => "flash_sale_item",
});

string_enum!(ReservationStatus, "reservation status", {
    Active => "active",
    Committed => "committed",
    Released => "released",
    Expired => "expired",
});

string_enum!(OrderStatus, "order status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
});

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Raw on-hand stock for a sellable subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub subject_id: Uuid,
    pub subject_type: SubjectType,
    pub quantity_on_hand: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
    pub owner_id: Uuid,
    pub status: ReservationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Active and not yet past its expiry. Lapsed-but-unswept rows are not live.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active
            && self.expires_at.map_or(false, |expires_at| expires_at > now)
    }

    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active
            && self.expires_at.map_or(true, |expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub reservation_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: OrderStatus,
    pub payment_deadline: DateTime<Utc>,
    pub lines: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySnapshot {
    pub subject_id: Uuid,
    pub quantity_available: i32,
    pub actual_quantity: i32,
    pub reserved_quantity: i64,
}

/// A cart line as shown to the storefront, with the state of its hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
    pub reservation_id: Option<Uuid>,
    pub reserved_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub owner_id: Uuid,
    pub lines: Vec<CartLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSubjectRequest {
    pub subject_type: SubjectType,
    pub quantity_on_hand: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockRequest {
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub success: bool,
    pub released_count: usize,
    pub cancelled_order_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reservation(status: ReservationStatus, expires_at: Option<DateTime<Utc>>) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            subject_type: SubjectType::FlashSaleItem,
            subject_id: Uuid::new_v4(),
            quantity: 1,
            owner_id: Uuid::new_v4(),
            status,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_strings_match_column_values() {
        assert_eq!(ReservationStatus::Active.as_str(), "active");
        assert_eq!("expired".parse::<ReservationStatus>(), Ok(ReservationStatus::Expired));
        assert_eq!("auction_lot".parse::<SubjectType>(), Ok(SubjectType::AuctionLot));
        assert!("reopened".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn serde_uses_same_spelling_as_columns() {
        let json = serde_json::to_string(&SubjectType::FlashSaleItem).unwrap();
        assert_eq!(json, "\"flash_sale_item\"");
    }

    #[test]
    fn lapsed_active_reservation_is_not_live() {
        let now = Utc::now();
        let lapsed = reservation(ReservationStatus::Active, Some(now - Duration::seconds(1)));
        assert!(!lapsed.is_live(now));
        assert!(lapsed.has_lapsed(now));

        let boundary = reservation(ReservationStatus::Active, Some(now));
        assert!(!boundary.is_live(now));

        let live = reservation(ReservationStatus::Active, Some(now + Duration::seconds(1)));
        assert!(live.is_live(now));
        assert!(!live.has_lapsed(now));
    }

    #[test]
    fn terminal_reservation_never_lapses() {
        let now = Utc::now();
        let released = reservation(ReservationStatus::Released, None);
        assert!(!released.is_live(now));
        assert!(!released.has_lapsed(now));
        assert!(released.status.is_terminal());
    }
}
