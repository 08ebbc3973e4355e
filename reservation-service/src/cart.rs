//! Cart mutations and checkout on top of the reservation manager.
//!
//! Every cart line for a scarce subject carries a reservation. Touching the
//! cart pushes the expiry of the other lines forward so an active shopper is
//! not evicted mid-session. Checkout is two steps: `place_order` turns the
//! cart into a pending order whose holds last until the payment deadline,
//! and `finalize_order` commits every line at once.

use chrono::Duration;
use shared::{CartItem, CartLine, CartView, Order, SubjectType};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::manager::ReservationManager;
use crate::store::{CancelOutcome, CartLineHold, LineQuantity};

#[derive(Clone)]
pub struct CartService {
    manager: ReservationManager,
    reservation_ttl: Duration,
    payment_window: Duration,
}

impl CartService {
    pub fn new(manager: ReservationManager, reservation_ttl: Duration, payment_window: Duration) -> Self {
        Self {
            manager,
            reservation_ttl,
            payment_window,
        }
    }

    pub async fn view(&self, owner_id: Uuid) -> Result<CartView> {
        let now = self.manager.clock().now();
        let items = self.manager.store().cart(owner_id).await?;

        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let held = match item.reservation_id {
                Some(id) => self
                    .manager
                    .store()
                    .reservation(id)
                    .await?
                    .filter(|r| r.is_live(now)),
                None => None,
            };
            lines.push(CartLine {
                subject_type: item.subject_type,
                subject_id: item.subject_id,
                quantity: item.quantity,
                reservation_id: held.as_ref().map(|r| r.id),
                reserved_until: held.and_then(|r| r.expires_at),
            });
        }

        Ok(CartView { owner_id, lines })
    }

    /// Adds `quantity` to the cart. If the subject is already in the cart
    /// the line grows by that amount.
    pub async fn add_item(
        &self,
        owner_id: Uuid,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity: i32,
    ) -> Result<CartView> {
        if quantity <= 0 {
            return Err(ReservationError::InvalidInput("quantity must be positive".to_string()));
        }

        let item = self
            .hold_line(owner_id, subject_type, subject_id, LineQuantity::Add(quantity))
            .await?;
        info!(
            "Cart {} now holds {} of {} as {:?}",
            owner_id, item.quantity, subject_id, item.reservation_id
        );

        self.touch(owner_id, Some(subject_id)).await;
        self.view(owner_id).await
    }

    /// Sets the line to exactly `quantity`; zero removes it.
    pub async fn update_item(&self, owner_id: Uuid, subject_id: Uuid, quantity: i32) -> Result<CartView> {
        if quantity < 0 {
            return Err(ReservationError::InvalidInput("quantity cannot be negative".to_string()));
        }
        if quantity == 0 {
            return self.remove_item(owner_id, subject_id).await;
        }

        let item = self
            .manager
            .store()
            .cart_item(owner_id, subject_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("cart item", subject_id))?;
        self.hold_line(owner_id, item.subject_type, subject_id, LineQuantity::Set(quantity))
            .await?;

        self.touch(owner_id, Some(subject_id)).await;
        self.view(owner_id).await
    }

    pub async fn remove_item(&self, owner_id: Uuid, subject_id: Uuid) -> Result<CartView> {
        let item = self
            .manager
            .store()
            .remove_cart_item(owner_id, subject_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("cart item", subject_id))?;
        if let Some(reservation_id) = item.reservation_id {
            self.manager.release(reservation_id).await?;
        }

        self.touch(owner_id, None).await;
        self.view(owner_id).await
    }

    pub async fn clear(&self, owner_id: Uuid) -> Result<CartView> {
        let items = self.manager.store().clear_cart(owner_id).await?;

        let mut first_error = None;
        for reservation_id in items.iter().filter_map(|item| item.reservation_id) {
            if let Err(e) = self.manager.release(reservation_id).await {
                warn!("Failed to release {} while clearing cart {}: {}", reservation_id, owner_id, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!("Cleared cart {} ({} items)", owner_id, items.len());
        Ok(CartView { owner_id, lines: Vec::new() })
    }

    pub async fn place_order(&self, owner_id: Uuid) -> Result<Order> {
        let now = self.manager.clock().now();
        let order = self
            .manager
            .store()
            .place_order(owner_id, now + self.payment_window, now)
            .await?;
        info!(
            "Placed order {} for {} with {} lines, payment due {}",
            order.id, owner_id, order.lines.len(), order.payment_deadline
        );
        Ok(order)
    }

    /// Commits every line or none of them.
    pub async fn finalize_order(&self, order_id: Uuid) -> Result<Order> {
        let order = self
            .manager
            .retry_once("finalize_order", || {
                self.manager
                    .store()
                    .finalize_order(order_id, self.manager.clock().now())
            })
            .await?;
        info!("Finalized order {} ({} lines committed)", order_id, order.lines.len());
        Ok(order)
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        let now = self.manager.clock().now();
        match self.manager.store().cancel_order(order_id, now).await? {
            CancelOutcome::Cancelled(order) => {
                info!("Cancelled order {}", order_id);
                Ok(order)
            }
            CancelOutcome::AlreadyCancelled(order) => Ok(order),
        }
    }

    pub async fn order(&self, order_id: Uuid) -> Result<Order> {
        self.manager
            .store()
            .order(order_id)
            .await?
            .ok_or_else(|| ReservationError::not_found("order", order_id))
    }

    async fn hold_line(
        &self,
        owner_id: Uuid,
        subject_type: SubjectType,
        subject_id: Uuid,
        quantity: LineQuantity,
    ) -> Result<CartItem> {
        self.manager
            .retry_once("hold_cart_line", || {
                let now = self.manager.clock().now();
                let line = CartLineHold {
                    owner_id,
                    subject_type,
                    subject_id,
                    quantity,
                    expires_at: now + self.reservation_ttl,
                };
                self.manager.store().hold_cart_line(line, now)
            })
            .await
    }

    /// Extends every other held line. Lines whose hold already lapsed lose it
    /// and show up unreserved; they are re-reserved on their next update.
    async fn touch(&self, owner_id: Uuid, skip_subject: Option<Uuid>) {
        let items = match self.manager.store().cart(owner_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Could not load cart {} to extend holds: {}", owner_id, e);
                return;
            }
        };

        for item in items {
            if Some(item.subject_id) == skip_subject {
                continue;
            }
            let Some(reservation_id) = item.reservation_id else {
                continue;
            };
            match self.manager.extend(reservation_id, self.reservation_ttl).await {
                Ok(_) => {}
                Err(ReservationError::NotFound { .. }) => {
                    let now = self.manager.clock().now();
                    let detach = self
                        .manager
                        .store()
                        .detach_cart_hold(owner_id, item.subject_id, reservation_id, now);
                    if let Err(e) = detach.await {
                        warn!("Could not detach lapsed hold {} from cart {}: {}", reservation_id, owner_id, e);
                    }
                }
                Err(e) => warn!("Could not extend hold {} in cart {}: {}", reservation_id, owner_id, e),
            }
        }
    }
}
