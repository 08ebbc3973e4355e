//! Releases lapsed reservations and cancels pending orders whose payment
//! deadline has passed.
//!
//! Safe to run repeatedly and from several triggers at once. Only a
//! transition this call actually performed is counted, so overlapping sweeps
//! never double count. One bad row is logged and recorded in the report; it
//! never stops the rest of the batch.

use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ReservationError;
use crate::manager::ReservationManager;
use crate::store::{CancelOutcome, ReleaseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepItem {
    Reservation(Uuid),
    Order(Uuid),
    ReservationScan,
    OrderScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub item: SweepItem,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released_count: usize,
    pub cancelled_order_count: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub batch_size: u32,
    pub item_timeout: Duration,
    pub concurrency: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            item_timeout: Duration::from_secs(2),
            concurrency: 8,
        }
    }
}

enum ItemResult {
    Done,
    Skipped,
    Failed(SweepFailure),
}

#[derive(Clone)]
pub struct ExpirySweeper {
    manager: ReservationManager,
    settings: SweepSettings,
}

impl ExpirySweeper {
    pub fn new(manager: ReservationManager, settings: SweepSettings) -> Self {
        Self { manager, settings }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.release_expired(&mut report).await;
        self.cancel_lapsed_orders(&mut report).await;

        if report.released_count > 0 || report.cancelled_order_count > 0 || !report.failures.is_empty() {
            info!(
                "Sweep released {} reservations, cancelled {} orders, {} failures",
                report.released_count,
                report.cancelled_order_count,
                report.failures.len()
            );
        }
        report
    }

    async fn release_expired(&self, report: &mut SweepReport) {
        let now = self.manager.clock().now();
        let ids = match self
            .manager
            .store()
            .expired_reservations(now, self.settings.batch_size)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!("Could not list expired reservations: {}", e);
                report.failures.push(SweepFailure {
                    item: SweepItem::ReservationScan,
                    error: e.to_string(),
                });
                return;
            }
        };

        let results: Vec<ItemResult> = stream::iter(ids)
            .map(|id| self.release_one(id))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                ItemResult::Done => report.released_count += 1,
                ItemResult::Skipped => {}
                ItemResult::Failed(failure) => report.failures.push(failure),
            }
        }
    }

    async fn release_one(&self, id: Uuid) -> ItemResult {
        let item = SweepItem::Reservation(id);
        match tokio::time::timeout(self.settings.item_timeout, self.manager.release(id)).await {
            Ok(Ok(ReleaseOutcome::Released(_))) => ItemResult::Done,
            Ok(Ok(ReleaseOutcome::AlreadyTerminal(_))) => ItemResult::Skipped,
            Ok(Err(e)) => failed(item, e),
            Err(_) => timed_out(item),
        }
    }

    async fn cancel_lapsed_orders(&self, report: &mut SweepReport) {
        let now = self.manager.clock().now();
        let ids = match self
            .manager
            .store()
            .lapsed_orders(now, self.settings.batch_size)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!("Could not list lapsed orders: {}", e);
                report.failures.push(SweepFailure {
                    item: SweepItem::OrderScan,
                    error: e.to_string(),
                });
                return;
            }
        };

        let results: Vec<ItemResult> = stream::iter(ids)
            .map(|id| self.cancel_one(id))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                ItemResult::Done => report.cancelled_order_count += 1,
                ItemResult::Skipped => {}
                ItemResult::Failed(failure) => report.failures.push(failure),
            }
        }
    }

    async fn cancel_one(&self, id: Uuid) -> ItemResult {
        let item = SweepItem::Order(id);
        let now = self.manager.clock().now();
        let cancel = self.manager.store().cancel_order(id, now);
        match tokio::time::timeout(self.settings.item_timeout, cancel).await {
            Ok(Ok(CancelOutcome::Cancelled(_))) => {
                info!("Cancelled order {} after its payment deadline", id);
                ItemResult::Done
            }
            Ok(Ok(CancelOutcome::AlreadyCancelled(_))) => ItemResult::Skipped,
            // confirmed between listing and cancelling
            Ok(Err(ReservationError::InvalidState { .. })) => ItemResult::Skipped,
            Ok(Err(e)) => failed(item, e),
            Err(_) => timed_out(item),
        }
    }
}

fn failed(item: SweepItem, e: ReservationError) -> ItemResult {
    warn!("Sweep could not process {:?}: {}", item, e);
    ItemResult::Failed(SweepFailure {
        item,
        error: e.to_string(),
    })
}

fn timed_out(item: SweepItem) -> ItemResult {
    warn!("Sweep timed out on {:?}", item);
    ItemResult::Failed(SweepFailure {
        item,
        error: "timed out".to_string(),
    })
}
