use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{DateRange, Estado, ItemId, ReservationId};

const CHANNEL_CAPACITY: usize = 256;

/// Something moved the committed stock of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockChange {
    /// The catalog entry was created or its stock changed.
    Catalog { stock_total: u32 },
    /// A reservation now holds `cantidad` units over `window` (0 when the line was dropped).
    Lines {
        reservation_id: ReservationId,
        window: DateRange,
        cantidad: u32,
    },
    /// A reservation holding this item changed lifecycle state.
    Estado {
        reservation_id: ReservationId,
        estado: Estado,
    },
}

/// In-process broadcast of stock changes, one channel per item.
pub struct NotifyHub {
    channels: DashMap<ItemId, broadcast::Sender<StockChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on one item. Creates the channel if needed.
    pub fn subscribe(&self, item: ItemId) -> broadcast::Receiver<StockChange> {
        self.channels
            .entry(item)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, item: ItemId, change: StockChange) {
        if let Some(sender) = self.channels.get(&item) {
            let _ = sender.send(change);
        }
    }

    /// Drop channels whose subscribers are all gone.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let item = Ulid::new();
        let mut rx = hub.subscribe(item);

        hub.send(item, StockChange::Catalog { stock_total: 12 });
        assert_eq!(rx.recv().await.unwrap(), StockChange::Catalog { stock_total: 12 });
    }

    #[tokio::test]
    async fn other_items_are_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);

        hub.send(Ulid::new(), StockChange::Catalog { stock_total: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Ulid::new(), StockChange::Catalog { stock_total: 1 });
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        let _kept = hub.subscribe(Ulid::new());
        drop(rx);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
    }
}
