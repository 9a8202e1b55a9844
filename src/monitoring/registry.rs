//! View registry boundary.
//!
//! The strategy runtime owns the trading state; the monitoring server only
//! reads it through [`ViewRegistry`]. Any view may be absent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use super::views::{
    HealthView, MetricsView, OrderbookView, PnlView, PositionsView, Trade,
};

/// Read-only source of live trading state inside a strategy process
pub trait ViewRegistry: Send + Sync {
    fn health(&self) -> Option<HealthView>;
    fn pnl_view(&self) -> Option<PnlView>;
    fn positions_view(&self) -> Option<PositionsView>;
    fn orderbook_view(&self, asset: &str) -> Option<OrderbookView>;
    /// Most recent trades, newest first
    fn recent_trades(&self, limit: usize) -> Option<Vec<Trade>>;
    fn metrics(&self) -> Option<MetricsView>;
    fn available_assets(&self) -> Option<Vec<String>>;
}

/// Maximum trades retained by [`SharedViewRegistry`]
const MAX_RECENT_TRADES: usize = 1000;

#[derive(Default)]
struct Views {
    health: Option<HealthView>,
    pnl: Option<PnlView>,
    positions: Option<PositionsView>,
    orderbooks: BTreeMap<String, OrderbookView>,
    trades: VecDeque<Trade>,
    metrics: Option<MetricsView>,
}

/// Lock-protected registry the strategy runtime publishes into
#[derive(Default)]
pub struct SharedViewRegistry {
    views: RwLock<Views>,
}

impl SharedViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_health(&self, health: HealthView) {
        self.write(|v| v.health = Some(health));
    }

    pub fn set_pnl(&self, pnl: PnlView) {
        self.write(|v| v.pnl = Some(pnl));
    }

    pub fn set_positions(&self, positions: PositionsView) {
        self.write(|v| v.positions = Some(positions));
    }

    /// Insert or replace the book for `book.asset`
    pub fn set_orderbook(&self, book: OrderbookView) {
        self.write(|v| {
            v.orderbooks.insert(book.asset.clone(), book);
        });
    }

    pub fn record_trade(&self, trade: Trade) {
        self.write(|v| {
            v.trades.push_front(trade);
            v.trades.truncate(MAX_RECENT_TRADES);
        });
    }

    pub fn set_metrics(&self, metrics: MetricsView) {
        self.write(|v| v.metrics = Some(metrics));
    }

    pub fn increment_counter(&self, name: &str, by: u64) {
        self.write(|v| {
            let metrics = v.metrics.get_or_insert_with(MetricsView::default);
            *metrics.counters.entry(name.to_string()).or_insert(0) += by;
        });
    }

    fn write(&self, f: impl FnOnce(&mut Views)) {
        // A poisoned lock only means a writer panicked mid-update; the views
        // are plain data and stay usable
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        f(&mut views);
    }

    fn read<T>(&self, f: impl FnOnce(&Views) -> T) -> T {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        f(&views)
    }
}

impl ViewRegistry for SharedViewRegistry {
    fn health(&self) -> Option<HealthView> {
        self.read(|v| v.health.clone())
    }

    fn pnl_view(&self) -> Option<PnlView> {
        self.read(|v| v.pnl.clone())
    }

    fn positions_view(&self) -> Option<PositionsView> {
        self.read(|v| v.positions.clone())
    }

    fn orderbook_view(&self, asset: &str) -> Option<OrderbookView> {
        self.read(|v| v.orderbooks.get(asset).cloned())
    }

    fn recent_trades(&self, limit: usize) -> Option<Vec<Trade>> {
        self.read(|v| {
            if v.trades.is_empty() {
                None
            } else {
                Some(v.trades.iter().take(limit).cloned().collect())
            }
        })
    }

    fn metrics(&self) -> Option<MetricsView> {
        self.read(|v| v.metrics.clone())
    }

    fn available_assets(&self) -> Option<Vec<String>> {
        self.read(|v| {
            if v.orderbooks.is_empty() {
                None
            } else {
                Some(v.orderbooks.keys().cloned().collect())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_registry_returns_none() {
        let registry = SharedViewRegistry::new();
        assert!(registry.pnl_view().is_none());
        assert!(registry.recent_trades(10).is_none());
        assert!(registry.available_assets().is_none());
        assert!(registry.orderbook_view("BTC").is_none());
    }

    #[test]
    fn test_recent_trades_newest_first_with_limit() {
        let registry = SharedViewRegistry::new();
        for i in 0..5 {
            registry.record_trade(Trade {
                trade_id: format!("t{i}"),
                price: dec!(0.5),
                ..Default::default()
            });
        }
        let trades = registry.recent_trades(2).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade_id, "t4");
        assert_eq!(trades[1].trade_id, "t3");
    }

    #[test]
    fn test_assets_follow_orderbooks() {
        let registry = SharedViewRegistry::new();
        registry.set_orderbook(OrderbookView {
            asset: "ETH".into(),
            ..Default::default()
        });
        registry.set_orderbook(OrderbookView {
            asset: "BTC".into(),
            ..Default::default()
        });
        assert_eq!(registry.available_assets().unwrap(), vec!["BTC", "ETH"]);
        assert!(registry.orderbook_view("ETH").is_some());
    }

    #[test]
    fn test_counters_accumulate() {
        let registry = SharedViewRegistry::new();
        registry.increment_counter("orders_submitted", 2);
        registry.increment_counter("orders_submitted", 3);
        assert_eq!(registry.metrics().unwrap().counters["orders_submitted"], 5);
    }
}
