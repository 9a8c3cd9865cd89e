//! Market state cache.
//!
//! Holds the latest quote and Greeks per symbol. Staleness is recomputed on
//! every read, not just on write, so a feed outage is visible even when no
//! new events arrive. A background sweep raises a one-shot staleness alert
//! per symbol when staleness first crosses the warning threshold; the alert
//! re-arms only after a fresh quote for that symbol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::shared::Symbol;

/// Channel capacity for staleness alerts.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Option sensitivities attached to a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta.
    pub delta: Decimal,
    /// Gamma.
    pub gamma: Decimal,
    /// Theta.
    pub theta: Decimal,
    /// Vega.
    pub vega: Decimal,
}

/// Inbound quote event from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEvent {
    /// Symbol the quote is for.
    pub symbol: Symbol,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Mark (mid or exchange mark).
    pub mark: Decimal,
    /// Greeks, when the feed provides them.
    pub greeks: Option<Greeks>,
}

/// Point-in-time view of a cached symbol.
///
/// `staleness_ms` is computed at read time against the wall clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Symbol.
    pub symbol: Symbol,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Mark price.
    pub mark: Decimal,
    /// Greeks, when known.
    pub greeks: Option<Greeks>,
    /// Last update timestamp.
    pub last_update: DateTime<Utc>,
    /// Milliseconds since the last update, as of this read.
    pub staleness_ms: i64,
}

/// One-shot alert emitted when a symbol first crosses the warning threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessAlert {
    /// Symbol that went stale.
    pub symbol: Symbol,
    /// Observed staleness at the time of the alert.
    pub staleness_ms: i64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bid: Decimal,
    ask: Decimal,
    mark: Decimal,
    greeks: Option<Greeks>,
    last_update: DateTime<Utc>,
    // Edge-trigger latch: set when an alert has fired, cleared by a fresh quote.
    warned: bool,
}

/// Per-symbol quote/Greeks cache with a staleness clock.
///
/// Explicitly constructed and injected; accessed only through its public
/// operations. Safe for concurrent use from multiple trade tasks.
pub struct MarketStateCache {
    entries: RwLock<HashMap<Symbol, CacheEntry>>,
    alert_tx: broadcast::Sender<StalenessAlert>,
    warn_threshold_ms: i64,
}

impl MarketStateCache {
    /// Create a cache with the given staleness warning threshold.
    #[must_use]
    pub fn new(warn_threshold_ms: i64) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            alert_tx,
            warn_threshold_ms,
        }
    }

    /// Ingest a quote event, stamping it with the current time.
    pub fn apply_quote(&self, event: &QuoteEvent) {
        self.apply_quote_at(event, Utc::now());
    }

    /// Ingest a quote event with an explicit timestamp.
    ///
    /// A fresh quote clears the staleness latch so the next breach alerts
    /// again.
    pub fn apply_quote_at(&self, event: &QuoteEvent, at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        entries.insert(
            event.symbol.clone(),
            CacheEntry {
                bid: event.bid,
                ask: event.ask,
                mark: event.mark,
                greeks: event.greeks,
                last_update: at,
                warned: false,
            },
        );
    }

    /// Read the latest snapshot for a symbol, recomputing staleness.
    #[must_use]
    pub fn snapshot(&self, symbol: &Symbol) -> Option<MarketSnapshot> {
        let now = Utc::now();
        let entries = self.entries.read();
        entries.get(symbol).map(|entry| MarketSnapshot {
            symbol: symbol.clone(),
            bid: entry.bid,
            ask: entry.ask,
            mark: entry.mark,
            greeks: entry.greeks,
            last_update: entry.last_update,
            staleness_ms: (now - entry.last_update).num_milliseconds(),
        })
    }

    /// Symbols currently cached.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.read().keys().cloned().collect()
    }

    /// Subscribe to staleness alerts.
    ///
    /// Delivery is at-least-once to each live subscriber; no ordering is
    /// guaranteed across subscribers.
    #[must_use]
    pub fn alerts(&self) -> broadcast::Receiver<StalenessAlert> {
        self.alert_tx.subscribe()
    }

    /// Recompute staleness for all symbols and emit alerts for symbols that
    /// newly crossed the threshold.
    ///
    /// Alerts are sent after the map lock is released.
    pub fn sweep_once(&self) {
        self.sweep_at(Utc::now());
    }

    fn sweep_at(&self, now: DateTime<Utc>) {
        let mut fired = Vec::new();
        {
            let mut entries = self.entries.write();
            for (symbol, entry) in entries.iter_mut() {
                let staleness_ms = (now - entry.last_update).num_milliseconds();
                if staleness_ms >= self.warn_threshold_ms && !entry.warned {
                    entry.warned = true;
                    fired.push(StalenessAlert {
                        symbol: symbol.clone(),
                        staleness_ms,
                    });
                }
            }
        }

        for alert in fired {
            tracing::warn!(
                symbol = %alert.symbol,
                staleness_ms = alert.staleness_ms,
                "market data stale"
            );
            let _ = self.alert_tx.send(alert);
        }
    }

    /// Spawn the background staleness sweep.
    ///
    /// Runs on its own schedule, independent of any trade's lifecycle, until
    /// the shutdown token is cancelled.
    pub fn spawn_sweep(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.sweep_once(),
                    () = shutdown.cancelled() => {
                        tracing::info!("staleness sweep shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for MarketStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketStateCache")
            .field("symbols", &self.entries.read().len())
            .field("warn_threshold_ms", &self.warn_threshold_ms)
            .finish()
    }
}
