use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::types::PriceSample;

// ---------------------------------------------------------------------------
// PriceHistoryStore -- bounded FIFO ring per symbol
// ---------------------------------------------------------------------------

/// Per-symbol summary for the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub sample_count: usize,
    pub last_update_timestamp: Option<i64>,
}

/// Thread-safe store holding the most recent `capacity` samples per symbol in
/// arrival order. Timestamps within a symbol never decrease.
///
/// The lock is held only for a single append, seed or copy; indicator
/// computation always runs on a copied snapshot.
pub struct PriceHistoryStore {
    histories: RwLock<HashMap<String, VecDeque<PriceSample>>>,
    capacity: usize,
}

impl PriceHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one sample, evicting the oldest when full.
    ///
    /// Returns `false` (and stores nothing) for a non-finite price or a
    /// timestamp older than the symbol's newest sample.
    pub fn append(&self, symbol: &str, price: f64, timestamp: i64) -> bool {
        self.push(PriceSample::new(symbol, price, timestamp))
    }

    /// [`append`](Self::append) for an already-built sample.
    pub fn push(&self, sample: PriceSample) -> bool {
        if !sample.price.is_finite() {
            debug!(symbol = %sample.symbol, "dropping non-finite price");
            return false;
        }

        let mut map = self.histories.write();
        let ring = map
            .entry(sample.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if let Some(last) = ring.back() {
            if sample.timestamp < last.timestamp {
                debug!(
                    symbol = %sample.symbol,
                    ts = sample.timestamp,
                    newest = last.timestamp,
                    "dropping out-of-order sample"
                );
                return false;
            }
        }

        ring.push_back(sample);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        true
    }

    /// Bulk-initialise a symbol's history (cold start).
    ///
    /// Samples are sorted by timestamp; those not strictly older than the
    /// oldest live sample are skipped so live data always wins. The merged ring is trimmed
    /// to capacity keeping the newest. Returns how many seeded samples were
    /// retained.
    pub fn seed(&self, symbol: &str, samples: Vec<PriceSample>) -> usize {
        let mut incoming: Vec<PriceSample> = samples
            .into_iter()
            .filter(|s| s.symbol == symbol && s.price.is_finite())
            .collect();
        incoming.sort_by_key(|s| s.timestamp);

        let mut map = self.histories.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if let Some(oldest) = ring.front().map(|s| s.timestamp) {
            incoming.retain(|s| s.timestamp < oldest);
        }

        let live = ring.len();
        for sample in incoming.into_iter().rev() {
            ring.push_front(sample);
        }
        while ring.len() > self.capacity {
            ring.pop_front();
        }

        let retained = ring.len().saturating_sub(live);
        debug!(symbol, retained, total = ring.len(), "price history seeded");
        retained
    }

    /// Copy of the symbol's history, oldest first.
    pub fn snapshot(&self, symbol: &str) -> Vec<PriceSample> {
        let map = self.histories.read();
        map.get(symbol)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Prices only, oldest first.
    pub fn prices(&self, symbol: &str) -> Vec<f64> {
        let map = self.histories.read();
        map.get(symbol)
            .map(|ring| ring.iter().map(|s| s.price).collect())
            .unwrap_or_default()
    }

    pub fn last_sample(&self, symbol: &str) -> Option<PriceSample> {
        let map = self.histories.read();
        map.get(symbol).and_then(|ring| ring.back().cloned())
    }

    pub fn len(&self, symbol: &str) -> usize {
        let map = self.histories.read();
        map.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.histories.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn stats(&self, symbol: &str) -> HistoryStats {
        let map = self.histories.read();
        match map.get(symbol) {
            Some(ring) => HistoryStats {
                sample_count: ring.len(),
                last_update_timestamp: ring.back().map(|s| s.timestamp),
            },
            None => HistoryStats {
                sample_count: 0,
                last_update_timestamp: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
