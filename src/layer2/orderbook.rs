// Order Book - synchronized per-market ladder with wall lifecycle scan
// Applies depth diffs under the exchange sequencing rules, buffers while
// invalid, and reports wall changes after every applied batch

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::Thresholds;
use crate::core::types::{BookSide, GoneReason, Market, PriceKey, WallChange};
use crate::layer2::parser::{DepthSnapshot, DepthUpdate};

/// Diffs queued while the book is invalid; oldest dropped beyond this.
pub const DIFF_BUFFER_CAP: usize = 10_000;

/// Result of offering a diff to the book.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Diff applied; wall changes detected during the post-apply scan.
    Applied(Vec<WallChange>),
    /// Book not ready; diff buffered for replay after the next anchor.
    Buffered,
    /// Stale diff (`u <= last_update_id`); ignored.
    Dropped,
    /// Sequencing violation; ladder discarded, re-anchor required.
    Desynced,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BookStats {
    pub diffs_applied: u64,
    pub diffs_dropped: u64,
    pub diffs_buffered: u64,
    pub buffer_overflow: u64,
    pub desyncs: u64,
    pub pruned_levels: u64,
    pub invariant_violations: u64,
}

/// Read-only status snapshot.
#[derive(Debug, Clone)]
pub struct BookStatus {
    pub ready: bool,
    pub last_update_id: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub mid: Option<f64>,
    pub spread_pct: Option<f64>,
    pub wall_count_bid: usize,
    pub wall_count_ask: usize,
    pub buffer_len: usize,
}

/// Depth/imbalance bands used by the per-minute metrics snapshot.
pub const METRIC_BANDS: [f64; 5] = [0.001, 0.005, 0.01, 0.02, 0.05];

#[derive(Debug, Clone)]
pub struct BookMetrics {
    pub mid_price: f64,
    pub spread_pct: f64,
    pub bid_depth: [f64; 5],
    pub ask_depth: [f64; 5],
    pub imbalance: [f64; 5],
    pub wall_count_bid: usize,
    pub wall_count_ask: usize,
}

/// Current view of one tracked wall level, for the confirmed-wall checker.
#[derive(Debug, Clone)]
pub struct WallView {
    pub quantity: f64,
    pub notional_usd: f64,
    pub mid: f64,
    pub distance_pct: f64,
}

/// Flags the snapshot recovery loop polls.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryState {
    pub ready: bool,
    pub violated: bool,
    pub not_ready_for: Option<Duration>,
}

enum SeqCheck {
    Apply,
    Drop,
    Violation,
}

struct BookInner {
    bids: BTreeMap<PriceKey, f64>,
    asks: BTreeMap<PriceKey, f64>,
    last_update_id: u64,
    ready: bool,
    invalid: bool,
    first_diff_applied: bool,
    buffer: VecDeque<DepthUpdate>,
    /// (side, price) -> last scanned quantity for levels currently
    /// qualifying as walls. Survives invalidation so wall identity holds
    /// across re-anchors.
    walls: HashMap<(BookSide, PriceKey), f64>,
    sequencing_violated: bool,
    not_ready_since: Option<Instant>,
    stats: BookStats,
}

/// Synchronized order book for one (market, symbol).
pub struct MarketBook {
    pub market: Market,
    wall_threshold_usd: f64,
    prune_distance: f64,
    inner: RwLock<BookInner>,
}

impl MarketBook {
    pub fn new(market: Market, thresholds: &Thresholds) -> Self {
        info!(market = %market, threshold_usd = thresholds.wall_threshold_usd, "MarketBook created");
        Self {
            market,
            wall_threshold_usd: thresholds.wall_threshold_usd,
            prune_distance: thresholds.prune_distance_pct,
            inner: RwLock::new(BookInner {
                bids: BTreeMap::new(),
                asks: BTreeMap::new(),
                last_update_id: 0,
                ready: false,
                invalid: true,
                first_diff_applied: false,
                buffer: VecDeque::new(),
                walls: HashMap::new(),
                sequencing_violated: false,
                not_ready_since: Some(Instant::now()),
                stats: BookStats::default(),
            }),
        }
    }

    // ========================================================================
    // Invalidation protocol
    // ========================================================================

    /// Mark the book invalid: ladder no longer observable, incoming diffs
    /// buffered until the next `apply_snapshot`. Must run strictly before
    /// any REST fetch that will re-anchor this book.
    pub fn invalidate(&self) {
        let mut inner = self.inner.write();
        inner.ready = false;
        inner.invalid = true;
        inner.buffer.clear();
        if inner.not_ready_since.is_none() {
            inner.not_ready_since = Some(Instant::now());
        }
        debug!(market = %self.market, "book invalidated, buffering diffs until re-anchor");
    }

    /// Install a REST snapshot, replay buffered diffs under the first-diff
    /// rule, and re-assert `ready`. Returns wall changes from the full
    /// rescan of the rebuilt ladder.
    pub fn apply_snapshot(&self, snap: &DepthSnapshot) -> Vec<WallChange> {
        let mut inner = self.inner.write();

        inner.bids.clear();
        inner.asks.clear();
        for (key, qty) in &snap.bids {
            if *qty > 0.0 {
                inner.bids.insert(key.clone(), *qty);
            }
        }
        for (key, qty) in &snap.asks {
            if *qty > 0.0 {
                inner.asks.insert(key.clone(), *qty);
            }
        }
        inner.last_update_id = snap.last_update_id;
        inner.first_diff_applied = false;
        inner.sequencing_violated = false;

        let buffered: Vec<DepthUpdate> = inner.buffer.drain(..).collect();
        let total = buffered.len();
        let mut applied = 0usize;
        let mut dropped = 0usize;
        let mut replay_ok = true;

        for diff in buffered {
            match self.seq_check(&inner, &diff) {
                SeqCheck::Drop => dropped += 1,
                SeqCheck::Apply => {
                    Self::apply_levels(&mut inner, &diff);
                    inner.last_update_id = diff.final_update_id;
                    inner.first_diff_applied = true;
                    applied += 1;
                }
                SeqCheck::Violation => {
                    replay_ok = false;
                    break;
                }
            }
        }

        if !replay_ok {
            inner.ready = false;
            inner.invalid = true;
            inner.sequencing_violated = true;
            if inner.not_ready_since.is_none() {
                inner.not_ready_since = Some(Instant::now());
            }
            inner.stats.desyncs += 1;
            warn!(
                market = %self.market,
                "gap inside buffered diffs during replay, book stays invalid"
            );
            return Vec::new();
        }

        inner.invalid = false;
        inner.ready = true;
        inner.not_ready_since = None;
        info!(
            market = %self.market,
            last_update_id = inner.last_update_id,
            bid_levels = inner.bids.len(),
            ask_levels = inner.asks.len(),
            buffered = total,
            replayed = applied,
            dropped = dropped,
            "snapshot applied"
        );

        self.full_rescan(&mut inner)
    }

    // ========================================================================
    // Diff application
    // ========================================================================

    /// Offer one depth diff. Sequencing per market:
    /// spot window `U <= anchor+1 <= u` then `U == prev_u + 1`;
    /// futures window `U <= anchor <= u` then `pu == prev_u`.
    pub fn apply_diff(&self, diff: DepthUpdate) -> ApplyOutcome {
        let mut inner = self.inner.write();

        if !inner.ready {
            if inner.buffer.len() >= DIFF_BUFFER_CAP {
                inner.buffer.pop_front();
                inner.stats.buffer_overflow += 1;
            }
            inner.buffer.push_back(diff);
            inner.stats.diffs_buffered += 1;
            return ApplyOutcome::Buffered;
        }

        match self.seq_check(&inner, &diff) {
            SeqCheck::Drop => {
                inner.stats.diffs_dropped += 1;
                ApplyOutcome::Dropped
            }
            SeqCheck::Violation => {
                self.desync(&mut inner, &diff);
                ApplyOutcome::Desynced
            }
            SeqCheck::Apply => {
                let changed = Self::apply_levels(&mut inner, &diff);
                inner.last_update_id = diff.final_update_id;
                inner.first_diff_applied = true;
                inner.stats.diffs_applied += 1;
                let changes = self.scan_walls(&mut inner, &changed);
                ApplyOutcome::Applied(changes)
            }
        }
    }

    fn seq_check(&self, inner: &BookInner, diff: &DepthUpdate) -> SeqCheck {
        let u = diff.final_update_id;
        let first = diff.first_update_id;

        if u <= inner.last_update_id {
            return SeqCheck::Drop;
        }

        let ok = if !inner.first_diff_applied {
            // Anchor window. `u > last_update_id` already holds from the
            // drop rule, which covers the upper half of the window.
            let anchor = inner.last_update_id;
            if self.market.is_futures() {
                first <= anchor
            } else {
                first <= anchor + 1
            }
        } else if self.market.is_futures() {
            diff.prev_final_update_id == Some(inner.last_update_id)
        } else {
            first == inner.last_update_id + 1
        };

        if ok {
            SeqCheck::Apply
        } else {
            SeqCheck::Violation
        }
    }

    fn desync(&self, inner: &mut BookInner, diff: &DepthUpdate) {
        warn!(
            market = %self.market,
            last_update_id = inner.last_update_id,
            first_update_id = diff.first_update_id,
            prev_final = ?diff.prev_final_update_id,
            "sequencing violation, ladder discarded; awaiting re-anchor"
        );
        inner.ready = false;
        inner.invalid = true;
        inner.sequencing_violated = true;
        inner.bids.clear();
        inner.asks.clear();
        inner.buffer.clear();
        if inner.not_ready_since.is_none() {
            inner.not_ready_since = Some(Instant::now());
        }
        inner.stats.desyncs += 1;
    }

    /// Upsert/delete the diff's levels. Returns (side, price, old, new) for
    /// every touched level.
    fn apply_levels(
        inner: &mut BookInner,
        diff: &DepthUpdate,
    ) -> Vec<(BookSide, PriceKey, f64, f64)> {
        let mut changed = Vec::with_capacity(diff.bids.len() + diff.asks.len());
        for (key, qty) in &diff.bids {
            let old = Self::apply_level(&mut inner.bids, &mut inner.stats, key, *qty);
            changed.push((BookSide::Bid, key.clone(), old, qty.max(0.0)));
        }
        for (key, qty) in &diff.asks {
            let old = Self::apply_level(&mut inner.asks, &mut inner.stats, key, *qty);
            changed.push((BookSide::Ask, key.clone(), old, qty.max(0.0)));
        }
        changed
    }

    fn apply_level(
        side: &mut BTreeMap<PriceKey, f64>,
        stats: &mut BookStats,
        key: &PriceKey,
        qty: f64,
    ) -> f64 {
        if qty <= 0.0 {
            if qty < 0.0 {
                stats.invariant_violations += 1;
            }
            side.remove(key).unwrap_or(0.0)
        } else {
            side.insert(key.clone(), qty).unwrap_or(0.0)
        }
    }

    // ========================================================================
    // Wall scan
    // ========================================================================

    fn qualifies(&self, price: f64, qty: f64, mid: f64) -> bool {
        qty > 0.0
            && price * qty >= self.wall_threshold_usd
            && (price - mid).abs() / mid <= self.prune_distance
    }

    fn gone_reason(prev_qty: f64, new_qty: f64) -> GoneReason {
        if new_qty == 0.0 {
            GoneReason::Filled
        } else if new_qty < prev_qty {
            GoneReason::Partial
        } else {
            GoneReason::Cancelled
        }
    }

    /// Wall diffing over the levels touched by a batch, plus a re-check of
    /// tracked walls the batch did not touch (the mid may have moved them
    /// out of the window).
    fn scan_walls(
        &self,
        inner: &mut BookInner,
        changed: &[(BookSide, PriceKey, f64, f64)],
    ) -> Vec<WallChange> {
        let mid = match Self::mid_of(inner) {
            Some(m) if m > 0.0 => m,
            _ => return Vec::new(),
        };

        let mut out = Vec::new();
        let mut touched: HashSet<(BookSide, PriceKey)> = HashSet::with_capacity(changed.len());

        for (side, key, _old, new_qty) in changed {
            touched.insert((*side, key.clone()));
            let price = key.value();
            let map_key = (*side, key.clone());
            let prev = inner.walls.get(&map_key).copied();

            if self.qualifies(price, *new_qty, mid) {
                inner.walls.insert(map_key, *new_qty);
                out.push(WallChange::Seen {
                    side: *side,
                    price: key.clone(),
                    quantity: *new_qty,
                    notional_usd: price * new_qty,
                    mid,
                });
            } else if let Some(prev_qty) = prev {
                inner.walls.remove(&map_key);
                out.push(WallChange::Gone {
                    side: *side,
                    price: key.clone(),
                    reason: Self::gone_reason(prev_qty, *new_qty),
                    last_quantity: *new_qty,
                    prev_notional_usd: prev_qty * price,
                    mid,
                });
            }
        }

        let untouched: Vec<(BookSide, PriceKey)> = inner
            .walls
            .keys()
            .filter(|k| !touched.contains(k))
            .cloned()
            .collect();
        for (side, key) in untouched {
            let price = key.value();
            let ladder_qty = match side {
                BookSide::Bid => inner.bids.get(&key).copied().unwrap_or(0.0),
                BookSide::Ask => inner.asks.get(&key).copied().unwrap_or(0.0),
            };
            if self.qualifies(price, ladder_qty, mid) {
                inner.walls.insert((side, key), ladder_qty);
            } else {
                let prev_qty = inner.walls.remove(&(side, key.clone())).unwrap_or(0.0);
                out.push(WallChange::Gone {
                    side,
                    price: key,
                    reason: Self::gone_reason(prev_qty, ladder_qty),
                    last_quantity: ladder_qty,
                    prev_notional_usd: prev_qty * price,
                    mid,
                });
            }
        }

        out
    }

    /// Diff the wall map against the entire rebuilt ladder. Used after
    /// snapshot anchoring, where per-level history is not available.
    fn full_rescan(&self, inner: &mut BookInner) -> Vec<WallChange> {
        let mid = match Self::mid_of(inner) {
            Some(m) if m > 0.0 => m,
            _ => return Vec::new(),
        };

        let mut out = Vec::new();
        let mut qualifying: HashSet<(BookSide, PriceKey)> = HashSet::new();

        for (side, ladder) in [(BookSide::Bid, &inner.bids), (BookSide::Ask, &inner.asks)] {
            for (key, qty) in ladder {
                let price = key.value();
                if self.qualifies(price, *qty, mid) {
                    qualifying.insert((side, key.clone()));
                    out.push(WallChange::Seen {
                        side,
                        price: key.clone(),
                        quantity: *qty,
                        notional_usd: price * qty,
                        mid,
                    });
                }
            }
        }

        let gone: Vec<(BookSide, PriceKey)> = inner
            .walls
            .keys()
            .filter(|k| !qualifying.contains(k))
            .cloned()
            .collect();
        for (side, key) in gone {
            let price = key.value();
            let ladder_qty = match side {
                BookSide::Bid => inner.bids.get(&key).copied().unwrap_or(0.0),
                BookSide::Ask => inner.asks.get(&key).copied().unwrap_or(0.0),
            };
            let prev_qty = inner.walls.remove(&(side, key.clone())).unwrap_or(0.0);
            out.push(WallChange::Gone {
                side,
                price: key,
                reason: Self::gone_reason(prev_qty, ladder_qty),
                last_quantity: ladder_qty,
                prev_notional_usd: prev_qty * price,
                mid,
            });
        }

        for (side, key) in qualifying {
            let qty = match side {
                BookSide::Bid => inner.bids.get(&key).copied().unwrap_or(0.0),
                BookSide::Ask => inner.asks.get(&key).copied().unwrap_or(0.0),
            };
            inner.walls.insert((side, key), qty);
        }

        out
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop levels further than the prune distance from mid. Memory
    /// management only; the wall scan has already retired anything this
    /// removes.
    pub fn prune_distant_levels(&self) -> usize {
        let mut inner = self.inner.write();
        let mid = match Self::mid_of(&inner) {
            Some(m) if m > 0.0 => m,
            _ => return 0,
        };
        let low = mid * (1.0 - self.prune_distance);
        let high = mid * (1.0 + self.prune_distance);

        let before = inner.bids.len() + inner.asks.len();
        inner.bids.retain(|k, _| (low..=high).contains(&k.value()));
        inner.asks.retain(|k, _| (low..=high).contains(&k.value()));
        let pruned = before - (inner.bids.len() + inner.asks.len());
        inner.stats.pruned_levels += pruned as u64;
        if pruned > 0 {
            debug!(market = %self.market, pruned = pruned, "pruned distant levels");
        }
        pruned
    }

    // ========================================================================
    // Read-only views (defensive copies; lock never held across I/O)
    // ========================================================================

    fn mid_of(inner: &BookInner) -> Option<f64> {
        let best_bid = inner.bids.keys().next_back()?.value();
        let best_ask = inner.asks.keys().next()?.value();
        Some((best_bid + best_ask) / 2.0)
    }

    fn spread_pct_of(inner: &BookInner) -> Option<f64> {
        let best_bid = inner.bids.keys().next_back()?.value();
        let best_ask = inner.asks.keys().next()?.value();
        let mid = (best_bid + best_ask) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((best_ask - best_bid) / mid * 100.0)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    pub fn mid(&self) -> Option<f64> {
        Self::mid_of(&self.inner.read())
    }

    /// Defensive copy of the best n levels per side (bids descending,
    /// asks ascending).
    pub fn top_levels(&self, n: usize) -> (Vec<(PriceKey, f64)>, Vec<(PriceKey, f64)>) {
        let inner = self.inner.read();
        let bids = inner
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(k, q)| (k.clone(), *q))
            .collect();
        let asks = inner
            .asks
            .iter()
            .take(n)
            .map(|(k, q)| (k.clone(), *q))
            .collect();
        (bids, asks)
    }

    pub fn status(&self) -> BookStatus {
        let inner = self.inner.read();
        BookStatus {
            ready: inner.ready,
            last_update_id: inner.last_update_id,
            bid_levels: inner.bids.len(),
            ask_levels: inner.asks.len(),
            mid: Self::mid_of(&inner),
            spread_pct: Self::spread_pct_of(&inner),
            wall_count_bid: inner.walls.keys().filter(|(s, _)| *s == BookSide::Bid).count(),
            wall_count_ask: inner.walls.keys().filter(|(s, _)| *s == BookSide::Ask).count(),
            buffer_len: inner.buffer.len(),
        }
    }

    pub fn stats(&self) -> BookStats {
        self.inner.read().stats
    }

    /// Aggregated depth/imbalance metrics for the minute snapshot table.
    pub fn metrics(&self) -> Option<BookMetrics> {
        let inner = self.inner.read();
        if !inner.ready {
            return None;
        }
        let mid = Self::mid_of(&inner)?;
        if mid <= 0.0 {
            return None;
        }
        let spread_pct = Self::spread_pct_of(&inner).unwrap_or(0.0);

        let mut bid_depth = [0.0f64; 5];
        let mut ask_depth = [0.0f64; 5];
        let mut imbalance = [0.0f64; 5];

        for (i, band) in METRIC_BANDS.iter().enumerate() {
            let low = mid * (1.0 - band);
            let high = mid * (1.0 + band);
            let bid_sum: f64 = inner
                .bids
                .iter()
                .filter(|(k, _)| (low..=mid).contains(&k.value()))
                .map(|(k, q)| k.value() * q)
                .sum();
            let ask_sum: f64 = inner
                .asks
                .iter()
                .filter(|(k, _)| (mid..=high).contains(&k.value()))
                .map(|(k, q)| k.value() * q)
                .sum();
            bid_depth[i] = bid_sum;
            ask_depth[i] = ask_sum;
            let total = bid_sum + ask_sum;
            imbalance[i] = if total > 0.0 {
                (bid_sum - ask_sum) / total
            } else {
                0.0
            };
        }

        Some(BookMetrics {
            mid_price: mid,
            spread_pct,
            bid_depth,
            ask_depth,
            imbalance,
            wall_count_bid: inner.walls.keys().filter(|(s, _)| *s == BookSide::Bid).count(),
            wall_count_ask: inner.walls.keys().filter(|(s, _)| *s == BookSide::Ask).count(),
        })
    }

    /// Current view of one tracked wall level (confirmed-wall checker).
    /// None if the book is not observable or the level is gone.
    pub fn wall_view(&self, side: BookSide, price_str: &str) -> Option<WallView> {
        let key = PriceKey::parse(price_str)?;
        let inner = self.inner.read();
        if !inner.ready {
            return None;
        }
        let mid = Self::mid_of(&inner)?;
        if mid <= 0.0 {
            return None;
        }
        let qty = match side {
            BookSide::Bid => inner.bids.get(&key).copied()?,
            BookSide::Ask => inner.asks.get(&key).copied()?,
        };
        let price = key.value();
        Some(WallView {
            quantity: qty,
            notional_usd: price * qty,
            mid,
            distance_pct: (price - mid) / mid * 100.0,
        })
    }

    pub fn recovery_state(&self) -> RecoveryState {
        let inner = self.inner.read();
        RecoveryState {
            ready: inner.ready,
            violated: inner.sequencing_violated,
            not_ready_for: inner.not_ready_since.map(|t| t.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    fn key(s: &str) -> PriceKey {
        PriceKey::parse(s).unwrap()
    }

    fn snapshot(anchor: u64, bids: &[(&str, f64)], asks: &[(&str, f64)]) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: anchor,
            bids: bids.iter().map(|(p, q)| (key(p), *q)).collect(),
            asks: asks.iter().map(|(p, q)| (key(p), *q)).collect(),
        }
    }

    fn diff(
        first: u64,
        last: u64,
        pu: Option<u64>,
        bids: &[(&str, f64)],
        asks: &[(&str, f64)],
    ) -> DepthUpdate {
        DepthUpdate {
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: pu,
            event_time_ms: 0,
            bids: bids.iter().map(|(p, q)| (key(p), *q)).collect(),
            asks: asks.iter().map(|(p, q)| (key(p), *q)).collect(),
        }
    }

    fn ready_futures_book() -> MarketBook {
        let book = MarketBook::new(Market::Futures, &thresholds());
        book.apply_snapshot(&snapshot(
            100,
            &[("50000.00", 1.0), ("49900.00", 2.0)],
            &[("50100.00", 1.0), ("50200.00", 2.0)],
        ));
        assert!(book.is_ready());
        book
    }

    #[test]
    fn test_diffs_buffer_until_anchor() {
        let book = MarketBook::new(Market::Futures, &thresholds());
        assert!(matches!(
            book.apply_diff(diff(1, 2, None, &[], &[])),
            ApplyOutcome::Buffered
        ));
        assert_eq!(book.status().buffer_len, 1);
    }

    #[test]
    fn test_futures_first_diff_window() {
        // U == anchor accepted
        let book = ready_futures_book();
        assert!(matches!(
            book.apply_diff(diff(100, 105, Some(99), &[], &[])),
            ApplyOutcome::Applied(_)
        ));
        assert_eq!(book.status().last_update_id, 105);

        // U > anchor rejected
        let book = ready_futures_book();
        assert!(matches!(
            book.apply_diff(diff(101, 105, Some(100), &[], &[])),
            ApplyOutcome::Desynced
        ));
        assert!(!book.is_ready());
    }

    #[test]
    fn test_futures_pu_chain() {
        let book = ready_futures_book();
        book.apply_diff(diff(100, 105, Some(99), &[], &[]));
        assert!(matches!(
            book.apply_diff(diff(106, 110, Some(105), &[], &[])),
            ApplyOutcome::Applied(_)
        ));
        // pu mismatch after the chain is established
        assert!(matches!(
            book.apply_diff(diff(111, 115, Some(109), &[], &[])),
            ApplyOutcome::Desynced
        ));
        let state = book.recovery_state();
        assert!(state.violated);
        assert!(!state.ready);
    }

    #[test]
    fn test_spot_first_diff_window() {
        let book = MarketBook::new(Market::Spot, &thresholds());
        book.apply_snapshot(&snapshot(100, &[("50000.00", 1.0)], &[("50100.00", 1.0)]));

        // U == anchor+1 accepted
        assert!(matches!(
            book.apply_diff(diff(101, 103, None, &[], &[])),
            ApplyOutcome::Applied(_)
        ));
        // then strict U == prev_u + 1
        assert!(matches!(
            book.apply_diff(diff(104, 106, None, &[], &[])),
            ApplyOutcome::Applied(_)
        ));
        assert!(matches!(
            book.apply_diff(diff(108, 110, None, &[], &[])),
            ApplyOutcome::Desynced
        ));
    }

    #[test]
    fn test_stale_diff_dropped() {
        let book = ready_futures_book();
        assert!(matches!(
            book.apply_diff(diff(90, 99, Some(89), &[], &[])),
            ApplyOutcome::Dropped
        ));
        assert!(book.is_ready());
        assert_eq!(book.status().last_update_id, 100);
    }

    #[test]
    fn test_empty_diff_is_noop() {
        let book = ready_futures_book();
        let before = book.status();
        match book.apply_diff(diff(100, 101, Some(99), &[], &[])) {
            ApplyOutcome::Applied(changes) => assert!(changes.is_empty()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let after = book.status();
        assert_eq!(after.bid_levels, before.bid_levels);
        assert_eq!(after.ask_levels, before.ask_levels);
    }

    #[test]
    fn test_snapshot_identical_to_ladder_is_idempotent() {
        let book = ready_futures_book();
        let before = book.status();
        let changes = book.apply_snapshot(&snapshot(
            100,
            &[("50000.00", 1.0), ("49900.00", 2.0)],
            &[("50100.00", 1.0), ("50200.00", 2.0)],
        ));
        assert!(changes.is_empty());
        let after = book.status();
        assert_eq!(after.last_update_id, before.last_update_id);
        assert_eq!(after.bid_levels, before.bid_levels);
        assert!(after.ready);
    }

    #[test]
    fn test_wall_seen_and_gone_filled() {
        let book = ready_futures_book();
        // mid = 50050; qty 50 @ 50000 = $2.5M notional, inside the window
        let changes = match book.apply_diff(diff(100, 105, Some(99), &[("50000.00", 50.0)], &[])) {
            ApplyOutcome::Applied(c) => c,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(matches!(
            changes.as_slice(),
            [WallChange::Seen { side: BookSide::Bid, notional_usd, .. }]
                if (*notional_usd - 2_500_000.0).abs() < 1.0
        ));

        // level drops to zero -> filled
        let changes = match book.apply_diff(diff(106, 110, Some(105), &[("50000.00", 0.0)], &[])) {
            ApplyOutcome::Applied(c) => c,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(matches!(
            changes.as_slice(),
            [WallChange::Gone { reason: GoneReason::Filled, .. }]
        ));
    }

    #[test]
    fn test_wall_gone_partial() {
        let book = ready_futures_book();
        book.apply_diff(diff(100, 105, Some(99), &[("50000.00", 50.0)], &[]));
        // qty shrinks but stays > 0 while falling below the threshold
        let changes = match book.apply_diff(diff(106, 110, Some(105), &[("50000.00", 1.0)], &[])) {
            ApplyOutcome::Applied(c) => c,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(matches!(
            changes.as_slice(),
            [WallChange::Gone { reason: GoneReason::Partial, .. }]
        ));
    }

    #[test]
    fn test_wall_cancelled_when_mid_moves_away() {
        let mut th = thresholds();
        th.prune_distance_pct = 0.01; // tight window so a mid move disqualifies
        let book = MarketBook::new(Market::Futures, &th);
        book.apply_snapshot(&snapshot(
            100,
            &[("50000.00", 50.0), ("49990.00", 1.0)],
            &[("50010.00", 1.0)],
        ));
        // the $2.5M bid at 50000 is a wall at mid ~50005
        assert_eq!(book.status().wall_count_bid, 1);

        // best levels jump 2% away; the wall level itself is untouched
        let changes = match book.apply_diff(diff(
            100,
            105,
            Some(99),
            &[("50990.00", 1.0), ("49990.00", 0.0)],
            &[("50010.00", 0.0), ("51010.00", 1.0)],
        )) {
            ApplyOutcome::Applied(c) => c,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let gone: Vec<_> = changes
            .iter()
            .filter(|c| matches!(c, WallChange::Gone { .. }))
            .collect();
        assert_eq!(gone.len(), 1);
        assert!(matches!(
            gone[0],
            WallChange::Gone { reason: GoneReason::Cancelled, .. }
        ));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let book = ready_futures_book();
        // exactly $500_000 at 50000.00 -> qty 10.0
        let changes = match book.apply_diff(diff(100, 105, Some(99), &[("50000.00", 10.0)], &[])) {
            ApplyOutcome::Applied(c) => c,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], WallChange::Seen { .. }));
    }

    #[test]
    fn test_prune_distant_levels() {
        let book = MarketBook::new(Market::Futures, &thresholds());
        book.apply_snapshot(&snapshot(
            100,
            &[("50000.00", 1.0), ("20000.00", 5.0)],
            &[("50100.00", 1.0), ("90000.00", 5.0)],
        ));
        let pruned = book.prune_distant_levels();
        assert_eq!(pruned, 2);
        let status = book.status();
        assert_eq!(status.bid_levels, 1);
        assert_eq!(status.ask_levels, 1);
    }

    #[test]
    fn test_invalidate_buffers_and_replay_matches_uninterrupted() {
        let d1 = diff(100, 105, Some(99), &[("50000.00", 3.0)], &[]);
        let d2 = diff(106, 110, Some(105), &[("49950.00", 2.0)], &[("50100.00", 0.0)]);
        let d3 = diff(111, 115, Some(110), &[("50000.00", 0.0)], &[("50150.00", 4.0)]);

        // Reference: no refresh
        let a = ready_futures_book();
        for d in [d1.clone(), d2.clone(), d3.clone()] {
            assert!(matches!(a.apply_diff(d), ApplyOutcome::Applied(_)));
        }

        // Refresh mid-stream: invalidate, buffer d2/d3 during the "fetch",
        // re-anchor inside d2's window (diff levels are absolute, so the
        // overlapping replay is idempotent), replay
        let b = ready_futures_book();
        assert!(matches!(b.apply_diff(d1), ApplyOutcome::Applied(_)));
        b.invalidate();
        assert!(matches!(b.apply_diff(d2), ApplyOutcome::Buffered));
        assert!(matches!(b.apply_diff(d3), ApplyOutcome::Buffered));
        b.apply_snapshot(&snapshot(
            108,
            &[("50000.00", 3.0), ("49950.00", 2.0), ("49900.00", 2.0)],
            &[("50200.00", 2.0)],
        ));

        let sa = a.status();
        let sb = b.status();
        assert!(sb.ready);
        assert_eq!(sa.last_update_id, sb.last_update_id);
        assert_eq!(sa.bid_levels, sb.bid_levels);
        assert_eq!(sa.ask_levels, sb.ask_levels);
        assert_eq!(sa.mid, sb.mid);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let book = MarketBook::new(Market::Futures, &thresholds());
        for i in 0..(DIFF_BUFFER_CAP as u64 + 10) {
            book.apply_diff(diff(i + 1, i + 2, None, &[], &[]));
        }
        assert_eq!(book.status().buffer_len, DIFF_BUFFER_CAP);
        assert_eq!(book.stats().buffer_overflow, 10);
    }

    #[test]
    fn test_metrics_bands() {
        let book = ready_futures_book();
        let m = book.metrics().unwrap();
        assert!(m.mid_price > 0.0);
        // widest band covers everything near mid
        assert!(m.bid_depth[4] > 0.0);
        assert!(m.ask_depth[4] > 0.0);
        assert!(m.imbalance[4].abs() <= 1.0);
    }

    #[test]
    fn test_top_levels_ordering() {
        let book = ready_futures_book();
        let (bids, asks) = book.top_levels(2);
        assert_eq!(bids[0].0.as_str(), "50000.00");
        assert_eq!(bids[1].0.as_str(), "49900.00");
        assert_eq!(asks[0].0.as_str(), "50100.00");
        assert_eq!(asks[1].0.as_str(), "50200.00");
    }

    #[test]
    fn test_wall_view() {
        let book = ready_futures_book();
        book.apply_diff(diff(100, 105, Some(99), &[("50000.00", 50.0)], &[]));
        let view = book.wall_view(BookSide::Bid, "50000.00").unwrap();
        assert!((view.notional_usd - 2_500_000.0).abs() < 1.0);
        assert!(view.distance_pct < 0.0);
        assert!(book.wall_view(BookSide::Bid, "12345.00").is_none());
    }
}
