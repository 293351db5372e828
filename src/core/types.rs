// Core Type Definitions for wallwatch
// Markets, sides, price keys and the events that flow between components

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    Spot,
    Futures,
}

impl Market {
    pub const ALL: [Market; 2] = [Market::Spot, Market::Futures];

    pub fn is_futures(&self) -> bool {
        matches!(self, Market::Futures)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(Market::Spot),
            "futures" => Ok(Market::Futures),
            _ => Err(format!("Invalid market: '{}'", s)),
        }
    }
}

/// Side of the book a resting order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "bid",
            BookSide::Ask => "ask",
        }
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bid" => Ok(BookSide::Bid),
            "ask" => Ok(BookSide::Ask),
            _ => Err(format!("Invalid book side: '{}'", s)),
        }
    }
}

/// Taker side of an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Binance convention: `m == true` means the buyer was the maker,
    /// so the aggressor (taker) sold.
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Which positions a liquidation order wiped out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiqSide {
    Long,
    Short,
}

impl LiqSide {
    /// A forced SELL closes longs; a forced BUY closes shorts.
    pub fn from_order_side(order_side: &str) -> Self {
        if order_side.eq_ignore_ascii_case("SELL") {
            LiqSide::Long
        } else {
            LiqSide::Short
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LiqSide::Long => "long",
            LiqSide::Short => "short",
        }
    }
}

impl fmt::Display for LiqSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PriceKey
// ============================================================================

/// Order-book price as received from the exchange.
///
/// Keeps the canonical decimal string (wall identity across diffs) alongside
/// the parsed value. Ordering and equality compare the parsed decimal first
/// with the raw string as a tie-break; bare IEEE comparison is never used
/// for identity.
#[derive(Debug, Clone)]
pub struct PriceKey {
    raw: String,
    value: OrderedFloat<f64>,
}

impl PriceKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let value: f64 = raw.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self {
            raw: raw.to_string(),
            value: OrderedFloat(value),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> f64 {
        self.value.0
    }
}

impl PartialEq for PriceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl Hash for PriceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ============================================================================
// Stream Events
// ============================================================================

/// Classified aggTrade event.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub market: Market,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub notional_usd: f64,
    pub is_buyer_maker: bool,
    pub timestamp_ms: i64,
}

/// Parsed forceOrder event (futures only).
#[derive(Debug, Clone)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: LiqSide,
    pub price: f64,
    pub quantity: f64,
    pub notional_usd: f64,
    pub order_type: String,
    pub timestamp_ms: i64,
}

// ============================================================================
// Wall Lifecycle
// ============================================================================

/// Why a tracked wall left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    Cancelled,
    Filled,
    Partial,
}

impl GoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoneReason::Cancelled => "cancelled",
            GoneReason::Filled => "filled",
            GoneReason::Partial => "partial",
        }
    }
}

impl fmt::Display for GoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall lifecycle event emitted by the order-book scan after each applied
/// diff batch (and after snapshot re-anchoring).
#[derive(Debug, Clone)]
pub enum WallChange {
    Seen {
        side: BookSide,
        price: PriceKey,
        quantity: f64,
        notional_usd: f64,
        mid: f64,
    },
    Gone {
        side: BookSide,
        price: PriceKey,
        reason: GoneReason,
        last_quantity: f64,
        prev_notional_usd: f64,
        mid: f64,
    },
}

// ============================================================================
// Alert Kinds
// ============================================================================

/// Closed set of alert kinds. The router's static dispatch table and the
/// notification settings are keyed by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    WallNew,
    WallGone,
    ConfirmedWall,
    ConfirmedWallGone,
    LargeTrade,
    MegaTrade,
    Liquidation,
    MegaLiquidation,
    CvdSpike,
    Imbalance,
    Digest,
    System,
}

impl AlertKind {
    pub const ALL: [AlertKind; 12] = [
        AlertKind::WallNew,
        AlertKind::WallGone,
        AlertKind::ConfirmedWall,
        AlertKind::ConfirmedWallGone,
        AlertKind::LargeTrade,
        AlertKind::MegaTrade,
        AlertKind::Liquidation,
        AlertKind::MegaLiquidation,
        AlertKind::CvdSpike,
        AlertKind::Imbalance,
        AlertKind::Digest,
        AlertKind::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::WallNew => "wall_new",
            AlertKind::WallGone => "wall_gone",
            AlertKind::ConfirmedWall => "confirmed_wall",
            AlertKind::ConfirmedWallGone => "confirmed_wall_gone",
            AlertKind::LargeTrade => "large_trade",
            AlertKind::MegaTrade => "mega_trade",
            AlertKind::Liquidation => "liquidation",
            AlertKind::MegaLiquidation => "mega_liquidation",
            AlertKind::CvdSpike => "cvd_spike",
            AlertKind::Imbalance => "imbalance",
            AlertKind::Digest => "digest",
            AlertKind::System => "system",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Time helpers
// ============================================================================

/// Wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Start of the minute containing `ts_ms`, as epoch seconds.
pub fn minute_epoch(ts_ms: i64) -> i64 {
    ts_ms / 1000 / 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_side_from_maker_flag() {
        assert_eq!(TradeSide::from_buyer_is_maker(true), TradeSide::Sell);
        assert_eq!(TradeSide::from_buyer_is_maker(false), TradeSide::Buy);
    }

    #[test]
    fn test_liq_side_mapping() {
        assert_eq!(LiqSide::from_order_side("SELL"), LiqSide::Long);
        assert_eq!(LiqSide::from_order_side("BUY"), LiqSide::Short);
    }

    #[test]
    fn test_price_key_ordering_is_numeric() {
        let a = PriceKey::parse("9000.50").unwrap();
        let b = PriceKey::parse("10000.00").unwrap();
        // Lexicographic order would put "9000.50" after "10000.00"
        assert!(a < b);
    }

    #[test]
    fn test_price_key_identity() {
        let a = PriceKey::parse("50000.00").unwrap();
        let b = PriceKey::parse("50000.00").unwrap();
        let c = PriceKey::parse("50000.10").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "50000.00");
    }

    #[test]
    fn test_price_key_rejects_garbage() {
        assert!(PriceKey::parse("abc").is_none());
        assert!(PriceKey::parse("-1.0").is_none());
        assert!(PriceKey::parse("inf").is_none());
    }

    #[test]
    fn test_minute_epoch() {
        // 2021-01-01 00:01:30.500 UTC
        let ts_ms = 1_609_459_290_500i64;
        assert_eq!(minute_epoch(ts_ms), 1_609_459_260);
    }

    #[test]
    fn test_display_round_trips() {
        use std::str::FromStr;
        assert_eq!(Market::from_str("futures").unwrap(), Market::Futures);
        assert_eq!(BookSide::from_str("ASK").unwrap(), BookSide::Ask);
        assert_eq!(format!("{}", TradeSide::Buy), "BUY");
        assert_eq!(format!("{}", GoneReason::Partial), "partial");
    }
}
