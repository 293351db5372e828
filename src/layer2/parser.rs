// Message Parser - raw Binance WebSocket/REST payloads into typed events
// Combined-stream envelopes are routed by stream-name suffix

use serde::Deserialize;
use thiserror::Error;

use crate::core::types::{LiqSide, LiquidationEvent, Market, PriceKey, TradeEvent, TradeSide};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Unroutable stream: '{0}'")]
    UnknownStream(String),
}

fn parse_f64(value: &str, field: &'static str) -> Result<f64, ParseError> {
    value.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(PriceKey, f64)>, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    for pair in raw {
        let key = PriceKey::parse(&pair[0]).ok_or_else(|| ParseError::InvalidNumber {
            field: "price",
            value: pair[0].clone(),
        })?;
        let qty = parse_f64(&pair[1], "quantity")?;
        out.push((key, qty));
    }
    Ok(out)
}

// ============================================================================
// Combined-stream envelope
// ============================================================================

/// Every message on a combined stream is `{ "stream": ..., "data": ... }`.
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Consumer a stream name routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRoute {
    Depth,
    Trade,
    Liquidation,
}

pub fn route_stream(stream: &str) -> Result<StreamRoute, ParseError> {
    if stream.contains("@depth") {
        Ok(StreamRoute::Depth)
    } else if stream.contains("@aggTrade") {
        Ok(StreamRoute::Trade)
    } else if stream.contains("forceOrder") {
        Ok(StreamRoute::Liquidation)
    } else {
        Err(ParseError::UnknownStream(stream.to_string()))
    }
}

// ============================================================================
// Typed payloads
// ============================================================================

/// Order-book diff event. `prev_final_update_id` (`pu`) is present on the
/// futures stream only.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub prev_final_update_id: Option<u64>,
    pub event_time_ms: i64,
    pub bids: Vec<(PriceKey, f64)>,
    pub asks: Vec<(PriceKey, f64)>,
}

/// REST depth snapshot.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(PriceKey, f64)>,
    pub asks: Vec<(PriceKey, f64)>,
}

// ============================================================================
// Raw serde structures (Binance field names)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "pu", default)]
    prev_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawAggTrade {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "T")]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RawForceOrderInner {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o", default)]
    order_type: Option<String>,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "p", default)]
    price: Option<String>,
    #[serde(rename = "ap", default)]
    average_price: Option<String>,
    #[serde(rename = "T")]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RawForceOrder {
    #[serde(rename = "o")]
    order: RawForceOrderInner,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

// ============================================================================
// Parse functions
// ============================================================================

pub fn parse_depth_update(data: &serde_json::Value) -> Result<DepthUpdate, ParseError> {
    let raw: RawDepthUpdate = serde_json::from_value(data.clone())?;
    Ok(DepthUpdate {
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        prev_final_update_id: raw.prev_final_update_id,
        event_time_ms: raw.event_time,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

pub fn parse_trade(data: &serde_json::Value, market: Market) -> Result<TradeEvent, ParseError> {
    let raw: RawAggTrade = serde_json::from_value(data.clone())?;
    let price = parse_f64(&raw.price, "price")?;
    let quantity = parse_f64(&raw.quantity, "quantity")?;
    Ok(TradeEvent {
        market,
        side: TradeSide::from_buyer_is_maker(raw.is_buyer_maker),
        price,
        quantity,
        notional_usd: price * quantity,
        is_buyer_maker: raw.is_buyer_maker,
        timestamp_ms: raw.timestamp,
    })
}

pub fn parse_liquidation(data: &serde_json::Value) -> Result<LiquidationEvent, ParseError> {
    let raw: RawForceOrder = serde_json::from_value(data.clone())?;
    let o = raw.order;
    // Average price reflects actual execution; the limit price is a fallback.
    let price_str = o
        .average_price
        .or(o.price)
        .unwrap_or_else(|| "0".to_string());
    let price = parse_f64(&price_str, "price")?;
    let quantity = parse_f64(&o.quantity, "quantity")?;
    Ok(LiquidationEvent {
        symbol: o.symbol,
        side: LiqSide::from_order_side(&o.side),
        price,
        quantity,
        notional_usd: price * quantity,
        order_type: o.order_type.unwrap_or_else(|| "MARKET".to_string()),
        timestamp_ms: o.timestamp,
    })
}

pub fn parse_depth_snapshot(body: &str) -> Result<DepthSnapshot, ParseError> {
    let raw: RawDepthSnapshot = serde_json::from_str(body)?;
    Ok(DepthSnapshot {
        last_update_id: raw.last_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_by_suffix() {
        assert_eq!(
            route_stream("btcusdt@depth@100ms").unwrap(),
            StreamRoute::Depth
        );
        assert_eq!(route_stream("btcusdt@aggTrade").unwrap(), StreamRoute::Trade);
        assert_eq!(
            route_stream("!forceOrder@arr").unwrap(),
            StreamRoute::Liquidation
        );
        assert!(route_stream("btcusdt@kline_1m").is_err());
    }

    #[test]
    fn test_parse_depth_update_futures() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":100,"u":105,"pu":99,
                "b":[["50000.00","1.5"],["49999.50","0"]],"a":[["50001.00","2.0"]]}"#,
        )
        .unwrap();
        let update = parse_depth_update(&data).unwrap();
        assert_eq!(update.first_update_id, 100);
        assert_eq!(update.final_update_id, 105);
        assert_eq!(update.prev_final_update_id, Some(99));
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.bids[0].0.as_str(), "50000.00");
        assert_eq!(update.bids[1].1, 0.0);
    }

    #[test]
    fn test_parse_depth_update_spot_has_no_pu() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":7,"u":9,
                "b":[],"a":[["50010.10","0.25"]]}"#,
        )
        .unwrap();
        let update = parse_depth_update(&data).unwrap();
        assert_eq!(update.prev_final_update_id, None);
    }

    #[test]
    fn test_parse_trade_sides() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"e":"aggTrade","E":1700000000000,"s":"BTCUSDT","a":1,"p":"50000.0","q":"2.0",
                "f":1,"l":1,"T":1700000000123,"m":true}"#,
        )
        .unwrap();
        let trade = parse_trade(&data, Market::Futures).unwrap();
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.notional_usd, 100_000.0);
        assert_eq!(trade.timestamp_ms, 1700000000123);
    }

    #[test]
    fn test_parse_liquidation() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"e":"forceOrder","E":1700000000000,
                "o":{"s":"BTCUSDT","S":"SELL","o":"LIMIT","f":"IOC","q":"10.0",
                     "p":"49900.00","ap":"50000.00","X":"FILLED","l":"10.0","z":"10.0",
                     "T":1700000000456}}"#,
        )
        .unwrap();
        let liq = parse_liquidation(&data).unwrap();
        assert_eq!(liq.symbol, "BTCUSDT");
        assert_eq!(liq.side, LiqSide::Long);
        assert_eq!(liq.price, 50_000.0);
        assert_eq!(liq.notional_usd, 500_000.0);
    }

    #[test]
    fn test_parse_snapshot() {
        let snap = parse_depth_snapshot(
            r#"{"lastUpdateId":12345,
                "bids":[["50000.00","1.0"],["49999.00","2.0"]],
                "asks":[["50001.00","1.5"]]}"#,
        )
        .unwrap();
        assert_eq!(snap.last_update_id, 12345);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"e":"depthUpdate","E":1,"U":1,"u":2,"b":[["oops","1.0"]],"a":[]}"#,
        )
        .unwrap();
        assert!(parse_depth_update(&data).is_err());
    }
}
