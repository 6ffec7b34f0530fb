use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a market position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The order side that closes a position opened on `self`.
    pub fn closing(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("BUY"),
            Side::Sell => f.write_str("SELL"),
        }
    }
}

/// One open position as observed on a terminal account.
///
/// A position is immutable per snapshot; `sl`/`tp` of 0.0 mean unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price_open: f64,
    pub sl: f64,
    pub tp: f64,
    pub magic: u64,
    /// Broker timestamp of the fill (ms since epoch).
    pub opened_at: u64,
}

impl Position {
    /// True if the protective levels changed relative to `prev`.
    pub fn sltp_differs(&self, prev: &Position) -> bool {
        self.sl != prev.sl || self.tp != prev.tp
    }
}

/// Login credentials for one terminal account.
///
/// The password is held decrypted in memory only; `Debug` redacts it so it
/// can never leak through logs or error chains.
#[derive(Clone)]
pub struct Credentials {
    pub login: u64,
    pub password: String,
    pub server: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

/// Trading constraints for a symbol as reported by the terminal.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    /// Smallest tradeable lot size.
    pub volume_min: f64,
    pub digits: u32,
}

/// Best bid/ask at a single instant.
#[derive(Debug, Clone, Copy)]
pub struct TickQuote {
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: u64,
}

/// Full trading state of one account: open positions keyed by ticket plus
/// the number of pending orders (observed, never replicated).
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub positions: HashMap<u64, Position>,
    pub pending_orders: u32,
}

/// Fill policy sent with every trade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    ImmediateOrCancel,
}

/// Order lifetime sent with every trade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    GoodTillCancel,
}

/// Fully-resolved market order submitted to the vendor terminal.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub sl: f64,
    pub tp: f64,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub filling: FillPolicy,
    pub lifetime: TimeInForce,
}

/// Market order that closes an existing position by ticket.
#[derive(Debug, Clone)]
pub struct CloseOrder {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub filling: FillPolicy,
    pub lifetime: TimeInForce,
}

/// Open request as issued by the replication layer.
///
/// `volume` is the desired lot size after multiplier scaling; the terminal
/// layer applies rounding and min/max clamping against live symbol info.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    /// 0.0 = uncapped.
    pub max_lot: f64,
    pub deviation: u32,
    pub magic: u64,
    pub master_ticket: u64,
}

/// Close request as issued by the replication layer.
#[derive(Debug, Clone, Copy)]
pub struct CloseSpec {
    pub slave_ticket: u64,
    pub master_ticket: u64,
    pub deviation: u32,
    pub magic: u64,
}

/// Outcome of a successful open, echoing the executed volume so callers can
/// detect clamp adjustments.
#[derive(Debug, Clone, Copy)]
pub struct OpenReceipt {
    pub ticket: u64,
    pub volume: f64,
    pub price: f64,
}

/// Round a lot volume to the 2-decimal granularity brokers accept.
pub fn round_lots(volume: f64) -> f64 {
    (volume * 100.0).round() / 100.0
}

/// Normalize a desired volume against symbol constraints.
///
/// Rounds to 2 decimals, caps at `max_lot` when set, then raises to
/// `volume_min`. The minimum wins over the cap: a below-minimum order would
/// be rejected outright, so the clamp always produces an executable size.
pub fn clamp_volume(desired: f64, volume_min: f64, max_lot: f64) -> f64 {
    let mut v = round_lots(desired);
    if max_lot > 0.0 {
        v = v.min(max_lot);
    }
    if v < volume_min {
        v = volume_min;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_position(ticket: u64, sl: f64, tp: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 1.0,
            price_open: 1.1,
            sl,
            tp,
            magic: 0,
            opened_at: 0,
        }
    }

    #[test]
    fn closing_side_is_opposite() {
        assert_eq!(Side::Buy.closing(), Side::Sell);
        assert_eq!(Side::Sell.closing(), Side::Buy);
    }

    #[test]
    fn sltp_differs_detects_each_level() {
        let base = mk_position(1, 0.0, 1.2);

        assert!(base.sltp_differs(&mk_position(1, 1.1, 1.2)));
        assert!(base.sltp_differs(&mk_position(1, 0.0, 1.3)));
        assert!(!base.sltp_differs(&mk_position(1, 0.0, 1.2)));
    }

    #[test]
    fn credentials_debug_never_prints_password() {
        let creds = Credentials {
            login: 123456,
            password: "s3cret-pw".to_string(),
            server: "Demo-Server".to_string(),
        };

        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("s3cret-pw"));
        assert!(rendered.contains("123456"));
    }

    #[test]
    fn round_lots_uses_two_decimals() {
        assert_eq!(round_lots(0.125), 0.13);
        assert_eq!(round_lots(0.124), 0.12);
        assert_eq!(round_lots(1.0), 1.0);
    }

    #[test]
    fn clamp_raises_to_symbol_minimum() {
        // 0.01 * 0.1 = 0.001 -> rounds to 0.0 -> raised to min
        assert_eq!(clamp_volume(0.001, 0.01, 0.0), 0.01);
    }

    #[test]
    fn clamp_caps_at_max_lot() {
        assert_eq!(clamp_volume(5.0, 0.01, 2.0), 2.0);
    }

    #[test]
    fn zero_max_lot_means_uncapped() {
        assert_eq!(clamp_volume(50.0, 0.01, 0.0), 50.0);
    }

    #[test]
    fn minimum_wins_over_max_lot() {
        // max_lot below the symbol minimum cannot produce a valid order size;
        // the minimum takes precedence.
        assert_eq!(clamp_volume(1.0, 0.10, 0.05), 0.10);
    }
}
