// =============================================================================
// Shared types used across the Vega trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a directional signal or trade: long calls or long puts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CALL" => Some(Self::Call),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action requested by an inbound alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertAction {
    BuyCall,
    BuyPut,
    Close,
}

impl AlertAction {
    /// Directional actions carry a trade direction; CLOSE does not.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::BuyCall => Some(Direction::Call),
            Self::BuyPut => Some(Direction::Put),
            Self::Close => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY_CALL" => Some(Self::BuyCall),
            "BUY_PUT" => Some(Self::BuyPut),
            "CLOSE" => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyCall => write!(f, "BUY_CALL"),
            Self::BuyPut => write!(f, "BUY_PUT"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// Where an alert came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    External,
    InternalStrategy,
    ManualTest,
    Retake,
}

impl AlertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::InternalStrategy => "internal_strategy",
            Self::ManualTest => "manual_test",
            Self::Retake => "retake",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "external" => Some(Self::External),
            "internal_strategy" => Some(Self::InternalStrategy),
            "manual_test" => Some(Self::ManualTest),
            "retake" => Some(Self::Retake),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a persisted alert. RECEIVED is the only non-terminal
/// state; once a terminal status is set the row is append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Received,
    Accepted,
    Rejected,
    Processed,
    Error,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Processed => "PROCESSED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(Self::Received),
            "ACCEPTED" => Some(Self::Accepted),
            "REJECTED" => Some(Self::Rejected),
            "PROCESSED" => Some(Self::Processed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade lifecycle state machine.
///
/// ```text
/// PENDING -> FILLED -> STOP_LOSS_PLACED -> EXITING -> CLOSED
/// PENDING -> CANCELLED                (reject / limit timeout)
/// STOP_LOSS_PLACED -> CLOSED          (broker stop filled directly)
/// any non-terminal -> ERROR           (unrecoverable failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    StopLossPlaced,
    Exiting,
    Closed,
    Cancelled,
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::StopLossPlaced => "STOP_LOSS_PLACED",
            Self::Exiting => "EXITING",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "FILLED" => Some(Self::Filled),
            "STOP_LOSS_PLACED" => Some(Self::StopLossPlaced),
            "EXITING" => Some(Self::Exiting),
            "CLOSED" => Some(Self::Closed),
            "CANCELLED" => Some(Self::Cancelled),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Error)
    }

    /// The position is live at the broker (entry filled, not yet closed).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Filled | Self::StopLossPlaced | Self::Exiting)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trade was (or is being) exited or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TimeBased,
    MaxHoldTime,
    StopLoss,
    ProfitTarget,
    TrailingStop,
    StopLossHit,
    Signal,
    ManualClose,
    LimitTimeout,
    BrokerRejected,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeBased => "TIME_BASED",
            Self::MaxHoldTime => "MAX_HOLD_TIME",
            Self::StopLoss => "STOP_LOSS",
            Self::ProfitTarget => "PROFIT_TARGET",
            Self::TrailingStop => "TRAILING_STOP",
            Self::StopLossHit => "STOP_LOSS_HIT",
            Self::Signal => "SIGNAL",
            Self::ManualClose => "MANUAL_CLOSE",
            Self::LimitTimeout => "LIMIT_TIMEOUT",
            Self::BrokerRejected => "BROKER_REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TIME_BASED" => Some(Self::TimeBased),
            "MAX_HOLD_TIME" => Some(Self::MaxHoldTime),
            "STOP_LOSS" => Some(Self::StopLoss),
            "PROFIT_TARGET" => Some(Self::ProfitTarget),
            "TRAILING_STOP" => Some(Self::TrailingStop),
            "STOP_LOSS_HIT" => Some(Self::StopLossHit),
            "SIGNAL" => Some(Self::Signal),
            "MANUAL_CLOSE" => Some(Self::ManualClose),
            "LIMIT_TIMEOUT" => Some(Self::LimitTimeout),
            "BROKER_REJECTED" => Some(Self::BrokerRejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only trade event types. Every trade state transition writes exactly
/// one event with a matching trade_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEventType {
    AlertReceived,
    ContractSelected,
    EntryOrderPlaced,
    EntryFilled,
    EntryCancelled,
    StopLossPlaced,
    StopLossCancelled,
    ExitTriggered,
    ExitOrderPlaced,
    ExitFilled,
    StopLossHit,
    CloseSignal,
    ManualClose,
}

impl TradeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlertReceived => "ALERT_RECEIVED",
            Self::ContractSelected => "CONTRACT_SELECTED",
            Self::EntryOrderPlaced => "ENTRY_ORDER_PLACED",
            Self::EntryFilled => "ENTRY_FILLED",
            Self::EntryCancelled => "ENTRY_CANCELLED",
            Self::StopLossPlaced => "STOP_LOSS_PLACED",
            Self::StopLossCancelled => "STOP_LOSS_CANCELLED",
            Self::ExitTriggered => "EXIT_TRIGGERED",
            Self::ExitOrderPlaced => "EXIT_ORDER_PLACED",
            Self::ExitFilled => "EXIT_FILLED",
            Self::StopLossHit => "STOP_LOSS_HIT",
            Self::CloseSignal => "CLOSE_SIGNAL",
            Self::ManualClose => "MANUAL_CLOSE",
        }
    }
}

impl std::fmt::Display for TradeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-side order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Working,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Working => write!(f, "WORKING"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Bar timeframe supported by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
}

impl Timeframe {
    pub fn minutes(&self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" | "1" => Some(Self::M1),
            "5m" | "5" => Some(Self::M5),
            "15m" | "15" => Some(Self::M15),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named signal strategies the evaluator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    EmaCross,
    VwapCross,
    EmaVwap,
    Orb,
    OrbDirectional,
    VwapRsi,
    BbSqueeze,
    RsiReversal,
    Confluence,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmaCross => "ema_cross",
            Self::VwapCross => "vwap_cross",
            Self::EmaVwap => "ema_vwap",
            Self::Orb => "orb",
            Self::OrbDirectional => "orb_directional",
            Self::VwapRsi => "vwap_rsi",
            Self::BbSqueeze => "bb_squeeze",
            Self::RsiReversal => "rsi_reversal",
            Self::Confluence => "confluence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ema_cross" => Some(Self::EmaCross),
            "vwap_cross" => Some(Self::VwapCross),
            "ema_vwap" => Some(Self::EmaVwap),
            "orb" => Some(Self::Orb),
            "orb_directional" => Some(Self::OrbDirectional),
            "vwap_rsi" => Some(Self::VwapRsi),
            "bb_squeeze" => Some(Self::BbSqueeze),
            "rsi_reversal" => Some(Self::RsiReversal),
            "confluence" => Some(Self::Confluence),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_status_roundtrip() {
        for status in [
            TradeStatus::Pending,
            TradeStatus::Filled,
            TradeStatus::StopLossPlaced,
            TradeStatus::Exiting,
            TradeStatus::Closed,
            TradeStatus::Cancelled,
            TradeStatus::Error,
        ] {
            assert_eq!(TradeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TradeStatus::parse("BOGUS"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(TradeStatus::Closed.is_terminal());
        assert!(TradeStatus::Cancelled.is_terminal());
        assert!(TradeStatus::Error.is_terminal());
        assert!(!TradeStatus::Pending.is_terminal());
        assert!(!TradeStatus::StopLossPlaced.is_terminal());
    }

    #[test]
    fn open_states() {
        assert!(TradeStatus::Filled.is_open());
        assert!(TradeStatus::StopLossPlaced.is_open());
        assert!(TradeStatus::Exiting.is_open());
        assert!(!TradeStatus::Pending.is_open());
        assert!(!TradeStatus::Closed.is_open());
    }

    #[test]
    fn action_direction() {
        assert_eq!(AlertAction::BuyCall.direction(), Some(Direction::Call));
        assert_eq!(AlertAction::BuyPut.direction(), Some(Direction::Put));
        assert_eq!(AlertAction::Close.direction(), None);
    }

    #[test]
    fn action_parse() {
        assert_eq!(AlertAction::parse("BUY_CALL"), Some(AlertAction::BuyCall));
        assert_eq!(AlertAction::parse("CLOSE"), Some(AlertAction::Close));
        assert_eq!(AlertAction::parse("SELL"), None);
    }

    #[test]
    fn timeframe_minutes() {
        assert_eq!(Timeframe::M1.minutes(), 1);
        assert_eq!(Timeframe::M5.minutes(), 5);
        assert_eq!(Timeframe::M15.minutes(), 15);
        assert_eq!(Timeframe::parse("5m"), Some(Timeframe::M5));
        assert_eq!(Timeframe::parse("5"), Some(Timeframe::M5));
    }

    #[test]
    fn signal_kind_roundtrip() {
        for kind in [
            SignalKind::EmaCross,
            SignalKind::VwapCross,
            SignalKind::EmaVwap,
            SignalKind::Orb,
            SignalKind::OrbDirectional,
            SignalKind::VwapRsi,
            SignalKind::BbSqueeze,
            SignalKind::RsiReversal,
            SignalKind::Confluence,
        ] {
            assert_eq!(SignalKind::parse(kind.as_str()), Some(kind));
        }
    }
}
