// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the signal
// evaluator. Every public function returns `Option<T>` or an empty series so
// callers are forced to handle warmup and numerical-edge-case scenarios; the
// evaluator gates on this before firing any signal.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod orb;
pub mod rsi;
pub mod volume;
pub mod vwap;
