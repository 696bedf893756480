// =============================================================================
// Contract Selector — best 0-DTE option by delta fit and spread
// =============================================================================
//
// Given (underlying, direction, current price), fetch today's chain around
// at-the-money, drop illiquid entries, and score the survivors by
// |delta - target| + spread% / 100. Smallest score wins; ties break by
// smaller spread, then by strike closest to the underlying.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{BrokerClient, ChainEntry};
use crate::error::{EngineError, EngineResult};
use crate::types::Direction;

/// The chosen contract for an admission.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedContract {
    pub option_symbol: String,
    pub strike: f64,
    /// Expiry is always the current session date (0-DTE).
    pub expiry: chrono::NaiveDate,
    pub delta: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_percent: f64,
}

/// Selection parameters, a narrow view of the app config.
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    pub delta_target: f64,
    pub max_spread_percent: f64,
    pub strike_count: u32,
}

/// Spread as a percent of the mid price. `None` for a one-sided book.
fn spread_percent(bid: f64, ask: f64) -> Option<f64> {
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    let mid = (ask + bid) / 2.0;
    if mid <= 0.0 {
        return None;
    }
    Some((ask - bid) / mid * 100.0)
}

/// Score one surviving chain entry. Lower is better.
fn score(entry: &ChainEntry, spread_pct: f64, delta_target: f64) -> f64 {
    (entry.delta.abs() - delta_target).abs() + spread_pct / 100.0
}

/// Choose the single best contract for today's expiration.
pub async fn select_contract(
    broker: &Arc<dyn BrokerClient>,
    config: SelectorConfig,
    underlying: &str,
    direction: Direction,
    underlying_price: f64,
) -> EngineResult<SelectedContract> {
    let chain = broker
        .option_chain(underlying, direction, config.strike_count, true)
        .await?;

    debug!(
        underlying,
        direction = %direction,
        entries = chain.len(),
        "chain fetched for selection"
    );

    let mut best: Option<(f64, f64, ChainEntry)> = None;

    for entry in chain {
        let Some(spread_pct) = spread_percent(entry.bid, entry.ask) else {
            continue;
        };
        if spread_pct > config.max_spread_percent {
            continue;
        }

        let entry_score = score(&entry, spread_pct, config.delta_target);

        let better = match &best {
            None => true,
            Some((best_score, best_spread, best_entry)) => {
                if (entry_score - best_score).abs() > f64::EPSILON {
                    entry_score < *best_score
                } else if (spread_pct - best_spread).abs() > f64::EPSILON {
                    spread_pct < *best_spread
                } else {
                    (entry.strike - underlying_price).abs()
                        < (best_entry.strike - underlying_price).abs()
                }
            }
        };
        if better {
            best = Some((entry_score, spread_pct, entry));
        }
    }

    match best {
        Some((entry_score, spread_pct, entry)) => {
            info!(
                underlying,
                direction = %direction,
                symbol = %entry.symbol,
                strike = entry.strike,
                delta = entry.delta,
                spread_pct = format!("{spread_pct:.2}"),
                score = format!("{entry_score:.4}"),
                "contract selected"
            );
            Ok(SelectedContract {
                option_symbol: entry.symbol,
                strike: entry.strike,
                expiry: chrono::Utc::now().date_naive(),
                delta: entry.delta,
                bid: entry.bid,
                ask: entry.ask,
                spread_percent: spread_pct,
            })
        }
        None => Err(EngineError::NoLiquidContract {
            underlying: underlying.to_string(),
            direction: direction.to_string(),
        }),
    }
}
