// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA, upper/lower = SMA ± k*σ. Band width is the normalised
// distance (upper - lower) / middle * 100 and is the compression measure used
// by the squeeze-breakout strategy.

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Calculate Bollinger Bands over the last `period` closes.
///
/// Returns `None` with fewer than `period` closes, a zero middle band, or a
/// non-finite width.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<Bands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(Bands {
        upper,
        middle,
        lower,
        width,
    })
}

/// Band widths for the last `count` closes (oldest first), one width per
/// trailing window ending at each close. Used to detect a low-volatility
/// compression preceding a breakout.
pub fn width_series(closes: &[f64], period: usize, num_std: f64, count: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let available = closes.len() - period + 1;
    let take = count.min(available);

    (0..take)
        .rev()
        .filter_map(|back| {
            let end = closes.len() - back;
            bollinger(&closes[..end], period, num_std).map(|b| b.width)
        })
        .collect()
}
