// =============================================================================
// Market session clock — America/New_York time, windows, event calendar
// =============================================================================
//
// All trading-time decisions (session windows, bar boundaries, force-exit,
// event-day afternoon block) are made in the market's local zone. Persisted
// timestamps stay naive UTC; conversion happens only at decision points.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::SessionWindow;
use crate::types::Timeframe;

/// The market's local zone.
pub const MARKET_TZ: Tz = New_York;

/// Current wall-clock time in the market zone.
pub fn market_now() -> DateTime<Tz> {
    Utc::now().with_timezone(&MARKET_TZ)
}

/// Convert a naive-UTC timestamp (as stored) into market local time.
pub fn to_market(naive_utc: NaiveDateTime) -> DateTime<Tz> {
    Utc.from_utc_datetime(&naive_utc).with_timezone(&MARKET_TZ)
}

/// The session date for a given market-local instant.
pub fn session_date(now: DateTime<Tz>) -> NaiveDate {
    now.date_naive()
}

/// Regular session open in market local time.
pub fn session_open_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("valid constant time")
}

/// Parse an "HH:MM" config string.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Whether `now` falls inside any configured session window.
/// Windows are [start, end) in market local time.
pub fn in_session_windows(windows: &[SessionWindow], now: NaiveTime) -> bool {
    windows.iter().any(|w| {
        match (parse_hhmm(&w.start), parse_hhmm(&w.end)) {
            (Some(start), Some(end)) => now >= start && now < end,
            _ => {
                warn!(start = %w.start, end = %w.end, "unparseable session window — skipped");
                false
            }
        }
    })
}

/// Floor a market-local instant to its bar-open boundary for the timeframe.
/// Bars are aligned to the top of the hour, which also aligns them to the
/// 09:30 session open for 1/5/15-minute timeframes.
pub fn bar_open(ts: DateTime<Tz>, timeframe: Timeframe) -> DateTime<Tz> {
    let step = timeframe.minutes();
    let floored_min = (ts.minute() / step) * step;
    ts.with_minute(floored_min)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Whether `ts` is at or past the given "HH:MM" market-local time of day.
pub fn at_or_past(ts: DateTime<Tz>, hhmm: &str) -> bool {
    match parse_hhmm(hhmm) {
        Some(t) => ts.time() >= t,
        None => {
            warn!(time = hhmm, "unparseable time-of-day config — treated as never reached");
            false
        }
    }
}

// =============================================================================
// Event calendar
// =============================================================================

#[derive(Debug, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    blocked_afternoons: Vec<NaiveDate>,
}

/// Event-day calendar: afternoons on which new entries are blocked.
/// Loading is best-effort; a missing or malformed file yields an empty
/// calendar with a warning.
#[derive(Debug, Clone, Default)]
pub struct EventCalendar {
    blocked: HashSet<NaiveDate>,
}

impl EventCalendar {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "event calendar unreadable — no blocked afternoons");
                return Self::default();
            }
        };

        match serde_json::from_str::<CalendarFile>(&content) {
            Ok(file) => {
                info!(
                    path = %path.display(),
                    blocked = file.blocked_afternoons.len(),
                    "event calendar loaded"
                );
                Self {
                    blocked: file.blocked_afternoons.into_iter().collect(),
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "event calendar parse failed — no blocked afternoons");
                Self::default()
            }
        }
    }

    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            blocked: dates.into_iter().collect(),
        }
    }

    pub fn is_blocked(&self, date: NaiveDate) -> bool {
        self.blocked.contains(&date)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn market_dt(h: u32, m: u32) -> DateTime<Tz> {
        MARKET_TZ
            .with_ymd_and_hms(2025, 6, 16, h, m, 30)
            .single()
            .unwrap()
    }

    #[test]
    fn parse_hhmm_ok() {
        assert_eq!(parse_hhmm("09:30"), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(parse_hhmm("15:00"), NaiveTime::from_hms_opt(15, 0, 0));
        assert!(parse_hhmm("25:00").is_none());
        assert!(parse_hhmm("nope").is_none());
    }

    #[test]
    fn session_window_membership() {
        let windows = vec![SessionWindow {
            start: "09:30".into(),
            end: "15:00".into(),
        }];
        assert!(in_session_windows(&windows, NaiveTime::from_hms_opt(9, 30, 0).unwrap()));
        assert!(in_session_windows(&windows, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        // End is exclusive.
        assert!(!in_session_windows(&windows, NaiveTime::from_hms_opt(15, 0, 0).unwrap()));
        assert!(!in_session_windows(&windows, NaiveTime::from_hms_opt(9, 29, 59).unwrap()));
    }

    #[test]
    fn multiple_windows() {
        let windows = vec![
            SessionWindow {
                start: "09:30".into(),
                end: "11:00".into(),
            },
            SessionWindow {
                start: "13:00".into(),
                end: "15:00".into(),
            },
        ];
        assert!(in_session_windows(&windows, NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
        assert!(!in_session_windows(&windows, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(in_session_windows(&windows, NaiveTime::from_hms_opt(14, 59, 0).unwrap()));
    }

    #[test]
    fn bar_open_floors_to_timeframe() {
        let ts = market_dt(10, 7);
        assert_eq!(bar_open(ts, Timeframe::M1).minute(), 7);
        assert_eq!(bar_open(ts, Timeframe::M5).minute(), 5);
        assert_eq!(bar_open(ts, Timeframe::M15).minute(), 0);
        assert_eq!(bar_open(ts, Timeframe::M5).second(), 0);
    }

    #[test]
    fn bar_open_aligns_with_session_open() {
        // 09:30 is itself a boundary for all supported timeframes.
        let ts = market_dt(9, 30);
        for tf in [Timeframe::M1, Timeframe::M5, Timeframe::M15] {
            assert_eq!(bar_open(ts, tf).minute(), 30);
        }
    }

    #[test]
    fn at_or_past_boundary() {
        assert!(at_or_past(market_dt(15, 0), "15:00"));
        assert!(at_or_past(market_dt(15, 30), "15:00"));
        assert!(!at_or_past(market_dt(14, 59), "15:00"));
        assert!(!at_or_past(market_dt(14, 59), "bogus"));
    }

    #[test]
    fn calendar_blocks_listed_dates() {
        let d = NaiveDate::from_ymd_opt(2025, 6, 16).unwrap();
        let cal = EventCalendar::from_dates([d]);
        assert!(cal.is_blocked(d));
        assert!(!cal.is_blocked(NaiveDate::from_ymd_opt(2025, 6, 17).unwrap()));
    }

    #[test]
    fn calendar_missing_file_is_empty() {
        let cal = EventCalendar::load("/nonexistent/calendar.json");
        assert!(!cal.is_blocked(NaiveDate::from_ymd_opt(2025, 6, 16).unwrap()));
    }
}
