//! Temporal query parsing and boosting.
//!
//! Accepts predefined ranges (`today`, `yesterday`, `this_week`, ...),
//! relative expressions (`3 days ago`, `2w`), `last <weekday>`, single ISO
//! dates, and explicit `{from, to}` pairs.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use regex::Regex;
use std::sync::OnceLock;

const IN_RANGE_BOOST: f32 = 0.05;
const RECENCY_BONUS: f32 = 0.05;
const RECENCY_BONUS_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TemporalQuery {
    #[must_use]
    pub const fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Parse a free-form range expression relative to `now`.
    #[must_use]
    pub fn parse(raw: &str, now: DateTime<Utc>) -> Option<Self> {
        let lowered = raw.trim().to_lowercase().replace('_', " ");
        let day_start =
            |date: NaiveDate| Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"));
        let today = now.date_naive();

        match lowered.as_str() {
            "today" => return Some(Self::range(day_start(today), now)),
            "yesterday" => {
                let start = day_start(today - Duration::days(1));
                return Some(Self::range(start, start + Duration::days(1)));
            }
            "this week" => {
                let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                return Some(Self::range(day_start(monday), now));
            }
            "last week" => {
                let this_monday =
                    today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                let last_monday = this_monday - Duration::days(7);
                return Some(Self::range(
                    day_start(last_monday),
                    day_start(this_monday),
                ));
            }
            "this month" => {
                let first = today.with_day(1).expect("day 1 exists");
                return Some(Self::range(day_start(first), now));
            }
            "last month" => {
                let first_this = today.with_day(1).expect("day 1 exists");
                let last_prev = first_this - Duration::days(1);
                let first_prev = last_prev.with_day(1).expect("day 1 exists");
                return Some(Self::range(day_start(first_prev), day_start(first_this)));
            }
            "this year" => {
                let first = NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("jan 1 exists");
                return Some(Self::range(day_start(first), now));
            }
            _ => {}
        }

        if let Some(start) = parse_relative(&lowered, now) {
            return Some(Self::range(start, now));
        }

        if let Some(rest) = lowered.strip_prefix("last ") {
            if let Some(weekday) = parse_weekday(rest.trim()) {
                let mut days_back =
                    i64::from(today.weekday().num_days_from_monday() as i32
                        - weekday.num_days_from_monday() as i32)
                        .rem_euclid(7);
                if days_back == 0 {
                    days_back = 7;
                }
                let day = today - Duration::days(days_back);
                let start = day_start(day);
                return Some(Self::range(start, start + Duration::days(1)));
            }
        }

        if let Some(date) = parse_date(&lowered) {
            let start = day_start(date);
            return Some(Self::range(start, start + Duration::days(1)));
        }

        None
    }

    /// Parse an explicit `{from, to}` pair; either side may be a date or a
    /// relative expression, missing sides default to the epoch / `now`.
    #[must_use]
    pub fn parse_bounds(from: Option<&str>, to: Option<&str>, now: DateTime<Utc>) -> Option<Self> {
        if from.is_none() && to.is_none() {
            return None;
        }
        let parse_side = |raw: &str| -> Option<DateTime<Utc>> {
            let lowered = raw.trim().to_lowercase();
            parse_date(&lowered)
                .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight")))
                .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|d| d.with_timezone(&Utc)))
                .or_else(|| parse_relative(&lowered, now))
        };
        let from = match from {
            Some(raw) => parse_side(raw)?,
            None => Utc.timestamp_opt(0, 0).single().expect("epoch"),
        };
        let to = match to {
            Some(raw) => parse_side(raw)?,
            None => now,
        };
        Some(Self::range(from, to))
    }

    #[must_use]
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.from && timestamp <= self.to
    }

    /// Additive ranking boost: +0.05 when the session falls inside the
    /// range, plus up to +0.05 more for sessions updated within the last 30
    /// days (linear decay).
    #[must_use]
    pub fn boost(&self, updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
        let Some(updated_at) = updated_at else {
            return 0.0;
        };
        if !self.contains(updated_at) {
            return 0.0;
        }
        let age_days = (now - updated_at).num_seconds().max(0) as f64 / 86_400.0;
        let bonus = RECENCY_BONUS * (1.0 - age_days / RECENCY_BONUS_DAYS).clamp(0.0, 1.0) as f32;
        IN_RANGE_BOOST + bonus
    }
}

fn relative_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)\s*(hours?|days?|weeks?|months?|h|d|w|m)(\s+ago)?$")
            .expect("static regex compiles")
    })
}

fn parse_relative(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let captures = relative_regex().captures(raw.trim())?;
    let amount: i64 = captures[1].parse().ok()?;
    let delta = match &captures[2] {
        "h" | "hour" | "hours" => Duration::hours(amount),
        "d" | "day" | "days" => Duration::days(amount),
        "w" | "week" | "weeks" => Duration::weeks(amount),
        "m" | "month" | "months" => Duration::days(amount * 30),
        _ => return None,
    };
    Some(now - delta)
}

fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}
