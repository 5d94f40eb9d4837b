//! Preference aggregation over the fork history.
//!
//! Sessions the user keeps forking into earn an additive ranking boost:
//! `min(0.10, 0.04·log2(1 + forks) + 0.02·position_bonus + 0.02·recency)`.

use crate::fork_history::{ForkEvent, ForkHistory};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const MAX_PREFERENCE_BOOST: f32 = 0.10;
const RECENCY_WINDOW_DAYS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceRecord {
    pub session_id: String,
    pub fork_count: usize,
    pub avg_position: f64,
    pub last_selected: DateTime<Utc>,
}

impl PreferenceRecord {
    /// Additive boost contribution, capped at +0.10.
    #[must_use]
    pub fn boost(&self, now: DateTime<Utc>) -> f32 {
        let fork_term = 0.04 * (1.0 + self.fork_count as f64).log2();

        // Selections near the top of the ranking (position 0) earn the full
        // position bonus, decaying linearly to zero by position 5.
        let position_bonus = (1.0 - self.avg_position / 5.0).clamp(0.0, 1.0);
        let position_term = 0.02 * position_bonus;

        let age_days = (now - self.last_selected).num_seconds().max(0) as f64 / 86_400.0;
        let recency = (1.0 - age_days / RECENCY_WINDOW_DAYS).clamp(0.0, 1.0);
        let recency_term = 0.02 * recency;

        ((fork_term + position_term + recency_term) as f32).min(MAX_PREFERENCE_BOOST)
    }
}

/// Derives per-session preference records from the fork history.
pub struct PreferenceService;

impl PreferenceService {
    #[must_use]
    pub fn aggregate(events: &[ForkEvent]) -> HashMap<String, PreferenceRecord> {
        let mut records: HashMap<String, PreferenceRecord> = HashMap::new();
        for event in events {
            let record = records
                .entry(event.session_id.clone())
                .or_insert_with(|| PreferenceRecord {
                    session_id: event.session_id.clone(),
                    fork_count: 0,
                    avg_position: 0.0,
                    last_selected: event.timestamp,
                });
            let prior = record.fork_count as f64;
            record.avg_position =
                (record.avg_position * prior + event.position as f64) / (prior + 1.0);
            record.fork_count += 1;
            if event.timestamp > record.last_selected {
                record.last_selected = event.timestamp;
            }
        }
        records
    }

    pub fn from_history(history: &ForkHistory) -> Result<HashMap<String, PreferenceRecord>> {
        Ok(Self::aggregate(&history.all()?))
    }

    pub fn for_session(
        history: &ForkHistory,
        session_id: &str,
    ) -> Result<Option<PreferenceRecord>> {
        let events = history.for_session(session_id)?;
        Ok(Self::aggregate(&events).remove(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(session: &str, position: usize, day: u32) -> ForkEvent {
        ForkEvent {
            session_id: session.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 7, day, 12, 0, 0).unwrap(),
            query: "q".to_string(),
            position,
            outcome: None,
        }
    }

    #[test]
    fn aggregates_counts_and_positions() {
        let events = vec![event("s", 0, 1), event("s", 2, 2), event("s", 4, 3)];
        let records = PreferenceService::aggregate(&events);
        let record = &records["s"];
        assert_eq!(record.fork_count, 3);
        assert!((record.avg_position - 2.0).abs() < 1e-9);
        assert_eq!(
            record.last_selected,
            Utc.with_ymd_and_hms(2026, 7, 3, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn boost_grows_with_forks_and_caps() {
        let now = Utc.with_ymd_and_hms(2026, 7, 4, 0, 0, 0).unwrap();
        let one = PreferenceRecord {
            session_id: "a".into(),
            fork_count: 1,
            avg_position: 0.0,
            last_selected: now,
        };
        let many = PreferenceRecord {
            fork_count: 50,
            ..one.clone()
        };
        assert!(many.boost(now) > one.boost(now));
        assert!(many.boost(now) <= MAX_PREFERENCE_BOOST + f32::EPSILON);
    }

    #[test]
    fn top_positions_beat_deep_positions() {
        let now = Utc.with_ymd_and_hms(2026, 7, 4, 0, 0, 0).unwrap();
        let top = PreferenceRecord {
            session_id: "t".into(),
            fork_count: 2,
            avg_position: 0.0,
            last_selected: now,
        };
        let deep = PreferenceRecord {
            avg_position: 5.0,
            ..top.clone()
        };
        assert!(top.boost(now) > deep.boost(now));
    }

    #[test]
    fn stale_selections_lose_the_recency_term() {
        let selected = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let record = PreferenceRecord {
            session_id: "old".into(),
            fork_count: 1,
            avg_position: 0.0,
            last_selected: selected,
        };
        let fresh = record.boost(selected);
        let stale = record.boost(selected + chrono::Duration::days(90));
        assert!(fresh > stale);
    }
}
