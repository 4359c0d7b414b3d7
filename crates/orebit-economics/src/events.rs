//! # Event Windows
//!
//! Time-bounded multipliers. Explicit windows come from configuration;
//! recurring definitions (weekend boosts, weekly sales) are materialised per
//! ISO week with deterministic IDs.
//!
//! | Kind | Affects |
//! |------|---------|
//! | `mining_boost` | mining rate |
//! | `double_xp` | XP granted by rewards |
//! | `sale` | marketplace prices |

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use orebit_core::{EconomyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MiningBoost,
    DoubleXp,
    Sale,
}

impl EventKind {
    /// Whether the multiplier enters the mining rate product
    pub fn affects_rate(&self) -> bool {
        matches!(self, Self::MiningBoost)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MiningBoost => "mining_boost",
            Self::DoubleXp => "double_xp",
            Self::Sale => "sale",
        }
    }
}

/// A concrete, time-bounded multiplier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventWindow {
    pub id: String,
    pub kind: EventKind,
    pub multiplier: f64,
    pub start_time: DateTime<Utc>,
    pub duration_hours: u32,
}

impl EventWindow {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::hours(self.duration_hours as i64)
    }

    /// Active on `[start, end)`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && now < self.end_time()
    }

    pub fn overlaps(&self, other: &EventWindow) -> bool {
        self.start_time < other.end_time() && other.start_time < self.end_time()
    }
}

/// Weekly recurring event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurringEvent {
    pub name: String,
    pub kind: EventKind,
    pub multiplier: f64,
    pub weekday: Weekday,

    /// Hour of day (UTC) the window opens
    #[serde(default)]
    pub start_hour: u32,
    pub duration_hours: u32,
}

impl RecurringEvent {
    /// Window for the ISO week containing `at`
    pub fn window_for_week(&self, at: DateTime<Utc>) -> Option<EventWindow> {
        let date = at.date_naive();
        let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        let day = monday + Duration::days(self.weekday.num_days_from_monday() as i64);
        let time = NaiveTime::from_hms_opt(self.start_hour, 0, 0)?;
        let start = Utc.from_utc_datetime(&day.and_time(time));
        let week = monday.iso_week();

        Some(EventWindow {
            id: format!("{}-{}-W{:02}", self.name, week.year(), week.week()),
            kind: self.kind,
            multiplier: self.multiplier,
            start_time: start,
            duration_hours: self.duration_hours,
        })
    }
}

/// Event configuration section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub windows: Vec<EventWindow>,

    #[serde(default = "default_recurring")]
    pub recurring: Vec<RecurringEvent>,
}

fn default_recurring() -> Vec<RecurringEvent> {
    vec![
        RecurringEvent {
            name: "weekend-double-xp".to_string(),
            kind: EventKind::DoubleXp,
            multiplier: 2.0,
            weekday: Weekday::Sat,
            start_hour: 0,
            duration_hours: 48,
        },
        RecurringEvent {
            name: "midweek-boost".to_string(),
            kind: EventKind::MiningBoost,
            multiplier: 1.5,
            weekday: Weekday::Wed,
            start_hour: 12,
            duration_hours: 6,
        },
    ]
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            windows: Vec::new(),
            recurring: default_recurring(),
        }
    }
}

impl EventConfig {
    pub fn validate(&self) -> Result<()> {
        for window in &self.windows {
            if window.duration_hours == 0 {
                return Err(EconomyError::Config(format!(
                    "event window {} has zero duration",
                    window.id
                )));
            }
            check_multiplier(&window.id, window.multiplier)?;
        }
        for recurring in &self.recurring {
            if recurring.duration_hours == 0 || recurring.duration_hours > 7 * 24 {
                return Err(EconomyError::Config(format!(
                    "recurring event {} duration must be 1..=168 hours",
                    recurring.name
                )));
            }
            if recurring.start_hour > 23 {
                return Err(EconomyError::Config(format!(
                    "recurring event {} start_hour must be 0..=23",
                    recurring.name
                )));
            }
            check_multiplier(&recurring.name, recurring.multiplier)?;
        }

        for (i, a) in self.windows.iter().enumerate() {
            for b in &self.windows[i + 1..] {
                if a.kind == b.kind && a.overlaps(b) {
                    return Err(EconomyError::Config(format!(
                        "event windows {} and {} of kind {} overlap",
                        a.id,
                        b.id,
                        a.kind.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_multiplier(id: &str, multiplier: f64) -> Result<()> {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Err(EconomyError::Config(format!(
            "event {id} multiplier must be positive"
        )));
    }
    Ok(())
}

/// All scheduled windows, explicit and recurring
#[derive(Clone, Debug, Default)]
pub struct EventCalendar {
    config: EventConfig,
}

impl EventCalendar {
    pub fn new(config: EventConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Windows active at `now`. Recurring events are checked against this
    /// week's and last week's occurrence so windows crossing midnight Sunday
    /// are still seen.
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<EventWindow> {
        let mut active: Vec<EventWindow> = self
            .config
            .windows
            .iter()
            .filter(|w| w.is_active(now))
            .cloned()
            .collect();

        for recurring in &self.config.recurring {
            for anchor in [now - Duration::weeks(1), now] {
                if let Some(window) = recurring.window_for_week(anchor) {
                    if window.is_active(now) {
                        active.push(window);
                    }
                }
            }
        }

        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }
}

/// Largest active multiplier per kind.
///
/// Same-kind windows never stack: if two overlap anyway, only the larger
/// one counts.
pub fn strongest_by_kind(events: &[EventWindow], now: DateTime<Utc>) -> BTreeMap<EventKind, f64> {
    let mut strongest: BTreeMap<EventKind, f64> = BTreeMap::new();
    for event in events.iter().filter(|e| e.is_active(now)) {
        let entry = strongest.entry(event.kind).or_insert(event.multiplier);
        if event.multiplier > *entry {
            *entry = event.multiplier;
        }
    }
    strongest
}

/// Multiplier for one kind at `now` (1.0 when nothing is active)
pub fn multiplier_for(events: &[EventWindow], kind: EventKind, now: DateTime<Utc>) -> f64 {
    strongest_by_kind(events, now)
        .get(&kind)
        .copied()
        .unwrap_or(1.0)
}

/// Product of the rate-affecting kinds
pub fn rate_multiplier(events: &[EventWindow], now: DateTime<Utc>) -> f64 {
    strongest_by_kind(events, now)
        .into_iter()
        .filter(|(kind, _)| kind.affects_rate())
        .map(|(_, m)| m)
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn window(id: &str, kind: EventKind, multiplier: f64, start: DateTime<Utc>, hours: u32) -> EventWindow {
        EventWindow {
            id: id.to_string(),
            kind,
            multiplier,
            start_time: start,
            duration_hours: hours,
        }
    }

    #[test]
    fn test_window_is_half_open() {
        let w = window("w", EventKind::MiningBoost, 2.0, at(2026, 3, 1, 0), 2);

        assert!(!w.is_active(at(2026, 2, 28, 23)));
        assert!(w.is_active(at(2026, 3, 1, 0)));
        assert!(w.is_active(at(2026, 3, 1, 1)));
        assert!(!w.is_active(at(2026, 3, 1, 2)));
    }

    #[test]
    fn test_recurring_window_ids_are_deterministic() {
        let recurring = &default_recurring()[0];
        // Wednesday 2026-10-14 and Friday 2026-10-16 share an ISO week
        let a = recurring.window_for_week(at(2026, 10, 14, 9)).unwrap();
        let b = recurring.window_for_week(at(2026, 10, 16, 22)).unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.start_time, at(2026, 10, 17, 0));
        assert_eq!(a.start_time.weekday(), Weekday::Sat);
    }

    #[test]
    fn test_weekend_window_crosses_into_sunday() {
        let calendar = EventCalendar::new(EventConfig::default()).unwrap();

        let sunday = at(2026, 10, 18, 20);
        let active = calendar.active_at(sunday);
        assert!(active.iter().any(|w| w.kind == EventKind::DoubleXp));

        let monday = at(2026, 10, 19, 1);
        assert!(calendar
            .active_at(monday)
            .iter()
            .all(|w| w.kind != EventKind::DoubleXp));
    }

    #[test]
    fn test_same_kind_overlap_rejected() {
        let config = EventConfig {
            windows: vec![
                window("a", EventKind::Sale, 0.8, at(2026, 5, 1, 0), 24),
                window("b", EventKind::Sale, 0.5, at(2026, 5, 1, 12), 24),
            ],
            recurring: Vec::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_different_kinds_may_overlap() {
        let config = EventConfig {
            windows: vec![
                window("a", EventKind::Sale, 0.8, at(2026, 5, 1, 0), 24),
                window("b", EventKind::MiningBoost, 2.0, at(2026, 5, 1, 12), 24),
            ],
            recurring: Vec::new(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlapping_same_kind_does_not_stack() {
        let now = at(2026, 5, 1, 6);
        let events = vec![
            window("a", EventKind::MiningBoost, 2.0, at(2026, 5, 1, 0), 24),
            window("b", EventKind::MiningBoost, 3.0, at(2026, 5, 1, 0), 24),
            window("c", EventKind::DoubleXp, 2.0, at(2026, 5, 1, 0), 24),
        ];

        assert_eq!(rate_multiplier(&events, now), 3.0);
        assert_eq!(multiplier_for(&events, EventKind::DoubleXp, now), 2.0);
        assert_eq!(multiplier_for(&events, EventKind::Sale, now), 1.0);
    }
}
