//! # Competitions
//!
//! Time-boxed leaderboards. Only scores that were actually recorded are
//! ranked: an empty leaderboard stays empty.

use crate::rules::Reward;
use chrono::{DateTime, Duration, Utc};
use orebit_core::{EconomyError, Result, UserId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Prize for an inclusive rank range
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrizeTier {
    pub from_rank: u32,
    pub to_rank: u32,
    pub reward: Reward,
}

impl PrizeTier {
    pub fn covers(&self, rank: u32) -> bool {
        (self.from_rank..=self.to_rank).contains(&rank)
    }
}

/// One competition window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompetitionDefinition {
    /// Window id; also the ledger source id of its prizes
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub duration_hours: u32,

    #[serde(default)]
    pub prizes: Vec<PrizeTier>,
}

impl CompetitionDefinition {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::hours(self.duration_hours as i64)
    }

    /// Accepting scores on `[start, end)`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && now < self.end_time()
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time()
    }

    pub fn prize_for(&self, rank: u32) -> Option<&Reward> {
        self.prizes.iter().find(|t| t.covers(rank)).map(|t| &t.reward)
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration_hours == 0 {
            return Err(EconomyError::Config(format!(
                "competition {} has zero duration",
                self.id
            )));
        }
        for (i, tier) in self.prizes.iter().enumerate() {
            if tier.from_rank == 0 || tier.from_rank > tier.to_rank {
                return Err(EconomyError::Config(format!(
                    "competition {}: invalid rank range {}..={}",
                    self.id, tier.from_rank, tier.to_rank
                )));
            }
            let overlaps = self.prizes[..i]
                .iter()
                .any(|t| tier.from_rank <= t.to_rank && t.from_rank <= tier.to_rank);
            if overlaps {
                return Err(EconomyError::Config(format!(
                    "competition {}: prize tiers overlap",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

pub fn validate_competitions(competitions: &[CompetitionDefinition]) -> Result<()> {
    for (i, c) in competitions.iter().enumerate() {
        c.validate()?;
        if competitions[..i].iter().any(|o| o.id == c.id) {
            return Err(EconomyError::Config(format!("competition {} defined twice", c.id)));
        }
    }
    Ok(())
}

/// A user's standing in one competition window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitionEntry {
    pub window_id: String,
    pub user_id: UserId,
    pub score: u64,

    /// Derived by [`rank_entries`]; 0 until ranked
    #[serde(default)]
    pub rank: u32,
}

impl CompetitionEntry {
    pub fn new(window_id: impl Into<String>, user_id: UserId, score: u64) -> Self {
        Self {
            window_id: window_id.into(),
            user_id,
            score,
            rank: 0,
        }
    }
}

/// Score descending, ties broken by user id ascending
pub fn standing_order(a: &CompetitionEntry, b: &CompetitionEntry) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort and assign ranks starting at 1
pub fn rank_entries(mut entries: Vec<CompetitionEntry>) -> Vec<CompetitionEntry> {
    entries.sort_by(standing_order);
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i as u32 + 1;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn competition() -> CompetitionDefinition {
        CompetitionDefinition {
            id: "weekly-2026-W27".into(),
            start_time: Utc.with_ymd_and_hms(2026, 6, 29, 0, 0, 0).unwrap(),
            duration_hours: 7 * 24,
            prizes: vec![
                PrizeTier {
                    from_rank: 1,
                    to_rank: 1,
                    reward: Reward::coins(100.0),
                },
                PrizeTier {
                    from_rank: 2,
                    to_rank: 3,
                    reward: Reward::coins(25.0),
                },
            ],
        }
    }

    #[test]
    fn test_rank_ties_by_user_id() {
        let ranked = rank_entries(vec![
            CompetitionEntry::new("w", UserId::from("carol"), 10),
            CompetitionEntry::new("w", UserId::from("bob"), 30),
            CompetitionEntry::new("w", UserId::from("alice"), 10),
        ]);

        let order: Vec<_> = ranked.iter().map(|e| (e.user_id.as_str(), e.rank)).collect();
        assert_eq!(order, vec![("bob", 1), ("alice", 2), ("carol", 3)]);
    }

    #[test]
    fn test_empty_leaderboard_stays_empty() {
        assert!(rank_entries(Vec::new()).is_empty());
    }

    #[test]
    fn test_prize_lookup() {
        let c = competition();
        assert_eq!(c.prize_for(1), Some(&Reward::coins(100.0)));
        assert_eq!(c.prize_for(3), Some(&Reward::coins(25.0)));
        assert_eq!(c.prize_for(4), None);
    }

    #[test]
    fn test_window_bounds() {
        let c = competition();
        assert!(c.is_open(c.start_time));
        assert!(!c.is_open(c.end_time()));
        assert!(c.has_ended(c.end_time()));
    }

    #[test]
    fn test_overlapping_tiers_rejected() {
        let mut c = competition();
        c.prizes[1].from_rank = 1;
        assert!(c.validate().is_err());
    }
}
