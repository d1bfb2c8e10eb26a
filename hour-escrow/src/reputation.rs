//! Reputation Aggregator - trust metrics from reconciled escrows
//!
//! Turns the reconciled escrow map into per-subject statistics, a composite
//! score and grade, a render-ready history list and network-wide analytics.
//! Everything here is a pure function of its inputs.

use crate::{
    models::{amount_to_hours, Address, Amount, BlockNumber, EscrowId, EscrowStatus},
    reconciler::{ReconciledEscrow, ReconciledMap},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

/// Score every subject starts from
pub const BASE_SCORE: i64 = 100;
/// Points per completed escrow in either role
pub const COMPLETED_POINTS: i64 = 10;
/// Extra points per escrow completed as provider
pub const PROVIDER_BONUS_POINTS: i64 = 5;
/// Penalty per escrow the subject requested and then saw cancelled
pub const CANCELLED_PENALTY_POINTS: i64 = 5;

/// Subject's relation to one escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Provider,
    Observer,
}

impl Role {
    /// Classify `subject` against one entry; requester takes precedence
    pub fn classify(entry: &ReconciledEscrow, subject: Option<&Address>) -> Self {
        let Some(subject) = subject else {
            return Self::Observer;
        };
        if entry.requester() == Some(subject) {
            Self::Requester
        } else if entry.provider.as_ref() == Some(subject) {
            Self::Provider
        } else {
            Self::Observer
        }
    }
}

/// Reputation tier derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    Newcomer,
    Rookie,
    Pro,
    Expert,
}

impl Grade {
    /// Calculate grade based on score, thresholds are inclusive lower bounds
    pub fn from_score(score: u64) -> Self {
        match score {
            170.. => Self::Expert,
            130..=169 => Self::Pro,
            100..=129 => Self::Rookie,
            _ => Self::Newcomer,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Newcomer => "Newcomer",
            Self::Rookie => "Rookie",
            Self::Pro => "Pro",
            Self::Expert => "Expert",
        };
        f.write_str(name)
    }
}

/// Composite score, never negative
pub fn score(completed: u64, as_provider_completed: u64, cancelled: u64) -> u64 {
    let raw = BASE_SCORE + completed as i64 * COMPLETED_POINTS
        + as_provider_completed as i64 * PROVIDER_BONUS_POINTS
        - cancelled as i64 * CANCELLED_PENALTY_POINTS;
    raw.max(0) as u64
}

/// Per-subject statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationStats {
    /// Escrows the subject requested, any outcome
    pub created: u64,
    /// Completed escrows the subject was party to
    pub completed: u64,
    /// Escrows the subject requested that were cancelled
    pub cancelled: u64,
    pub as_requester_completed: u64,
    pub as_provider_completed: u64,
    pub hours_requested: f64,
    pub hours_provided: f64,
    pub score: u64,
    pub grade: Grade,
}

impl Default for ReputationStats {
    fn default() -> Self {
        let mut stats = Self {
            created: 0,
            completed: 0,
            cancelled: 0,
            as_requester_completed: 0,
            as_provider_completed: 0,
            hours_requested: 0.0,
            hours_provided: 0.0,
            score: 0,
            grade: Grade::Newcomer,
        };
        stats.calculate_score();
        stats
    }
}

impl ReputationStats {
    /// Recompute score and grade from the counters
    pub fn calculate_score(&mut self) {
        self.score = score(self.completed, self.as_provider_completed, self.cancelled);
        self.grade = Grade::from_score(self.score);
    }

    /// Fold one escrow into the counters
    ///
    /// Requester and provider sides are checked independently, so an
    /// escrow that names the subject on both sides counts for both.
    fn record(&mut self, entry: &ReconciledEscrow, subject: &Address) {
        let is_requester = entry.requester() == Some(subject);
        let is_provider = entry.provider.as_ref() == Some(subject);
        if !is_requester && !is_provider {
            return;
        }

        let status = entry.status();
        let hours = amount_to_hours(entry.amount);

        if is_requester {
            self.created += 1;
        }
        if status == EscrowStatus::Completed {
            self.completed += 1;
            if is_requester {
                self.as_requester_completed += 1;
                self.hours_requested += hours;
            }
            if is_provider {
                self.as_provider_completed += 1;
                self.hours_provided += hours;
            }
        }
        if is_requester && status == EscrowStatus::Cancelled {
            self.cancelled += 1;
        }
    }
}

/// One row of the escrow history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: EscrowId,
    pub role: Role,
    pub status: EscrowStatus,
    pub hours: f64,
    pub amount_raw: Amount,
    pub created_block: Option<BlockNumber>,
    pub completed_block: Option<BlockNumber>,
    pub requester: Option<Address>,
    pub provider: Option<Address>,
    /// Creation log was never seen for this escrow
    pub inferred: bool,
}

impl HistoryItem {
    fn from_entry(entry: &ReconciledEscrow, subject: Option<&Address>) -> Self {
        let status = entry.status();
        Self {
            id: entry.id,
            role: Role::classify(entry, subject),
            status,
            hours: amount_to_hours(entry.amount),
            amount_raw: entry.amount,
            created_block: entry.created_block(),
            completed_block: match status {
                EscrowStatus::Completed => entry.released_block,
                _ => None,
            },
            requester: entry.requester().cloned(),
            provider: entry.provider.clone(),
            inferred: entry.is_inferred(),
        }
    }
}

/// Aggregated view for one (optional) subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationReport {
    pub subject: Option<Address>,
    /// Present only when a subject was given
    pub stats: Option<ReputationStats>,
    pub history: Vec<HistoryItem>,
}

impl ReputationReport {
    /// History rows the subject took part in
    pub fn participant_history(&self) -> Vec<&HistoryItem> {
        self.history
            .iter()
            .filter(|item| item.role != Role::Observer)
            .collect()
    }
}

/// Completed hours attributed to one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub address: Address,
    pub hours: f64,
}

/// Network-wide escrow analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub total: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub completed_hours: f64,
    pub pending_hours: f64,
    pub completion_rate: f64,
    pub unique_participants: usize,
    pub latest_block: Option<BlockNumber>,
    pub top_providers: Vec<LeaderboardEntry>,
    pub top_requesters: Vec<LeaderboardEntry>,
}

/// Configuration for the reputation aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Entries kept in each leaderboard
    pub leaderboard_size: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            leaderboard_size: 5,
        }
    }
}

/// Main reputation aggregator
#[derive(Debug, Clone, Default)]
pub struct ReputationAggregator {
    config: ReputationConfig,
}

impl ReputationAggregator {
    /// Create a new reputation aggregator
    pub fn new(config: ReputationConfig) -> Self {
        Self { config }
    }

    /// Statistics for `subject` and the full history, newest first
    pub fn aggregate(&self, escrows: &ReconciledMap, subject: Option<&Address>) -> ReputationReport {
        let mut stats = subject.map(|_| ReputationStats::default());
        let mut history = Vec::with_capacity(escrows.len());

        for entry in escrows.values() {
            history.push(HistoryItem::from_entry(entry, subject));
            if let (Some(stats), Some(subject)) = (stats.as_mut(), subject) {
                stats.record(entry, subject);
            }
        }

        if let Some(stats) = stats.as_mut() {
            stats.calculate_score();
        }

        sort_history(&mut history);

        ReputationReport {
            subject: subject.cloned(),
            stats,
            history,
        }
    }

    /// Totals, completion rate and leaderboards over a history list
    pub fn network_summary(&self, history: &[HistoryItem]) -> NetworkSummary {
        let mut completed = 0;
        let mut cancelled = 0;
        let mut pending = 0;
        let mut completed_hours = 0.0;
        let mut pending_hours = 0.0;
        let mut participants = BTreeSet::new();
        let mut latest_block: Option<BlockNumber> = None;
        let mut providers: HashMap<Address, f64> = HashMap::new();
        let mut requesters: HashMap<Address, f64> = HashMap::new();

        for item in history {
            participants.extend(item.requester.iter().cloned());
            participants.extend(item.provider.iter().cloned());

            for block in [item.created_block, item.completed_block].into_iter().flatten() {
                latest_block = Some(latest_block.map_or(block, |b| b.max(block)));
            }

            match item.status {
                EscrowStatus::Completed => {
                    completed += 1;
                    completed_hours += item.hours;
                    if let Some(provider) = &item.provider {
                        *providers.entry(provider.clone()).or_insert(0.0) += item.hours;
                    }
                    if let Some(requester) = &item.requester {
                        *requesters.entry(requester.clone()).or_insert(0.0) += item.hours;
                    }
                }
                EscrowStatus::Cancelled => cancelled += 1,
                EscrowStatus::Pending => {
                    pending += 1;
                    pending_hours += item.hours;
                }
            }
        }

        let total = history.len();
        NetworkSummary {
            total,
            completed,
            cancelled,
            pending,
            completed_hours,
            pending_hours,
            completion_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
            unique_participants: participants.len(),
            latest_block,
            top_providers: self.leaderboard(providers),
            top_requesters: self.leaderboard(requesters),
        }
    }

    fn leaderboard(&self, totals: HashMap<Address, f64>) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = totals
            .into_iter()
            .map(|(address, hours)| LeaderboardEntry { address, hours })
            .collect();
        entries.sort_by(|a, b| {
            b.hours
                .total_cmp(&a.hours)
                .then_with(|| a.address.cmp(&b.address))
        });
        entries.truncate(self.config.leaderboard_size);
        entries
    }
}

/// Newest first by creation block; unknown creation sorts as block 0
fn sort_history(history: &mut [HistoryItem]) {
    history.sort_by(|a, b| {
        b.created_block
            .unwrap_or(0)
            .cmp(&a.created_block.unwrap_or(0))
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStreams;
    use crate::models::hours;
    use crate::reconciler::reconcile;
    use crate::reconciler::tests::{addr, cancelled, created, released};

    #[test]
    fn test_provider_example() {
        let streams = EventStreams {
            created: vec![created(7, 0xaa, 0xbb, hours(2), 100)],
            released: vec![released(7, 0xbb, hours(2), 105)],
            cancelled: vec![],
        };
        let state = reconcile(&streams);

        let report = ReputationAggregator::default().aggregate(&state.escrows, Some(&addr(0xbb)));
        let stats = report.stats.unwrap();
        assert_eq!(stats.as_provider_completed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.hours_provided, 2.0);
        assert_eq!(stats.score, 115);
        assert_eq!(stats.grade, Grade::Rookie);

        let item = &report.history[0];
        assert_eq!(item.role, Role::Provider);
        assert_eq!(item.completed_block, Some(105));
        assert_eq!(item.hours, 2.0);
    }

    #[test]
    fn test_score_formula() {
        assert_eq!(score(5, 3, 1), 160);
        assert_eq!(Grade::from_score(160), Grade::Pro);
        assert_eq!(score(0, 0, 0), 100);
        assert_eq!(score(0, 0, 1000), 0);
    }

    #[test]
    fn test_grade_thresholds() {
        assert_eq!(Grade::from_score(170), Grade::Expert);
        assert_eq!(Grade::from_score(169), Grade::Pro);
        assert_eq!(Grade::from_score(130), Grade::Pro);
        assert_eq!(Grade::from_score(129), Grade::Rookie);
        assert_eq!(Grade::from_score(100), Grade::Rookie);
        assert_eq!(Grade::from_score(99), Grade::Newcomer);
        assert_eq!(Grade::from_score(0), Grade::Newcomer);
    }

    #[test]
    fn test_cancellations_only_penalize_requester() {
        let mut streams = EventStreams::default();
        for id in 0..30 {
            streams.created.push(created(id, 0xaa, 0xbb, hours(1), id + 1));
            streams.cancelled.push(cancelled(id, id + 100));
        }
        let state = reconcile(&streams);
        let aggregator = ReputationAggregator::default();

        let requester = aggregator.aggregate(&state.escrows, Some(&addr(0xaa))).stats.unwrap();
        assert_eq!(requester.cancelled, 30);
        assert_eq!(requester.created, 30);
        assert_eq!(requester.score, 0);
        assert_eq!(requester.grade, Grade::Newcomer);

        let provider = aggregator.aggregate(&state.escrows, Some(&addr(0xbb))).stats.unwrap();
        assert_eq!(provider.cancelled, 0);
        assert_eq!(provider.score, 100);
    }

    #[test]
    fn test_history_sorted_newest_first() {
        let streams = EventStreams {
            created: vec![
                created(1, 0xaa, 0xbb, hours(1), 100),
                created(2, 0xaa, 0xbb, hours(1), 300),
            ],
            released: vec![released(3, 0xbb, hours(1), 400)],
            cancelled: vec![],
        };
        let state = reconcile(&streams);

        let report = ReputationAggregator::default().aggregate(&state.escrows, None);
        let order: Vec<Option<u64>> = report.history.iter().map(|h| h.created_block).collect();
        assert_eq!(order, vec![Some(300), Some(100), None]);
        assert!(report.stats.is_none());
        assert!(report.history.iter().all(|h| h.role == Role::Observer));
        assert!(report.history[2].inferred);
    }

    #[test]
    fn test_participant_history_excludes_observers() {
        let streams = EventStreams {
            created: vec![
                created(0, 0xaa, 0xbb, hours(1), 1),
                created(1, 0xcc, 0xdd, hours(1), 2),
                created(2, 0xdd, 0xaa, hours(1), 3),
            ],
            ..EventStreams::default()
        };
        let state = reconcile(&streams);

        let report = ReputationAggregator::default().aggregate(&state.escrows, Some(&addr(0xaa)));
        assert_eq!(report.history.len(), 3);
        let ids: Vec<u64> = report.participant_history().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 0]);
        assert_eq!(report.stats.unwrap().created, 1);
    }

    #[test]
    fn test_network_summary() {
        let streams = EventStreams {
            created: vec![
                created(0, 0xaa, 0xbb, hours(2), 1),
                created(1, 0xaa, 0xcc, hours(3), 2),
                created(2, 0xdd, 0xbb, hours(1), 3),
                created(3, 0xaa, 0xbb, hours(4), 4),
            ],
            released: vec![released(0, 0xbb, hours(2), 5), released(1, 0xcc, hours(3), 6)],
            cancelled: vec![cancelled(2, 7)],
        };
        let state = reconcile(&streams);
        let aggregator = ReputationAggregator::new(ReputationConfig {
            leaderboard_size: 1,
        });

        let report = aggregator.aggregate(&state.escrows, None);
        let summary = aggregator.network_summary(&report.history);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.completed_hours, 5.0);
        assert_eq!(summary.pending_hours, 4.0);
        assert_eq!(summary.completion_rate, 0.5);
        assert_eq!(summary.unique_participants, 4);
        assert_eq!(summary.latest_block, Some(6));
        assert_eq!(summary.top_providers.len(), 1);
        assert_eq!(summary.top_providers[0].address, addr(0xcc));
        assert_eq!(summary.top_requesters[0].address, addr(0xaa));
        assert_eq!(summary.top_requesters[0].hours, 5.0);
    }

    #[test]
    fn test_empty_summary() {
        let summary = ReputationAggregator::default().network_summary(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.completion_rate, 0.0);
        assert_eq!(summary.latest_block, None);
    }
}
