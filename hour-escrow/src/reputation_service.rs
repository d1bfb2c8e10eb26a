//! Reputation queries with stale-result protection
//!
//! Every query gets a generation number. A query that finishes after a newer
//! one was issued is reported as superseded and never replaces the published
//! view. Fetch failures still produce a view, marked unavailable, so callers
//! cannot mistake an empty history for a real one.

use crate::{
    events::EventKind,
    models::{Address, BlockNumber},
    reconciler::{Anomaly, EventReconciler, ReconcileState},
    reputation::{HistoryItem, ReputationAggregator, ReputationStats, Role},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// How much of the ledger history a view reflects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    /// Some logs could not be decoded or some escrows lack a creation log
    Partial { skipped_logs: usize, inferred: usize },
    /// The streams could not be fetched at all
    Unavailable { reason: String },
}

impl Completeness {
    fn of(state: &ReconcileState) -> Self {
        let skipped_logs = state.skipped.len();
        let inferred = state.inferred_ids().len();
        if skipped_logs == 0 && inferred == 0 {
            Self::Complete
        } else {
            Self::Partial {
                skipped_logs,
                inferred,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Result of one reputation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationView {
    pub generation: u64,
    pub subject: Option<Address>,
    pub stats: Option<ReputationStats>,
    pub history: Vec<HistoryItem>,
    pub anomalies: Vec<Anomaly>,
    pub completeness: Completeness,
    pub head_block: Option<BlockNumber>,
    pub generated_at: DateTime<Utc>,
}

impl ReputationView {
    /// History rows the subject took part in
    pub fn participant_history(&self) -> Vec<&HistoryItem> {
        self.history
            .iter()
            .filter(|item| item.role != Role::Observer)
            .collect()
    }
}

/// Outcome of `ReputationService::query`
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Fresh(ReputationView),
    /// A newer query was issued while this one was in flight
    Superseded { generation: u64, latest: u64 },
}

impl QueryOutcome {
    pub fn fresh(self) -> Option<ReputationView> {
        match self {
            Self::Fresh(view) => Some(view),
            Self::Superseded { .. } => None,
        }
    }
}

/// Serves reputation views built from a full event replay per query
pub struct ReputationService {
    reconciler: EventReconciler,
    aggregator: ReputationAggregator,
    generation: AtomicU64,
    latest: RwLock<Option<ReputationView>>,
}

impl ReputationService {
    pub fn new(reconciler: EventReconciler, aggregator: ReputationAggregator) -> Self {
        Self {
            reconciler,
            aggregator,
            generation: AtomicU64::new(0),
            latest: RwLock::new(None),
        }
    }

    /// Build a view for `subject`, discarding it if a newer query started
    pub async fn query(&self, subject: Option<&Address>) -> QueryOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, subject = ?subject, "Starting reputation query");

        let view = match self.reconciler.reconcile_full().await {
            Ok(state) => self.build_view(generation, subject, &state),
            Err(e) => {
                error!(generation, error = %e, "Reputation query failed");
                Self::unavailable_view(generation, subject, e.to_string())
            }
        };

        let mut latest = self.latest.write().await;
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            info!(generation, latest = current, "Discarding superseded reputation result");
            return QueryOutcome::Superseded {
                generation,
                latest: current,
            };
        }

        *latest = Some(view.clone());
        QueryOutcome::Fresh(view)
    }

    /// Last published view
    pub async fn latest(&self) -> Option<ReputationView> {
        self.latest.read().await.clone()
    }

    /// Build a view from already reconciled state
    pub fn build_view(
        &self,
        generation: u64,
        subject: Option<&Address>,
        state: &ReconcileState,
    ) -> ReputationView {
        let report = self.aggregator.aggregate(&state.escrows, subject);
        let head_block = state.cursors.get(EventKind::Created);
        ReputationView {
            generation,
            subject: report.subject,
            stats: report.stats,
            history: report.history,
            anomalies: state.anomalies.clone(),
            completeness: Completeness::of(state),
            head_block,
            generated_at: Utc::now(),
        }
    }

    fn unavailable_view(generation: u64, subject: Option<&Address>, reason: String) -> ReputationView {
        ReputationView {
            generation,
            subject: subject.cloned(),
            stats: subject.map(|_| ReputationStats::default()),
            history: Vec::new(),
            anomalies: Vec::new(),
            completeness: Completeness::Unavailable { reason },
            head_block: None,
            generated_at: Utc::now(),
        }
    }
}
