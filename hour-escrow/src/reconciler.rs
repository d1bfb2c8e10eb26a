//! Event Reconciler - rebuilds escrow state from ledger event streams
//!
//! There is no "current escrow" query on the ledger. State is derived by
//! replaying three independent log streams (creation, release,
//! cancellation) into one record per escrow id. The merge is a pure
//! function of the event sets: each stream is sorted by ledger position
//! before it is applied and every apply step tolerates the others having
//! run first, so a full replay and any sequence of incremental syncs
//! converge on the same map.

use crate::{
    codec::{decode_event, event_topic},
    error::EscrowError,
    events::{
        CancelledEvent, CreatedEvent, EscrowEvent, EventKind, EventStreams, LogPosition, ReleasedEvent,
    },
    ledger_client::{LedgerClient, LogQuery, RawLog},
    models::{Address, Amount, BlockNumber, EscrowId, EscrowStatus},
    retry::RetryPolicy,
    EscrowResult,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// How much of an escrow the reconciler has actually observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin")]
pub enum EscrowOrigin {
    /// The creation log was seen
    Seen {
        requester: Address,
        created_block: BlockNumber,
    },
    /// Only a release or cancellation was seen, e.g. after a partial
    /// range fetch; requester and creation block are unknown
    InferredFromReleaseOrCancel,
}

/// Escrow state reconstructed from events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledEscrow {
    pub id: EscrowId,
    pub origin: EscrowOrigin,
    /// Unknown for an escrow only seen through its cancellation
    pub provider: Option<Address>,
    /// Zero for an escrow only seen through its cancellation
    pub amount: Amount,
    pub released_block: Option<BlockNumber>,
    pub cancelled_block: Option<BlockNumber>,
    /// Every log folded into this record, duplicates included
    #[serde(default)]
    pub applied_logs: BTreeSet<(EventKind, LogPosition)>,
}

impl ReconciledEscrow {
    fn inferred(id: EscrowId, amount: Amount) -> Self {
        Self {
            id,
            origin: EscrowOrigin::InferredFromReleaseOrCancel,
            provider: None,
            amount,
            released_block: None,
            cancelled_block: None,
            applied_logs: BTreeSet::new(),
        }
    }

    /// Record a log, false if this exact log was already applied
    fn mark_applied(&mut self, kind: EventKind, position: LogPosition) -> bool {
        self.applied_logs.insert((kind, position))
    }

    pub fn requester(&self) -> Option<&Address> {
        match &self.origin {
            EscrowOrigin::Seen { requester, .. } => Some(requester),
            EscrowOrigin::InferredFromReleaseOrCancel => None,
        }
    }

    pub fn created_block(&self) -> Option<BlockNumber> {
        match &self.origin {
            EscrowOrigin::Seen { created_block, .. } => Some(*created_block),
            EscrowOrigin::InferredFromReleaseOrCancel => None,
        }
    }

    pub fn is_inferred(&self) -> bool {
        matches!(self.origin, EscrowOrigin::InferredFromReleaseOrCancel)
    }

    pub fn released(&self) -> bool {
        self.released_block.is_some()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled_block.is_some()
    }

    /// Release wins over cancellation; both set is an anomaly
    pub fn status(&self) -> EscrowStatus {
        if self.released() {
            EscrowStatus::Completed
        } else if self.cancelled() {
            EscrowStatus::Cancelled
        } else {
            EscrowStatus::Pending
        }
    }
}

pub type ReconciledMap = BTreeMap<EscrowId, ReconciledEscrow>;

/// Event history that breaks a settlement invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Both a release and a cancellation exist for one id
    ReleasedAndCancelled,
    DuplicateCreation,
    DuplicateRelease,
    DuplicateCancellation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub escrow_id: EscrowId,
    pub kind: AnomalyKind,
    pub block_number: Option<BlockNumber>,
}

/// Log entry dropped because it could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLog {
    pub stream: EventKind,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    pub reason: String,
}

/// Last block processed per stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursors {
    pub created: Option<BlockNumber>,
    pub released: Option<BlockNumber>,
    pub cancelled: Option<BlockNumber>,
}

impl StreamCursors {
    pub fn get(&self, kind: EventKind) -> Option<BlockNumber> {
        match kind {
            EventKind::Created => self.created,
            EventKind::Released => self.released,
            EventKind::Cancelled => self.cancelled,
        }
    }

    fn set_all(&mut self, head: BlockNumber) {
        self.created = Some(head);
        self.released = Some(head);
        self.cancelled = Some(head);
    }
}

/// Reconciled escrows plus everything needed to resume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileState {
    pub escrows: ReconciledMap,
    pub cursors: StreamCursors,
    pub anomalies: Vec<Anomaly>,
    pub skipped: Vec<SkippedLog>,
}

impl ReconcileState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of decoded events
    pub fn merge(&mut self, streams: &EventStreams) {
        let mut sorted = streams.clone();
        sorted.normalize();

        for event in &sorted.created {
            self.apply_created(event);
        }
        for event in &sorted.released {
            self.apply_released(event);
        }
        for event in &sorted.cancelled {
            self.apply_cancelled(event);
        }

        self.refresh_conflicts();
    }

    fn apply_created(&mut self, event: &CreatedEvent) {
        let block = event.position.block_number;
        match self.escrows.entry(event.escrow_id) {
            Entry::Vacant(slot) => {
                slot.insert(ReconciledEscrow {
                    id: event.escrow_id,
                    origin: EscrowOrigin::Seen {
                        requester: event.requester.clone(),
                        created_block: block,
                    },
                    provider: Some(event.provider.clone()),
                    amount: event.amount,
                    released_block: None,
                    cancelled_block: None,
                    applied_logs: BTreeSet::from([(EventKind::Created, event.position)]),
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if !entry.mark_applied(EventKind::Created, event.position) {
                    return;
                }
                match entry.created_block() {
                    Some(existing) => {
                        self.anomalies.push(Anomaly {
                            escrow_id: event.escrow_id,
                            kind: AnomalyKind::DuplicateCreation,
                            block_number: Some(block),
                        });
                        warn!(
                            escrow_id = event.escrow_id,
                            kept_block = existing.min(block),
                            "Duplicate creation log"
                        );
                        if block < existing {
                            entry.origin = EscrowOrigin::Seen {
                                requester: event.requester.clone(),
                                created_block: block,
                            };
                        }
                    }
                    None => {
                        // Upgrade a placeholder; release data stays authoritative
                        entry.origin = EscrowOrigin::Seen {
                            requester: event.requester.clone(),
                            created_block: block,
                        };
                        if !entry.released() {
                            entry.provider = Some(event.provider.clone());
                            entry.amount = event.amount;
                        }
                    }
                }
            }
        }
    }

    fn apply_released(&mut self, event: &ReleasedEvent) {
        let block = event.position.block_number;
        let entry = self
            .escrows
            .entry(event.escrow_id)
            .or_insert_with(|| ReconciledEscrow::inferred(event.escrow_id, event.amount));
        if !entry.mark_applied(EventKind::Released, event.position) {
            return;
        }

        if let Some(existing) = entry.released_block {
            self.anomalies.push(Anomaly {
                escrow_id: event.escrow_id,
                kind: AnomalyKind::DuplicateRelease,
                block_number: Some(block),
            });
            warn!(escrow_id = event.escrow_id, first_block = existing, "Duplicate release log");
            if block >= existing {
                return;
            }
        }

        entry.released_block = Some(block);
        entry.provider = Some(event.provider.clone());
        entry.amount = event.amount;
    }

    fn apply_cancelled(&mut self, event: &CancelledEvent) {
        let block = event.position.block_number;
        let entry = self
            .escrows
            .entry(event.escrow_id)
            .or_insert_with(|| ReconciledEscrow::inferred(event.escrow_id, 0));
        if !entry.mark_applied(EventKind::Cancelled, event.position) {
            return;
        }

        if let Some(existing) = entry.cancelled_block {
            self.anomalies.push(Anomaly {
                escrow_id: event.escrow_id,
                kind: AnomalyKind::DuplicateCancellation,
                block_number: Some(block),
            });
            warn!(escrow_id = event.escrow_id, first_block = existing, "Duplicate cancellation log");
            if block >= existing {
                return;
            }
        }

        entry.cancelled_block = Some(block);
    }

    /// Recompute released-and-cancelled anomalies over the whole map
    fn refresh_conflicts(&mut self) {
        self.anomalies
            .retain(|a| a.kind != AnomalyKind::ReleasedAndCancelled);

        for entry in self.escrows.values() {
            if entry.released() && entry.cancelled() {
                warn!(
                    escrow_id = entry.id,
                    released_block = entry.released_block,
                    cancelled_block = entry.cancelled_block,
                    "Escrow both released and cancelled, treating as completed"
                );
                self.anomalies.push(Anomaly {
                    escrow_id: entry.id,
                    kind: AnomalyKind::ReleasedAndCancelled,
                    block_number: entry.cancelled_block,
                });
            }
        }
    }

    /// Ids whose record was inferred rather than seen
    pub fn inferred_ids(&self) -> Vec<EscrowId> {
        self.escrows
            .values()
            .filter(|e| e.is_inferred())
            .map(|e| e.id)
            .collect()
    }
}

/// Reconcile a complete set of streams from scratch
pub fn reconcile(streams: &EventStreams) -> ReconcileState {
    let mut state = ReconcileState::new();
    state.merge(streams);
    state
}

/// Decode one stream, collecting undecodable entries instead of failing
pub fn decode_stream(kind: EventKind, logs: &[RawLog], into: &mut EventStreams) -> Vec<SkippedLog> {
    let mut skipped = Vec::new();

    for log in logs {
        match decode_event(kind, log) {
            Ok(EscrowEvent::Created(e)) => into.created.push(e),
            Ok(EscrowEvent::Released(e)) => into.released.push(e),
            Ok(EscrowEvent::Cancelled(e)) => into.cancelled.push(e),
            Err(err) => {
                warn!(stream = %kind, tx = ?log.transaction_hash, error = %err, "Skipping malformed log");
                skipped.push(SkippedLog {
                    stream: kind,
                    transaction_hash: log.transaction_hash.clone(),
                    log_index: log.log_index.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    skipped
}

/// Configuration for the event reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Escrow contract whose logs are replayed
    pub contract_address: Address,
    /// First block of the replay (deployment block)
    pub from_block: BlockNumber,
    pub retry: RetryPolicy,
}

/// Outcome of a fetch over a block range
#[derive(Debug, Clone, Default)]
pub struct FetchedStreams {
    pub streams: EventStreams,
    pub skipped: Vec<SkippedLog>,
}

/// Result of one incremental sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub head: BlockNumber,
    pub new_events: usize,
    pub skipped: usize,
}

/// Fetches the three streams and merges them into reconciled state
#[derive(Clone)]
pub struct EventReconciler {
    client: Arc<dyn LedgerClient>,
    config: ReconcilerConfig,
}

impl EventReconciler {
    pub fn new(client: Arc<dyn LedgerClient>, config: ReconcilerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Replay the full history from the configured start block
    pub async fn reconcile_full(&self) -> EscrowResult<ReconcileState> {
        let mut state = ReconcileState::new();
        self.sync(&mut state).await?;
        Ok(state)
    }

    /// Bring `state` up to the current head
    ///
    /// All three streams are fetched before anything is merged, so a fetch
    /// failure leaves `state` untouched and the sync can simply be retried.
    pub async fn sync(&self, state: &mut ReconcileState) -> EscrowResult<SyncOutcome> {
        let client = self.client.clone();
        let head = self
            .config
            .retry
            .run("eth_blockNumber", || {
                let client = client.clone();
                async move { client.block_number().await }
            })
            .await
            .map_err(|e| EscrowError::log_fetch("head", e.to_string()))?;

        let (created, released, cancelled) = tokio::try_join!(
            self.fetch_since(EventKind::Created, state.cursors.get(EventKind::Created), head),
            self.fetch_since(EventKind::Released, state.cursors.get(EventKind::Released), head),
            self.fetch_since(EventKind::Cancelled, state.cursors.get(EventKind::Cancelled), head),
        )?;

        let mut fetched = FetchedStreams::default();
        for (kind, logs) in [
            (EventKind::Created, created),
            (EventKind::Released, released),
            (EventKind::Cancelled, cancelled),
        ] {
            let skipped = decode_stream(kind, &logs, &mut fetched.streams);
            fetched.skipped.extend(skipped);
        }

        let outcome = SyncOutcome {
            head,
            new_events: fetched.streams.len(),
            skipped: fetched.skipped.len(),
        };

        state.merge(&fetched.streams);
        state.skipped.extend(fetched.skipped);
        state.cursors.set_all(head);

        info!(
            head,
            new_events = outcome.new_events,
            skipped = outcome.skipped,
            escrows = state.escrows.len(),
            "Reconciled escrow events"
        );

        Ok(outcome)
    }

    /// Fetch and decode every stream over an explicit range
    pub async fn fetch_range(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> EscrowResult<FetchedStreams> {
        let (created, released, cancelled) = tokio::try_join!(
            self.fetch_logs(EventKind::Created, from_block, to_block),
            self.fetch_logs(EventKind::Released, from_block, to_block),
            self.fetch_logs(EventKind::Cancelled, from_block, to_block),
        )?;

        let mut fetched = FetchedStreams::default();
        fetched.skipped.extend(decode_stream(EventKind::Created, &created, &mut fetched.streams));
        fetched.skipped.extend(decode_stream(EventKind::Released, &released, &mut fetched.streams));
        fetched.skipped.extend(decode_stream(EventKind::Cancelled, &cancelled, &mut fetched.streams));
        Ok(fetched)
    }

    async fn fetch_since(
        &self,
        kind: EventKind,
        cursor: Option<BlockNumber>,
        head: BlockNumber,
    ) -> EscrowResult<Vec<RawLog>> {
        let from_block = match cursor {
            Some(last) => last + 1,
            None => self.config.from_block,
        };
        if from_block > head {
            debug!(stream = %kind, from_block, head, "Stream already at head");
            return Ok(Vec::new());
        }
        self.fetch_logs(kind, from_block, head).await
    }

    async fn fetch_logs(
        &self,
        kind: EventKind,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> EscrowResult<Vec<RawLog>> {
        let query = LogQuery {
            address: self.config.contract_address.clone(),
            topic0: event_topic(kind),
            from_block,
            to_block: Some(to_block),
        };
        let client = self.client.clone();
        let label = kind.to_string();

        self.config
            .retry
            .run(&label, || {
                let client = client.clone();
                let query = query.clone();
                async move { client.get_logs(&query).await }
            })
            .await
            .map_err(|e| match e {
                EscrowError::LogFetch { .. } => e,
                other => EscrowError::log_fetch(kind.to_string(), other.to_string()),
            })
    }
}
