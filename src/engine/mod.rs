mod bookings;
mod catalog;
mod error;
mod guides;
mod ledger;
mod proposals;
mod queries;
mod rules;
mod store;

pub use bookings::{ExpiryWindows, NewBooking};
pub use catalog::CatalogKind;
pub use error::{DateRejection, EngineError, ErrorBody, FieldError};
pub use proposals::{DraftGuide, ProposalDraft};
pub use queries::BookingFilter;

use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// The UTC calendar date booking rules are evaluated against.
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no partial bytes leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Booking admission and proposal promotion over the in-memory store.
///
/// Lock order, everywhere: write gate (shared), then tour, then guide
/// calendars ascending by id; or proposal, then catalog, then slug registry.
/// Locks are held across the check, the WAL append and the apply, and
/// released before notifications go out.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    /// Held shared by every mutation and exclusively by compaction, so a
    /// snapshot never misses an in-flight write.
    pub(super) writes: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> io::Result<Self> {
        let recovered = Wal::recover(&wal_path)?;
        if recovered.discarded > 0 {
            tracing::warn!(bytes = recovered.discarded, "discarding torn WAL tail");
        }
        let wal = Wal::open(&wal_path, recovered.valid_len)?;
        let events = recovered.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.replay(event);
        }
        tracing::info!(
            events = events.len(),
            tours = store.tour_count(),
            proposals = store.proposal_count(),
            "state restored from {}",
            wal_path.display()
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            gateway,
            writes: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL with the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.writes.write().await;
        let mut events = Vec::new();

        {
            let catalog = self.store.catalog.read().await;
            let mut locations: Vec<_> = catalog.locations.iter().collect();
            locations.sort();
            for (id, name) in locations {
                events.push(Event::LocationRegistered { id: *id, name: name.clone() });
            }
            let mut categories: Vec<_> = catalog.categories.iter().collect();
            categories.sort();
            for (id, name) in categories {
                events.push(Event::CategoryRegistered { id: *id, name: name.clone() });
            }
        }

        for shared in self.store.proposals() {
            let proposal = shared.read().await.clone();
            events.push(Event::ProposalSubmitted { proposal });
        }

        for slot in self.store.tours() {
            events.push(Event::TourPublished { tour: (*slot.tour).clone() });
            let state = slot.state.read().await;
            let mut bookings: Vec<&Booking> = state.bookings.values().collect();
            bookings.sort_by_key(|b| b.id);
            for booking in bookings {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
        }

        for marker in self.store.markers(None) {
            events.push(Event::BusyMarkerAdded { marker });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
