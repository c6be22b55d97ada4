mod availability;
mod error;
mod guard;
mod mutations;
mod queries;

pub use availability::{committed_peak, committed_sum, item_availability, lifetime_peak};
pub use error::EngineError;
pub use guard::{normalize_lines, validate_window};
pub use mutations::with_conflict_retry;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<ItemLedger>>;
pub type SharedReservation = Arc<RwLock<ReservationState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL file. Appends that arrive while a flush is pending are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
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

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes do not leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.compact(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Catalog, reservations and per-item stock ledgers for one tenant.
///
/// Lock order: `commit_gate` (read for mutations, write for compaction), then a
/// reservation, then item ledgers in ascending id order.
pub struct Engine {
    pub(super) items: DashMap<ItemId, SharedLedger>,
    pub(super) reservations: DashMap<ReservationId, SharedReservation>,
    /// Unique index: one reservation per evento.
    pub(super) by_evento: DashMap<EventoId, ReservationId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Replay target: plain maps, wrapped in locks once the log has been applied.
#[derive(Default)]
struct ReplayState {
    items: HashMap<ItemId, ItemLedger>,
    reservations: HashMap<ReservationId, ReservationState>,
}

impl ReplayState {
    fn apply(&mut self, event: Event) {
        match event {
            Event::ItemUpserted { item } => match self.items.get_mut(&item.id) {
                Some(ledger) => ledger.item = item,
                None => {
                    self.items.insert(item.id, ItemLedger::new(item));
                }
            },
            Event::ReservationCreated { reservation } => {
                self.reservations
                    .insert(reservation.id, ReservationState::new(reservation));
            }
            Event::LinesReplaced { reservation_id, lines } => {
                let Some(rs) = self.reservations.get_mut(&reservation_id) else {
                    tracing::warn!(%reservation_id, "replay: lines for unknown reservation");
                    return;
                };
                for item_id in touched_items(&rs.lines, &lines) {
                    let cantidad = lines
                        .iter()
                        .find(|l| l.menaje_id == item_id)
                        .map_or(0, |l| l.cantidad);
                    if let Some(ledger) = self.items.get_mut(&item_id) {
                        ledger.replace_commitment(&rs.reservation, cantidad);
                    }
                }
                rs.lines = lines;
            }
            Event::EstadoChanged { reservation_id, estado } => {
                let Some(rs) = self.reservations.get_mut(&reservation_id) else {
                    tracing::warn!(%reservation_id, "replay: estado for unknown reservation");
                    return;
                };
                rs.reservation.estado = estado;
                for line in &rs.lines {
                    if let Some(ledger) = self.items.get_mut(&line.menaje_id) {
                        ledger.set_commitment_estado(&reservation_id, estado);
                    }
                }
            }
        }
    }
}

/// Sorted, deduplicated item ids referenced by either line set.
pub(crate) fn touched_items(old: &[ReservationLine], new: &[ReservationLine]) -> Vec<ItemId> {
    let mut ids: Vec<ItemId> = old.iter().chain(new).map(|l| l.menaje_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let replayed = events.len();
        let mut state = ReplayState::default();
        for event in events {
            state.apply(event);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let by_evento = state
            .reservations
            .values()
            .map(|rs| (rs.reservation.evento_id, rs.reservation.id))
            .collect();
        let items = state
            .items
            .into_iter()
            .map(|(id, ledger)| (id, Arc::new(RwLock::new(ledger))))
            .collect();
        let reservations = state
            .reservations
            .into_iter()
            .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
            .collect();

        tracing::info!(path = %wal_path.display(), replayed, "engine loaded");

        Ok(Self {
            items,
            reservations,
            by_evento,
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            config,
        })
    }

    /// Send one event to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn ledger(&self, id: &ItemId) -> Option<SharedLedger> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub(super) fn reservation(&self, id: &ReservationId) -> Option<SharedReservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub(super) fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }
}
