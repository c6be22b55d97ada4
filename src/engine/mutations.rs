use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::StockChange;

use super::availability::lifetime_peak;
use super::guard::{find_violations, normalize_lines, validate_window};
use super::{touched_items, Engine, EngineError, WalCommand};

/// Attempts at claiming an evento before giving up with a conflict.
const MAX_CLAIM_ATTEMPTS: usize = 8;

impl Engine {
    /// Register a catalog item or update its name, unit and stock.
    ///
    /// Lowering `stock_total` below the busiest day already committed is refused.
    pub async fn upsert_item(&self, item: InventoryItem) -> Result<InventoryItem, EngineError> {
        if item.nombre.trim().is_empty() || item.nombre.len() > MAX_NOMBRE_LEN {
            return Err(EngineError::LimitExceeded("nombre must be 1..=256 bytes"));
        }
        if item.stock_total > MAX_STOCK_TOTAL {
            return Err(EngineError::LimitExceeded("stock_total too large"));
        }

        let _gate = self.commit_gate.read().await;
        let deadline = self.lock_deadline();
        let id = item.id;

        if !self.items.contains_key(&id) && self.items.len() >= MAX_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many items"));
        }

        let fresh = Arc::new(RwLock::new(ItemLedger::new(item.clone())));
        // Fresh lock, nobody else can hold it yet.
        let fresh_guard = fresh
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::ConcurrencyConflict)?;
        let existing = match self.items.entry(id) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                None
            }
        };

        let Some(ledger) = existing else {
            if let Err(e) = self.wal_append(Event::ItemUpserted { item: item.clone() }).await {
                self.items.remove(&id);
                return Err(e);
            }
            drop(fresh_guard);
            info!(menaje_id = %id, nombre = %item.nombre, stock_total = item.stock_total, "item registered");
            self.notify.send(id, StockChange::Catalog { stock_total: item.stock_total });
            return Ok(item);
        };
        drop(fresh_guard);

        let mut guard = tokio::time::timeout_at(deadline, ledger.write_owned())
            .await
            .map_err(|_| EngineError::ConcurrencyConflict)?;
        let committed = lifetime_peak(&guard, self.config.commit_policy);
        if item.stock_total < committed {
            tracing::warn!(menaje_id = %id, stock_total = item.stock_total, committed, "stock reduction refused");
            return Err(EngineError::StockBelowCommitted {
                menaje_id: id,
                stock_total: item.stock_total,
                committed,
            });
        }
        self.wal_append(Event::ItemUpserted { item: item.clone() }).await?;
        guard.item = item.clone();
        info!(menaje_id = %id, stock_total = item.stock_total, "item updated");
        self.notify.send(id, StockChange::Catalog { stock_total: item.stock_total });
        Ok(item)
    }

    /// Reservation for `evento_id`, created as an empty `borrador` on first use.
    ///
    /// The window comes from `fecha` through the configured window policy. Concurrent
    /// first calls for the same evento all return the same reservation.
    pub async fn get_or_create_reservation(
        &self,
        evento_id: EventoId,
        fecha: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let window = self
            .config
            .window
            .window_for(fecha)
            .ok_or(EngineError::InvalidWindow)?;
        validate_window(&window)?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if let Some(existing) = self.existing_for_evento(&evento_id).await {
                return Ok(existing);
            }

            let _gate = self.commit_gate.read().await;
            if self.reservations.len() >= MAX_RESERVATIONS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many reservations"));
            }

            let reservation = Reservation {
                id: Ulid::new(),
                evento_id,
                window,
                estado: Estado::Borrador,
                created_at: Utc::now(),
            };
            let shared = Arc::new(RwLock::new(ReservationState::new(reservation.clone())));
            let Ok(guard) = shared.clone().try_write_owned() else {
                return Err(EngineError::ConcurrencyConflict);
            };
            // Visible before the claim so a loser can wait on the winner's lock.
            self.reservations.insert(reservation.id, shared);
            let claimed = match self.by_evento.entry(evento_id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(reservation.id);
                    true
                }
            };
            if !claimed {
                self.reservations.remove(&reservation.id);
                drop(guard);
                continue;
            }

            let event = Event::ReservationCreated { reservation: reservation.clone() };
            if let Err(e) = self.wal_append(event).await {
                self.by_evento.remove(&evento_id);
                self.reservations.remove(&reservation.id);
                return Err(e);
            }
            drop(guard);
            info!(reserva_id = %reservation.id, %evento_id, window = %reservation.window, "reservation created");
            return Ok(reservation);
        }

        metrics::counter!(crate::observability::CONCURRENCY_CONFLICTS_TOTAL).increment(1);
        Err(EngineError::ConcurrencyConflict)
    }

    /// Committed reservation claimed by `evento_id`. Waits for an in-flight creation.
    async fn existing_for_evento(&self, evento_id: &EventoId) -> Option<Reservation> {
        let id = self.by_evento.get(evento_id).map(|e| *e.value())?;
        let shared = self.reservation(&id)?;
        let rs = shared.read().await;
        // The creator may have rolled back while we waited.
        let still_claimed = self.by_evento.get(evento_id).map(|e| *e.value()) == Some(id);
        still_claimed.then(|| rs.reservation.clone())
    }

    /// Replace every line of a reservation, or change nothing.
    ///
    /// Zero quantities are dropped. Each remaining line is checked against what
    /// other reservations leave free over this reservation's window.
    pub async fn save_reservation_lines(
        &self,
        id: ReservationId,
        proposed: Vec<ReservationLine>,
    ) -> Result<Vec<ReservationLine>, EngineError> {
        let lines = normalize_lines(proposed)?;

        let _gate = self.commit_gate.read().await;
        let deadline = self.lock_deadline();
        let mut rs = self.lock_reservation(&id, deadline).await?;
        if rs.reservation.estado == Estado::Devuelto {
            return Err(EngineError::Returned(id));
        }

        let item_ids = touched_items(&rs.lines, &lines);
        let mut ledgers = self.lock_ledgers(&item_ids, deadline).await?;

        for ledger in &ledgers {
            let adds_commitment = rs.quantity_of(&ledger.item.id) == 0
                && lines.iter().any(|l| l.menaje_id == ledger.item.id);
            if adds_commitment && ledger.commitments.len() >= MAX_COMMITMENTS_PER_ITEM {
                return Err(EngineError::LimitExceeded("too many reservations on item"));
            }
        }

        let window = rs.reservation.window;
        let violations = find_violations(&ledgers, &lines, &window, id, self.config.commit_policy);
        if !violations.is_empty() {
            tracing::warn!(reserva_id = %id, %window, violations = violations.len(), "save rejected: insufficient stock");
            metrics::counter!(crate::observability::OVERBOOKING_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::InsufficientStock(violations));
        }

        self.wal_append(Event::LinesReplaced { reservation_id: id, lines: lines.clone() })
            .await?;

        for ledger in ledgers.iter_mut() {
            let item_id = ledger.item.id;
            let cantidad = lines
                .iter()
                .find(|l| l.menaje_id == item_id)
                .map_or(0, |l| l.cantidad);
            ledger.replace_commitment(&rs.reservation, cantidad);
            self.notify.send(item_id, StockChange::Lines { reservation_id: id, window, cantidad });
        }
        rs.lines = lines.clone();
        info!(reserva_id = %id, lines = lines.len(), "reservation lines saved");
        Ok(lines)
    }

    /// Move a reservation through its lifecycle. `devuelto` is terminal.
    ///
    /// When the move makes the reservation start holding stock under the active
    /// policy, its lines are checked again first.
    pub async fn set_estado(
        &self,
        id: ReservationId,
        estado: Estado,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        let deadline = self.lock_deadline();
        let mut rs = self.lock_reservation(&id, deadline).await?;

        let from = rs.reservation.estado;
        if from == estado {
            return Ok(rs.reservation.clone());
        }
        if !from.can_transition_to(estado) {
            return Err(EngineError::InvalidTransition { from, to: estado });
        }

        let item_ids: Vec<ItemId> = rs.lines.iter().map(|l| l.menaje_id).collect();
        let mut ledgers = self.lock_ledgers(&item_ids, deadline).await?;

        let policy = self.config.commit_policy;
        if !policy.commits(from) && policy.commits(estado) {
            let window = rs.reservation.window;
            let violations = find_violations(&ledgers, &rs.lines, &window, id, policy);
            if !violations.is_empty() {
                tracing::warn!(reserva_id = %id, %from, to = %estado, "transition rejected: insufficient stock");
                metrics::counter!(crate::observability::OVERBOOKING_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::InsufficientStock(violations));
            }
        }

        self.wal_append(Event::EstadoChanged { reservation_id: id, estado }).await?;

        rs.reservation.estado = estado;
        for ledger in ledgers.iter_mut() {
            ledger.set_commitment_estado(&id, estado);
            self.notify.send(ledger.item.id, StockChange::Estado { reservation_id: id, estado });
        }
        info!(reserva_id = %id, %from, to = %estado, "estado changed");
        Ok(rs.reservation.clone())
    }

    /// Rewrite the WAL as the minimal event list that rebuilds the current state.
    ///
    /// Holds the commit gate exclusively, so no mutation can interleave.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut snapshot = Vec::new();
        for item in self.list_items().await {
            snapshot.push(Event::ItemUpserted { item });
        }

        let mut reservations: Vec<_> = self
            .reservations
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        reservations.sort_by_key(|(id, _)| *id);
        for (id, shared) in reservations {
            let rs = shared.read().await;
            snapshot.push(Event::ReservationCreated { reservation: rs.reservation.clone() });
            if !rs.lines.is_empty() {
                snapshot.push(Event::LinesReplaced { reservation_id: id, lines: rs.lines.clone() });
            }
        }

        let records = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records, "WAL compacted");
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

/// Run `op` until it succeeds, fails for a reason other than a concurrency
/// conflict, or `attempts` runs out. Backs off a little between attempts.
pub async fn with_conflict_retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::debug!(attempt, "concurrency conflict, retrying");
                tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
