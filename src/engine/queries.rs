use std::collections::BTreeMap;

use crate::model::*;

use super::availability::item_availability;
use super::guard::validate_window;
use super::{Engine, EngineError, SharedLedger};

impl Engine {
    /// Ledgers sorted by item id, so callers see a stable order.
    fn ledgers_sorted(&self) -> Vec<SharedLedger> {
        let mut entries: Vec<(ItemId, SharedLedger)> = self
            .items
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, ledger)| ledger).collect()
    }

    pub async fn list_items(&self) -> Vec<InventoryItem> {
        let mut out = Vec::with_capacity(self.items.len());
        for ledger in self.ledgers_sorted() {
            out.push(ledger.read().await.item.clone());
        }
        out
    }

    pub async fn get_item(&self, id: &ItemId) -> Result<InventoryItem, EngineError> {
        let ledger = self.ledger(id).ok_or(EngineError::NotFound(*id))?;
        let guard = ledger.read().await;
        Ok(guard.item.clone())
    }

    /// Per-item stock picture over `window`, ignoring `exclude`'s own lines.
    ///
    /// Every catalog item is present, including those nobody has reserved.
    pub async fn availability(
        &self,
        window: DateRange,
        exclude: Option<ReservationId>,
    ) -> Result<BTreeMap<ItemId, ItemAvailability>, EngineError> {
        validate_window(&window)?;
        let policy = self.config.commit_policy;
        let mut out = BTreeMap::new();
        for ledger in self.ledgers_sorted() {
            let guard = ledger.read().await;
            out.insert(guard.item.id, item_availability(&guard, &window, exclude, policy));
        }
        Ok(out)
    }

    /// Reservation header plus its lines joined with the catalog.
    pub async fn read_reservation(&self, id: &ReservationId) -> Result<ReservationDetail, EngineError> {
        let shared = self.reservation(id).ok_or(EngineError::NotFound(*id))?;
        let rs = shared.read().await;
        if !self.reservations.contains_key(id) {
            return Err(EngineError::NotFound(*id));
        }

        let mut lines = Vec::with_capacity(rs.lines.len());
        for line in &rs.lines {
            let item = self.get_item(&line.menaje_id).await?;
            lines.push(LineDetail {
                menaje_id: item.id,
                nombre: item.nombre,
                unidad: item.unidad,
                cantidad: line.cantidad,
            });
        }
        Ok(ReservationDetail {
            reservation: rs.reservation.clone(),
            lines,
        })
    }

    /// Reservation for an evento, if one has been created.
    pub async fn reservation_for_evento(&self, evento_id: &EventoId) -> Option<Reservation> {
        let id = self.by_evento.get(evento_id).map(|e| *e.value())?;
        let shared = self.reservation(&id)?;
        let rs = shared.read().await;
        Some(rs.reservation.clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}
