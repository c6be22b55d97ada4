use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::Instant;

use crate::limits::*;
use crate::model::*;

use super::availability::item_availability;
use super::{Engine, EngineError};

pub(super) type LedgerGuard = OwnedRwLockWriteGuard<ItemLedger>;
pub(super) type ReservationGuard = OwnedRwLockWriteGuard<ReservationState>;

pub fn validate_window(window: &DateRange) -> Result<(), EngineError> {
    if window.start > window.end {
        return Err(EngineError::InvalidWindow);
    }
    if window.days() > MAX_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("date window too wide"));
    }
    Ok(())
}

/// Drop zero quantities, reject repeated items, and sort by item id.
pub fn normalize_lines(
    proposed: Vec<ReservationLine>,
) -> Result<Vec<ReservationLine>, EngineError> {
    if proposed.len() > MAX_LINES_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many lines in reservation"));
    }
    let mut lines: Vec<ReservationLine> =
        proposed.into_iter().filter(|l| l.cantidad > 0).collect();
    if lines.iter().any(|l| l.cantidad > MAX_CANTIDAD) {
        return Err(EngineError::LimitExceeded("cantidad too large"));
    }
    lines.sort_by_key(|l| l.menaje_id);
    if let Some(pair) = lines.windows(2).find(|w| w[0].menaje_id == w[1].menaje_id) {
        return Err(EngineError::DuplicateLine(pair[0].menaje_id));
    }
    Ok(lines)
}

/// Lines whose requested quantity exceeds what others leave free over `window`.
///
/// `ledgers` must hold every item named in `lines`.
pub(super) fn find_violations(
    ledgers: &[LedgerGuard],
    lines: &[ReservationLine],
    window: &DateRange,
    exclude: ReservationId,
    policy: CommitPolicy,
) -> Vec<Violation> {
    lines
        .iter()
        .filter_map(|line| {
            let ledger = ledgers.iter().find(|g| g.item.id == line.menaje_id)?;
            let available = item_availability(ledger, window, Some(exclude), policy).disponible;
            (line.cantidad > available).then_some(Violation {
                menaje_id: line.menaje_id,
                requested: line.cantidad,
                available,
            })
        })
        .collect()
}

fn lock_wait_expired(what: &'static str) -> EngineError {
    tracing::debug!(what, "lock wait expired");
    metrics::counter!(crate::observability::CONCURRENCY_CONFLICTS_TOTAL).increment(1);
    EngineError::ConcurrencyConflict
}

impl Engine {
    pub(super) fn lock_deadline(&self) -> Instant {
        Instant::now() + self.lock_timeout()
    }

    pub(super) async fn lock_reservation(
        &self,
        id: &ReservationId,
        deadline: Instant,
    ) -> Result<ReservationGuard, EngineError> {
        let shared = self.reservation(id).ok_or(EngineError::NotFound(*id))?;
        let guard = tokio::time::timeout_at(deadline, shared.write_owned())
            .await
            .map_err(|_| lock_wait_expired("reservation"))?;
        // Lost a creation race that was rolled back.
        if !self.reservations.contains_key(id) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Write-lock the ledgers of `ids`, which must be sorted ascending.
    pub(super) async fn lock_ledgers(
        &self,
        ids: &[ItemId],
        deadline: Instant,
    ) -> Result<Vec<LedgerGuard>, EngineError> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let ledger = self.ledger(id).ok_or(EngineError::NotFound(*id))?;
            let guard = tokio::time::timeout_at(deadline, ledger.write_owned())
                .await
                .map_err(|_| lock_wait_expired("item ledger"))?;
            guards.push(guard);
        }
        Ok(guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn line(id: Ulid, cantidad: u32) -> ReservationLine {
        ReservationLine { menaje_id: id, cantidad }
    }

    #[test]
    fn zero_quantities_are_dropped() {
        let a = Ulid::new();
        let b = Ulid::new();
        let lines = normalize_lines(vec![line(a, 0), line(b, 3)]).unwrap();
        assert_eq!(lines, vec![line(b, 3)]);
    }

    #[test]
    fn lines_come_back_sorted() {
        let mut ids: Vec<Ulid> = (0..5).map(|_| Ulid::new()).collect();
        ids.sort();
        let proposed: Vec<_> = ids.iter().rev().map(|id| line(*id, 1)).collect();
        let lines = normalize_lines(proposed).unwrap();
        let got: Vec<_> = lines.iter().map(|l| l.menaje_id).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn duplicate_item_is_rejected() {
        let a = Ulid::new();
        let err = normalize_lines(vec![line(a, 1), line(Ulid::new(), 2), line(a, 4)]).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLine(id) if id == a));
    }

    #[test]
    fn duplicate_of_a_zero_line_is_fine() {
        let a = Ulid::new();
        let lines = normalize_lines(vec![line(a, 0), line(a, 2)]).unwrap();
        assert_eq!(lines, vec![line(a, 2)]);
    }

    #[test]
    fn oversized_requests_hit_limits() {
        let err = normalize_lines(vec![line(Ulid::new(), MAX_CANTIDAD + 1)]).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));

        let many: Vec<_> = (0..=MAX_LINES_PER_RESERVATION)
            .map(|_| line(Ulid::new(), 1))
            .collect();
        assert!(matches!(normalize_lines(many), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn window_validation() {
        let day: chrono::NaiveDate = "2024-05-01".parse().unwrap();
        assert!(validate_window(&DateRange::single_day(day)).is_ok());

        let inverted = DateRange { start: day, end: day.pred_opt().unwrap() };
        assert!(matches!(validate_window(&inverted), Err(EngineError::InvalidWindow)));

        let far = day + chrono::Days::new(MAX_WINDOW_DAYS as u64);
        let too_wide = DateRange { start: day, end: far };
        assert!(matches!(validate_window(&too_wide), Err(EngineError::LimitExceeded(_))));
    }
}
