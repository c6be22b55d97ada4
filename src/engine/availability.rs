use crate::model::*;

// ── Committed stock ──────────────────────────────────────────────

/// Units committed by every counted reservation whose window overlaps `window`.
///
/// A reservation touching any day of the window counts in full, whether or not
/// the others share that day with it.
pub fn committed_sum<'a>(
    commitments: impl IntoIterator<Item = &'a Commitment>,
    window: &DateRange,
    exclude: Option<ReservationId>,
    policy: CommitPolicy,
) -> u32 {
    let total: u64 = commitments
        .into_iter()
        .filter(|c| {
            Some(c.reservation_id) != exclude && policy.commits(c.estado) && c.window.overlaps(window)
        })
        .map(|c| u64::from(c.cantidad))
        .sum();
    u32::try_from(total).unwrap_or(u32::MAX)
}

/// Peak number of units committed on any single day of `window`.
///
/// Only commitments that overlap `window`, belong to a reservation other than
/// `exclude`, and are counted by `policy` contribute. Each commitment is clamped
/// to the window, then a sweep over day boundaries finds the busiest day.
pub fn committed_peak<'a>(
    commitments: impl IntoIterator<Item = &'a Commitment>,
    window: &DateRange,
    exclude: Option<ReservationId>,
    policy: CommitPolicy,
) -> u32 {
    let (lo, hi) = window.day_span();

    // (day, delta): +cantidad on the first day, -cantidad the day after the last.
    let mut deltas: Vec<(Day, i64)> = Vec::new();
    for c in commitments {
        if Some(c.reservation_id) == exclude
            || !policy.commits(c.estado)
            || !c.window.overlaps(window)
        {
            continue;
        }
        let (start, end) = c.window.day_span();
        deltas.push((start.max(lo), i64::from(c.cantidad)));
        deltas.push((end.min(hi), -i64::from(c.cantidad)));
    }
    // Releases sort before acquisitions on the same day.
    deltas.sort_unstable();

    let mut running = 0i64;
    let mut peak = 0i64;
    for (_, delta) in deltas {
        running += delta;
        peak = peak.max(running);
    }
    u32::try_from(peak).unwrap_or(u32::MAX)
}

/// Availability of one item over `window`, ignoring `exclude`'s own lines.
pub fn item_availability(
    ledger: &ItemLedger,
    window: &DateRange,
    exclude: Option<ReservationId>,
    policy: CommitPolicy,
) -> ItemAvailability {
    let reservado = committed_sum(ledger.overlapping(window), window, exclude, policy);
    let raw = i64::from(ledger.item.stock_total) - i64::from(reservado);
    if raw < 0 {
        tracing::warn!(
            menaje_id = %ledger.item.id,
            stock_total = ledger.item.stock_total,
            reservado,
            %window,
            "negative availability: committed stock exceeds stock_total"
        );
        metrics::counter!(crate::observability::NEGATIVE_AVAILABILITY_TOTAL).increment(1);
    }
    ItemAvailability {
        menaje_id: ledger.item.id,
        stock_total: ledger.item.stock_total,
        reservado,
        disponible: u32::try_from(raw.max(0)).unwrap_or(0),
    }
}

/// Highest committed quantity on any day, across the whole ledger.
pub fn lifetime_peak(ledger: &ItemLedger, policy: CommitPolicy) -> u32 {
    let Some(first) = ledger.commitments.first() else {
        return 0;
    };
    let last_end = ledger
        .commitments
        .iter()
        .map(|c| c.window.end)
        .max()
        .unwrap_or(first.window.end);
    let all_time = DateRange::new(first.window.start, last_end);
    committed_peak(&ledger.commitments, &all_time, None, policy)
}
