use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type ItemId = Ulid;
pub type ReservationId = Ulid;
pub type EventoId = Ulid;

/// Day number used by the sweep over reservation windows.
pub type Day = i32;

/// Inclusive date window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Checked constructor for windows coming from callers.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Number of calendar days covered, boundaries included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: sharing a boundary day counts.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Half-open day numbers `[first, last + 1)` for sweep-line processing.
    pub fn day_span(&self) -> (Day, Day) {
        (self.start.num_days_from_ce(), self.end.num_days_from_ce() + 1)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Unit of measure for a rentable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unidad {
    Pieza,
    Juego,
    Par,
    Metro,
    Caja,
    Docena,
}

impl Unidad {
    pub const ALL: [Unidad; 6] = [
        Unidad::Pieza,
        Unidad::Juego,
        Unidad::Par,
        Unidad::Metro,
        Unidad::Caja,
        Unidad::Docena,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Unidad::Pieza => "pieza",
            Unidad::Juego => "juego",
            Unidad::Par => "par",
            Unidad::Metro => "metro",
            Unidad::Caja => "caja",
            Unidad::Docena => "docena",
        }
    }
}

impl fmt::Display for Unidad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unidad {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Unidad::ALL
            .into_iter()
            .find(|u| u.as_str() == lower)
            .ok_or_else(|| format!("unknown unidad: {s}"))
    }
}

/// Catalog entry for a finite-stock rentable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: ItemId,
    pub nombre: String,
    pub unidad: Unidad,
    pub stock_total: u32,
}

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Estado {
    Borrador,
    Confirmado,
    Devuelto,
}

impl Estado {
    pub fn as_str(self) -> &'static str {
        match self {
            Estado::Borrador => "borrador",
            Estado::Confirmado => "confirmado",
            Estado::Devuelto => "devuelto",
        }
    }

    /// `devuelto` is terminal; everything else may move freely.
    pub fn can_transition_to(self, next: Estado) -> bool {
        self == next || self != Estado::Devuelto
    }
}

impl fmt::Display for Estado {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Estado {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "borrador" => Ok(Estado::Borrador),
            "confirmado" => Ok(Estado::Confirmado),
            "devuelto" => Ok(Estado::Devuelto),
            _ => Err(format!("unknown estado: {s}")),
        }
    }
}

/// Which lifecycle states hold stock against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// `borrador` and `confirmado` both commit.
    #[default]
    DraftsCommit,
    /// Only `confirmado` commits; drafts are exploratory.
    ConfirmedOnly,
}

impl CommitPolicy {
    pub fn commits(self, estado: Estado) -> bool {
        match (self, estado) {
            (_, Estado::Devuelto) => false,
            (CommitPolicy::DraftsCommit, _) => true,
            (CommitPolicy::ConfirmedOnly, estado) => estado == Estado::Confirmado,
        }
    }
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drafts" => Ok(CommitPolicy::DraftsCommit),
            "confirmed" => Ok(CommitPolicy::ConfirmedOnly),
            _ => Err(format!("unknown commit policy: {s} (expected drafts|confirmed)")),
        }
    }
}

/// How a reservation window is derived from the event date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowPolicy {
    /// Days before the event (setup).
    pub setup_days: u32,
    /// Days after the event (teardown / pickup).
    pub teardown_days: u32,
}

impl WindowPolicy {
    pub fn window_for(&self, fecha: NaiveDate) -> Option<DateRange> {
        let start = fecha.checked_sub_days(chrono::Days::new(self.setup_days.into()))?;
        let end = fecha.checked_add_days(chrono::Days::new(self.teardown_days.into()))?;
        Some(DateRange::new(start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub evento_id: EventoId,
    pub window: DateRange,
    pub estado: Estado,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub menaje_id: ItemId,
    pub cantidad: u32,
}

/// A reservation plus its stored lines.
#[derive(Debug, Clone)]
pub struct ReservationState {
    pub reservation: Reservation,
    /// Sorted by `menaje_id`, never contains zero quantities.
    pub lines: Vec<ReservationLine>,
}

impl ReservationState {
    pub fn new(reservation: Reservation) -> Self {
        Self {
            reservation,
            lines: Vec::new(),
        }
    }

    pub fn quantity_of(&self, item: &ItemId) -> u32 {
        self.lines
            .iter()
            .find(|l| &l.menaje_id == item)
            .map_or(0, |l| l.cantidad)
    }
}

/// Stock held by one reservation against one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub reservation_id: ReservationId,
    pub window: DateRange,
    pub cantidad: u32,
    pub estado: Estado,
}

/// Per-item stock ledger: the catalog entry plus every non-returned commitment.
#[derive(Debug, Clone)]
pub struct ItemLedger {
    pub item: InventoryItem,
    /// Sorted by `window.start`.
    pub commitments: Vec<Commitment>,
}

impl ItemLedger {
    pub fn new(item: InventoryItem) -> Self {
        Self {
            item,
            commitments: Vec::new(),
        }
    }

    pub fn insert_commitment(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .partition_point(|c| c.window.start <= commitment.window.start);
        self.commitments.insert(pos, commitment);
    }

    pub fn remove_commitment(&mut self, reservation_id: &ReservationId) -> Option<Commitment> {
        let pos = self
            .commitments
            .iter()
            .position(|c| &c.reservation_id == reservation_id)?;
        Some(self.commitments.remove(pos))
    }

    /// Replace whatever `reservation` held on this item with `cantidad` units.
    pub fn replace_commitment(&mut self, reservation: &Reservation, cantidad: u32) {
        self.remove_commitment(&reservation.id);
        if cantidad > 0 && reservation.estado != Estado::Devuelto {
            self.insert_commitment(Commitment {
                reservation_id: reservation.id,
                window: reservation.window,
                cantidad,
                estado: reservation.estado,
            });
        }
    }

    /// Follow a lifecycle change; `devuelto` drops the commitment.
    pub fn set_commitment_estado(&mut self, reservation_id: &ReservationId, estado: Estado) {
        if estado == Estado::Devuelto {
            self.remove_commitment(reservation_id);
        } else if let Some(c) = self
            .commitments
            .iter_mut()
            .find(|c| &c.reservation_id == reservation_id)
        {
            c.estado = estado;
        }
    }

    /// Commitments whose window overlaps `query` (inclusive).
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.window.start <= query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.window.end >= query.start)
    }
}

/// WAL record format. One record per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemUpserted {
        item: InventoryItem,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    LinesReplaced {
        reservation_id: ReservationId,
        lines: Vec<ReservationLine>,
    },
    EstadoChanged {
        reservation_id: ReservationId,
        estado: Estado,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineDetail {
    pub menaje_id: ItemId,
    pub nombre: String,
    pub unidad: Unidad,
    pub cantidad: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDetail {
    pub reservation: Reservation,
    pub lines: Vec<LineDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ItemAvailability {
    pub menaje_id: ItemId,
    pub stock_total: u32,
    pub reservado: u32,
    pub disponible: u32,
}

/// One over-booked line of a rejected save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub menaje_id: ItemId,
    pub requested: u32,
    pub available: u32,
}
