use ulid::Ulid;

use crate::model::{Estado, Violation};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// Committed demand would exceed stock on at least one day of the window.
    InsufficientStock(Vec<Violation>),
    /// Lock wait expired or a concurrent writer won. Safe to retry.
    ConcurrencyConflict,
    InvalidTransition {
        from: Estado,
        to: Estado,
    },
    /// Lines of a returned reservation are frozen.
    Returned(Ulid),
    DuplicateLine(Ulid),
    InvalidWindow,
    /// Catalog update would drop stock below what is already promised.
    StockBelowCommitted {
        menaje_id: Ulid,
        stock_total: u32,
        committed: u32,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InsufficientStock(violations) => {
                write!(f, "insufficient stock for {} item(s):", violations.len())?;
                for v in violations {
                    write!(
                        f,
                        " {} (requested {}, available {})",
                        v.menaje_id, v.requested, v.available
                    )?;
                }
                Ok(())
            }
            EngineError::ConcurrencyConflict => {
                write!(f, "concurrent modification, retry the operation")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid estado transition: {from} -> {to}")
            }
            EngineError::Returned(id) => {
                write!(f, "reservation {id} is devuelto; lines cannot change")
            }
            EngineError::DuplicateLine(id) => write!(f, "duplicate line for item {id}"),
            EngineError::InvalidWindow => write!(f, "invalid date window: start after end"),
            EngineError::StockBelowCommitted {
                menaje_id,
                stock_total,
                committed,
            } => write!(
                f,
                "stock_total {stock_total} for item {menaje_id} is below the {committed} units already committed"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
