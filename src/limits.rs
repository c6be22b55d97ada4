//! Hard caps that keep one tenant from exhausting the process.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ITEMS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_TENANT: usize = 1_000_000;
pub const MAX_COMMITMENTS_PER_ITEM: usize = 100_000;

pub const MAX_NOMBRE_LEN: usize = 256;
pub const MAX_LINES_PER_RESERVATION: usize = 1_000;
pub const MAX_CANTIDAD: u32 = 1_000_000;
pub const MAX_STOCK_TOTAL: u32 = 100_000_000;

/// Widest availability or reservation window, in days.
pub const MAX_WINDOW_DAYS: i64 = 3_660;

pub const MAX_SQL_LEN: usize = 1 << 20;

/// Largest WAL record accepted on write or replay. Larger length prefixes are torn frames.
pub const MAX_WAL_RECORD_LEN: u32 = 16 << 20;
