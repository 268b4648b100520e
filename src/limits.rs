use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_CUSTOMERS_PER_TENANT: usize = 1_000_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_LOCATION_LEN: usize = 512;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single rental can't run longer than a year.
pub const MAX_BOOKING_DURATION_MS: Ms = 366 * 24 * HOUR_MS;

pub const HOUR_MS: Ms = 3_600_000;
/// Pickups further away than this get a reminder scheduled this long before pickup.
pub const REMINDER_LEAD_MS: Ms = 24 * HOUR_MS;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;
/// Attempts at locking a booking whose resources keep changing underneath us.
pub const MAX_LOCK_RETRIES: usize = 4;

/// Balances within this much of the recomputed value are considered consistent.
pub const BALANCE_TOLERANCE: Decimal = dec!(0.01);
pub const MAX_AMOUNT: Decimal = dec!(100000000);
