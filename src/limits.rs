//! Hard caps protecting the engine from unbounded input.

pub const MAX_ORGANIZERS_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_ORGANIZER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
/// RFC 5321 path limit.
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_TIMEZONE_LEN: usize = 64;
pub const MAX_BLACKOUT_DATES: usize = 1_000;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PAGE_SIZE: usize = 1_000;

/// Upper bound on meeting durations and buffers, in minutes.
pub const MINUTES_PER_DAY: u32 = 1_440;

/// Bookings must start within [2000-01-01, 2200-01-01) UTC.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;
