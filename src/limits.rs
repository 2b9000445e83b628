use crate::model::Ms;

pub const MAX_DOCTORS: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 4096;

/// One appointment may not run longer than a day.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z .. 2200-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
