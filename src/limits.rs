use crate::model::Ms;

/// Max slots the store will hold.
pub const MAX_SLOTS: usize = 100_000;

/// Max spans accepted by one `insert_intervals` call.
pub const MAX_BATCH_SIZE: usize = 2_000;

/// Longest accepted slot (one day).
pub const MAX_SLOT_DURATION_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_REFERENCE_LEN: usize = 128;

pub const MAX_METADATA_LEN: usize = 16 * 1024;

pub const MAX_TOKEN_LEN: usize = 128;

/// Webhook bodies above this are refused unless configured otherwise.
pub const DEFAULT_WEBHOOK_PAYLOAD_LIMIT: usize = 100 * 1024;
