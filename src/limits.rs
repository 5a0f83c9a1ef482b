//! Hard input limits, checked before any store access.

/// Products a single request may ask for.
pub const MAX_PRODUCTS_PER_REQUEST: usize = 32;

/// Length of a language, rating or product name.
pub const MAX_CRITERION_LEN: usize = 64;

/// Languages, products or ratings a manager may list.
pub const MAX_TAGS_PER_MANAGER: usize = 64;

/// Matches the `sales_managers.name` column width.
pub const MAX_NAME_LEN: usize = 250;

/// Rows in a single multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Valid timestamp range: 1970-01-01 to 2100-01-01.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;
