use crate::model::Ms;

// Per-tenant structure
pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_HIERARCHY_DEPTH: usize = 32;

// Per-resource
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_QUANTITY: u32 = 1_000_000;

// Time bounds (unix ms). Upper bound is the end of year 9999.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;

// Orders
pub const MAX_ORDER_ITEMS: usize = 64;
pub const MAX_REASON_LEN: usize = 512;

/// Cap on remembered cancel-before-reserve tombstones per tenant.
pub const MAX_VOIDED_INTENTS: usize = 100_000;
