//! Per-table sensitive-field declarations.
//!
//! Fixed at build time and identical on every device; the server never sees
//! these field names in plaintext. A mismatch between encrypting and
//! decrypting parties is a deployment bug, not a runtime condition, which is
//! why this is a static table rather than configuration data.

/// Tables participating in sync.
pub const SYNC_TABLES: &[&str] = &[
    "transactions",
    "accounts",
    "holdings",
    "assets",
    "liabilities",
];

/// Sensitive fields for a table, or `None` for an unknown table.
///
/// Everything not listed here stays plaintext so the server can filter on it
/// (dates, categories, foreign keys). `id` is never sensitive.
pub fn sensitive_fields(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "transactions" => Some(&["merchant", "notes", "amount"]),
        "accounts" => Some(&["name", "institution", "balance"]),
        "holdings" => Some(&["quantity", "average_cost", "notes"]),
        "assets" => Some(&["name", "value", "notes"]),
        "liabilities" => Some(&["name", "balance", "notes"]),
        _ => None,
    }
}

/// Whether a table participates in sync at all.
pub fn is_sync_table(table: &str) -> bool {
    sensitive_fields(table).is_some()
}
