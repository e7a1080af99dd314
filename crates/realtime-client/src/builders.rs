//! Pre-filled configurations for common subscription patterns

use std::fmt::Display;

use realtime_common::{EventFilter, RowFilter};

use crate::subscription::SubscriptionConfig;

/// Every change on a table
pub fn table(table: impl Into<String>) -> SubscriptionConfig {
    SubscriptionConfig::new(table, EventFilter::All)
}

/// Changes to rows whose `column` equals `owner`, e.g. a user's orders
pub fn owned_by(
    table: impl Into<String>,
    column: impl Into<String>,
    owner: impl Display,
) -> SubscriptionConfig {
    SubscriptionConfig::new(table, EventFilter::All).row_filter(&RowFilter::eq(column, owner))
}

/// Changes to a single row identified by its `id` column
pub fn row(table: impl Into<String>, id: impl Display) -> SubscriptionConfig {
    owned_by(table, "id", id)
}

/// New rows only
pub fn inserts(table: impl Into<String>) -> SubscriptionConfig {
    SubscriptionConfig::new(table, EventFilter::Insert)
}
