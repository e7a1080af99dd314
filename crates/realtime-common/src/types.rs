//! Change events and subscription filters

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Change Events
// ============================================================================

/// Operation kind of a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A table change event. Row images are opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event ID
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Type of change
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Schema name
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table name
    pub table: String,
    /// Timestamp of the change
    #[serde(default = "Utc::now")]
    pub commit_timestamp: DateTime<Utc>,
    /// New record (for INSERT and UPDATE)
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    /// Old record (for UPDATE and DELETE)
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(schema: &str, table: &str, new_record: serde_json::Value) -> Self {
        Self::build(EventKind::Insert, schema, table, Some(new_record), None)
    }

    /// Create an UPDATE event
    pub fn update(
        schema: &str,
        table: &str,
        old_record: serde_json::Value,
        new_record: serde_json::Value,
    ) -> Self {
        Self::build(
            EventKind::Update,
            schema,
            table,
            Some(new_record),
            Some(old_record),
        )
    }

    /// Create a DELETE event
    pub fn delete(schema: &str, table: &str, old_record: serde_json::Value) -> Self {
        Self::build(EventKind::Delete, schema, table, None, Some(old_record))
    }

    fn build(
        kind: EventKind,
        schema: &str,
        table: &str,
        new: Option<serde_json::Value>,
        old: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            schema: schema.to_string(),
            table: table.to_string(),
            commit_timestamp: Utc::now(),
            new,
            old,
        }
    }

    /// The row image a filter applies to: `new` for inserts and updates, `old` for deletes
    pub fn record(&self) -> Option<&serde_json::Value> {
        match self.kind {
            EventKind::Insert | EventKind::Update => self.new.as_ref().or(self.old.as_ref()),
            EventKind::Delete => self.old.as_ref(),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Which event kinds a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    #[default]
    #[serde(rename = "*")]
    All,
}

impl EventFilter {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Insert => kind == EventKind::Insert,
            Self::Update => kind == EventKind::Update,
            Self::Delete => kind == EventKind::Delete,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::All => write!(f, "*"),
        }
    }
}

/// Comparison operator of a row filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            other => Err(Error::InvalidFilter(format!("unknown operator '{}'", other))),
        }
    }
}

/// Row filter in postgres-changes syntax: `column=op.value`
///
/// `in` takes a parenthesised list: `status=in.(open,pending)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl RowFilter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column=eq.value`
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::new(column, FilterOp::Eq, value.to_string())
    }

    /// Parse a filter expression
    ///
    /// A bare `column=value` without a recognised operator prefix means `eq`.
    pub fn parse(expr: &str) -> Result<Self> {
        let (column, rest) = expr
            .split_once('=')
            .ok_or_else(|| Error::InvalidFilter(format!("missing '=' in '{}'", expr)))?;

        let column = column.trim();
        if column.is_empty() {
            return Err(Error::InvalidFilter(format!("empty column in '{}'", expr)));
        }

        let (op, value) = rest
            .split_once('.')
            .and_then(|(op, value)| op.trim().parse::<FilterOp>().ok().map(|op| (op, value)))
            .unwrap_or((FilterOp::Eq, rest));
        if value.is_empty() {
            return Err(Error::InvalidFilter(format!("empty value in '{}'", expr)));
        }
        if op == FilterOp::In && !(value.starts_with('(') && value.ends_with(')')) {
            return Err(Error::InvalidFilter(format!(
                "'in' expects a parenthesised list in '{}'",
                expr
            )));
        }

        Ok(Self::new(column, op, value))
    }

    /// Evaluate against a row image
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };
        let actual = scalar_text(field);

        match self.op {
            FilterOp::Eq => same_value(&actual, &self.value),
            FilterOp::Neq => !same_value(&actual, &self.value),
            FilterOp::In => self
                .value
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .any(|candidate| same_value(&actual, candidate.trim())),
            FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
                let ordering = match (actual.parse::<f64>(), self.value.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(actual.as_str().cmp(self.value.as_str())),
                };
                match (self.op, ordering) {
                    (_, None) => false,
                    (FilterOp::Lt, Some(o)) => o.is_lt(),
                    (FilterOp::Lte, Some(o)) => o.is_le(),
                    (FilterOp::Gt, Some(o)) => o.is_gt(),
                    (_, Some(o)) => o.is_ge(),
                }
            }
        }
    }
}

/// Numeric when both sides parse as numbers, so `42.0` equals `42`
fn same_value(actual: &str, expected: &str) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => actual == expected,
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

impl FromStr for RowFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
