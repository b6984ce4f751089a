//! Conjunctive row filters and ordering, the query vocabulary understood by
//! every `RelationalStore` implementation.

use std::cmp::Ordering;

use errand_core::row::Row;
use serde_json::Value;

#[derive(Clone, Debug)]
enum Cond {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
}

/// A conjunction of column conditions.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    conds: Vec<Cond>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conds.push(Cond::Eq(column.into(), value.into()));
        self
    }

    pub fn is_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.conds.push(Cond::In(column.into(), values));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.conds.push(Cond::IsNull(column.into()));
        self
    }

    pub fn not_null(mut self, column: impl Into<String>) -> Self {
        self.conds.push(Cond::NotNull(column.into()));
        self
    }

    /// Merge another filter's conditions into this one.
    pub fn and(mut self, other: Filter) -> Self {
        self.conds.extend(other.conds);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conds.iter().all(|cond| match cond {
            Cond::Eq(col, value) => row.get(col).is_some_and(|v| v == value),
            Cond::In(col, values) => row.get(col).is_some_and(|v| values.contains(v)),
            Cond::IsNull(col) => matches!(row.get(col), None | Some(Value::Null)),
            Cond::NotNull(col) => {
                !matches!(row.get(col), None | Some(Value::Null))
            }
        })
    }
}

/// Single-column sort order.
#[derive(Clone, Debug)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// Stable sort, so equal keys keep their row order (the tie-break rule
    /// for equal `proposed_at` timestamps).
    pub fn apply(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| {
            let ord = cmp_values(a.get(&self.column), b.get(&self.column));
            if self.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }
}

fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}
