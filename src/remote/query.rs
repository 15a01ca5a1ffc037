//! Row filters and query shape shared by every backend.
//!
//! Filters are evaluated locally by the in-process backend and rendered to
//! PostgREST query parameters by the REST client.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over a single row.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    Eq(String, Value),
    Neq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Neq(column.to_string(), value.into())
    }

    pub fn in_list<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::Or(mut left), f) => {
                left.push(f);
                Filter::Or(left)
            }
            (left, right) => Filter::Or(vec![left, right]),
        }
    }

    /// Both directed rows of an unordered pair: `(a, b)` or `(b, a)`.
    pub fn pair(
        left_column: &str,
        right_column: &str,
        a: impl Into<Value>,
        b: impl Into<Value>,
    ) -> Self {
        let a = a.into();
        let b = b.into();
        Filter::eq(left_column, a.clone())
            .and(Filter::eq(right_column, b.clone()))
            .or(Filter::eq(left_column, b).and(Filter::eq(right_column, a)))
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => field(row, column) == value,
            Filter::Neq(column, value) => field(row, column) != value,
            Filter::In(column, values) => {
                let actual = field(row, column);
                values.iter().any(|v| v == actual)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }
}

fn field<'a>(row: &'a Value, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Select shape: projected columns, filter, ordering and row limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub columns: String,
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            columns: "*".to_string(),
            filter: Filter::All,
            order: None,
            limit: None,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = self.filter.and(filter);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort, truncate and project rows already known to match the filter.
    pub fn shape(&self, mut rows: Vec<Value>) -> Vec<Value> {
        if let Some(order) = &self.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(field(a, &order.column), field(b, &order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        if self.columns.trim() == "*" {
            return rows;
        }

        let columns: Vec<&str> = self.columns.split(',').map(str::trim).collect();
        rows.into_iter()
            .map(|row| {
                let projected = columns
                    .iter()
                    .filter_map(|c| row.get(*c).map(|v| (c.to_string(), v.clone())))
                    .collect();
                Value::Object(projected)
            })
            .collect()
    }
}

/// Ordering used for `order_by`: nulls first, timestamps chronologically,
/// numbers numerically, everything else by its JSON text.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x).map(|d| d.with_timezone(&Utc)),
                DateTime::parse_from_rfc3339(y).map(|d| d.with_timezone(&Utc)),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}
