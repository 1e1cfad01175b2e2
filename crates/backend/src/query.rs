//! Backend-neutral description of a relational read/write target.
//!
//! A [`Query`] names a table plus filters, ordering and an optional row
//! window. The hosted client renders it in the PostgREST dialect; the SQLite
//! stand-in renders it as SQL.

use serde_json::Value;

use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    IsNull(String),
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn neq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Neq(column.into(), value.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull(column.into())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    /// Evaluates the filter against a JSON row. Missing columns read as null.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(column, expected) => loosely_equal(column_value(row, column), expected),
            Filter::Neq(column, expected) => {
                let actual = column_value(row, column);
                !actual.is_null() && !loosely_equal(actual, expected)
            }
            Filter::IsNull(column) => column_value(row, column).is_null(),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }

    /// Renders the filter as a top-level PostgREST query parameter.
    pub fn to_postgrest_param(&self) -> BackendResult<(String, String)> {
        match self {
            Filter::Eq(column, value) => Ok((column.clone(), format!("eq.{}", render_value(value)))),
            Filter::Neq(column, value) => {
                Ok((column.clone(), format!("neq.{}", render_value(value))))
            }
            Filter::IsNull(column) => Ok((column.clone(), "is.null".to_string())),
            Filter::Or(filters) => Ok(("or".to_string(), render_group(filters)?)),
            Filter::And(filters) => Ok(("and".to_string(), render_group(filters)?)),
        }
    }

    /// Realtime bindings accept a single `column=eq.value` expression.
    pub fn to_realtime_filter(&self) -> BackendResult<String> {
        match self {
            Filter::Eq(column, value) => Ok(format!("{column}=eq.{}", render_value(value))),
            Filter::Neq(column, value) => Ok(format!("{column}=neq.{}", render_value(value))),
            other => Err(BackendError::InvalidQuery(format!(
                "realtime filters support a single comparison, got {other:?}"
            ))),
        }
    }

    fn render_nested(&self) -> BackendResult<String> {
        match self {
            Filter::Eq(column, value) => Ok(format!("{column}.eq.{}", quote_nested(value))),
            Filter::Neq(column, value) => Ok(format!("{column}.neq.{}", quote_nested(value))),
            Filter::IsNull(column) => Ok(format!("{column}.is.null")),
            Filter::Or(filters) => Ok(format!("or{}", render_group(filters)?)),
            Filter::And(filters) => Ok(format!("and{}", render_group(filters)?)),
        }
    }
}

fn render_group(filters: &[Filter]) -> BackendResult<String> {
    if filters.is_empty() {
        return Err(BackendError::InvalidQuery(
            "logical filter group must not be empty".into(),
        ));
    }
    let parts = filters
        .iter()
        .map(Filter::render_nested)
        .collect::<BackendResult<Vec<_>>>()?;
    Ok(format!("({})", parts.join(",")))
}

fn column_value<'a>(row: &'a Value, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), other) | (other, Value::String(a)) if !other.is_string() => {
            *a == render_value(other)
        }
        _ => false,
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn quote_nested(value: &Value) -> String {
    let raw = render_value(value);
    if raw.contains([',', '(', ')', '"', ':']) {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn to_postgrest(&self) -> String {
        format!(
            "{}.{}.nullslast",
            self.column,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Orders with nulls last, the PostgREST default for descending order is
    /// nulls first so it is always spelled out.
    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    /// Inclusive row window, `range(0, 49)` is the first fifty rows.
    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from).saturating_add(1));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_postgrest_params(&self) -> BackendResult<Vec<(String, String)>> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for filter in &self.filters {
            params.push(filter.to_postgrest_param()?);
        }
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(Order::to_postgrest)
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        Ok(params)
    }
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
