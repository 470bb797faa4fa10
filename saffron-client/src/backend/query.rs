//! Row filters shared by both backends
//!
//! A [`Query`] renders to PostgREST query parameters for the hosted backend
//! and evaluates directly against JSON rows for the memory backend, so both
//! see the same filter semantics.

use serde_json::Value;
use std::cmp::Ordering;

/// Single column predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    /// Case-insensitive LIKE; `%` matches any run, `_` one character
    ILike(String, String),
    /// Any of the nested filters
    Or(Vec<Filter>),
}

impl Filter {
    /// `column ILIKE %text%`, with LIKE and PostgREST reserved characters removed
    pub fn ilike_contains(column: impl Into<String>, text: &str) -> Self {
        let cleaned: String = text
            .chars()
            .filter(|c| !matches!(c, '%' | '_' | ',' | '(' | ')' | '"' | '\\'))
            .collect();
        Filter::ILike(column.into(), format!("%{}%", cleaned.trim()))
    }

    /// `column.op.value` form used inside `or=(...)`
    fn render_inner(&self) -> String {
        let (column, op, value) = self.render_parts();
        format!("{column}.{op}.{value}")
    }

    fn render_parts(&self) -> (String, &'static str, String) {
        match self {
            Filter::Eq(c, Value::Null) => (c.clone(), "is", "null".into()),
            Filter::Eq(c, v) => (c.clone(), "eq", render_value(v)),
            Filter::Neq(c, Value::Null) => (c.clone(), "not.is", "null".into()),
            Filter::Neq(c, v) => (c.clone(), "neq", render_value(v)),
            Filter::Gte(c, v) => (c.clone(), "gte", render_value(v)),
            Filter::Lte(c, v) => (c.clone(), "lte", render_value(v)),
            Filter::In(c, values) => {
                let list: Vec<String> = values.iter().map(render_list_item).collect();
                (c.clone(), "in", format!("({})", list.join(",")))
            }
            Filter::ILike(c, pattern) => (c.clone(), "ilike", pattern.replace('%', "*")),
            Filter::Or(filters) => {
                let inner: Vec<String> = filters.iter().map(Filter::render_inner).collect();
                ("or".into(), "", format!("({})", inner.join(",")))
            }
        }
    }

    /// PostgREST `(key, value)` query parameter
    pub fn to_param(&self) -> (String, String) {
        let (column, op, value) = self.render_parts();
        if op.is_empty() {
            (column, value)
        } else {
            (column, format!("{op}.{value}"))
        }
    }

    /// Evaluate against a JSON row; a missing column reads as null
    pub fn matches(&self, row: &Value) -> bool {
        let col = |c: &str| row.get(c).unwrap_or(&Value::Null);
        match self {
            Filter::Eq(c, v) => values_equal(col(c), v),
            Filter::Neq(c, v) => !values_equal(col(c), v),
            Filter::Gte(c, v) => matches!(
                compare_values(col(c), v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lte(c, v) => matches!(
                compare_values(col(c), v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In(c, values) => values.iter().any(|v| values_equal(col(c), v)),
            Filter::ILike(c, pattern) => match col(c) {
                Value::String(s) => like_match(pattern, s),
                _ => false,
            },
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Select / update / delete scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column list for the select (`*` when unset)
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(column.into(), value.into()))
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Neq(column.into(), value.into()))
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Gte(column.into(), value.into()))
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Lte(column.into(), value.into()))
    }

    pub fn is_in<V: Into<Value>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(Filter::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn or(self, filters: Vec<Filter>) -> Self {
        self.filter(Filter::Or(filters))
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// PostgREST query parameters for a read
    pub fn to_select_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(self.to_filter_params());
        if !self.order.is_empty() {
            let order: Vec<String> = self
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect();
            params.push(("order".to_string(), order.join(",")));
        }
        if let Some(n) = self.limit {
            params.push(("limit".to_string(), n.to_string()));
        }
        params
    }

    /// PostgREST query parameters for the row scope of a write
    pub fn to_filter_params(&self) -> Vec<(String, String)> {
        self.filters.iter().map(Filter::to_param).collect()
    }

    /// All filters hold for the row
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Filter, sort and limit rows in memory
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut out: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).cloned().collect();
        if !self.order.is_empty() {
            out.sort_by(|a, b| {
                for key in &self.order {
                    let ord = sort_cmp(
                        a.get(&key.column).unwrap_or(&Value::Null),
                        b.get(&key.column).unwrap_or(&Value::Null),
                    );
                    let ord = if key.ascending { ord } else { ord.reverse() };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_list_item(v: &Value) -> String {
    match v {
        Value::String(s) if s.contains([',', '(', ')', '"', '.', ':']) => {
            format!("\"{}\"", s.replace('"', "\\\""))
        }
        other => render_value(other),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting; nulls sort after values
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

fn like_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[char], s: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => (0..=s.len()).any(|i| go(rest, &s[i..])),
            Some(('_', rest)) => !s.is_empty() && go(rest, &s[1..]),
            Some((c, rest)) => s.first() == Some(c) && go(rest, &s[1..]),
        }
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let s: Vec<char> = text.to_lowercase().chars().collect();
    go(&p, &s)
}
