//! Safe filter expression rendering.
//!
//! Filter templates use `{:name}` placeholders that are replaced with
//! properly quoted literals, so user-supplied values can never break out of
//! a string literal:
//!
//! ```
//! use threadline_pb::Filter;
//!
//! let filter = Filter::new("thread = {:threadId} && resolved = {:resolved}")
//!     .bind("threadId", "t1")
//!     .bind("resolved", false)
//!     .render();
//! assert_eq!(filter, "thread = 't1' && resolved = false");
//! ```

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

use crate::types::format_datetime;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{:(\w+)\}").expect("placeholder pattern is valid"));

/// A value bound to a filter placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FilterValue {
    /// Render the value as a filter literal.
    pub fn to_literal(&self) -> String {
        match self {
            FilterValue::Str(s) => quote(s),
            FilterValue::Int(n) => n.to_string(),
            FilterValue::Float(n) => n.to_string(),
            FilterValue::Bool(b) => b.to_string(),
            FilterValue::Null => "null".to_string(),
            FilterValue::DateTime(dt) => quote(&format_datetime(dt)),
            FilterValue::Json(value) => quote(&value.to_string()),
        }
    }
}

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "\\'"))
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Str(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Str(v)
    }
}

impl From<&String> for FilterValue {
    fn from(v: &String) -> Self {
        FilterValue::Str(v.clone())
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        FilterValue::Int(v.into())
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        FilterValue::Float(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(v: DateTime<Utc>) -> Self {
        FilterValue::DateTime(v)
    }
}

impl From<serde_json::Value> for FilterValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => FilterValue::Null,
            serde_json::Value::Bool(b) => FilterValue::Bool(b),
            serde_json::Value::String(s) => FilterValue::Str(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FilterValue::Int(i),
                None => FilterValue::Float(n.as_f64().unwrap_or_default()),
            },
            other => FilterValue::Json(other),
        }
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FilterValue::Null)
    }
}

/// A filter template with bound parameters.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    template: String,
    params: HashMap<String, FilterValue>,
}

impl Filter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            params: HashMap::new(),
        }
    }

    /// Bind a value to `{:name}`.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Render the template. Placeholders without a bound value are left as-is.
    ///
    /// Substitution happens in a single pass, so bound values that themselves
    /// contain `{:name}` are never expanded again.
    pub fn render(&self) -> String {
        PLACEHOLDER
            .replace_all(&self.template, |caps: &Captures<'_>| {
                match self.params.get(&caps[1]) {
                    Some(value) => value.to_literal(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.render()
    }
}
