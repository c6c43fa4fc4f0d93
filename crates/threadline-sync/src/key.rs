//! Deterministic cache keys.
//!
//! A key has the shape `{collection}/{method}:{params}` where `params` is the
//! canonical JSON encoding of the call parameters: object keys are sorted at
//! every depth, so two parameter sets that differ only in insertion order
//! produce the same key.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::SyncError;

/// Remote read method a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    GetList,
    GetFullList,
    GetOne,
    GetFirstListItem,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::GetList => "get_list",
            QueryMethod::GetFullList => "get_full_list",
            QueryMethod::GetOne => "get_one",
            QueryMethod::GetFirstListItem => "get_first_list_item",
        }
    }
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `method` on `collection` with `params`.
    pub fn new(
        collection: &str,
        method: QueryMethod,
        params: &impl Serialize,
    ) -> Result<Self, SyncError> {
        let value =
            serde_json::to_value(params).map_err(|e| SyncError::InvalidKey(e.to_string()))?;
        let mut key = format!("{}/{}:", collection, method);
        write_canonical(&value, &mut key);
        Ok(Self(key))
    }

    /// Prefix matching every key for `collection`.
    pub fn collection_prefix(collection: &str) -> String {
        format!("{}/", collection)
    }

    /// Prefix matching every key for `method` on `collection`.
    pub fn method_prefix(collection: &str, method: QueryMethod) -> String {
        format!("{}/{}:", collection, method)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use threadline_pb::ListOptions;

    #[test]
    fn test_list_key_format() {
        let options = ListOptions::new().filter("thread = 't1'");
        let key = CacheKey::new("comments", QueryMethod::GetList, &(1, 50, &options)).unwrap();
        assert_eq!(key.as_str(), r#"comments/get_list:[1,50,{"filter":"thread = 't1'"}]"#);
    }

    #[test]
    fn test_nested_keys_sorted() {
        let params = serde_json::json!({"b": {"z": 1, "a": [{"y": 2, "x": 1}]}, "a": null});
        let key = CacheKey::new("threads", QueryMethod::GetOne, &params).unwrap();
        assert_eq!(
            key.as_str(),
            r#"threads/get_one:{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_insertion_order_is_irrelevant() {
        let mut first = HashMap::new();
        first.insert("filter", "resolved = false");
        first.insert("sort", "-created");
        first.insert("expand", "author");

        let mut second = HashMap::new();
        second.insert("expand", "author");
        second.insert("sort", "-created");
        second.insert("filter", "resolved = false");

        assert_eq!(
            CacheKey::new("threads", QueryMethod::GetList, &first).unwrap(),
            CacheKey::new("threads", QueryMethod::GetList, &second).unwrap()
        );
    }

    #[test]
    fn test_prefixes() {
        let key = CacheKey::new("comments", QueryMethod::GetFirstListItem, &"x").unwrap();
        assert!(key.as_str().starts_with(&CacheKey::collection_prefix("comments")));
        assert!(
            key.as_str()
                .starts_with(&CacheKey::method_prefix("comments", QueryMethod::GetFirstListItem))
        );
        assert!(
            !key.as_str()
                .starts_with(&CacheKey::method_prefix("comments", QueryMethod::GetList))
        );
    }
}
