//! Core types for PocketBase records.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::records::{
    COMMENTS_COLLECTION, NOTEBOOKS_COLLECTION, PLAYGROUNDS_COLLECTION, SCRATCHPADS_COLLECTION,
    THREADS_COLLECTION, USERS_COLLECTION,
};

/// Datetime layout used by PocketBase (`2024-01-15 10:30:00.123Z`).
pub const PB_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3fZ";

/// Format a timestamp the way PocketBase stores it.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format(PB_DATETIME_FORMAT).to_string()
}

/// Parse a PocketBase timestamp. Also accepts RFC 3339.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.fZ")
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// Serde adapter for PocketBase datetime fields, where unset values are `""`.
pub mod pb_datetime {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&format_datetime(dt)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => parse_datetime(s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime: {}", s))),
        }
    }
}

/// A record type stored in a named collection.
pub trait CollectionRecord:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Collection name the record lives in.
    const COLLECTION: &'static str;

    /// Stable record identifier.
    fn id(&self) -> &str;
}

/// Fields present on every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemFields {
    pub id: String,
    #[serde(default, with = "pb_datetime")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, with = "pb_datetime")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collection_id: String,
    #[serde(default)]
    pub collection_name: String,
}

impl SystemFields {
    /// System fields for a record that only has an id (useful in tests and
    /// optimistic inserts).
    pub fn with_id(id: impl Into<String>, collection: &str) -> Self {
        Self {
            id: id.into(),
            collection_name: collection.to_string(),
            ..Self::default()
        }
    }
}

/// Author relation expansion shared by threads and comments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorExpand {
    #[serde(default)]
    pub author: Option<User>,
}

/// A discussion thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<AuthorExpand>,
}

/// A comment on a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thread: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<AuthorExpand>,
}

impl Comment {
    /// Build a comment value, mostly for tests and optimistic inserts.
    pub fn new(id: impl Into<String>, thread: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            system: SystemFields::with_id(id, COMMENTS_COLLECTION),
            attachments: Vec::new(),
            author: String::new(),
            content: content.into(),
            thread: thread.into(),
            expand: None,
        }
    }

    /// Name of the author, if the relation was expanded.
    pub fn author_name(&self) -> Option<&str> {
        let user = self.expand.as_ref()?.author.as_ref()?;
        user.display_name()
    }
}

/// A user's personal notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub author: String,
    /// Rich-text HTML content.
    #[serde(default)]
    pub content: String,
}

/// A shared code playground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playground {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub contents: serde_json::Value,
    #[serde(default)]
    pub notebook: String,
    #[serde(default)]
    pub share_link: String,
    #[serde(default)]
    pub thread: String,
}

/// A scratchpad attached to a thread or notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scratchpad {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub notebook: String,
    #[serde(default)]
    pub thread: String,
}

/// An auth record from the users collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_visibility: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub name: String,
}

impl User {
    /// Display name, falling back to the username.
    pub fn display_name(&self) -> Option<&str> {
        [self.name.as_str(), self.username.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
    }
}

macro_rules! impl_collection_record {
    ($($ty:ty => $collection:expr;)*) => {
        $(
            impl CollectionRecord for $ty {
                const COLLECTION: &'static str = $collection;

                fn id(&self) -> &str {
                    &self.system.id
                }
            }
        )*
    };
}

impl_collection_record! {
    Thread => THREADS_COLLECTION;
    Comment => COMMENTS_COLLECTION;
    Notebook => NOTEBOOKS_COLLECTION;
    Playground => PLAYGROUNDS_COLLECTION;
    Scratchpad => SCRATCHPADS_COLLECTION;
    User => USERS_COLLECTION;
}

/// Values for creating or patching a thread. Unset fields are omitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

/// Values for creating or patching a comment. Unset fields are omitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommentValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

/// Values for creating or patching a notebook. Unset fields are omitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotebookValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult<T> {
    pub page: u32,
    pub per_page: u32,
    /// Total matching records on the server; `-1` when the total was skipped.
    pub total_items: i64,
    pub total_pages: i64,
    pub items: Vec<T>,
}

impl<T> ListResult<T> {
    /// A single page holding exactly `items`.
    pub fn single_page(items: Vec<T>) -> Self {
        let total = items.len() as i64;
        Self {
            page: 1,
            per_page: items.len().max(1) as u32,
            total_items: total,
            total_pages: 1,
            items,
        }
    }
}

/// Query options for list requests and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    /// Options that apply to a realtime subscription (sort is meaningless there).
    pub fn for_subscription(&self) -> SubscribeOptions {
        SubscribeOptions {
            filter: self.filter.clone(),
            expand: self.expand.clone(),
        }
    }
}

/// Options for single-record requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand: Option<String>,
}

/// Query options attached to a realtime subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand: Option<String>,
}

impl SubscribeOptions {
    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.expand.is_none()
    }
}

/// Kind of change carried by a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

/// A realtime change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent<T> {
    pub action: RecordAction,
    pub record: T,
}

impl<T> RecordEvent<T> {
    pub fn create(record: T) -> Self {
        Self {
            action: RecordAction::Create,
            record,
        }
    }

    pub fn update(record: T) -> Self {
        Self {
            action: RecordAction::Update,
            record,
        }
    }

    pub fn delete(record: T) -> Self {
        Self {
            action: RecordAction::Delete,
            record,
        }
    }
}
