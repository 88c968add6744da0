//! crates/verse_study_core/src/store.rs
//!
//! The vocabulary shared by every `DocumentStore` implementation: hierarchical
//! paths, query descriptors, documents and the write helpers (merge and
//! server-timestamp resolution) that give all stores the same semantics.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::ports::{PortError, PortResult};

/// Placeholder key recognised by `resolve_server_timestamps`.
const SERVER_TIMESTAMP_KEY: &str = "__serverTimestamp";

//=========================================================================================
// Paths
//=========================================================================================

/// A collection path such as `verses` or `users/{uid}/userVerses`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: impl Into<String>) -> DocPath {
        DocPath {
            collection: self.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single document reference: a collection plus a document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    collection: CollectionPath,
    id: String,
}

impl DocPath {
    /// Parses `a/b/c/d` style paths. The last segment is the document id.
    pub fn parse(path: &str) -> PortResult<Self> {
        let trimmed = path.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((collection, id)) if !collection.is_empty() && !id.is_empty() => {
                Ok(CollectionPath::new(collection).doc(id))
            }
            _ => Err(PortError::InvalidInput(format!(
                "'{}' is not a document path",
                path
            ))),
        }
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Well-known locations in the store.
pub mod paths {
    use super::{CollectionPath, DocPath};
    use uuid::Uuid;

    pub const VERSES: &str = "verses";
    pub const USERS: &str = "users";
    pub const USER_VERSES: &str = "userVerses";
    pub const DAILY_VERSES: &str = "dailyShlokas";

    pub fn verses() -> CollectionPath {
        CollectionPath::new(VERSES)
    }

    pub fn verse(fingerprint: &str) -> DocPath {
        verses().doc(fingerprint)
    }

    pub fn user_profile(uid: Uuid) -> DocPath {
        CollectionPath::new(USERS).doc(uid.to_string())
    }

    pub fn user_verses(uid: Uuid) -> CollectionPath {
        CollectionPath::new(format!("{}/{}/{}", USERS, uid, USER_VERSES))
    }

    pub fn user_verse(uid: Uuid, fingerprint: &str) -> DocPath {
        user_verses(uid).doc(fingerprint)
    }

    pub fn daily_verses() -> CollectionPath {
        CollectionPath::new(DAILY_VERSES)
    }
}

//=========================================================================================
// Queries
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = data.get(&self.field) else {
            return false;
        };
        match (self.op, compare_values(actual, &self.value)) {
            (FilterOp::Eq, Some(Ordering::Equal)) => true,
            (FilterOp::Lt, Some(Ordering::Less)) => true,
            (FilterOp::Le, Some(Ordering::Less | Ordering::Equal)) => true,
            (FilterOp::Gt, Some(Ordering::Greater)) => true,
            (FilterOp::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A query descriptor. Two descriptors with equal values describe the same
/// subscription, whatever their provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Applies filters, ordering and limit to an unordered set of documents.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|doc| doc.path.collection() == &self.collection)
            .filter(|doc| self.filters.iter().all(|f| f.matches(&doc.data)))
            .collect();

        if let Some(order) = &self.order_by {
            matched.sort_by(|a, b| {
                let ord = match (a.data.get(&order.field), b.data.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ord = match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                ord.then_with(|| a.path.id().cmp(b.path.id()))
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Orders two JSON scalars of the same kind. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

//=========================================================================================
// Documents and Writes
//=========================================================================================

/// A document as returned by reads and snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub data: Value,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Deserializes the document body into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> PortResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            PortError::Unexpected(format!("Malformed document {}: {}", self.path, e))
        })
    }
}

/// How a `set` combines the payload with an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Patch: object fields are merged recursively, other values overwrite.
    Merge,
    /// Replace the whole document body.
    Replace,
}

/// A sentinel value that the store replaces with its own clock at write time.
pub fn server_timestamp() -> Value {
    let mut marker = Map::new();
    marker.insert(SERVER_TIMESTAMP_KEY.to_string(), Value::Bool(true));
    Value::Object(marker)
}

/// Formats a timestamp the way stores persist it, so it sorts lexically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A store clock that never hands out the same instant twice, so timestamps
/// assigned by consecutive writes are strictly increasing once formatted.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = Utc::now().trunc_subsecs(6);
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

/// Replaces every `server_timestamp()` sentinel inside `data` with `now`.
pub fn resolve_server_timestamps(data: &mut Value, now: DateTime<Utc>) {
    match data {
        Value::Object(map) => {
            if map.len() == 1 && map.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)) {
                *data = Value::String(format_timestamp(now));
                return;
            }
            for value in map.values_mut() {
                resolve_server_timestamps(value, now);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_server_timestamps(item, now);
            }
        }
        _ => {}
    }
}

/// Combines `patch` into `existing` according to `mode`.
pub fn merge_into(existing: Option<Value>, patch: Value, mode: WriteMode) -> Value {
    match (mode, existing) {
        (WriteMode::Merge, Some(mut current)) => {
            deep_merge(&mut current, patch);
            current
        }
        (_, _) => patch,
    }
}

fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                let nested = value.is_object() && matches!(target_map.get(&key), Some(Value::Object(_)));
                if nested {
                    if let Some(slot) = target_map.get_mut(&key) {
                        deep_merge(slot, value);
                    }
                } else {
                    target_map.insert(key, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
