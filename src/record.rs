use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;

/// An event record: a dynamically-typed nested mapping. The engine treats
/// records as opaque except through the dotted-path accessors below.
pub type Record = serde_json::Map<String, Value>;

/// Prefix marking a value that is resolved from the record at evaluation
/// time: `_$a.b` means "the string view of field `a.b`".
pub const FIELD_REF_PREFIX: &str = "_$";

/// Reserved token for "the whole working record" in plugin arguments, and as
/// an append target meaning "replace the working record".
pub const RAW_DATA_TOKEN: &str = "_$ORIDATA";

/// Resolve a dotted path to the typed value it points at. Integer-looking
/// segments index lists; every other segment is a map key.
pub fn lookup_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = record.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dotted path to its string view. Missing paths yield
/// `("", false)`; non-string terminals are canonically stringified.
pub fn lookup_string(record: &Record, path: &str) -> (String, bool) {
    match lookup_value(record, path) {
        Some(value) => (canonical_string(value), true),
        None => (String::new(), false),
    }
}

/// Canonical stringification: strings pass through, numbers render in their
/// shortest round-trip form, booleans as `true`/`false`, null as the empty
/// string, lists and maps as JSON.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write a top-level field on the record (append target).
pub fn set_field(record: &mut Record, name: &str, value: Value) {
    record.insert(name.to_string(), value);
}

/// Unset a dotted path from the record. Intermediate maps and lists are
/// descended; a missing segment makes the delete a no-op.
pub fn delete_field(record: &mut Record, path: &str) {
    if path.is_empty() {
        return;
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() == 1 {
        record.remove(segments[0]);
        return;
    }

    let Some(first) = record.get_mut(segments[0]) else {
        return;
    };
    let mut current = first;
    for segment in &segments[1..segments.len() - 1] {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return,
            },
            Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return;
                };
                match items.get_mut(index) {
                    Some(next) => next,
                    None => return,
                }
            }
            _ => return,
        };
    }

    let last = segments[segments.len() - 1];
    match current {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

/// Per-record memo of string lookups, keyed by the raw syntactic form of the
/// reference (a `_$`-prefixed needle and the bare field path cache
/// separately). Acquired from the pool before a record is evaluated and
/// returned afterwards; cleared on acquisition.
#[derive(Debug, Default)]
pub struct FieldCache {
    entries: HashMap<String, (String, bool)>,
}

impl FieldCache {
    pub fn new() -> Self {
        FieldCache::default()
    }

    /// String view of a reference against `record`. The `_$` prefix is
    /// stripped for resolution but kept in the cache key.
    pub fn lookup(&mut self, record: &Record, raw_ref: &str) -> (String, bool) {
        if let Some(cached) = self.entries.get(raw_ref) {
            return cached.clone();
        }
        let path = raw_ref.strip_prefix(FIELD_REF_PREFIX).unwrap_or(raw_ref);
        let resolved = lookup_string(record, path);
        self.entries.insert(raw_ref.to_string(), resolved.clone());
        resolved
    }

    /// Drop memoised entries whose value may have changed after a record
    /// mutation (append/del/plugin rewrites).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static FIELD_CACHE_POOL: Lazy<Mutex<Vec<FieldCache>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Take a cleared cache from the pool, or allocate a fresh one.
pub fn acquire_field_cache() -> FieldCache {
    let mut pool = FIELD_CACHE_POOL.lock();
    match pool.pop() {
        Some(mut cache) => {
            cache.clear();
            cache
        }
        None => FieldCache::new(),
    }
}

/// Return a cache to the pool for reuse by the next record.
pub fn release_field_cache(cache: FieldCache) {
    let mut pool = FIELD_CACHE_POOL.lock();
    if pool.len() < 1024 {
        pool.push(cache);
    }
}
