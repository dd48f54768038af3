//! ParamTable - named, typed parameter storage for one device port.
//!
//! A [`ParamTable`] is the key-value store behind every digitizer port. Each
//! parameter has a name, a fixed [`ParamKind`] and an optional value (a freshly
//! created parameter is *undefined* until somebody writes it).
//!
//! The table itself is not synchronized. It lives inside the port lock of the
//! owning device, so every read and write is serialized by that single
//! coarse-grained mutex.
//!
//! # Change Notification
//!
//! Setters only mark parameters dirty. Changes are pushed to subscribers in a
//! batch when [`ParamTable::publish`] is called, mirroring how a driver updates
//! several related values and then dispatches them together:
//!
//! ```rust,ignore
//! table.set_int(burst_id, 42);
//! table.set_float(time_read, 12.5);
//! table.publish(); // subscribers receive both updates
//! ```
//!
//! # Write Protection
//!
//! Parameters created with [`ParamTable::create_protected`] can only be changed
//! through the infallible setters (used by the framework and drivers). The
//! external entry point, [`ParamTable::write`], rejects them with
//! [`ParamError::WriteProtected`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config_param::ConfigRegistry;
use crate::error::ParamError;

/// Capacity of the change-notification broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Index of a parameter within its [`ParamTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub usize);

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Text,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKind::Int => write!(f, "int"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::Text => write!(f, "text"),
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i32),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }

    /// Equality used for change detection. NaN compares equal to NaN so that
    /// re-publishing an invalid float does not count as a change.
    fn same_as(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (ParamValue::Float(a), ParamValue::Float(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            _ => self == other,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A published parameter change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamUpdate {
    pub id: ParamId,
    pub name: String,
    /// `None` if the parameter became undefined.
    pub value: Option<ParamValue>,
}

#[derive(Debug)]
struct Entry {
    name: String,
    kind: ParamKind,
    value: Option<ParamValue>,
    protected: bool,
    dirty: bool,
}

/// Named parameter storage for a device port.
#[derive(Debug)]
pub struct ParamTable {
    entries: Vec<Entry>,
    by_name: HashMap<String, ParamId>,
    pub(crate) config: ConfigRegistry,
    updates: broadcast::Sender<ParamUpdate>,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamTable {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
            config: ConfigRegistry::default(),
            updates,
        }
    }

    /// Create an externally writable parameter.
    pub fn create(&mut self, name: &str, kind: ParamKind) -> Result<ParamId, ParamError> {
        self.insert(name, kind, false)
    }

    /// Create a parameter that external writers cannot change.
    pub fn create_protected(&mut self, name: &str, kind: ParamKind) -> Result<ParamId, ParamError> {
        self.insert(name, kind, true)
    }

    fn insert(&mut self, name: &str, kind: ParamKind, protected: bool) -> Result<ParamId, ParamError> {
        if self.by_name.contains_key(name) {
            return Err(ParamError::Duplicate(name.to_string()));
        }
        let id = ParamId(self.entries.len());
        self.entries.push(Entry {
            name: name.to_string(),
            kind,
            value: None,
            protected,
            dirty: false,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Mark an existing parameter as write-protected.
    pub fn protect(&mut self, id: ParamId) {
        self.entry_mut(id).protected = true;
    }

    pub fn find(&self, name: &str) -> Result<ParamId, ParamError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ParamError::UnknownName(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.entry(id).name
    }

    pub fn kind(&self, id: ParamId) -> ParamKind {
        self.entry(id).kind
    }

    pub fn is_protected(&self, id: ParamId) -> bool {
        self.entry(id).protected
    }

    /// Current value, `None` if undefined.
    pub fn value(&self, id: ParamId) -> Option<&ParamValue> {
        self.entry(id).value.as_ref()
    }

    pub fn get_int(&self, id: ParamId) -> Option<i32> {
        match self.typed(id, ParamKind::Int) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, id: ParamId) -> Option<f64> {
        match self.typed(id, ParamKind::Float) {
            Some(ParamValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_text(&self, id: ParamId) -> Option<&str> {
        match self.typed(id, ParamKind::Text) {
            Some(ParamValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn set_int(&mut self, id: ParamId, value: i32) {
        self.set_value(id, ParamValue::Int(value));
    }

    pub fn set_float(&mut self, id: ParamId, value: f64) {
        self.set_value(id, ParamValue::Float(value));
    }

    pub fn set_text(&mut self, id: ParamId, value: impl Into<String>) {
        self.set_value(id, ParamValue::Text(value.into()));
    }

    /// Store a value, bypassing write protection.
    ///
    /// # Panics
    ///
    /// Panics if the value kind does not match the parameter kind.
    pub fn set_value(&mut self, id: ParamId, value: ParamValue) {
        let entry = self.entry_mut(id);
        assert_eq!(
            entry.kind,
            value.kind(),
            "parameter '{}' has kind {}",
            entry.name,
            entry.kind
        );
        let changed = match &entry.value {
            Some(old) => !old.same_as(&value),
            None => true,
        };
        if changed {
            entry.value = Some(value);
            entry.dirty = true;
        }
    }

    /// External write entry point: checks write protection and kind.
    /// Fails with [`ParamError::TypeMismatch`] unless the parameter holds
    /// `requested` values. Use before the typed getters on client input.
    pub fn check_kind(&self, id: ParamId, requested: ParamKind) -> Result<(), ParamError> {
        let entry = self.entry(id);
        if entry.kind != requested {
            return Err(ParamError::TypeMismatch {
                name: entry.name.clone(),
                expected: entry.kind,
                actual: requested,
            });
        }
        Ok(())
    }

    pub fn write(&mut self, id: ParamId, value: ParamValue) -> Result<(), ParamError> {
        let entry = self.entry(id);
        if entry.protected {
            return Err(ParamError::WriteProtected(entry.name.clone()));
        }
        if entry.kind != value.kind() {
            return Err(ParamError::TypeMismatch {
                name: entry.name.clone(),
                expected: entry.kind,
                actual: value.kind(),
            });
        }
        self.set_value(id, value);
        Ok(())
    }

    /// Push all pending changes to subscribers. Returns how many parameters
    /// were published.
    pub fn publish(&mut self) -> usize {
        let mut count = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if !entry.dirty {
                continue;
            }
            entry.dirty = false;
            count += 1;
            // No receivers is not an error; updates are fire-and-forget.
            let _ = self.updates.send(ParamUpdate {
                id: ParamId(index),
                name: entry.name.clone(),
                value: entry.value.clone(),
            });
        }
        count
    }

    /// Subscribe to published parameter changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ParamUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of every parameter as `(name, value)` pairs, in creation order.
    pub fn dump(&self) -> Vec<(String, Option<ParamValue>)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    fn typed(&self, id: ParamId, kind: ParamKind) -> Option<&ParamValue> {
        let entry = self.entry(id);
        assert_eq!(
            entry.kind, kind,
            "parameter '{}' has kind {}",
            entry.name, entry.kind
        );
        entry.value.as_ref()
    }

    fn entry(&self, id: ParamId) -> &Entry {
        &self.entries[id.0]
    }

    fn entry_mut(&mut self, id: ParamId) -> &mut Entry {
        &mut self.entries[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let mut table = ParamTable::new();
        let a = table.create("A", ParamKind::Int).unwrap();
        let b = table.create_protected("B", ParamKind::Float).unwrap();

        assert_eq!(table.find("A").unwrap(), a);
        assert_eq!(table.find("B").unwrap(), b);
        assert!(table.is_protected(b));
        assert!(!table.is_protected(a));
        assert_eq!(
            table.find("C").unwrap_err(),
            ParamError::UnknownName("C".into())
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = ParamTable::new();
        table.create("A", ParamKind::Int).unwrap();
        assert_eq!(
            table.create("A", ParamKind::Float).unwrap_err(),
            ParamError::Duplicate("A".into())
        );
    }

    #[test]
    fn test_undefined_until_set() {
        let mut table = ParamTable::new();
        let id = table.create("A", ParamKind::Int).unwrap();
        assert_eq!(table.get_int(id), None);
        table.set_int(id, 7);
        assert_eq!(table.get_int(id), Some(7));
    }

    #[test]
    fn test_write_respects_protection_and_kind() {
        let mut table = ParamTable::new();
        let open = table.create("OPEN", ParamKind::Int).unwrap();
        let closed = table.create_protected("CLOSED", ParamKind::Int).unwrap();

        table.write(open, ParamValue::Int(3)).unwrap();
        assert_eq!(table.get_int(open), Some(3));

        assert_eq!(
            table.write(closed, ParamValue::Int(3)).unwrap_err(),
            ParamError::WriteProtected("CLOSED".into())
        );
        assert!(matches!(
            table.write(open, ParamValue::Float(1.0)).unwrap_err(),
            ParamError::TypeMismatch { .. }
        ));

        // Framework setters bypass protection.
        table.set_int(closed, 4);
        assert_eq!(table.get_int(closed), Some(4));
    }

    #[test]
    fn test_check_kind() {
        let mut table = ParamTable::new();
        let rate = table.create("RATE", ParamKind::Float).unwrap();

        assert!(table.check_kind(rate, ParamKind::Float).is_ok());
        assert_eq!(
            table.check_kind(rate, ParamKind::Int).unwrap_err(),
            ParamError::TypeMismatch {
                name: "RATE".into(),
                expected: ParamKind::Float,
                actual: ParamKind::Int,
            }
        );
    }

    #[test]
    fn test_publish_sends_only_changes() {
        let mut table = ParamTable::new();
        let a = table.create("A", ParamKind::Int).unwrap();
        let b = table.create("B", ParamKind::Float).unwrap();
        let mut rx = table.subscribe();

        table.set_int(a, 1);
        table.set_float(b, f64::NAN);
        assert_eq!(table.publish(), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.name, "A");
        assert_eq!(first.value, Some(ParamValue::Int(1)));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.name, "B");

        // Same values again, including NaN, are not changes.
        table.set_int(a, 1);
        table.set_float(b, f64::NAN);
        assert_eq!(table.publish(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "has kind")]
    fn test_kind_mismatch_on_set_panics() {
        let mut table = ParamTable::new();
        let a = table.create("A", ParamKind::Int).unwrap();
        table.set_float(a, 1.0);
    }
}
