//! Namespaced roster store shared by the frame loop, the reconciler and the
//! persistence flush.
//!
//! Values are stored as text. Booleans are `true`/`false`, integers are plain
//! decimal digits and everything else is kept verbatim.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type StudentId = String;

pub const FIELD_NAME: &str = "name";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_ASSISTANCE: &str = "assistance";
pub const FIELD_ASSISTANCE_SENT: &str = "assistance_sent";
pub const FIELD_PARTICIPATION: &str = "participation_counter";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    pub fn parse(text: &str) -> FieldValue {
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(i) = text.parse() {
                return FieldValue::Int(i);
            }
        }
        match text {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => FieldValue::Text(text.to_string()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Key-value store holding one hash of fields per key.
pub trait RosterStore: Send + Sync {
    fn set_field(&self, key: &str, field: &str, value: FieldValue) -> Result<()>;
    fn get_field(&self, key: &str, field: &str) -> Result<Option<FieldValue>>;
    /// Add `delta` to an integer field, treating a missing field as 0.
    fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    /// Every key under `namespace` with its fields.
    fn scan_all(&self, namespace: &str) -> Result<Vec<(String, HashMap<String, FieldValue>)>>;
    /// Remove every key under `namespace`, returning how many were removed.
    fn delete_namespace(&self, namespace: &str) -> Result<usize>;
}

/// In-process store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryRosterStore {
    inner: Arc<RwLock<BTreeMap<String, HashMap<String, String>>>>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Store("roster store lock poisoned".into())
    }
}

fn in_namespace(key: &str, namespace: &str) -> bool {
    key.strip_prefix(namespace).is_some_and(|rest| rest.starts_with(':'))
}

impl RosterStore for MemoryRosterStore {
    fn set_field(&self, key: &str, field: &str, value: FieldValue) -> Result<()> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        map.entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_text());
        Ok(())
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<FieldValue>> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(key)
            .and_then(|fields| fields.get(field))
            .map(|v| FieldValue::parse(v)))
    }

    fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let slot = map
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = slot
            .parse()
            .map_err(|_| Error::Store(format!("{}.{} is not an integer: {:?}", key, field, slot)))?;
        let updated = current + delta;
        *slot = updated.to_string();
        Ok(updated)
    }

    fn scan_all(&self, namespace: &str) -> Result<Vec<(String, HashMap<String, FieldValue>)>> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .iter()
            .filter(|(key, _)| in_namespace(key, namespace))
            .map(|(key, fields)| {
                let parsed = fields
                    .iter()
                    .map(|(f, v)| (f.clone(), FieldValue::parse(v)))
                    .collect();
                (key.clone(), parsed)
            })
            .collect())
    }

    fn delete_namespace(&self, namespace: &str) -> Result<usize> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let before = map.len();
        map.retain(|key, _| !in_namespace(key, namespace));
        Ok(before - map.len())
    }
}

/// Per-course, per-session key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(course_id: u64, session_count: u64) -> Self {
        Namespace(format!("course:{}:session:{}", course_id, session_count))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn student_key(&self, id: &str) -> String {
        format!("{}:student:{}", self.0, id)
    }

    fn student_prefix(&self) -> String {
        format!("{}:student:", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Enrolled student as supplied at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: StudentId,
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Face embedding of the enrolment photo, if one exists.
    #[serde(default)]
    pub template: Option<Vec<f32>>,
}

/// Current state of one roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: StudentId,
    pub name: String,
    pub email: String,
    pub assistance: bool,
    pub assistance_sent: bool,
    pub participation_counter: i64,
}

impl RosterEntry {
    fn from_fields(id: StudentId, fields: &HashMap<String, FieldValue>) -> Self {
        let text = |f: &str| match fields.get(f) {
            Some(v) => v.to_text(),
            None => String::new(),
        };
        let flag = |f: &str| fields.get(f).and_then(FieldValue::as_bool).unwrap_or(false);
        RosterEntry {
            id,
            name: text(FIELD_NAME),
            email: text(FIELD_EMAIL),
            assistance: flag(FIELD_ASSISTANCE),
            assistance_sent: flag(FIELD_ASSISTANCE_SENT),
            participation_counter: fields
                .get(FIELD_PARTICIPATION)
                .and_then(FieldValue::as_int)
                .unwrap_or(0),
        }
    }
}

/// Roster view scoped to one session namespace.
#[derive(Clone)]
pub struct Roster {
    store: Arc<dyn RosterStore>,
    namespace: Namespace,
}

impl Roster {
    pub fn new(store: Arc<dyn RosterStore>, namespace: Namespace) -> Self {
        Roster { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Create one entry per student with every counter cleared.
    pub fn seed(&self, students: &[StudentRecord]) -> Result<()> {
        for student in students {
            let key = self.namespace.student_key(&student.id);
            self.store.set_field(&key, FIELD_NAME, FieldValue::Text(student.name.clone()))?;
            self.store.set_field(&key, FIELD_EMAIL, FieldValue::Text(student.email.clone()))?;
            self.store.set_field(&key, FIELD_ASSISTANCE, FieldValue::Bool(false))?;
            self.store.set_field(&key, FIELD_ASSISTANCE_SENT, FieldValue::Bool(false))?;
            self.store.set_field(&key, FIELD_PARTICIPATION, FieldValue::Int(0))?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<RosterEntry>> {
        let prefix = self.namespace.student_prefix();
        Ok(self
            .store
            .scan_all(self.namespace.as_str())?
            .into_iter()
            .filter_map(|(key, fields)| {
                let id = key.strip_prefix(&prefix)?.to_string();
                Some(RosterEntry::from_fields(id, &fields))
            })
            .collect())
    }

    pub fn entry(&self, id: &str) -> Result<Option<RosterEntry>> {
        Ok(self.entries()?.into_iter().find(|e| e.id == id))
    }

    pub fn name(&self, id: &str) -> Result<Option<String>> {
        let key = self.namespace.student_key(id);
        Ok(self.store.get_field(&key, FIELD_NAME)?.map(|v| v.to_text()))
    }

    pub fn is_present(&self, id: &str) -> Result<bool> {
        let key = self.namespace.student_key(id);
        Ok(self
            .store
            .get_field(&key, FIELD_ASSISTANCE)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// True when every entry has `assistance` set (vacuously true when empty).
    pub fn all_present(&self) -> Result<bool> {
        Ok(self.entries()?.iter().all(|e| e.assistance))
    }

    /// Monotone: only ever moves `assistance` to true.
    pub fn mark_present(&self, id: &str) -> Result<()> {
        let key = self.namespace.student_key(id);
        self.store.set_field(&key, FIELD_ASSISTANCE, FieldValue::Bool(true))
    }

    pub fn record_participation(&self, id: &str) -> Result<i64> {
        let key = self.namespace.student_key(id);
        self.store.increment_field(&key, FIELD_PARTICIPATION, 1)
    }

    pub fn reset_participation(&self, id: &str) -> Result<()> {
        let key = self.namespace.student_key(id);
        self.store.set_field(&key, FIELD_PARTICIPATION, FieldValue::Int(0))
    }

    pub fn mark_assistance_sent(&self, id: &str) -> Result<()> {
        let key = self.namespace.student_key(id);
        self.store.set_field(&key, FIELD_ASSISTANCE_SENT, FieldValue::Bool(true))
    }

    /// Delete the whole session namespace.
    pub fn teardown(&self) -> Result<usize> {
        self.store.delete_namespace(self.namespace.as_str())
    }
}
