//! Storage for persisted replica properties.
//!
//! Values are stored per type name together with the descriptor signature
//! they were written under. Loading with a different signature discards the
//! stored values instead of applying them to an incompatible layout.

use crate::error::{RemoteObjectsError, Result};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Property name -> last known value.
pub type PersistedValues = BTreeMap<String, Value>;

pub trait PersistedStore: Send + Sync {
    fn load(&self, type_name: &str, signature: &str) -> Result<Option<PersistedValues>>;
    fn save(&self, type_name: &str, signature: &str, values: PersistedValues) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredEntry {
    signature: String,
    values: PersistedValues,
}

fn take_matching(
    entries: &mut HashMap<String, StoredEntry>,
    type_name: &str,
    signature: &str,
) -> Option<PersistedValues> {
    let entry = entries.get(type_name)?;
    if entry.signature != signature {
        warn!(
            type_name,
            stored = %entry.signature,
            current = signature,
            "discarding persisted properties written under another signature"
        );
        entries.remove(type_name);
        return None;
    }
    Some(entry.values.clone())
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedStore for InMemoryStore {
    fn load(&self, type_name: &str, signature: &str) -> Result<Option<PersistedValues>> {
        let mut entries = self.entries.lock().unwrap();
        Ok(take_matching(&mut entries, type_name, signature))
    }

    fn save(&self, type_name: &str, signature: &str, values: PersistedValues) -> Result<()> {
        self.entries.lock().unwrap().insert(
            type_name.to_string(),
            StoredEntry {
                signature: signature.to_string(),
                values,
            },
        );
        Ok(())
    }
}

/// One JSON document holding every persisted type.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, StoredEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| {
            RemoteObjectsError::Persistence(format!("{}: {}", self.path.display(), e))
        })
    }

    fn write_all(&self, entries: &HashMap<String, StoredEntry>) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| RemoteObjectsError::Persistence(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl PersistedStore for JsonFileStore {
    fn load(&self, type_name: &str, signature: &str) -> Result<Option<PersistedValues>> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = self.read_all()?;
        let before = entries.len();
        let found = take_matching(&mut entries, type_name, signature);
        if entries.len() != before {
            self.write_all(&entries)?;
        }
        Ok(found)
    }

    fn save(&self, type_name: &str, signature: &str, values: PersistedValues) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = self.read_all()?;
        entries.insert(
            type_name.to_string(),
            StoredEntry {
                signature: signature.to_string(),
                values,
            },
        );
        self.write_all(&entries)
    }
}
