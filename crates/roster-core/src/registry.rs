//! Person registry: a JSON file of display details keyed by recognized name.
//!
//! Recognition never depends on it; callers use it to enrich results.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

const NOT_AVAILABLE: &str = "N/A";
const UNSPECIFIED: &str = "Unknown";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Display details for one person. Keys not listed here are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonRecord {
    pub full_name: String,
    pub position: String,
    pub department: String,
    pub email: String,
    pub phone: String,
    pub bio: String,
    pub avatar: String,
    pub join_date: String,
    pub employee_id: String,
    pub skills: Vec<String>,
    pub projects: Vec<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl PersonRecord {
    /// Placeholder shown for a recognized name with no registry entry.
    pub fn placeholder(name: &str) -> Self {
        Self {
            full_name: name.to_string(),
            position: UNSPECIFIED.to_string(),
            department: UNSPECIFIED.to_string(),
            email: NOT_AVAILABLE.to_string(),
            phone: NOT_AVAILABLE.to_string(),
            bio: "No information available".to_string(),
            ..Self::default()
        }
    }

    fn matches(&self, name: &str, query: &str) -> bool {
        [name, self.full_name.as_str(), self.position.as_str(), self.department.as_str()]
            .iter()
            .any(|field| field.to_lowercase().contains(query))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStatistics {
    pub total_people: usize,
    pub departments: IndexMap<String, usize>,
    pub positions: IndexMap<String, usize>,
    pub top_department: String,
    pub top_position: String,
}

pub struct PersonRegistry {
    path: PathBuf,
    people: IndexMap<String, PersonRecord>,
}

impl PersonRegistry {
    /// Read the registry at `path`. A missing or malformed file yields an
    /// empty registry bound to the same path.
    pub fn load(path: &Path) -> Self {
        let people = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<IndexMap<String, PersonRecord>>(&text) {
                Ok(people) => {
                    tracing::info!(path = %path.display(), count = people.len(), "person registry loaded");
                    people
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "malformed person registry; starting empty");
                    IndexMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "person registry not found; starting empty");
                IndexMap::new()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot read person registry");
                IndexMap::new()
            }
        };
        Self { path: path.to_path_buf(), people }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io { path: self.path.display().to_string(), source };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&self.people)?;
        std::fs::write(&self.path, json).map_err(io_err)?;
        tracing::debug!(path = %self.path.display(), count = self.people.len(), "person registry saved");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PersonRecord> {
        self.people.get(name)
    }

    /// The stored record, or a placeholder naming `name`.
    pub fn get_info(&self, name: &str) -> PersonRecord {
        self.people
            .get(name)
            .cloned()
            .unwrap_or_else(|| PersonRecord::placeholder(name))
    }

    /// Insert or replace `name`, defaulting `full_name` to the key. Persists.
    pub fn add(&mut self, name: &str, mut record: PersonRecord) -> Result<(), RegistryError> {
        if record.full_name.is_empty() {
            record.full_name = name.to_string();
        }
        self.people.insert(name.to_string(), record);
        self.save()?;
        tracing::info!(person = name, "person added");
        Ok(())
    }

    /// Merge `fields` into the stored record (creating it if absent). Persists.
    pub fn update(&mut self, name: &str, fields: &Map<String, Value>) -> Result<(), RegistryError> {
        let current = self.people.get(name).cloned().unwrap_or_default();
        let mut merged = match serde_json::to_value(current)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
        let record: PersonRecord = serde_json::from_value(Value::Object(merged))?;
        self.people.insert(name.to_string(), record);
        self.save()?;
        tracing::info!(person = name, fields = fields.len(), "person updated");
        Ok(())
    }

    /// Returns false when `name` was not present.
    pub fn remove(&mut self, name: &str) -> Result<bool, RegistryError> {
        if self.people.shift_remove(name).is_none() {
            tracing::warn!(person = name, "person not found");
            return Ok(false);
        }
        self.save()?;
        tracing::info!(person = name, "person removed");
        Ok(true)
    }

    pub fn all(&self) -> &IndexMap<String, PersonRecord> {
        &self.people
    }

    /// Case-insensitive substring match over key, full name, position and
    /// department.
    pub fn search(&self, query: &str) -> Vec<(&str, &PersonRecord)> {
        let query = query.to_lowercase();
        self.people
            .iter()
            .filter(|(name, record)| record.matches(name, &query))
            .map(|(name, record)| (name.as_str(), record))
            .collect()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut departments: IndexMap<String, usize> = IndexMap::new();
        let mut positions: IndexMap<String, usize> = IndexMap::new();
        for record in self.people.values() {
            *departments.entry(or_unspecified(&record.department)).or_default() += 1;
            *positions.entry(or_unspecified(&record.position)).or_default() += 1;
        }
        RegistryStatistics {
            total_people: self.people.len(),
            top_department: most_common(&departments),
            top_position: most_common(&positions),
            departments,
            positions,
        }
    }
}

fn or_unspecified(value: &str) -> String {
    if value.is_empty() { UNSPECIFIED.to_string() } else { value.to_string() }
}

/// Highest count, earliest entry on ties; "N/A" when empty.
fn most_common(counts: &IndexMap<String, usize>) -> String {
    let mut best: Option<(&String, usize)> = None;
    for (key, &n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((key, n));
        }
    }
    best.map_or_else(|| NOT_AVAILABLE.to_string(), |(k, _)| k.clone())
}
