#![forbid(unsafe_code)]

use crate::ids::PersonaId;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct PersonasFile {
    #[serde(default)]
    personas: Vec<PersonaEntry>,
}

#[derive(Debug, Deserialize)]
struct PersonaEntry {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersonaLoadError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("personas json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Display names for persona ids, read from `{"personas": [{"id", "name"}]}`.
#[derive(Clone, Debug, Default)]
pub struct PersonaDirectory {
    names: BTreeMap<String, String>,
}

impl PersonaDirectory {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let file: PersonasFile = serde_json::from_str(raw)?;
        let mut names = BTreeMap::new();
        for entry in file.personas {
            // Entries without both fields are skipped, not rejected.
            let (Some(id), Some(name)) = (entry.id, entry.name) else {
                continue;
            };
            let (id, name) = (id.trim().to_string(), name.trim().to_string());
            if id.is_empty() || name.is_empty() {
                continue;
            }
            names.insert(id, name);
        }
        Ok(Self { names })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersonaLoadError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }

    pub fn name_for(&self, persona_id: &PersonaId) -> Option<&str> {
        self.names.get(persona_id.as_str()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
