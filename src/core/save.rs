/// Save files: one JSON document per player holding every loaded entity's
/// runtime state and the navigation stack.
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::core::catalog::{Catalog, CatalogError};
use crate::core::runtime::{EntityRuntimeState, RuntimeContext, RuntimeError};
use crate::schema::entity::{EntityId, EntityKind, Value};

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("IO error on save file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed save file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// One entity's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub name: String,
    /// Empty when the save has none; restoring then uses the opening state.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub step: usize,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl SavedEntity {
    pub fn new(id: &EntityId, state: &EntityRuntimeState) -> Self {
        Self {
            kind: id.kind,
            name: id.name.clone(),
            state: state.state.clone(),
            step: state.step,
            variables: state.variables.clone(),
        }
    }

    pub fn id(&self) -> EntityId {
        EntityId::new(self.kind, self.name.clone())
    }

    pub fn runtime_state(&self) -> EntityRuntimeState {
        EntityRuntimeState {
            state: self.state.clone(),
            step: self.step,
            variables: self.variables.clone(),
        }
    }
}

/// The on-disk save document. Fields this runtime does not know about are
/// carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub entity_states: Vec<SavedEntity>,
    #[serde(default)]
    pub entity_stack: Vec<EntityId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SaveFile {
    /// A fresh save that starts with `stack` (bottom first).
    pub fn new_player(
        name: impl Into<String>,
        fullname: impl Into<String>,
        stack: Vec<EntityId>,
    ) -> Self {
        Self {
            name: name.into(),
            fullname: fullname.into(),
            entity_stack: stack,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, SaveError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| SaveError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), SaveError> {
        let io_error = |source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| SaveError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_error)?;
        tracing::info!(path = %path.display(), entities = self.entity_states.len(), "Saved game");
        Ok(())
    }

    /// Record `context` into a copy of this save, keeping player fields and
    /// unknown extras.
    pub fn capture(&self, context: &RuntimeContext) -> Self {
        Self {
            entity_states: context
                .store
                .snapshot()
                .iter()
                .map(|(id, state)| SavedEntity::new(id, state))
                .collect(),
            entity_stack: context.stack.iter().cloned().collect(),
            ..self.clone()
        }
    }

    /// Merge this save into `context`.
    ///
    /// Entities whose content has since been removed are skipped with a
    /// warning. Stack entries must still resolve.
    pub fn restore(
        &self,
        context: &mut RuntimeContext,
        catalog: &Catalog,
        rng: &mut StdRng,
    ) -> Result<(), SaveError> {
        for saved in &self.entity_states {
            let id = saved.id();
            match context
                .store
                .restore(catalog, &id, saved.runtime_state(), rng)
            {
                Ok(()) => {}
                Err(RuntimeError::Catalog(CatalogError::NotFound(_))) => {
                    tracing::warn!(entity = %id, "Saved entity has no content, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        for id in &self.entity_stack {
            context.enter(catalog, id, false, rng)?;
        }
        tracing::debug!(
            entities = self.entity_states.len(),
            stack = self.entity_stack.len(),
            "Restored save"
        );
        Ok(())
    }
}

/// A fresh, unique save path in `save_dir`.
pub fn new_save_path(save_dir: &Path) -> PathBuf {
    save_dir.join(format!("{}.json", Uuid::new_v4()))
}

/// One entry in the save-slot picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSlot {
    pub path: PathBuf,
    pub name: String,
    pub fullname: String,
}

#[derive(Deserialize)]
struct SlotHeader {
    #[serde(default)]
    name: String,
    #[serde(default)]
    fullname: String,
}

/// Every readable save in `save_dir`, sorted by player name.
pub fn list_slots(save_dir: &Path) -> Result<Vec<SaveSlot>, SaveError> {
    if !save_dir.exists() {
        return Ok(Vec::new());
    }
    let io_error = |source| SaveError::Io {
        path: save_dir.to_path_buf(),
        source,
    };

    let mut slots = Vec::new();
    for entry in std::fs::read_dir(save_dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let header = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                serde_json::from_str::<SlotHeader>(&contents).map_err(|e| e.to_string())
            });
        match header {
            Ok(header) => slots.push(SaveSlot {
                path,
                name: header.name,
                fullname: header.fullname,
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable save"),
        }
    }
    slots.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    Ok(slots)
}
