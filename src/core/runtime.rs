/// Runtime state: mutable per-entity positions and variables, the derived
/// indexes over them, and the context object that owns both plus the stack.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

use crate::core::catalog::{Catalog, CatalogError};
use crate::core::stack::NavigationStack;
use crate::schema::entity::{
    EntityBody, EntityDefinition, EntityId, EntityKind, QuestStatus, Value, DEATH_MESSAGE_VAR,
    MENU_STATE, QUEST_STATUS_VAR,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} is not loaded")]
    NotLoaded(EntityId),
    #[error("{entity} has no state '{state}'")]
    UnknownState { entity: EntityId, state: String },
    #[error("{entity} is at step {step} of '{state}', past the end of its script")]
    StepOutOfRange {
        entity: EntityId,
        state: String,
        step: usize,
    },
    #[error("{entity} has no variable '{name}'")]
    UnknownVariable { entity: EntityId, name: String },
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Where an entity is in its script, plus its variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRuntimeState {
    pub state: String,
    pub step: usize,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl EntityRuntimeState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            step: 0,
            variables: HashMap::new(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn quest_status(&self) -> Option<QuestStatus> {
        self.variables
            .get(QUEST_STATUS_VAR)
            .and_then(QuestStatus::from_value)
    }

    /// The line a dead character leaves with, if it is dead.
    pub fn death_message(&self) -> Option<&str> {
        match self.variables.get(DEATH_MESSAGE_VAR) {
            Some(Value::String(line)) if !line.is_empty() => Some(line),
            _ => None,
        }
    }
}

/// Caches over loaded entities, filled as each one is first loaded.
#[derive(Debug, Clone, Default)]
struct Indexes {
    /// Owner (character or location) -> quests it can start.
    quest_triggers: FxHashMap<EntityId, Vec<EntityId>>,
    /// Location name -> characters found there.
    character_locations: FxHashMap<String, Vec<EntityId>>,
    /// Location -> outbound connections.
    travel_paths: FxHashMap<EntityId, Vec<EntityId>>,
}

fn insert_sorted(list: &mut Vec<EntityId>, id: EntityId) {
    if let Err(pos) = list.binary_search(&id) {
        list.insert(pos, id);
    }
}

impl Indexes {
    fn register(&mut self, definition: &EntityDefinition) {
        let id = definition.id.clone();
        match &definition.body {
            EntityBody::Quest { start_entity, .. } => {
                insert_sorted(
                    self.quest_triggers.entry(start_entity.clone()).or_default(),
                    id,
                );
            }
            EntityBody::Character {
                location: Some(location),
                ..
            } => {
                insert_sorted(
                    self.character_locations.entry(location.clone()).or_default(),
                    id,
                );
            }
            EntityBody::Connection { from, .. } => {
                insert_sorted(
                    self.travel_paths
                        .entry(EntityId::location(from.clone()))
                        .or_default(),
                    id,
                );
            }
            _ => {}
        }
    }
}

/// Per-entity runtime state keyed by entity, with the definitions it was
/// created from.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStore {
    states: FxHashMap<EntityId, EntityRuntimeState>,
    definitions: FxHashMap<EntityId, Rc<EntityDefinition>>,
    indexes: Indexes,
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, id: &EntityId) -> bool {
        self.states.contains_key(id)
    }

    /// Load an entity with default state if it has not been seen yet.
    ///
    /// Also loads every character the entity references, so an effect scope
    /// can always be built for a loaded entity. Repeated calls are no-ops and
    /// never touch the indexes again.
    pub fn ensure_loaded(
        &mut self,
        catalog: &Catalog,
        id: &EntityId,
        rng: &mut StdRng,
    ) -> Result<(), RuntimeError> {
        if self.is_loaded(id) {
            return Ok(());
        }

        let definition = catalog.load(id)?;
        let mut state = EntityRuntimeState::new(opening_state(&definition, rng));
        state.variables = definition.variables.clone();
        if id.kind == EntityKind::Quest {
            state
                .variables
                .entry(QUEST_STATUS_VAR.to_string())
                .or_insert_with(|| Value::from(QuestStatus::Idle.as_str()));
        }

        tracing::debug!(entity = %id, state = %state.state, "Loaded entity");
        self.indexes.register(&definition);
        self.states.insert(id.clone(), state);
        self.definitions.insert(id.clone(), Rc::clone(&definition));

        for character in &definition.characters {
            self.ensure_loaded(catalog, &EntityId::character(character.clone()), rng)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &EntityId) -> Result<&EntityRuntimeState, RuntimeError> {
        self.states
            .get(id)
            .ok_or_else(|| RuntimeError::NotLoaded(id.clone()))
    }

    fn get_mut(&mut self, id: &EntityId) -> Result<&mut EntityRuntimeState, RuntimeError> {
        self.states
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotLoaded(id.clone()))
    }

    pub fn definition(&self, id: &EntityId) -> Result<Rc<EntityDefinition>, RuntimeError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotLoaded(id.clone()))
    }

    /// Fail unless `state` is one the entity can be moved to.
    pub fn check_state(&self, id: &EntityId, state: &str) -> Result<(), RuntimeError> {
        let definition = self.definition(id)?;
        if accepts_state(&definition, state) {
            Ok(())
        } else {
            Err(RuntimeError::UnknownState {
                entity: id.clone(),
                state: state.to_string(),
            })
        }
    }

    /// Move an entity to `state`. The step always restarts at 0.
    pub fn set_state(&mut self, id: &EntityId, state: &str) -> Result<(), RuntimeError> {
        self.check_state(id, state)?;
        let entry = self.get_mut(id)?;
        entry.state = state.to_string();
        entry.step = 0;
        tracing::debug!(entity = %id, state, "State changed");
        Ok(())
    }

    /// Re-roll an entity's opening state, as when the player walks up to a
    /// character again. A dead character goes straight to its menu, where it
    /// says its last line.
    pub fn reopen(&mut self, id: &EntityId, rng: &mut StdRng) -> Result<(), RuntimeError> {
        let definition = self.definition(id)?;
        if id.kind == EntityKind::Character && self.get(id)?.death_message().is_some() {
            return self.set_state(id, MENU_STATE);
        }
        let state = opening_state(&definition, rng);
        self.set_state(id, &state)
    }

    pub fn advance_step(&mut self, id: &EntityId) -> Result<usize, RuntimeError> {
        let entry = self.get_mut(id)?;
        entry.step += 1;
        Ok(entry.step)
    }

    /// Overwrite an existing variable.
    pub fn set_variable(
        &mut self,
        id: &EntityId,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let entry = self.get_mut(id)?;
        match entry.variables.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::UnknownVariable {
                entity: id.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Overlay persisted state onto an entity's defaults.
    ///
    /// Variables merge key by key so that variables added to content after
    /// the save was written keep their defaults. A saved position the content
    /// no longer supports falls back to the opening state.
    pub fn restore(
        &mut self,
        catalog: &Catalog,
        id: &EntityId,
        saved: EntityRuntimeState,
        rng: &mut StdRng,
    ) -> Result<(), RuntimeError> {
        self.ensure_loaded(catalog, id, rng)?;
        let definition = self.definition(id)?;

        let (state, step) = if !accepts_state(&definition, &saved.state) {
            tracing::warn!(entity = %id, state = %saved.state, "Saved state no longer exists");
            (opening_state(&definition, rng), 0)
        } else {
            match definition.state(&saved.state) {
                Some(def) if saved.step >= def.steps.len() => {
                    tracing::warn!(entity = %id, step = saved.step, "Saved step out of range");
                    (saved.state, 0)
                }
                Some(_) => (saved.state, saved.step),
                None => (saved.state, 0),
            }
        };

        let entry = self.get_mut(id)?;
        entry.state = state;
        entry.step = step;
        entry.variables.extend(saved.variables);
        Ok(())
    }

    /// All loaded entities and their state, sorted by id.
    pub fn snapshot(&self) -> Vec<(EntityId, EntityRuntimeState)> {
        let mut entries: Vec<_> = self
            .states
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn quests_for(&self, owner: &EntityId) -> &[EntityId] {
        self.indexes
            .quest_triggers
            .get(owner)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn characters_at(&self, location: &str) -> &[EntityId] {
        self.indexes
            .character_locations
            .get(location)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn travel_paths(&self, location: &EntityId) -> &[EntityId] {
        self.indexes
            .travel_paths
            .get(location)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Pick the state an entity opens in.
fn opening_state(definition: &EntityDefinition, rng: &mut StdRng) -> String {
    definition
        .opening_states
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| definition.fallback_state().to_string())
}

fn accepts_state(definition: &EntityDefinition, state: &str) -> bool {
    definition.states.contains_key(state)
        || state == definition.fallback_state()
        || (definition.kind().has_menu() && state == MENU_STATE)
}

/// Everything that changes during play, owned in one place.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub store: RuntimeStore,
    pub stack: NavigationStack,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `id` if needed and push it.
    pub fn enter(
        &mut self,
        catalog: &Catalog,
        id: &EntityId,
        reopen: bool,
        rng: &mut StdRng,
    ) -> Result<(), RuntimeError> {
        self.store.ensure_loaded(catalog, id, rng)?;
        if reopen {
            self.store.reopen(id, rng)?;
        }
        self.stack.push(id.clone());
        Ok(())
    }

    /// Load every entity the catalog knows about.
    pub fn preload(&mut self, catalog: &Catalog, rng: &mut StdRng) -> Result<usize, RuntimeError> {
        let ids = catalog.scan()?;
        for id in &ids {
            self.store.ensure_loaded(catalog, id, rng)?;
        }
        tracing::info!(count = ids.len(), "Preloaded story entities");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::in_memory();
        catalog
            .insert_json(
                EntityId::character("hiccup"),
                r#"{"location": "berk_square", "variables": {"trust": 1},
                    "states": {"talk": {"steps": [
                        {"type": "story", "text": "a"},
                        {"type": "story", "text": "b"}
                    ]}}}"#,
            )
            .unwrap();
        catalog
            .insert_json(
                EntityId::quest("rescue"),
                r#"{"start_entity": "hiccup", "start_condition": "true",
                    "start_line": "Help!", "start_state": "go",
                    "characters": ["hiccup"],
                    "states": {"go": {"steps": [{"type": "story", "text": "x"}]}}}"#,
            )
            .unwrap();
        catalog
            .insert_json(
                EntityId::connection("to_cove"),
                r#"{"from": "berk_square", "to": "cove", "action": "Walk to the cove"}"#,
            )
            .unwrap();
        catalog
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn ensure_loaded_creates_defaults() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let hiccup = EntityId::character("hiccup");

        assert!(matches!(store.get(&hiccup), Err(RuntimeError::NotLoaded(_))));
        store.ensure_loaded(&catalog, &hiccup, &mut rng()).unwrap();

        let state = store.get(&hiccup).unwrap();
        assert_eq!(state.state, MENU_STATE);
        assert_eq!(state.step, 0);
        assert_eq!(state.variables["trust"], Value::Int(1));
    }

    #[test]
    fn quest_gets_idle_status_and_loads_its_characters() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let quest = EntityId::quest("rescue");
        store.ensure_loaded(&catalog, &quest, &mut rng()).unwrap();

        assert_eq!(store.get(&quest).unwrap().quest_status(), Some(QuestStatus::Idle));
        assert_eq!(store.get(&quest).unwrap().state, "idle");
        assert!(store.is_loaded(&EntityId::character("hiccup")));
    }

    #[test]
    fn repeated_loads_do_not_duplicate_indexes() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let mut rng = rng();
        for _ in 0..3 {
            store
                .ensure_loaded(&catalog, &EntityId::quest("rescue"), &mut rng)
                .unwrap();
            store
                .ensure_loaded(&catalog, &EntityId::character("hiccup"), &mut rng)
                .unwrap();
            store
                .ensure_loaded(&catalog, &EntityId::connection("to_cove"), &mut rng)
                .unwrap();
        }

        assert_eq!(
            store.quests_for(&EntityId::character("hiccup")),
            &[EntityId::quest("rescue")]
        );
        assert_eq!(store.characters_at("berk_square"), &[EntityId::character("hiccup")]);
        assert_eq!(
            store.travel_paths(&EntityId::location("berk_square")),
            &[EntityId::connection("to_cove")]
        );
    }

    #[test]
    fn set_state_resets_step() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let hiccup = EntityId::character("hiccup");
        store.ensure_loaded(&catalog, &hiccup, &mut rng()).unwrap();
        store.set_state(&hiccup, "talk").unwrap();
        store.advance_step(&hiccup).unwrap();
        assert_eq!(store.get(&hiccup).unwrap().step, 1);

        store.set_state(&hiccup, "talk").unwrap();
        assert_eq!(store.get(&hiccup).unwrap().step, 0);

        assert!(matches!(
            store.set_state(&hiccup, "nonsense"),
            Err(RuntimeError::UnknownState { .. })
        ));
        assert_eq!(store.get(&hiccup).unwrap().state, "talk");
    }

    #[test]
    fn set_variable_requires_existing_name() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let hiccup = EntityId::character("hiccup");
        store.ensure_loaded(&catalog, &hiccup, &mut rng()).unwrap();

        store.set_variable(&hiccup, "trust", Value::Int(5)).unwrap();
        assert_eq!(store.get(&hiccup).unwrap().variables["trust"], Value::Int(5));
        assert!(store.set_variable(&hiccup, "mood", Value::Int(1)).is_err());
    }

    #[test]
    fn restore_merges_variables_key_by_key() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let hiccup = EntityId::character("hiccup");

        let mut saved = EntityRuntimeState::new("talk");
        saved.step = 1;
        saved
            .variables
            .insert("met_toothless".to_string(), Value::Bool(true));

        store.restore(&catalog, &hiccup, saved, &mut rng()).unwrap();
        let state = store.get(&hiccup).unwrap();
        assert_eq!(state.state, "talk");
        assert_eq!(state.step, 1);
        // default kept, saved key added
        assert_eq!(state.variables["trust"], Value::Int(1));
        assert_eq!(state.variables["met_toothless"], Value::Bool(true));
    }

    #[test]
    fn restore_tolerates_stale_positions() {
        let catalog = catalog();
        let mut store = RuntimeStore::new();
        let hiccup = EntityId::character("hiccup");

        let mut saved = EntityRuntimeState::new("talk");
        saved.step = 9;
        store.restore(&catalog, &hiccup, saved, &mut rng()).unwrap();
        assert_eq!(store.get(&hiccup).unwrap().step, 0);

        store
            .restore(&catalog, &hiccup, EntityRuntimeState::new("deleted_state"), &mut rng())
            .unwrap();
        assert_eq!(store.get(&hiccup).unwrap().state, MENU_STATE);
    }

    #[test]
    fn enter_reopens_and_pushes() {
        let catalog = catalog();
        let mut ctx = RuntimeContext::new();
        let hiccup = EntityId::character("hiccup");
        let mut rng = rng();

        ctx.store.ensure_loaded(&catalog, &hiccup, &mut rng).unwrap();
        ctx.store.set_state(&hiccup, "talk").unwrap();
        ctx.enter(&catalog, &hiccup, true, &mut rng).unwrap();

        assert_eq!(ctx.stack.top(), Some(&hiccup));
        assert_eq!(ctx.store.get(&hiccup).unwrap().state, MENU_STATE);
    }

    #[test]
    fn reopening_a_dead_character_goes_to_its_menu() {
        let mut catalog = catalog();
        catalog
            .insert_json(
                EntityId::character("stoick"),
                r#"{"opening_states": ["chief"], "variables": {"death_msg": ""},
                    "states": {"chief": {"steps": [{"type": "story", "text": "Son."}]}}}"#,
            )
            .unwrap();
        let stoick = EntityId::character("stoick");
        let mut ctx = RuntimeContext::new();
        let mut rng = rng();

        ctx.enter(&catalog, &stoick, true, &mut rng).unwrap();
        assert_eq!(ctx.store.get(&stoick).unwrap().state, "chief");
        assert_eq!(ctx.store.get(&stoick).unwrap().death_message(), None);

        ctx.store
            .set_variable(&stoick, DEATH_MESSAGE_VAR, Value::from("A chief protects his own."))
            .unwrap();
        ctx.stack.pop().unwrap();
        ctx.enter(&catalog, &stoick, true, &mut rng).unwrap();

        let state = ctx.store.get(&stoick).unwrap();
        assert_eq!(state.state, MENU_STATE);
        assert_eq!(state.death_message(), Some("A chief protects his own."));
    }

    #[test]
    fn preload_loads_everything() {
        let catalog = catalog();
        let mut ctx = RuntimeContext::new();
        assert_eq!(ctx.preload(&catalog, &mut rng()).unwrap(), 3);
        assert_eq!(ctx.store.len(), 3);
    }
}
