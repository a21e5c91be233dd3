/// Entity catalog: loads, validates and caches immutable story content.
///
/// Content lives under `<root>/<kind>/<name>.json`, except connections, which
/// share `<root>/location/connections.json` keyed by connection name.
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

use crate::schema::action::Expr;
use crate::schema::entity::{
    EntityBody, EntityDefinition, EntityId, EntityKind, Value, MENU_STATE,
};
use crate::schema::script::{MenuOption, StateDef};

const CONNECTIONS_FILE: &str = "connections";
const PLAYER_FILE: &str = "player.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no content for {0}")]
    NotFound(EntityId),
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed content in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid definition for {entity}: {message}")]
    Schema { entity: EntityId, message: String },
}

/// Player-facing lines shared by every save, read from `player.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dialogues: PlayerDialogues,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerDialogues {
    #[serde(default)]
    pub characters: CharacterDialogues,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CharacterDialogues {
    /// Templates with a `{character_name}` placeholder.
    #[serde(default)]
    pub farewell: Vec<String>,
}

impl PlayerProfile {
    pub fn farewells(&self) -> &[String] {
        &self.dialogues.characters.farewell
    }
}

// On-disk shape shared by every kind; kind-specific fields are checked when
// converting into an `EntityDefinition`.
#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    states: HashMap<String, StateDef>,
    #[serde(default)]
    opening_states: Vec<String>,
    #[serde(default)]
    variables: HashMap<String, Value>,
    #[serde(default, deserialize_with = "names_or_keys")]
    characters: Vec<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    menu_lines: Vec<String>,
    #[serde(default)]
    option_menus: Vec<MenuOption>,
    #[serde(default)]
    ambient: Vec<String>,
    #[serde(default)]
    start_condition: Option<Expr>,
    #[serde(default, alias = "start_character")]
    start_entity: Option<String>,
    #[serde(default)]
    start_line: Option<String>,
    #[serde(default)]
    start_state: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

/// `characters` may be a list of names or an object keyed by name.
fn names_or_keys<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Keys(HashMap<String, serde_json::Value>),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::List(names) => names,
        Names::Keys(map) => {
            let mut names: Vec<String> = map.into_keys().collect();
            names.sort();
            names
        }
    })
}

fn required<T>(id: &EntityId, field: &str, value: Option<T>) -> Result<T, CatalogError> {
    value.ok_or_else(|| CatalogError::Schema {
        entity: id.clone(),
        message: format!("missing required field '{}'", field),
    })
}

impl RawEntity {
    fn into_definition(self, id: EntityId) -> Result<EntityDefinition, CatalogError> {
        let schema = |message: String| CatalogError::Schema {
            entity: id.clone(),
            message,
        };

        let known_state = |state: &str| {
            self.states.contains_key(state) || (id.kind.has_menu() && state == MENU_STATE)
        };

        for (name, state) in &self.states {
            if state.steps.is_empty() {
                return Err(schema(format!("state '{}' has no steps", name)));
            }
            for transition in &state.transitions {
                if !known_state(&transition.target) {
                    return Err(schema(format!(
                        "state '{}' transitions to unknown state '{}'",
                        name, transition.target
                    )));
                }
            }
        }

        for opening in &self.opening_states {
            if !known_state(opening) {
                return Err(schema(format!("unknown opening state '{}'", opening)));
            }
        }

        let body = match id.kind {
            EntityKind::Character => {
                for option in &self.option_menus {
                    match &option.state {
                        Some(state) if known_state(state) => {}
                        Some(state) => {
                            return Err(schema(format!(
                                "menu option '{}' targets unknown state '{}'",
                                option.text, state
                            )))
                        }
                        None => {
                            return Err(schema(format!(
                                "menu option '{}' has no target state",
                                option.text
                            )))
                        }
                    }
                }
                EntityBody::Character {
                    location: self.location,
                    menu_lines: self.menu_lines,
                    option_menus: self.option_menus,
                }
            }
            EntityKind::Location => EntityBody::Location {
                ambient: self.ambient,
            },
            EntityKind::Quest => {
                let start_state = required(&id, "start_state", self.start_state)?;
                if !self.states.contains_key(&start_state) {
                    return Err(schema(format!("unknown start state '{}'", start_state)));
                }
                let owner = required(&id, "start_entity", self.start_entity)?;
                EntityBody::Quest {
                    start_condition: required(&id, "start_condition", self.start_condition)?,
                    start_entity: EntityId::parse_ref(&owner, EntityKind::Character)
                        .map_err(schema)?,
                    start_line: required(&id, "start_line", self.start_line)?,
                    start_state,
                }
            }
            EntityKind::Connection => EntityBody::Connection {
                from: required(&id, "from", self.from)?,
                to: required(&id, "to", self.to)?,
                action: required(&id, "action", self.action)?,
            },
            EntityKind::Init => {
                if self.opening_states.is_empty() && !self.states.contains_key("idle") {
                    return Err(schema(
                        "init screen needs opening_states or an 'idle' state".to_string(),
                    ));
                }
                EntityBody::Init
            }
        };

        Ok(EntityDefinition {
            name: self.name.unwrap_or_else(|| id.name.clone()),
            id,
            states: self.states,
            opening_states: self.opening_states,
            variables: self.variables,
            characters: self.characters,
            body,
        })
    }
}

/// Parse and validate a single definition from JSON text.
pub fn parse_definition(id: EntityId, json: &str) -> Result<EntityDefinition, CatalogError> {
    let raw: RawEntity = serde_json::from_str(json).map_err(|source| CatalogError::Json {
        path: PathBuf::from(format!("<{}>", id)),
        source,
    })?;
    raw.into_definition(id)
}

/// Read-only store of entity definitions, loaded on first use.
#[derive(Debug, Default)]
pub struct Catalog {
    root: Option<PathBuf>,
    cache: RefCell<FxHashMap<EntityId, Rc<EntityDefinition>>>,
    connections_loaded: Cell<bool>,
}

impl Catalog {
    /// A catalog backed by a story directory.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// A catalog holding only what gets inserted into it.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, definition: EntityDefinition) {
        self.cache
            .get_mut()
            .insert(definition.id.clone(), Rc::new(definition));
    }

    /// Parse a definition from JSON and add it.
    pub fn insert_json(&mut self, id: EntityId, json: &str) -> Result<(), CatalogError> {
        let definition = parse_definition(id, json)?;
        self.insert(definition);
        Ok(())
    }

    /// Look up a definition, reading it from disk on first access.
    pub fn load(&self, id: &EntityId) -> Result<Rc<EntityDefinition>, CatalogError> {
        if let Some(definition) = self.cache.borrow().get(id) {
            return Ok(Rc::clone(definition));
        }

        let Some(root) = &self.root else {
            return Err(CatalogError::NotFound(id.clone()));
        };

        if id.kind == EntityKind::Connection {
            self.load_connections(root)?;
            return self
                .cache
                .borrow()
                .get(id)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound(id.clone()));
        }

        let path = root
            .join(id.kind.as_str())
            .join(format!("{}.json", id.name));
        if !path.is_file() {
            return Err(CatalogError::NotFound(id.clone()));
        }
        let contents = read_file(&path)?;
        let raw: RawEntity = serde_json::from_str(&contents)
            .map_err(|source| CatalogError::Json { path: path.clone(), source })?;
        let definition = Rc::new(raw.into_definition(id.clone())?);

        tracing::debug!(entity = %id, path = %path.display(), "Loaded definition");
        self.cache
            .borrow_mut()
            .insert(id.clone(), Rc::clone(&definition));
        Ok(definition)
    }

    fn load_connections(&self, root: &Path) -> Result<(), CatalogError> {
        if self.connections_loaded.get() {
            return Ok(());
        }
        self.connections_loaded.set(true);

        let path = root
            .join(EntityKind::Location.as_str())
            .join(format!("{}.json", CONNECTIONS_FILE));
        if !path.is_file() {
            return Ok(());
        }

        let contents = read_file(&path)?;
        let raw: HashMap<String, RawEntity> = serde_json::from_str(&contents)
            .map_err(|source| CatalogError::Json { path: path.clone(), source })?;

        let mut cache = self.cache.borrow_mut();
        for (name, entry) in raw {
            let id = EntityId::connection(name);
            let definition = entry.into_definition(id.clone())?;
            cache.insert(id, Rc::new(definition));
        }
        tracing::debug!(path = %path.display(), "Loaded connections");
        Ok(())
    }

    /// Every entity the catalog can serve, sorted.
    ///
    /// For a directory-backed catalog this scans the story tree; the shared
    /// connections file contributes one entity per key and is not itself an
    /// entity.
    pub fn scan(&self) -> Result<Vec<EntityId>, CatalogError> {
        let mut ids: Vec<EntityId> = self.cache.borrow().keys().cloned().collect();

        if let Some(root) = &self.root {
            for kind in EntityKind::ALL {
                if kind == EntityKind::Connection {
                    continue;
                }
                for name in json_stems(&root.join(kind.as_str()))? {
                    if kind == EntityKind::Location && name == CONNECTIONS_FILE {
                        continue;
                    }
                    ids.push(EntityId::new(kind, name));
                }
            }

            self.load_connections(root)?;
            ids.extend(
                self.cache
                    .borrow()
                    .keys()
                    .filter(|id| id.kind == EntityKind::Connection)
                    .cloned(),
            );
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// The shared player profile; empty when the story has none.
    pub fn player(&self) -> Result<PlayerProfile, CatalogError> {
        let Some(root) = &self.root else {
            return Ok(PlayerProfile::default());
        };
        let path = root.join(PLAYER_FILE);
        if !path.is_file() {
            return Ok(PlayerProfile::default());
        }
        let contents = read_file(&path)?;
        serde_json::from_str(&contents).map_err(|source| CatalogError::Json { path, source })
    }
}

fn read_file(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// File stems of all `.json` files directly inside `dir`.
fn json_stems(dir: &Path) -> Result<Vec<String>, CatalogError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let io_error = |source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut stems = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_string());
        }
    }
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::script::Step;

    const HICCUP: &str = r#"{
        "name": "Hiccup",
        "location": "berk_square",
        "menu_lines": ["Hey."],
        "option_menus": [{"text": "Tell me about dragons", "state": "dragons"}],
        "variables": {"trust": 1},
        "states": {
            "dragons": {
                "steps": [{"type": "dialogue", "speaker": "hiccup", "text": "They're misunderstood."}],
                "transitions": [{"condition": "true", "target": "dragons"}]
            }
        }
    }"#;

    #[test]
    fn parse_character_definition() {
        let def = parse_definition(EntityId::character("hiccup"), HICCUP).unwrap();
        assert_eq!(def.name, "Hiccup");
        assert_eq!(def.location(), Some("berk_square"));
        assert_eq!(def.variables["trust"], Value::Int(1));
        assert!(matches!(
            def.states["dragons"].steps[0],
            Step::Dialogue { ref speaker, .. } if speaker == "hiccup"
        ));
    }

    #[test]
    fn unknown_transition_target_is_schema_error() {
        let json = r#"{"states": {"a": {
            "steps": [{"type": "story", "text": "x"}],
            "transitions": [{"condition": "true", "target": "nowhere"}]
        }}}"#;
        let err = parse_definition(EntityId::location("cove"), json).unwrap_err();
        assert!(matches!(err, CatalogError::Schema { .. }), "{}", err);
    }

    #[test]
    fn init_without_opening_state_is_schema_error() {
        let id = EntityId::new(EntityKind::Init, "prologue");
        let json = r#"{"states": {"intro": {"steps": [{"type": "story", "text": "x"}]}}}"#;
        let err = parse_definition(id.clone(), json).unwrap_err();
        assert!(matches!(err, CatalogError::Schema { .. }), "{}", err);

        let idle = r#"{"states": {"idle": {"steps": [{"type": "story", "text": "x"}]}}}"#;
        assert!(parse_definition(id, idle).is_ok());
    }

    #[test]
    fn quest_requires_start_fields() {
        let json = r#"{"start_line": "Help!", "states": {"go": {"steps": [{"type": "story", "text": "x"}]}}}"#;
        let err = parse_definition(EntityId::quest("rescue"), json).unwrap_err();
        match err {
            CatalogError::Schema { message, .. } => assert!(message.contains("start_state")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn quest_owner_accepts_legacy_field_and_kind_prefix() {
        let base = |owner_field: &str| {
            format!(
                r#"{{"{}", "start_condition": "true", "start_line": "Go", "start_state": "go",
                    "states": {{"go": {{"steps": [{{"type": "story", "text": "x"}}]}}}}}}"#,
                owner_field
            )
        };
        let def = parse_definition(
            EntityId::quest("a"),
            &base(r#"start_character": "stoick"#),
        )
        .unwrap();
        assert!(matches!(def.body, EntityBody::Quest { ref start_entity, .. }
            if *start_entity == EntityId::character("stoick")));

        let def = parse_definition(
            EntityId::quest("b"),
            &base(r#"start_entity": "location:forge"#),
        )
        .unwrap();
        assert!(matches!(def.body, EntityBody::Quest { ref start_entity, .. }
            if *start_entity == EntityId::location("forge")));
    }

    #[test]
    fn dialogue_without_speaker_fails_at_load() {
        let json = r#"{"states": {"a": {"steps": [{"type": "dialogue", "text": "?"}]}}}"#;
        assert!(matches!(
            parse_definition(EntityId::character("x"), json),
            Err(CatalogError::Json { .. })
        ));
    }

    #[test]
    fn characters_accepts_object_keys() {
        let json = r#"{"characters": {"toothless": {}, "astrid": {}}}"#;
        let def = parse_definition(EntityId::location("cove"), json).unwrap();
        assert_eq!(def.characters, vec!["astrid".to_string(), "toothless".to_string()]);
    }

    #[test]
    fn in_memory_catalog_not_found() {
        let catalog = Catalog::in_memory();
        assert!(matches!(
            catalog.load(&EntityId::character("nobody")),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn in_memory_insert_and_load() {
        let mut catalog = Catalog::in_memory();
        catalog
            .insert_json(EntityId::character("hiccup"), HICCUP)
            .unwrap();
        let def = catalog.load(&EntityId::character("hiccup")).unwrap();
        assert_eq!(def.name, "Hiccup");
        assert_eq!(catalog.scan().unwrap(), vec![EntityId::character("hiccup")]);
        assert!(catalog.player().unwrap().farewells().is_empty());
    }
}
