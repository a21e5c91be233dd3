use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::action::Expr;
use super::script::{MenuOption, StateDef};

/// The kinds of story entity the runtime knows how to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Character,
    Location,
    Quest,
    Connection,
    Init,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        Self::Character,
        Self::Location,
        Self::Quest,
        Self::Connection,
        Self::Init,
    ];

    /// Directory name under the story root, also the variable prefix an
    /// entity's own variables are bound under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Location => "location",
            Self::Quest => "quest",
            Self::Connection => "connection",
            Self::Init => "init",
        }
    }

    /// Whether entities of this kind have a built-in `__menu__` presentation.
    pub fn has_menu(&self) -> bool {
        matches!(self, Self::Character | Self::Location | Self::Connection)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind '{}'", s))
    }
}

/// Universal key for catalog and runtime-state lookups.
///
/// Serializes as `{"type": kind, "name": name}`, the shape used in save
/// files. Displays and parses as `kind:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub name: String,
}

impl EntityId {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn character(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Character, name)
    }

    pub fn location(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Location, name)
    }

    pub fn quest(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Quest, name)
    }

    pub fn connection(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Connection, name)
    }

    /// Parse an entity reference written in content. A bare name is taken
    /// to be of `default_kind`.
    pub fn parse_ref(input: &str, default_kind: EntityKind) -> Result<Self, String> {
        match input.split_once(':') {
            Some(_) => input.parse(),
            None if input.is_empty() => Err("empty entity reference".to_string()),
            None => Ok(Self::new(default_kind, input)),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for EntityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| format!("expected kind:name, got '{}'", s))?;
        if name.is_empty() {
            return Err(format!("empty entity name in '{}'", s));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

/// A dynamic value stored in entity variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Null => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Null => "none",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => f.write_str(s),
            Self::Null => f.write_str("none"),
        }
    }
}

/// Reserved character variable holding a death message. A non-empty string
/// marks the character as dead.
pub const DEATH_MESSAGE_VAR: &str = "death_msg";

/// Reserved quest variable tracking the quest lifecycle.
pub const QUEST_STATUS_VAR: &str = "status";

/// Name of the built-in menu state for characters, locations and connections.
pub const MENU_STATE: &str = "__menu__";

/// Lifecycle of a quest as stored in its `status` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
}

impl QuestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "inprogress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "idle" => Some(Self::Idle),
            "inprogress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Immutable, validated definition of one story entity.
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    pub id: EntityId,
    /// Display name; falls back to the entity's code name.
    pub name: String,
    pub states: HashMap<String, StateDef>,
    pub opening_states: Vec<String>,
    /// Variable defaults merged under any persisted values.
    pub variables: HashMap<String, Value>,
    /// Characters whose variables are visible to this entity's effects.
    pub characters: Vec<String>,
    pub body: EntityBody,
}

/// Kind-specific part of a definition.
#[derive(Debug, Clone)]
pub enum EntityBody {
    Character {
        location: Option<String>,
        menu_lines: Vec<String>,
        option_menus: Vec<MenuOption>,
    },
    Location {
        ambient: Vec<String>,
    },
    Quest {
        start_condition: Expr,
        start_entity: EntityId,
        start_line: String,
        start_state: String,
    },
    Connection {
        from: String,
        to: String,
        action: String,
    },
    Init,
}

impl EntityDefinition {
    pub fn kind(&self) -> EntityKind {
        self.id.kind
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    /// The state an entity starts in when none was chosen for it.
    pub fn fallback_state(&self) -> &'static str {
        if self.kind().has_menu() {
            MENU_STATE
        } else {
            "idle"
        }
    }

    /// Location this entity belongs to, for characters with one.
    pub fn location(&self) -> Option<&str> {
        match &self.body {
            EntityBody::Character { location, .. } => location.as_deref(),
            _ => None,
        }
    }
}
