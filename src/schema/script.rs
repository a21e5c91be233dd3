use serde::Deserialize;

use super::action::{Action, Expr};

/// One named state of an entity: an ordered script plus the rules that move
/// the entity on once the script is exhausted.
#[derive(Debug, Clone, Deserialize)]
pub struct StateDef {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl StateDef {
    pub fn last_step(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

/// Moves an entity to `target` when `condition` holds at end of script.
#[derive(Debug, Clone, Deserialize)]
pub struct Transition {
    pub condition: Expr,
    pub target: String,
}

/// A single presentable or actionable unit of a state's script.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    Story {
        text: String,
    },
    Dialogue {
        speaker: String,
        text: String,
        #[serde(default)]
        choices: Vec<MenuOption>,
    },
    StateUpdate {
        update: Action,
    },
}

/// A player-selectable option.
#[derive(Debug, Clone, Deserialize)]
pub struct MenuOption {
    pub text: String,
    #[serde(default)]
    pub effect: Option<Action>,
    #[serde(default)]
    pub retrospective: Option<Retrospective>,
    /// Menu transition target; only meaningful in `option_menus`.
    #[serde(default)]
    pub state: Option<String>,
}

/// A line echoed back after the player picks an option.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Retrospective {
    #[serde(rename = "type")]
    pub kind: RetrospectiveKind,
    #[serde(default)]
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrospectiveKind {
    /// Narrated as story text.
    Story,
    /// Spoken by the player.
    Dialogue,
    Skip,
}
