/// Dialogue/option builder: decides what one frame shows for an entity.
///
/// Building never mutates runtime state; randomness for line picks comes in
/// through the caller's RNG.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::core::catalog::PlayerProfile;
use crate::core::evaluator::{self, EvalError};
use crate::core::runtime::{RuntimeError, RuntimeStore};
use crate::schema::action::{Action, Expr};
use crate::schema::entity::{
    EntityBody, EntityDefinition, EntityId, EntityKind, QuestStatus, MENU_STATE, QUEST_STATUS_VAR,
};
use crate::schema::script::{MenuOption, Retrospective, Step};

/// Speaker name in content that stands for the player.
pub const PLAYER_SPEAKER: &str = "player";

const DEFAULT_FAREWELL: &str = "Farewell, {character_name}.";

/// An option as offered to the player.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedOption {
    pub text: String,
    pub effect: Option<Action>,
    pub retrospective: Option<Retrospective>,
}

impl PresentedOption {
    pub fn new(text: impl Into<String>, effect: Action) -> Self {
        Self {
            text: text.into(),
            effect: Some(effect),
            retrospective: None,
        }
    }
}

impl From<&MenuOption> for PresentedOption {
    fn from(option: &MenuOption) -> Self {
        Self {
            text: option.text.clone(),
            effect: option.effect.clone(),
            retrospective: option.retrospective.clone(),
        }
    }
}

/// What one frame presents for the entity on top of the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Presentation {
    CharacterMenu {
        speaker: String,
        line: Option<String>,
        options: Vec<PresentedOption>,
    },
    LocationMenu {
        ambient: Option<String>,
        options: Vec<PresentedOption>,
    },
    /// A dead character: show the line, then leave.
    Deceased { speaker: String, line: String },
    /// A connection in its menu state moves straight on to `destination`.
    Travel {
        connection: EntityId,
        destination: EntityId,
    },
    Story {
        text: String,
    },
    Dialogue {
        speaker: String,
        text: String,
        options: Vec<PresentedOption>,
    },
    StateUpdate {
        update: Action,
    },
}

/// Read-only view over the pieces a frame is built from.
pub struct MenuBuilder<'a> {
    store: &'a RuntimeStore,
    profile: &'a PlayerProfile,
    player_name: &'a str,
}

impl<'a> MenuBuilder<'a> {
    pub fn new(store: &'a RuntimeStore, profile: &'a PlayerProfile, player_name: &'a str) -> Self {
        Self {
            store,
            profile,
            player_name,
        }
    }

    pub fn build(&self, id: &EntityId, rng: &mut StdRng) -> Result<Presentation, EvalError> {
        let definition = self.store.definition(id)?;
        let runtime = self.store.get(id)?;

        if runtime.state == MENU_STATE && id.kind.has_menu() {
            return self.menu(&definition, rng);
        }

        let state = definition
            .state(&runtime.state)
            .ok_or_else(|| RuntimeError::UnknownState {
                entity: id.clone(),
                state: runtime.state.clone(),
            })?;
        let step = state
            .steps
            .get(runtime.step)
            .ok_or_else(|| RuntimeError::StepOutOfRange {
                entity: id.clone(),
                state: runtime.state.clone(),
                step: runtime.step,
            })?;

        Ok(match step {
            Step::Story { text } => Presentation::Story { text: text.clone() },
            Step::Dialogue {
                speaker,
                text,
                choices,
            } => Presentation::Dialogue {
                speaker: self.speaker_name(speaker),
                text: text.clone(),
                options: choices.iter().map(PresentedOption::from).collect(),
            },
            Step::StateUpdate { update } => Presentation::StateUpdate {
                update: update.clone(),
            },
        })
    }

    fn menu(&self, definition: &EntityDefinition, rng: &mut StdRng) -> Result<Presentation, EvalError> {
        let id = &definition.id;
        match &definition.body {
            EntityBody::Character {
                menu_lines,
                option_menus,
                ..
            } => {
                if let Some(line) = self.store.get(id)?.death_message() {
                    return Ok(Presentation::Deceased {
                        speaker: definition.name.clone(),
                        line: line.to_string(),
                    });
                }

                let mut options: Vec<PresentedOption> = option_menus
                    .iter()
                    .map(|option| menu_option(id, option))
                    .collect();
                options.extend(self.quest_options(id)?);
                options.push(self.farewell(definition, rng));

                Ok(Presentation::CharacterMenu {
                    speaker: definition.name.clone(),
                    line: menu_lines.choose(rng).cloned(),
                    options,
                })
            }
            EntityBody::Location { ambient } => {
                let mut options = self.quest_options(id)?;
                for character in self.store.characters_at(&id.name) {
                    let name = self.store.definition(character)?.name.clone();
                    options.push(PresentedOption::new(
                        format!("Talk to {}", name),
                        Action::PushEntity {
                            entity: character.clone(),
                            reopen: true,
                        },
                    ));
                }
                for connection in self.store.travel_paths(id) {
                    if let EntityBody::Connection { action, .. } =
                        &self.store.definition(connection)?.body
                    {
                        options.push(PresentedOption::new(
                            action.clone(),
                            Action::PushEntity {
                                entity: connection.clone(),
                                reopen: false,
                            },
                        ));
                    }
                }

                Ok(Presentation::LocationMenu {
                    ambient: ambient.choose(rng).cloned(),
                    options,
                })
            }
            EntityBody::Connection { to, .. } => Ok(Presentation::Travel {
                connection: id.clone(),
                destination: EntityId::location(to.clone()),
            }),
            EntityBody::Quest { .. } | EntityBody::Init => Err(RuntimeError::UnknownState {
                entity: id.clone(),
                state: MENU_STATE.to_string(),
            }
            .into()),
        }
    }

    /// Start options for every eligible quest `owner` can trigger.
    pub fn quest_options(&self, owner: &EntityId) -> Result<Vec<PresentedOption>, EvalError> {
        let mut options = Vec::new();
        for quest in self.store.quests_for(owner) {
            if !quest_eligible(self.store, quest)? {
                continue;
            }
            let definition = self.store.definition(quest)?;
            if let EntityBody::Quest {
                start_line,
                start_state,
                ..
            } = &definition.body
            {
                options.push(PresentedOption::new(
                    start_line.clone(),
                    quest_start(quest, start_state),
                ));
            }
        }
        Ok(options)
    }

    fn farewell(&self, definition: &EntityDefinition, rng: &mut StdRng) -> PresentedOption {
        let template = self
            .profile
            .farewells()
            .choose(rng)
            .map(String::as_str)
            .unwrap_or(DEFAULT_FAREWELL);
        PresentedOption::new(
            template.replace("{character_name}", &definition.name),
            Action::PopEntity,
        )
    }

    /// Display name for a speaker written in content.
    pub fn speaker_name(&self, speaker: &str) -> String {
        if speaker == PLAYER_SPEAKER {
            return self.player_name.to_string();
        }
        self.store
            .definition(&EntityId::character(speaker))
            .map(|definition| definition.name.clone())
            .unwrap_or_else(|_| speaker.to_string())
    }
}

/// A character's own menu entry, rewritten to move the character into the
/// entry's state.
fn menu_option(owner: &EntityId, option: &MenuOption) -> PresentedOption {
    let mut presented = PresentedOption::from(option);
    if let Some(state) = &option.state {
        let goto = Action::SetState {
            target: Some(owner.clone()),
            state: state.clone(),
        };
        presented.effect = Some(match presented.effect.take() {
            Some(effect) => Action::Compound(vec![effect, goto]),
            None => goto,
        });
    }
    presented
}

/// A quest is offered while it is idle and its start condition holds.
pub fn quest_eligible(store: &RuntimeStore, quest: &EntityId) -> Result<bool, EvalError> {
    let runtime = store.get(quest)?;
    if runtime.quest_status() != Some(QuestStatus::Idle) {
        return Ok(false);
    }
    match &store.definition(quest)?.body {
        EntityBody::Quest {
            start_condition, ..
        } => evaluator::check(store, quest, start_condition),
        _ => Ok(false),
    }
}

/// The single effect that starts a quest: mark it in progress, move it to
/// its start state and push it.
pub fn quest_start(quest: &EntityId, start_state: &str) -> Action {
    debug_assert_eq!(quest.kind, EntityKind::Quest);
    Action::Compound(vec![
        Action::SetVariable {
            target: Some(quest.clone()),
            name: QUEST_STATUS_VAR.to_string(),
            value: Expr::literal(QuestStatus::InProgress.as_str()),
        },
        Action::SetState {
            target: Some(quest.clone()),
            state: start_state.to_string(),
        },
        Action::PushEntity {
            entity: quest.clone(),
            reopen: false,
        },
    ])
}
