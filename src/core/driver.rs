/// State machine driver: the frame loop that walks the navigation stack.
///
/// Each frame presents the entity on top of the stack through a `Renderer`,
/// applies whatever the player picked, then advances or transitions the
/// entity's script.
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::catalog::{Catalog, CatalogError, PlayerProfile};
use crate::core::evaluator::{self, Command, EvalError};
use crate::core::menu::{MenuBuilder, Presentation, PresentedOption};
use crate::core::runtime::{RuntimeContext, RuntimeError};
use crate::core::save::{SaveError, SaveFile};
use crate::core::stack::StackError;
use crate::schema::action::Action;
use crate::schema::entity::{EntityId, EntityKind};
use crate::schema::script::RetrospectiveKind;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{entity} finished state '{state}' and no transition matched")]
    DeadEndTransition { entity: EntityId, state: String },
    #[error("selection {index} is out of range for {count} options")]
    InvalidSelection { index: usize, count: usize },
    #[error("{0} has no options to offer")]
    NoOptions(EntityId),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("effect error: {0}")]
    Eval(#[from] EvalError),
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("save error: {0}")]
    Save(#[from] SaveError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RenderError(pub String);

impl From<std::io::Error> for RenderError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// What the player did with a list of options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Index(usize),
    Quit,
}

/// The presentation boundary. Implementations own all terminal or GUI work.
pub trait Renderer {
    fn present_story(&mut self, text: &str) -> Result<(), RenderError>;
    fn present_dialogue(&mut self, speaker: &str, text: &str) -> Result<(), RenderError>;
    /// Blocks until the player picks one of `options` or quits.
    fn present_options(&mut self, options: &[String]) -> Result<Selection, RenderError>;
    fn clear_screen(&mut self) -> Result<(), RenderError>;
}

/// Outcome of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
    Quit,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The navigation stack ran empty.
    Finished,
    /// The player asked to stop.
    Quit,
}

/// What applying an effect did to the entity that ran it.
#[derive(Debug, Clone, Copy, Default)]
struct Applied {
    state_changed: bool,
    popped: bool,
}

/// The game session. Built via `Driver::builder()`.
pub struct Driver {
    catalog: Catalog,
    context: RuntimeContext,
    profile: PlayerProfile,
    save: SaveFile,
    save_path: Option<PathBuf>,
    rng: StdRng,
    last_top: Option<EntityId>,
}

/// Builder for constructing a `Driver`.
pub struct DriverBuilder {
    story_dir: Option<PathBuf>,
    catalog: Option<Catalog>,
    profile: Option<PlayerProfile>,
    save: Option<SaveFile>,
    save_path: Option<PathBuf>,
    seed: Option<u64>,
    preload: bool,
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder {
            story_dir: None,
            catalog: None,
            profile: None,
            save: None,
            save_path: None,
            seed: None,
            preload: true,
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The name the player's own lines are spoken under.
    pub fn player_name(&self) -> String {
        if !self.save.name.is_empty() {
            self.save.name.clone()
        } else {
            self.profile.name.clone().unwrap_or_else(|| "You".to_string())
        }
    }

    /// The current session as a save document.
    pub fn snapshot(&self) -> SaveFile {
        self.save.capture(&self.context)
    }

    /// Write the session to the save path, if one is set.
    pub fn persist(&self) -> Result<(), DriverError> {
        if let Some(path) = &self.save_path {
            self.snapshot().write(path)?;
        }
        Ok(())
    }

    /// Run frames until the stack empties or the player quits, then persist.
    pub fn run(&mut self, renderer: &mut dyn Renderer) -> Result<SessionEnd, DriverError> {
        let end = loop {
            match self.frame(renderer)? {
                Flow::Continue => {}
                Flow::Finished => break SessionEnd::Finished,
                Flow::Quit => break SessionEnd::Quit,
            }
        };
        self.persist()?;
        tracing::info!(?end, "Session ended");
        Ok(end)
    }

    /// Run one frame for the entity on top of the stack.
    pub fn frame(&mut self, renderer: &mut dyn Renderer) -> Result<Flow, DriverError> {
        let Some(id) = self.context.stack.top().cloned() else {
            return Ok(Flow::Finished);
        };
        self.context
            .store
            .ensure_loaded(&self.catalog, &id, &mut self.rng)?;

        if self.last_top.as_ref() != Some(&id) {
            renderer.clear_screen()?;
            self.last_top = Some(id.clone());
        }

        let player_name = self.player_name();
        let presentation = MenuBuilder::new(&self.context.store, &self.profile, &player_name)
            .build(&id, &mut self.rng)?;
        {
            let runtime = self.context.store.get(&id)?;
            tracing::debug!(entity = %id, state = %runtime.state, step = runtime.step, "Frame");
        }

        let applied = match presentation {
            Presentation::CharacterMenu {
                speaker,
                line,
                options,
            } => {
                if let Some(line) = line {
                    renderer.present_dialogue(&speaker, &line)?;
                }
                return self.menu_choice(&id, renderer, options);
            }
            Presentation::LocationMenu { ambient, options } => {
                if let Some(ambient) = ambient {
                    renderer.present_story(&ambient)?;
                }
                return self.menu_choice(&id, renderer, options);
            }
            Presentation::Deceased { speaker, line } => {
                renderer.present_dialogue(&speaker, &line)?;
                self.context.stack.pop_entity(&id)?;
                return Ok(Flow::Continue);
            }
            Presentation::Travel {
                connection,
                destination,
            } => {
                self.context.stack.pop_entity(&connection)?;
                self.context
                    .enter(&self.catalog, &destination, false, &mut self.rng)?;
                tracing::debug!(from = %connection, to = %destination, "Travelled");
                return Ok(Flow::Continue);
            }
            Presentation::Story { text } => {
                renderer.present_story(&text)?;
                Applied::default()
            }
            Presentation::Dialogue {
                speaker,
                text,
                options,
            } => {
                renderer.present_dialogue(&speaker, &text)?;
                if options.is_empty() {
                    Applied::default()
                } else {
                    match self.choose(renderer, options)? {
                        Some(option) => self.select(&id, renderer, option)?,
                        None => return Ok(Flow::Quit),
                    }
                }
            }
            Presentation::StateUpdate { update } => self.apply(&id, &update)?,
        };

        self.finish_step(&id, applied)?;
        Ok(Flow::Continue)
    }

    fn menu_choice(
        &mut self,
        id: &EntityId,
        renderer: &mut dyn Renderer,
        options: Vec<PresentedOption>,
    ) -> Result<Flow, DriverError> {
        if options.is_empty() {
            return Err(DriverError::NoOptions(id.clone()));
        }
        match self.choose(renderer, options)? {
            Some(option) => {
                self.select(id, renderer, option)?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Quit),
        }
    }

    /// Ask the renderer for a pick. `None` means the player quit.
    fn choose(
        &mut self,
        renderer: &mut dyn Renderer,
        mut options: Vec<PresentedOption>,
    ) -> Result<Option<PresentedOption>, DriverError> {
        let texts: Vec<String> = options.iter().map(|o| o.text.clone()).collect();
        match renderer.present_options(&texts)? {
            Selection::Quit => Ok(None),
            Selection::Index(index) if index < options.len() => Ok(Some(options.swap_remove(index))),
            Selection::Index(index) => Err(DriverError::InvalidSelection {
                index,
                count: options.len(),
            }),
        }
    }

    /// Echo the option's retrospective line, then apply its effect.
    fn select(
        &mut self,
        actor: &EntityId,
        renderer: &mut dyn Renderer,
        option: PresentedOption,
    ) -> Result<Applied, DriverError> {
        if let Some(retrospective) = &option.retrospective {
            match retrospective.kind {
                RetrospectiveKind::Story => renderer.present_story(&retrospective.line)?,
                RetrospectiveKind::Dialogue => {
                    renderer.present_dialogue(&self.player_name(), &retrospective.line)?
                }
                RetrospectiveKind::Skip => {}
            }
        }
        match &option.effect {
            Some(effect) => self.apply(actor, effect),
            None => Ok(Applied::default()),
        }
    }

    /// Run an effect for `actor`, write its variables back and carry out its
    /// control commands in order.
    fn apply(&mut self, actor: &EntityId, action: &Action) -> Result<Applied, DriverError> {
        let effect = evaluator::run(&self.context.store, actor, action)?;
        self.check_commands(&effect.commands)?;
        let commands = evaluator::commit(&mut self.context.store, effect)?;

        let mut applied = Applied::default();
        for command in commands {
            match command {
                Command::SetState { entity, state } => {
                    self.context.store.set_state(&entity, &state)?;
                    applied.state_changed |= entity == *actor;
                }
                Command::Push { entity, reopen } => {
                    self.context
                        .enter(&self.catalog, &entity, reopen, &mut self.rng)?;
                    applied.state_changed |= reopen && entity == *actor;
                }
                Command::Pop => {
                    let popped = self.context.stack.pop()?;
                    applied.popped |= popped == *actor;
                }
            }
        }
        tracing::debug!(entity = %actor, ?applied, "Applied effect");
        Ok(applied)
    }

    /// Make sure every command can be carried out before anything is written:
    /// pushed entities must load and pops must not run past the bottom.
    fn check_commands(&mut self, commands: &[Command]) -> Result<(), DriverError> {
        let mut depth = self.context.stack.len();
        for command in commands {
            match command {
                Command::Push { entity, .. } => {
                    self.context
                        .store
                        .ensure_loaded(&self.catalog, entity, &mut self.rng)?;
                    depth += 1;
                }
                Command::Pop => {
                    depth = depth.checked_sub(1).ok_or(StackError::Underflow)?;
                }
                Command::SetState { .. } => {}
            }
        }
        Ok(())
    }

    /// Advance within the script, or leave the state once it is exhausted.
    fn finish_step(&mut self, id: &EntityId, applied: Applied) -> Result<(), DriverError> {
        if applied.state_changed {
            return Ok(());
        }

        let definition = self.context.store.definition(id)?;
        let runtime = self.context.store.get(id)?;
        let Some(state) = definition.state(&runtime.state) else {
            return Ok(());
        };

        if runtime.step < state.last_step() {
            self.context.store.advance_step(id)?;
            return Ok(());
        }
        if applied.popped {
            return Ok(());
        }

        if id.kind == EntityKind::Quest
            && runtime.quest_status().is_some_and(|status| status.is_finished())
        {
            tracing::info!(quest = %id, status = ?runtime.quest_status(), "Quest finished");
            self.context.stack.pop_entity(id)?;
            return Ok(());
        }

        for transition in &state.transitions {
            if evaluator::check(&self.context.store, id, &transition.condition)? {
                let target = transition.target.clone();
                self.context.store.set_state(id, &target)?;
                return Ok(());
            }
        }

        Err(DriverError::DeadEndTransition {
            entity: id.clone(),
            state: runtime.state.clone(),
        })
    }
}

impl DriverBuilder {
    /// Read content from a story directory.
    pub fn story_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.story_dir = Some(path.into());
        self
    }

    /// Provide a catalog directly (for testing without files).
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Provide the player profile directly instead of reading `player.json`.
    pub fn with_profile(mut self, profile: PlayerProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// The save to resume from: player fields, entity states and stack.
    pub fn save(mut self, save: SaveFile) -> Self {
        self.save = Some(save);
        self
    }

    /// Where `run` writes the session when it ends.
    pub fn save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Load every entity up front so indexes are complete from the first
    /// frame. On by default.
    pub fn preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn build(self) -> Result<Driver, DriverError> {
        let catalog = match (self.catalog, self.story_dir) {
            (Some(catalog), _) => catalog,
            (None, Some(dir)) => Catalog::open(dir),
            (None, None) => Catalog::in_memory(),
        };
        let profile = match self.profile {
            Some(profile) => profile,
            None => catalog.player()?,
        };
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut context = RuntimeContext::new();
        if self.preload {
            context.preload(&catalog, &mut rng)?;
        }
        let save = self.save.unwrap_or_default();
        save.restore(&mut context, &catalog, &mut rng)?;

        Ok(Driver {
            catalog,
            context,
            profile,
            save,
            save_path: self.save_path,
            rng,
            last_top: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned selections and records everything shown.
    #[derive(Default)]
    struct Script {
        picks: VecDeque<Selection>,
        shown: Vec<String>,
        clears: usize,
    }

    impl Renderer for Script {
        fn present_story(&mut self, text: &str) -> Result<(), RenderError> {
            self.shown.push(text.to_string());
            Ok(())
        }

        fn present_dialogue(&mut self, speaker: &str, text: &str) -> Result<(), RenderError> {
            self.shown.push(format!("{}: {}", speaker, text));
            Ok(())
        }

        fn present_options(&mut self, options: &[String]) -> Result<Selection, RenderError> {
            self.shown.push(format!("[{}]", options.join(" | ")));
            self.picks
                .pop_front()
                .ok_or_else(|| RenderError("out of picks".to_string()))
        }

        fn clear_screen(&mut self) -> Result<(), RenderError> {
            self.clears += 1;
            Ok(())
        }
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::in_memory();
        catalog
            .insert_json(
                EntityId::character("valka"),
                r#"{"name": "Valka", "location": "sanctuary", "menu_lines": ["Hello, son."],
                    "option_menus": [{"text": "Tell me about dragons", "state": "lore"}],
                    "variables": {"told": 0},
                    "states": {"lore": {
                        "steps": [
                            {"type": "dialogue", "speaker": "valka", "text": "They are kind."},
                            {"type": "stateUpdate", "update": "character_told = character_told + 1"}
                        ],
                        "transitions": [{"condition": "character_told > 0", "target": "__menu__"}]
                    }}}"#,
            )
            .unwrap();
        catalog
            .insert_json(EntityId::location("sanctuary"), r#"{"ambient": ["Ice glitters."]}"#)
            .unwrap();
        catalog
            .insert_json(
                EntityId::new(EntityKind::Init, "haunting"),
                r#"{"opening_states": ["summon"], "variables": {"n": 0},
                    "states": {"summon": {"steps": [
                        {"type": "stateUpdate", "update": "init_n = 5; push character:ghost"}
                    ]}}}"#,
            )
            .unwrap();
        catalog
            .insert_json(
                EntityId::new(EntityKind::Init, "overreach"),
                r#"{"opening_states": ["leave"], "variables": {"n": 0},
                    "states": {"leave": {"steps": [
                        {"type": "stateUpdate", "update": "init_n = 5; pop; pop"}
                    ]}}}"#,
            )
            .unwrap();
        catalog
    }

    fn driver(stack: Vec<EntityId>) -> Driver {
        Driver::builder()
            .with_catalog(catalog())
            .with_profile(PlayerProfile::default())
            .save(SaveFile::new_player("Hiccup", "Hiccup Haddock", stack))
            .seed(42)
            .build()
            .unwrap()
    }

    #[test]
    fn empty_stack_finishes() {
        let mut driver = driver(Vec::new());
        let mut script = Script::default();
        assert_eq!(driver.run(&mut script).unwrap(), SessionEnd::Finished);
    }

    #[test]
    fn menu_state_script_and_transition() {
        let valka = EntityId::character("valka");
        let mut driver = driver(vec![valka.clone()]);
        let mut script = Script::default();
        script.picks.push_back(Selection::Index(0));

        // menu: pick the lore entry
        assert_eq!(driver.frame(&mut script).unwrap(), Flow::Continue);
        assert_eq!(driver.context().store.get(&valka).unwrap().state, "lore");
        assert_eq!(driver.context().store.get(&valka).unwrap().step, 0);

        // first step advances
        driver.frame(&mut script).unwrap();
        assert_eq!(driver.context().store.get(&valka).unwrap().step, 1);

        // last step runs the update then transitions back to the menu
        driver.frame(&mut script).unwrap();
        let state = driver.context().store.get(&valka).unwrap();
        assert_eq!(state.state, "__menu__");
        assert_eq!(state.step, 0);
        assert_eq!(state.variables["told"], crate::schema::entity::Value::Int(1));

        assert_eq!(script.clears, 1);
        assert_eq!(
            script.shown,
            vec![
                "Valka: Hello, son.",
                "[Tell me about dragons | Farewell, Valka.]",
                "Valka: They are kind.",
            ]
        );
    }

    #[test]
    fn invalid_selection_is_an_error() {
        let mut driver = driver(vec![EntityId::location("sanctuary")]);
        let mut script = Script::default();
        script.picks.push_back(Selection::Index(5));
        assert!(matches!(
            driver.frame(&mut script),
            Err(DriverError::InvalidSelection { index: 5, count: 1 })
        ));
    }

    #[test]
    fn quit_stops_without_applying() {
        let valka = EntityId::character("valka");
        let mut driver = driver(vec![valka.clone()]);
        let mut script = Script::default();
        script.picks.push_back(Selection::Quit);
        assert_eq!(driver.run(&mut script).unwrap(), SessionEnd::Quit);
        assert_eq!(driver.context().store.get(&valka).unwrap().state, "__menu__");
        assert_eq!(driver.context().stack.len(), 1);
    }

    #[test]
    fn farewell_pops_back_to_location() {
        let mut driver = driver(vec![EntityId::location("sanctuary")]);
        let mut script = Script::default();
        // talk to valka, then say farewell
        script.picks.push_back(Selection::Index(0));
        script.picks.push_back(Selection::Index(1));
        driver.frame(&mut script).unwrap();
        assert_eq!(driver.context().stack.top(), Some(&EntityId::character("valka")));
        driver.frame(&mut script).unwrap();
        assert_eq!(driver.context().stack.top(), Some(&EntityId::location("sanctuary")));
        assert_eq!(script.clears, 2);
    }

    #[test]
    fn unknown_push_target_writes_nothing() {
        let haunting = EntityId::new(EntityKind::Init, "haunting");
        let mut driver = driver(vec![haunting.clone()]);
        let mut script = Script::default();
        assert!(matches!(
            driver.frame(&mut script),
            Err(DriverError::Runtime(RuntimeError::Catalog(CatalogError::NotFound(_))))
        ));
        let state = driver.context().store.get(&haunting).unwrap();
        assert_eq!(state.variables["n"], crate::schema::entity::Value::Int(0));
        assert_eq!(driver.context().stack.len(), 1);
    }

    #[test]
    fn popping_past_the_bottom_writes_nothing() {
        let overreach = EntityId::new(EntityKind::Init, "overreach");
        let mut driver = driver(vec![overreach.clone()]);
        let mut script = Script::default();
        assert!(matches!(
            driver.frame(&mut script),
            Err(DriverError::Stack(StackError::Underflow))
        ));
        let state = driver.context().store.get(&overreach).unwrap();
        assert_eq!(state.variables["n"], crate::schema::entity::Value::Int(0));
        assert_eq!(driver.context().stack.top(), Some(&overreach));
    }
}
