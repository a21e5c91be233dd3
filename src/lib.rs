//! Narrative Runtime: a stack-driven state machine for story games.
//!
//! Story content is declarative JSON: characters, locations, quests,
//! connections and init screens, each with scripted states, menus and small
//! effects. The driver walks a navigation stack of these entities, shows each
//! frame through a `Renderer` and applies the player's choices.

pub mod config;
pub mod core;
pub mod schema;

pub use crate::config::GameConfig;
pub use crate::core::catalog::Catalog;
pub use crate::core::driver::{Driver, Renderer, Selection, SessionEnd};
pub use crate::core::save::SaveFile;
pub use crate::schema::entity::{EntityId, EntityKind, Value};
