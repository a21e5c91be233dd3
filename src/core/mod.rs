pub mod catalog;
pub mod driver;
pub mod evaluator;
pub mod expr;
pub mod menu;
pub mod runtime;
pub mod save;
pub mod stack;
