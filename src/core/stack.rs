/// Navigation stack: the last-in-first-out list of active entities.
use thiserror::Error;

use crate::schema::entity::EntityId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("navigation stack underflow")]
    Underflow,
    #[error("expected {expected} on top of the stack, found {found:?}")]
    NotOnTop {
        expected: EntityId,
        found: Option<EntityId>,
    },
}

/// The top entry is the current scene; an empty stack ends the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationStack {
    entries: Vec<EntityId>,
}

impl NavigationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: EntityId) {
        self.entries.push(id);
    }

    pub fn pop(&mut self) -> Result<EntityId, StackError> {
        self.entries.pop().ok_or(StackError::Underflow)
    }

    /// Pop `id`, failing if something else is on top.
    pub fn pop_entity(&mut self, id: &EntityId) -> Result<(), StackError> {
        match self.entries.last() {
            Some(top) if top == id => {
                self.entries.pop();
                Ok(())
            }
            found => Err(StackError::NotOnTop {
                expected: id.clone(),
                found: found.cloned(),
            }),
        }
    }

    pub fn top(&self) -> Option<&EntityId> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.iter()
    }
}

impl FromIterator<EntityId> for NavigationStack {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_returns_same() {
        let mut stack = NavigationStack::new();
        stack.push(EntityId::location("berk_square"));
        stack.push(EntityId::character("astrid"));
        assert_eq!(stack.top(), Some(&EntityId::character("astrid")));
        assert_eq!(stack.pop().unwrap(), EntityId::character("astrid"));
        assert_eq!(stack.pop().unwrap(), EntityId::location("berk_square"));
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_empty_underflows() {
        let mut stack = NavigationStack::new();
        assert_eq!(stack.pop(), Err(StackError::Underflow));
        assert_eq!(stack.top(), None);
    }

    #[test]
    fn pop_entity_checks_top() {
        let mut stack: NavigationStack =
            [EntityId::location("cove"), EntityId::quest("rescue")].into_iter().collect();

        let err = stack.pop_entity(&EntityId::location("cove")).unwrap_err();
        assert!(matches!(err, StackError::NotOnTop { .. }));
        assert_eq!(stack.len(), 2);

        stack.pop_entity(&EntityId::quest("rescue")).unwrap();
        assert_eq!(stack.iter().cloned().collect::<Vec<_>>(), vec![EntityId::location("cove")]);
    }
}
