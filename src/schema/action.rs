use serde::Deserialize;
use std::fmt;

use super::entity::{EntityId, EntityKind, Value};
use crate::core::expr::{parse_expr, parse_statements, ExprError};

/// Binary operators available to conditions and assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

/// A side-effect free expression over a variable scope.
///
/// Content writes expressions as strings (`quest_status == 'idle' and
/// hiccup_trust > 2`) or as bare JSON literals; both are parsed when the
/// definition is loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawExpr")]
pub enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(Value::String(s)) => write!(f, "'{}'", s),
            Self::Literal(v) => write!(f, "{}", v),
            Self::Var(name) => f.write_str(name),
            Self::Not(inner) => write!(f, "not {}", inner),
            Self::Neg(inner) => write!(f, "-{}", inner),
            Self::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpr {
    Text(String),
    Literal(Value),
}

impl TryFrom<RawExpr> for Expr {
    type Error = ExprError;

    fn try_from(raw: RawExpr) -> Result<Self, Self::Error> {
        match raw {
            RawExpr::Text(text) => parse_expr(&text),
            RawExpr::Literal(value) => Ok(Expr::Literal(value)),
        }
    }
}

/// The closed set of effects story content can trigger.
///
/// Untargeted writes go through the acting entity's scope; targeted writes
/// address another entity's variables or state directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawAction")]
pub enum Action {
    SetVariable {
        target: Option<EntityId>,
        name: String,
        value: Expr,
    },
    SetState {
        target: Option<EntityId>,
        state: String,
    },
    /// Push an entity onto the navigation stack. With `reopen`, its state is
    /// first reset to one of its opening states.
    PushEntity {
        entity: EntityId,
        reopen: bool,
    },
    PopEntity,
    Compound(Vec<Action>),
}

impl Action {
    /// Flatten nested compounds into the order their parts run in.
    pub fn parts(&self) -> Vec<&Action> {
        match self {
            Self::Compound(actions) => actions.iter().flat_map(|a| a.parts()).collect(),
            other => vec![other],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAction {
    Script(String),
    List(Vec<Action>),
    Tagged(TaggedAction),
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum TaggedAction {
    SetVariable {
        #[serde(default)]
        target: Option<String>,
        name: String,
        value: Expr,
    },
    SetState {
        #[serde(default)]
        target: Option<String>,
        state: String,
    },
    Push {
        entity: String,
        #[serde(default)]
        reopen: bool,
    },
    Enter {
        entity: String,
    },
    Pop,
    All {
        actions: Vec<Action>,
    },
}

fn parse_target(target: Option<String>) -> Result<Option<EntityId>, ExprError> {
    target
        .map(|t| t.parse::<EntityId>().map_err(ExprError::EntityRef))
        .transpose()
}

impl TryFrom<RawAction> for Action {
    type Error = ExprError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        match raw {
            RawAction::Script(text) => parse_statements(&text),
            RawAction::List(actions) => Ok(Action::Compound(actions)),
            RawAction::Tagged(tagged) => Ok(match tagged {
                TaggedAction::SetVariable {
                    target,
                    name,
                    value,
                } => Action::SetVariable {
                    target: parse_target(target)?,
                    name,
                    value,
                },
                TaggedAction::SetState { target, state } => Action::SetState {
                    target: parse_target(target)?,
                    state,
                },
                TaggedAction::Push { entity, reopen } => Action::PushEntity {
                    entity: EntityId::parse_ref(&entity, EntityKind::Character)
                        .map_err(ExprError::EntityRef)?,
                    reopen,
                },
                TaggedAction::Enter { entity } => Action::PushEntity {
                    entity: EntityId::parse_ref(&entity, EntityKind::Character)
                        .map_err(ExprError::EntityRef)?,
                    reopen: true,
                },
                TaggedAction::Pop => Action::PopEntity,
                TaggedAction::All { actions } => Action::Compound(actions),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_from_json_string_and_literal() {
        let e: Expr = serde_json::from_str(r#""quest_status == 'idle'""#).unwrap();
        assert!(matches!(e, Expr::Binary { op: BinaryOp::Eq, .. }));

        let e: Expr = serde_json::from_str("true").unwrap();
        assert_eq!(e, Expr::literal(true));
    }

    #[test]
    fn expr_parse_error_surfaces_as_json_error() {
        let result: Result<Expr, _> = serde_json::from_str(r#""a == ""#);
        assert!(result.is_err());
    }

    #[test]
    fn tagged_actions_deserialize() {
        let a: Action = serde_json::from_str(
            r#"{"action": "set_variable", "name": "hiccup_trust", "value": "hiccup_trust + 1"}"#,
        )
        .unwrap();
        assert!(matches!(a, Action::SetVariable { target: None, ref name, .. } if name == "hiccup_trust"));

        let a: Action = serde_json::from_str(
            r#"{"action": "set_state", "target": "quest:rescue", "state": "fight"}"#,
        )
        .unwrap();
        assert_eq!(
            a,
            Action::SetState {
                target: Some(EntityId::quest("rescue")),
                state: "fight".to_string(),
            }
        );

        let a: Action = serde_json::from_str(r#"{"action": "enter", "entity": "astrid"}"#).unwrap();
        assert_eq!(
            a,
            Action::PushEntity {
                entity: EntityId::character("astrid"),
                reopen: true,
            }
        );

        let a: Action = serde_json::from_str(r#"{"action": "pop"}"#).unwrap();
        assert_eq!(a, Action::PopEntity);
    }

    #[test]
    fn list_and_all_are_compound() {
        let a: Action =
            serde_json::from_str(r#"[{"action": "pop"}, "quest_status = 'failed'"]"#).unwrap();
        assert_eq!(a.parts().len(), 2);

        let b: Action = serde_json::from_str(
            r#"{"action": "all", "actions": [{"action": "pop"}, {"action": "pop"}]}"#,
        )
        .unwrap();
        assert_eq!(b.parts(), vec![&Action::PopEntity, &Action::PopEntity]);
    }

    #[test]
    fn expr_display_is_readable() {
        let e = Expr::binary(
            BinaryOp::And,
            Expr::Var("a".to_string()),
            Expr::Not(Box::new(Expr::literal("x"))),
        );
        assert_eq!(e.to_string(), "(a and not 'x')");
    }
}
