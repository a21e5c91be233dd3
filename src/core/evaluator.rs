/// Effect evaluator: runs conditions and actions against an explicit scope
/// built from runtime state, and writes the results back.
///
/// Running an action never touches the store. It produces an `Effect`; only
/// `commit` writes variables back, so a failing action leaves no trace.
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use thiserror::Error;

use crate::core::expr::ExprError;
use crate::core::runtime::{RuntimeError, RuntimeStore};
use crate::schema::action::{Action, BinaryOp, Expr};
use crate::schema::entity::{EntityId, Value};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unbound variable '{0}'")]
    Unbound(String),
    #[error("type mismatch: {lhs} {op} {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in '{0}'")]
    Overflow(&'static str),
    #[error("parse error: {0}")]
    Parse(#[from] ExprError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Variables visible to one entity's effects, flattened to prefixed names.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: FxHashMap<String, Value>,
    origins: FxHashMap<String, (EntityId, String)>,
}

impl Scope {
    /// Bind the actor's variables as `<kind>_<var>` and each referenced
    /// character's as `<character>_<var>`.
    pub fn build(store: &RuntimeStore, actor: &EntityId) -> Result<Self, EvalError> {
        let mut scope = Self::default();
        let definition = store.definition(actor)?;

        for character in &definition.characters {
            let id = EntityId::character(character.clone());
            scope.bind(store, &id, character)?;
        }
        scope.bind(store, actor, actor.kind.as_str())?;
        Ok(scope)
    }

    fn bind(&mut self, store: &RuntimeStore, id: &EntityId, prefix: &str) -> Result<(), EvalError> {
        for (name, value) in &store.get(id)?.variables {
            let scoped = format!("{}_{}", prefix, name);
            self.values.insert(scoped.clone(), value.clone());
            self.origins.insert(scoped, (id.clone(), name.clone()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Assign to an already bound name, returning the variable it stands for.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(EntityId, String), EvalError> {
        match (self.values.get_mut(name), self.origins.get(name)) {
            (Some(slot), Some(origin)) => {
                *slot = value;
                Ok(origin.clone())
            }
            _ => Err(EvalError::Unbound(name.to_string())),
        }
    }

    /// Every scoped name `id`'s variable `name` is bound under.
    fn bound_names(&self, id: &EntityId, name: &str) -> Vec<String> {
        self.origins
            .iter()
            .filter(|(_, (origin, variable))| origin == id && variable == name)
            .map(|(scoped, _)| scoped.clone())
            .collect()
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::Unbound(name.clone())),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow("-")),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(EvalError::TypeMismatch {
                    op: "-",
                    lhs: "",
                    rhs: other.type_name(),
                }),
            },
            Expr::Binary { op: BinaryOp::And, lhs, rhs } => {
                Ok(Value::Bool(self.eval(lhs)?.is_truthy() && self.eval(rhs)?.is_truthy()))
            }
            Expr::Binary { op: BinaryOp::Or, lhs, rhs } => {
                Ok(Value::Bool(self.eval(lhs)?.is_truthy() || self.eval(rhs)?.is_truthy()))
            }
            Expr::Binary { op, lhs, rhs } => binary(*op, self.eval(lhs)?, self.eval(rhs)?),
        }
    }

    /// Evaluate a condition to its truthiness.
    pub fn test(&self, expr: &Expr) -> Result<bool, EvalError> {
        Ok(self.eval(expr)?.is_truthy())
    }
}

fn mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => as_float(lhs)?.partial_cmp(&as_float(rhs)?),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use BinaryOp::*;

    match op {
        // Values of unrelated types are simply unequal.
        Eq => Ok(Value::Bool(compare(&lhs, &rhs) == Some(Ordering::Equal) || lhs == rhs)),
        Ne => Ok(Value::Bool(!(compare(&lhs, &rhs) == Some(Ordering::Equal) || lhs == rhs))),
        Lt | Le | Gt | Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| mismatch(op, &lhs, &rhs))?;
            Ok(Value::Bool(match op {
                Lt => ordering == Ordering::Less,
                Le => ordering != Ordering::Greater,
                Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        Add | Sub | Mul => match (&lhs, &rhs) {
            (Value::String(a), Value::String(b)) if op == Add => {
                Ok(Value::String(format!("{}{}", a, b)))
            }
            (Value::Int(a), Value::Int(b)) => {
                let result = match op {
                    Add => a.checked_add(*b),
                    Sub => a.checked_sub(*b),
                    _ => a.checked_mul(*b),
                };
                result.map(Value::Int).ok_or(EvalError::Overflow(op.symbol()))
            }
            _ => {
                let (a, b) = as_float(&lhs)
                    .zip(as_float(&rhs))
                    .ok_or_else(|| mismatch(op, &lhs, &rhs))?;
                Ok(Value::Float(match op {
                    Add => a + b,
                    Sub => a - b,
                    _ => a * b,
                }))
            }
        },
        // Division always yields a float.
        Div => {
            let (a, b) = as_float(&lhs)
                .zip(as_float(&rhs))
                .ok_or_else(|| mismatch(op, &lhs, &rhs))?;
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::Float(a / b))
        }
        And => Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        Or => Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
    }
}

/// A control action collected while running an effect, applied by the
/// driver after the variables have been written back.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetState { entity: EntityId, state: String },
    Push { entity: EntityId, reopen: bool },
    Pop,
}

/// The validated result of running an action, not yet applied.
#[derive(Debug, Clone)]
pub struct Effect {
    /// Variable writes in program order.
    writes: Vec<(EntityId, String, Value)>,
    pub commands: Vec<Command>,
}

/// Run `action` on behalf of `actor`.
///
/// Assignments update the scope in order, so later parts of a compound see
/// earlier writes, targeted ones included. Any failure discards the whole
/// effect. Control commands are only collected; the caller checks them
/// against the stack before committing.
pub fn run(store: &RuntimeStore, actor: &EntityId, action: &Action) -> Result<Effect, EvalError> {
    let mut scope = Scope::build(store, actor)?;
    let mut effect = Effect {
        writes: Vec::new(),
        commands: Vec::new(),
    };

    for part in action.parts() {
        match part {
            Action::SetVariable {
                target: None,
                name,
                value,
            } => {
                let value = scope.eval(value)?;
                let (id, variable) = scope.assign(name, value.clone())?;
                effect.writes.push((id, variable, value));
            }
            Action::SetVariable {
                target: Some(target),
                name,
                value,
            } => {
                if store.get(target)?.variable(name).is_none() {
                    return Err(EvalError::Unbound(format!("{}.{}", target, name)));
                }
                let value = scope.eval(value)?;
                for scoped in scope.bound_names(target, name) {
                    scope.assign(&scoped, value.clone())?;
                }
                effect.writes.push((target.clone(), name.clone(), value));
            }
            Action::SetState { target, state } => {
                let entity = target.clone().unwrap_or_else(|| actor.clone());
                store.check_state(&entity, state)?;
                effect.commands.push(Command::SetState {
                    entity,
                    state: state.clone(),
                });
            }
            Action::PushEntity { entity, reopen } => effect.commands.push(Command::Push {
                entity: entity.clone(),
                reopen: *reopen,
            }),
            Action::PopEntity => effect.commands.push(Command::Pop),
            Action::Compound(_) => {}
        }
    }
    Ok(effect)
}

/// Write an effect's variables back into the store in program order and
/// hand over its control commands.
pub fn commit(store: &mut RuntimeStore, effect: Effect) -> Result<Vec<Command>, EvalError> {
    for (id, name, value) in effect.writes {
        store.set_variable(&id, &name, value)?;
    }
    Ok(effect.commands)
}

/// Evaluate a condition in `actor`'s scope.
pub fn check(store: &RuntimeStore, actor: &EntityId, condition: &Expr) -> Result<bool, EvalError> {
    Scope::build(store, actor)?.test(condition)
}
