/// Expression and effect-statement parsing.
///
/// Conditions: `hiccup_trust >= 3 and not (quest_status == 'failed')`.
/// Effects: `hiccup_trust = hiccup_trust + 1; goto angry; push quest:rescue; pop`.

use thiserror::Error;

use crate::schema::action::{Action, BinaryOp, Expr};
use crate::schema::entity::{EntityId, EntityKind, Value};

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at column {column} of '{input}': {message}")]
    Parse {
        input: String,
        column: usize,
        message: String,
    },
    #[error("invalid entity reference: {0}")]
    EntityRef(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(&'static str),
}

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "(", ")", "=", ";", ":", "!",
];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    let error = |column: usize, message: String| ExprError::Parse {
        input: input.to_string(),
        column,
        message,
    };

    while i < len {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;

        if c.is_ascii_alphabetic() || c == '_' {
            while i < len && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        if c.is_ascii_digit() {
            let mut is_float = false;
            while i < len && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    if is_float {
                        return Err(error(i, "malformed number".to_string()));
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse()
                    .map(Token::Float)
                    .map_err(|_| error(start, format!("malformed number '{}'", text)))?
            } else {
                text.parse()
                    .map(Token::Int)
                    .map_err(|_| error(start, format!("integer out of range '{}'", text)))?
            };
            tokens.push((start, token));
            continue;
        }

        if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            while i < len && chars[i] != c {
                if chars[i] == '\\' && i + 1 < len {
                    i += 1;
                }
                text.push(chars[i]);
                i += 1;
            }
            if i >= len {
                return Err(error(start, "unterminated string".to_string()));
            }
            i += 1;
            tokens.push((start, Token::Str(text)));
            continue;
        }

        let rest: String = chars[i..len.min(i + 2)].iter().collect();
        match SYMBOLS.iter().find(|sym| rest.starts_with(**sym)) {
            Some(sym) => {
                i += sym.chars().count();
                tokens.push((start, Token::Sym(*sym)));
            }
            None => return Err(error(start, format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, ExprError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        let column = self
            .tokens
            .get(self.pos)
            .map(|(col, _)| *col)
            .unwrap_or_else(|| self.input.chars().count());
        ExprError::Parse {
            input: self.input.to_string(),
            column,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ExprError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") || self.eat_sym("||") {
            let rhs = self.and()?;
            lhs = Expr::binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") || self.eat_sym("&&") {
            let rhs = self.not()?;
            lhs = Expr::binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.eat_keyword("not") || self.eat_sym("!") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Some(Token::Sym("==")) => BinaryOp::Eq,
            Some(Token::Sym("!=")) => BinaryOp::Ne,
            Some(Token::Sym("<")) => BinaryOp::Lt,
            Some(Token::Sym("<=")) => BinaryOp::Le,
            Some(Token::Sym(">")) => BinaryOp::Gt,
            Some(Token::Sym(">=")) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        Ok(Expr::binary(op, lhs, rhs))
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat_sym("+") {
                BinaryOp::Add
            } else if self.eat_sym("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_sym("*") {
                BinaryOp::Mul
            } else if self.eat_sym("/") {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat_sym("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "none" | "None" | "null" => Expr::Literal(Value::Null),
                "and" | "or" | "not" => {
                    self.pos -= 1;
                    return Err(self.error(format!("unexpected keyword '{}'", name)));
                }
                _ => Expr::Var(name),
            }),
            Some(Token::Sym("(")) => {
                let inner = self.expr()?;
                if !self.eat_sym(")") {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.error("expected a value"))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn entity_ref(&mut self) -> Result<EntityId, ExprError> {
        let first = self.expect_ident("an entity")?;
        if self.eat_sym(":") {
            let name = self.expect_ident("an entity name")?;
            let kind: EntityKind = first.parse().map_err(ExprError::EntityRef)?;
            Ok(EntityId::new(kind, name))
        } else {
            Ok(EntityId::character(first))
        }
    }

    fn statement(&mut self) -> Result<Action, ExprError> {
        if self.eat_keyword("pop") {
            return Ok(Action::PopEntity);
        }
        if self.eat_keyword("push") {
            return Ok(Action::PushEntity {
                entity: self.entity_ref()?,
                reopen: false,
            });
        }
        if self.eat_keyword("enter") {
            return Ok(Action::PushEntity {
                entity: self.entity_ref()?,
                reopen: true,
            });
        }
        if self.eat_keyword("goto") {
            return Ok(Action::SetState {
                target: None,
                state: self.expect_ident("a state name")?,
            });
        }

        let name = self.expect_ident("a statement")?;
        if !self.eat_sym("=") {
            return Err(self.error(format!("expected '=' after '{}'", name)));
        }
        Ok(Action::SetVariable {
            target: None,
            name,
            value: self.expr()?,
        })
    }

    fn statements(&mut self) -> Result<Action, ExprError> {
        let mut actions = Vec::new();
        while !self.at_end() {
            if self.eat_sym(";") {
                continue;
            }
            actions.push(self.statement()?);
            if !self.at_end() && !self.eat_sym(";") {
                return Err(self.error("expected ';' between statements"));
            }
        }
        Ok(match actions.len() {
            1 => actions.remove(0),
            _ => Action::Compound(actions),
        })
    }
}

/// Parse a condition or value expression.
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser::new(input)?;
    if parser.at_end() {
        return Err(parser.error("empty expression"));
    }
    let expr = parser.expr()?;
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Parse a `;`-separated effect script into an action.
///
/// An empty script parses to an empty compound, which does nothing.
pub fn parse_statements(input: &str) -> Result<Action, ExprError> {
    Parser::new(input)?.statements()
}
