//! Small boolean expression language for project filters.
//!
//! ```text
//! state.altitude < 10000 && (msg.source == "beast" || state.country == "GB")
//! state.call_sign =~ "^(BAW|VIR)" && !state.on_ground
//! ```
//!
//! Fields are namespaced: `msg.*` reads the raw message, `state.*` the
//! aircraft's merged state. Unknown fields are rejected when the expression
//! is parsed, so a bad filter fails at startup rather than per message.
//! Comparisons involving a missing (`null`) value are false.

use anyhow::{Result, anyhow, bail};
use regex::Regex;
use std::fmt;

use crate::message::Message;
use crate::sighting::SightingState;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

fn number<T: Into<f64>>(value: Option<T>) -> Value {
    value.map(|v| Value::Number(v.into())).unwrap_or(Value::Null)
}

fn string(value: Option<&str>) -> Value {
    value
        .map(|v| Value::Str(v.to_string()))
        .unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    MsgSource,
    MsgIcao,
    MsgSquawk,
    MsgCallSign,
    MsgAltitude,
    MsgLatitude,
    MsgLongitude,
    MsgVerticalRate,
    MsgOnGround,
    MsgTrack,
    MsgGroundSpeed,
    MsgTransmissionType,
    StateAltitude,
    StateLatitude,
    StateLongitude,
    StateCallSign,
    StateSquawk,
    StateOnGround,
    StateCountry,
    StateVerticalRate,
    StateTrack,
    StateGroundSpeed,
    StateInTakeoff,
}

impl Field {
    fn parse(path: &str) -> Option<Self> {
        Some(match path {
            "msg.source" => Field::MsgSource,
            "msg.icao" => Field::MsgIcao,
            "msg.squawk" => Field::MsgSquawk,
            "msg.call_sign" => Field::MsgCallSign,
            "msg.altitude" => Field::MsgAltitude,
            "msg.latitude" => Field::MsgLatitude,
            "msg.longitude" => Field::MsgLongitude,
            "msg.vertical_rate" => Field::MsgVerticalRate,
            "msg.on_ground" => Field::MsgOnGround,
            "msg.track" => Field::MsgTrack,
            "msg.ground_speed" => Field::MsgGroundSpeed,
            "msg.transmission_type" => Field::MsgTransmissionType,
            "state.altitude" => Field::StateAltitude,
            "state.latitude" => Field::StateLatitude,
            "state.longitude" => Field::StateLongitude,
            "state.call_sign" => Field::StateCallSign,
            "state.squawk" => Field::StateSquawk,
            "state.on_ground" => Field::StateOnGround,
            "state.country" => Field::StateCountry,
            "state.vertical_rate" => Field::StateVerticalRate,
            "state.track" => Field::StateTrack,
            "state.ground_speed" => Field::StateGroundSpeed,
            "state.in_takeoff" => Field::StateInTakeoff,
            _ => return None,
        })
    }

    fn resolve(self, message: &Message, state: &SightingState) -> Result<Value> {
        Ok(match self {
            Field::MsgSource => Value::Str(message.source.clone()),
            Field::MsgIcao => Value::Str(message.icao_key()),
            Field::MsgSquawk => string(message.squawk()),
            Field::MsgCallSign => string(message.call_sign()),
            Field::MsgAltitude => number(message.altitude()?),
            Field::MsgLatitude => number(message.latitude()?),
            Field::MsgLongitude => number(message.longitude()?),
            Field::MsgVerticalRate => number(message.vertical_rate()?),
            Field::MsgOnGround => Value::Bool(message.is_on_ground),
            Field::MsgTrack => number(message.track()?),
            Field::MsgGroundSpeed => number(message.ground_speed()?),
            Field::MsgTransmissionType => number(message.transmission_type),
            Field::StateAltitude => number(state.altitude),
            Field::StateLatitude => number(state.location.map(|(lat, _)| lat)),
            Field::StateLongitude => number(state.location.map(|(_, lon)| lon)),
            Field::StateCallSign => string(state.call_sign.as_deref()),
            Field::StateSquawk => string(state.squawk.as_deref()),
            Field::StateOnGround => state.on_ground.map(Value::Bool).unwrap_or(Value::Null),
            Field::StateCountry => string(state.country.as_deref()),
            Field::StateVerticalRate => number(state.vertical_rate),
            Field::StateTrack => number(state.track),
            Field::StateGroundSpeed => number(state.ground_speed),
            Field::StateInTakeoff => Value::Bool(state.in_takeoff()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Field(Field),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CmpOp, Box<Node>, Box<Node>),
    Matches(Box<Node>, Regex),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Match,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => bail!("unterminated string literal"),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| anyhow!("unterminated string literal"))?;
                            value.push(*escaped);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| anyhow!("invalid number '{}'", text))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character '{}' at offset {}", other, i),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_primary()?;
                Ok(Node::Compare(op, Box::new(left), Box::new(right)))
            }
            Some(Token::Match) => {
                self.pos += 1;
                match self.next() {
                    Some(Token::Str(pattern)) => {
                        let regex = Regex::new(&pattern)
                            .map_err(|e| anyhow!("invalid pattern '{}': {}", pattern, e))?;
                        Ok(Node::Matches(Box::new(left), regex))
                    }
                    _ => bail!("'=~' must be followed by a string pattern"),
                }
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => bail!("expected ')'"),
                }
            }
            Some(Token::Number(n)) => Ok(Node::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                path => Field::parse(path)
                    .map(Node::Field)
                    .ok_or_else(|| anyhow!("unknown field '{}'", path)),
            },
            Some(token) => bail!("unexpected token {:?}", token),
            None => bail!("unexpected end of expression"),
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => return Ok(left == right),
        CmpOp::Ne => return Ok(left != right),
        _ => {}
    }

    let ordering = match (left, right) {
        (Value::Null, _) | (_, Value::Null) => return Ok(false),
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (a, b) => bail!("cannot order {} against {}", a.type_name(), b.type_name()),
    };

    let Some(ordering) = ordering else {
        return Ok(false);
    };

    Ok(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}

fn expect_bool(value: Value, context: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        other => bail!("{} expects a bool, got {}", context, other.type_name()),
    }
}

fn eval(node: &Node, message: &Message, state: &SightingState) -> Result<Value> {
    Ok(match node {
        Node::Literal(value) => value.clone(),
        Node::Field(field) => field.resolve(message, state)?,
        Node::Not(inner) => Value::Bool(!expect_bool(eval(inner, message, state)?, "'!'")?),
        Node::And(left, right) => {
            let result = expect_bool(eval(left, message, state)?, "'&&'")?
                && expect_bool(eval(right, message, state)?, "'&&'")?;
            Value::Bool(result)
        }
        Node::Or(left, right) => {
            let result = expect_bool(eval(left, message, state)?, "'||'")?
                || expect_bool(eval(right, message, state)?, "'||'")?;
            Value::Bool(result)
        }
        Node::Compare(op, left, right) => {
            let left = eval(left, message, state)?;
            let right = eval(right, message, state)?;
            Value::Bool(compare(*op, &left, &right)?)
        }
        Node::Matches(left, regex) => match eval(left, message, state)? {
            Value::Null => Value::Bool(false),
            Value::Str(s) => Value::Bool(regex.is_match(&s)),
            other => bail!("'=~' expects a string, got {}", other.type_name()),
        },
    })
}

/// A parsed filter expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            bail!("empty filter expression");
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            bail!("unexpected trailing token {:?}", token);
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a raw value without requiring a boolean
    pub fn value(&self, message: &Message, state: &SightingState) -> Result<Value> {
        eval(&self.root, message, state)
    }

    pub fn matches(&self, message: &Message, state: &SightingState) -> Result<bool> {
        match self.value(message, state)? {
            Value::Bool(b) => Ok(b),
            other => bail!(
                "filter '{}' produced {} instead of a bool",
                self.source,
                other.type_name()
            ),
        }
    }
}
