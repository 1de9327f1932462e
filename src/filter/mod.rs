//! Project filter predicates
//!
//! The tracker only depends on [`Predicate`]; [`Expression`] is the
//! implementation projects configure through their `filter` string.

mod expression;

pub use expression::{Expression, Value};

use anyhow::Result;
use std::fmt::Debug;

use crate::message::Message;
use crate::sighting::SightingState;

/// Boolean test over an incoming message and the aircraft's merged state.
///
/// Evaluation errors (including a non-boolean result) are reported as
/// errors, never silently treated as "filtered out".
pub trait Predicate: Send + Sync + Debug {
    fn evaluate(&self, message: &Message, state: &SightingState) -> Result<bool>;
}

impl Predicate for Expression {
    fn evaluate(&self, message: &Message, state: &SightingState) -> Result<bool> {
        self.matches(message, state)
    }
}
