//! Command interpretation for the chatpilot hub.
//!
//! Provides:
//! - `ContactMatcher` - Fuzzy contact resolution with explicit ambiguity
//! - Pronoun/reference detection
//! - `Interpreter` - Raw command + session snapshot to validated `Intent`
//! - `RuleParser` - Deterministic local stand-in for the language model

pub mod fuzzy;
pub mod interpreter;
pub mod reference;
pub mod rules;

pub use fuzzy::{Candidate, ContactMatcher, MatchError};
pub use interpreter::{InterpretError, Interpreter};
pub use rules::{RuleParser, extract_hint};
