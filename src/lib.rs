//! Connections-style puzzles over a database of tagged math expressions.
//!
//! A [`Database`] maps expressions to the categories they belong to. The
//! [`generate_puzzle`] loop picks four categories and four expressions for
//! each, rejecting any draw where an expression could be placed in more than
//! one group. A [`GameSession`] then deals the puzzle and tracks selections,
//! guesses and mistakes, reporting every transition to a [`Renderer`].

mod data;
pub mod database;
pub mod generator;
pub mod puzzle;
pub mod render;
pub mod session;

#[cfg(feature = "web")]
pub mod web;

pub use data::{DatabaseDocument, ExpressionRecord};
pub use database::{
    DEFAULT_DATABASE, Database, DatabaseSource, Expression, KNOWN_DATABASES, LoadError,
    LoadedDatabase,
};
pub use generator::{
    AttemptFailure, GenerationOptions, Generated, MAX_ATTEMPTS, Preset, generate_puzzle,
};
pub use puzzle::{DifficultyLabel, GROUP_COUNT, GROUP_SIZE, Group, Puzzle, display_math};
pub use render::{NullRenderer, RecordingRenderer, RenderEvent, Renderer, Severity};
pub use session::{GameSession, MAX_MISTAKES, Phase, SessionError, SubmitOutcome, Toggle};
