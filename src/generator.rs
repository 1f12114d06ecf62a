//! Puzzle generation.
//!
//! Every attempt runs through the same stages: pick four categories, pick four
//! expressions per category, then confirm that the sixteen texts are distinct and
//! that each one maps onto exactly one chosen category. A failed attempt is thrown
//! away whole and redrawn; once the attempt budget is spent the fixed
//! [`Puzzle::fallback`] is served instead.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::{Database, Expression};
use crate::puzzle::{DifficultyLabel, GROUP_COUNT, GROUP_SIZE, Group, Puzzle};

pub const MAX_ATTEMPTS: usize = 50;
const DIVERSITY_LEVELS: RangeInclusive<u8> = 1..=5;

/// Knobs accepted by [`generate_puzzle`]. Keys are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationOptions {
    pub max_difficulty: u8,
    pub min_difficulty: u8,
    /// Only honoured when at least four of these are available.
    pub preferred_groups: Vec<String>,
    pub avoid_groups: Vec<String>,
    /// Reject a category whose every member already belongs to an accepted one.
    pub strict_overlap: bool,
    /// Clamped to `1..=MAX_ATTEMPTS` by [`generate_puzzle`].
    pub max_attempts: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_difficulty: 4,
            min_difficulty: 1,
            preferred_groups: Vec::new(),
            avoid_groups: Vec::new(),
            strict_overlap: false,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl GenerationOptions {
    pub fn difficulty_range(&self) -> RangeInclusive<u8> {
        self.min_difficulty..=self.max_difficulty
    }
}

/// Named option bundles offered by the game controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Standard,
    Easy,
    Medium,
    Hard,
    Custom,
}

impl Preset {
    pub fn options(self) -> GenerationOptions {
        let base = GenerationOptions::default();
        match self {
            Preset::Standard => base,
            Preset::Easy => GenerationOptions {
                min_difficulty: 1,
                max_difficulty: 2,
                ..base
            },
            Preset::Medium => GenerationOptions {
                min_difficulty: 1,
                max_difficulty: 3,
                ..base
            },
            Preset::Hard => GenerationOptions {
                min_difficulty: 2,
                max_difficulty: 5,
                ..base
            },
            Preset::Custom => GenerationOptions {
                preferred_groups: vec![
                    "Derivative rules".to_string(),
                    "Integral rules".to_string(),
                    "Trigonometric identities".to_string(),
                ],
                ..base
            },
        }
    }
}

/// Why a single generation attempt was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("only {found} viable categories")]
    InsufficientCategories { found: usize },
    #[error("category `{category}` yielded {picked} usable expressions")]
    InsufficientExpressions { category: String, picked: usize },
    #[error("{distinct} distinct expressions across the puzzle")]
    UniquenessViolation { distinct: usize },
    #[error("expression `{expression}` is not in the database")]
    UnknownExpression { expression: String },
    #[error("expression `{expression}` placed under `{placed}` matches {matches:?}")]
    Ambiguous {
        expression: String,
        placed: String,
        matches: Vec<String>,
    },
}

/// Outcome of [`generate_puzzle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Generated {
    pub puzzle: Puzzle,
    pub attempts: usize,
    pub fell_back: bool,
}

/// Category names the generator may draw from under `options`.
pub fn candidate_categories(database: &Database, options: &GenerationOptions) -> Vec<String> {
    let available: Vec<String> = database
        .available_categories(&options.avoid_groups)
        .into_iter()
        .collect();
    if options.preferred_groups.is_empty() {
        return available;
    }
    let preferred: Vec<String> = available
        .iter()
        .filter(|name| options.preferred_groups.contains(name))
        .cloned()
        .collect();
    if preferred.len() < GROUP_COUNT {
        available
    } else {
        preferred
    }
}

/// Picks up to four categories with enough support, in random order.
pub fn select_categories<R: Rng + ?Sized>(
    candidates: &[String],
    database: &Database,
    strict_overlap: bool,
    rng: &mut R,
) -> Vec<String> {
    let mut viable: Vec<&String> = candidates
        .iter()
        .filter(|name| database.support(name) >= GROUP_SIZE)
        .collect();
    viable.shuffle(rng);

    let mut selected: Vec<String> = Vec::with_capacity(GROUP_COUNT);
    for name in viable {
        if selected.len() >= GROUP_COUNT {
            break;
        }
        if accepts_category(database, &selected, name, strict_overlap) {
            selected.push(name.clone());
        }
    }
    selected
}

fn accepts_category(
    database: &Database,
    accepted: &[String],
    candidate: &str,
    strict_overlap: bool,
) -> bool {
    if !strict_overlap {
        return true;
    }
    database
        .members(candidate)
        .any(|expression| !accepted.iter().any(|name| expression.belongs_to(name)))
}

/// Picks up to four expressions for `category`, spreading across difficulty levels.
pub fn select_expressions<'a, R: Rng + ?Sized>(
    category: &str,
    database: &'a Database,
    range: RangeInclusive<u8>,
    already_used: &HashSet<String>,
    rng: &mut R,
) -> Vec<&'a Expression> {
    let mut remaining: Vec<&'a Expression> = database
        .iter()
        .filter(|expression| {
            expression.belongs_to(category)
                && range.contains(&expression.difficulty())
                && !already_used.contains(expression.text())
        })
        .collect();
    if remaining.len() < GROUP_SIZE {
        return remaining;
    }
    remaining.shuffle(rng);

    let mut picked = Vec::with_capacity(GROUP_SIZE);
    for level in DIVERSITY_LEVELS {
        if picked.len() >= GROUP_SIZE {
            break;
        }
        if let Some(pos) = remaining
            .iter()
            .position(|expression| expression.difficulty() == level)
        {
            picked.push(remaining.remove(pos));
        }
    }
    while picked.len() < GROUP_SIZE && !remaining.is_empty() {
        let idx = rng.gen_range(0..remaining.len());
        picked.push(remaining.swap_remove(idx));
    }
    picked
}

/// Checks that every expression maps onto exactly one of the puzzle's categories,
/// and that it sits in that category's group.
pub fn validate_solvability(puzzle: &Puzzle, database: &Database) -> Result<(), AttemptFailure> {
    let chosen = puzzle.category_names();
    for group in &puzzle.groups {
        for text in &group.expressions {
            let expression = database.get(text).ok_or_else(|| {
                AttemptFailure::UnknownExpression {
                    expression: text.clone(),
                }
            })?;
            let matches: Vec<String> = chosen
                .iter()
                .filter(|name| expression.belongs_to(name))
                .map(|name| name.to_string())
                .collect();
            if matches.len() != 1 || matches[0] != group.category {
                return Err(AttemptFailure::Ambiguous {
                    expression: text.clone(),
                    placed: group.category.clone(),
                    matches,
                });
            }
        }
    }
    Ok(())
}

fn attempt<R: Rng + ?Sized>(
    database: &Database,
    options: &GenerationOptions,
    candidates: &[String],
    rng: &mut R,
) -> Result<Puzzle, AttemptFailure> {
    let categories = select_categories(candidates, database, options.strict_overlap, rng);
    if categories.len() < GROUP_COUNT {
        return Err(AttemptFailure::InsufficientCategories {
            found: categories.len(),
        });
    }

    let mut labels = DifficultyLabel::ALL;
    labels.shuffle(rng);

    let mut used: HashSet<String> = HashSet::with_capacity(GROUP_COUNT * GROUP_SIZE);
    let mut groups = Vec::with_capacity(GROUP_COUNT);
    for (category, label) in categories.into_iter().zip(labels) {
        let picked = select_expressions(
            &category,
            database,
            options.difficulty_range(),
            &used,
            rng,
        );
        if picked.len() < GROUP_SIZE {
            return Err(AttemptFailure::InsufficientExpressions {
                category,
                picked: picked.len(),
            });
        }
        let expressions: Vec<String> = picked
            .iter()
            .map(|expression| expression.text().to_string())
            .collect();
        used.extend(expressions.iter().cloned());
        groups.push(Group {
            category,
            expressions,
            label,
        });
    }

    let puzzle = Puzzle { groups };
    let distinct = puzzle.distinct_expression_count();
    if distinct != GROUP_COUNT * GROUP_SIZE {
        return Err(AttemptFailure::UniquenessViolation { distinct });
    }
    validate_solvability(&puzzle, database)?;
    Ok(puzzle)
}

/// Builds a uniquely solvable puzzle, or the fixed fallback once
/// `options.max_attempts` attempts (never more than [`MAX_ATTEMPTS`]) have failed.
pub fn generate_puzzle<R: Rng + ?Sized>(
    database: &Database,
    options: &GenerationOptions,
    rng: &mut R,
) -> Generated {
    let max_attempts = options.max_attempts.clamp(1, MAX_ATTEMPTS);
    let candidates = candidate_categories(database, options);
    for attempt_no in 1..=max_attempts {
        match attempt(database, options, &candidates, rng) {
            Ok(puzzle) => {
                info!(attempts = attempt_no, "generated puzzle with 16 unique expressions");
                return Generated {
                    puzzle,
                    attempts: attempt_no,
                    fell_back: false,
                };
            }
            Err(failure) => debug!(attempt = attempt_no, %failure, "puzzle attempt failed"),
        }
    }
    warn!(
        attempts = max_attempts,
        "could not generate a unique puzzle, using fallback"
    );
    Generated {
        puzzle: Puzzle::fallback(),
        attempts: max_attempts,
        fell_back: true,
    }
}
