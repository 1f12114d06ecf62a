use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{info, warn};

use crate::data::{DatabaseDocument, ExpressionRecord};

/// Database ids the catalog knows how to resolve, paired with their file names.
pub const KNOWN_DATABASES: &[(&str, &str)] = &[
    ("integration-strategies", "integration-strategies.json"),
    ("series-strategies", "series-strategies.json"),
];

pub const DEFAULT_DATABASE: &str = "integration-strategies";

static BUNDLED_INTEGRATION: &str = include_str!("../data/integration-strategies.json");
static BUNDLED_SERIES: &str = include_str!("../data/series-strategies.json");

const FALLBACK_RECORDS: [(&str, &[&str], u8); 16] = [
    (
        "$\\displaystyle \\sin^2\\theta + \\cos^2\\theta$",
        &["Expressions equal to 1", "Trigonometric identities"],
        2,
    ),
    (
        "$\\displaystyle e^0$",
        &["Expressions equal to 1", "Exponential functions"],
        1,
    ),
    (
        "$\\displaystyle \\lim_{x \\to 0} \\frac{\\sin x}{x}$",
        &["Expressions equal to 1", "Important limits"],
        4,
    ),
    (
        "$\\displaystyle \\cos^2\\frac{\\pi}{4}$",
        &["Expressions equal to 1", "Trigonometric values"],
        2,
    ),
    (
        "$\\displaystyle \\pi$",
        &["Famous constants", "Circle properties"],
        1,
    ),
    (
        "$\\displaystyle e$",
        &["Famous constants", "Exponential functions"],
        1,
    ),
    (
        "$\\displaystyle \\phi = \\frac{1+\\sqrt{5}}{2}$",
        &["Famous constants", "Golden ratio"],
        2,
    ),
    (
        "$\\displaystyle \\sqrt{2}$",
        &["Famous constants", "Algebraic numbers"],
        1,
    ),
    (
        "$\\displaystyle \\frac{d}{dx}[x^n] = nx^{n-1}$",
        &["Derivative rules", "Power rule"],
        1,
    ),
    (
        "$\\displaystyle \\frac{d}{dx}[\\sin x] = \\cos x$",
        &["Derivative rules", "Trigonometric derivatives"],
        1,
    ),
    (
        "$\\displaystyle \\frac{d}{dx}[e^x] = e^x$",
        &["Derivative rules", "Exponential derivatives"],
        1,
    ),
    (
        "$\\displaystyle \\frac{d}{dx}[\\ln x] = \\frac{1}{x}$",
        &["Derivative rules", "Logarithmic derivatives"],
        2,
    ),
    (
        "$\\displaystyle e^{i\\pi} + 1 = 0$",
        &["Complex numbers", "Euler's identity"],
        4,
    ),
    (
        "$\\displaystyle |z|^2 = z \\cdot \\overline{z}$",
        &["Complex numbers", "Modulus properties"],
        3,
    ),
    (
        "$\\displaystyle \\sqrt{-1} = i$",
        &["Complex numbers", "Imaginary unit"],
        2,
    ),
    (
        "$\\displaystyle (a+bi)(a-bi) = a^2 + b^2$",
        &["Complex numbers", "Conjugate products"],
        2,
    ),
];

static FALLBACK_DATABASE: Lazy<Database> = Lazy::new(|| {
    Database::from_records(
        FALLBACK_RECORDS
            .iter()
            .map(|(text, groups, difficulty)| ExpressionRecord::new(text, groups, *difficulty)),
    )
});

/// Reasons a database could not be loaded from its source.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown database `{0}`")]
    UnknownDatabase(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse database `{id}`: {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single tagged expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    text: String,
    categories: BTreeSet<String>,
    difficulty: u8,
}

impl Expression {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    pub fn belongs_to(&self, category: &str) -> bool {
        self.categories.contains(category)
    }
}

/// In-memory expression database, read-only once built.
///
/// Texts are unique; the first occurrence of a duplicated text wins.
#[derive(Debug, Clone, Default)]
pub struct Database {
    expressions: Vec<Expression>,
    by_text: HashMap<String, usize>,
}

impl Database {
    /// The built-in 16-expression set substituted whenever a load fails.
    pub fn fallback() -> Self {
        FALLBACK_DATABASE.clone()
    }

    pub fn from_document(document: DatabaseDocument) -> Self {
        Self::from_records(document.expressions)
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ExpressionRecord>,
    {
        let mut database = Self::default();
        for record in records {
            if record.groups.is_empty() {
                warn!(expression = %record.expression, "dropping expression without categories");
                continue;
            }
            let Some(difficulty) = record.difficulty_level() else {
                warn!(
                    expression = %record.expression,
                    difficulty = record.difficulty,
                    "dropping expression with unusable difficulty"
                );
                continue;
            };
            if database.by_text.contains_key(&record.expression) {
                warn!(expression = %record.expression, "dropping duplicate expression");
                continue;
            }
            database
                .by_text
                .insert(record.expression.clone(), database.expressions.len());
            database.expressions.push(Expression {
                text: record.expression,
                categories: record.groups.into_iter().collect(),
                difficulty,
            });
        }
        database
    }

    /// Parses a JSON document in the source shape.
    pub fn parse(id: &str, raw: &str) -> Result<Self, LoadError> {
        let document: DatabaseDocument =
            serde_json::from_str(raw).map_err(|source| LoadError::Parse {
                id: id.to_string(),
                source,
            })?;
        Ok(Self::from_document(document))
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.expressions.iter()
    }

    pub fn get(&self, text: &str) -> Option<&Expression> {
        self.by_text.get(text).map(|&idx| &self.expressions[idx])
    }

    /// Expressions tagged with `category`.
    pub fn members<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Expression> + 'a {
        self.expressions
            .iter()
            .filter(move |expression| expression.belongs_to(category))
    }

    /// Number of expressions referencing `category`.
    pub fn support(&self, category: &str) -> usize {
        self.members(category).count()
    }

    /// Every distinct category name, minus `excluding`.
    pub fn available_categories(&self, excluding: &[String]) -> BTreeSet<String> {
        self.expressions
            .iter()
            .flat_map(|expression| expression.categories.iter())
            .filter(|category| !excluding.contains(category))
            .cloned()
            .collect()
    }

    /// Category names with their support counts, largest first.
    pub fn category_supports(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for category in self.expressions.iter().flat_map(|e| e.categories.iter()) {
            *counts.entry(category.as_str()).or_insert(0) += 1;
        }
        let mut rows: Vec<_> = counts
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }
}

/// Where database documents come from.
#[derive(Debug, Clone, Default)]
pub enum DatabaseSource {
    /// Copies compiled into the binary.
    #[default]
    Bundled,
    /// `<dir>/<id>.json` on disk.
    Directory(PathBuf),
}

/// A resolved location for a database document.
#[derive(Debug, Clone)]
pub enum Located {
    Embedded(&'static str),
    File(PathBuf),
}

/// Result of [`DatabaseSource::load_or_fallback`].
#[derive(Debug, Clone)]
pub struct LoadedDatabase {
    pub id: String,
    pub database: Database,
    pub fell_back: bool,
}

impl LoadedDatabase {
    /// Wraps a load result, substituting the fallback set on failure.
    pub fn from_result(id: &str, result: Result<Database, LoadError>) -> Self {
        match result {
            Ok(database) => {
                info!(database = id, expressions = database.len(), "loaded expression database");
                Self {
                    id: id.to_string(),
                    database,
                    fell_back: false,
                }
            }
            Err(err) => {
                warn!(database = id, error = %err, "failed to load database, using fallback set");
                Self {
                    id: DEFAULT_DATABASE.to_string(),
                    database: Database::fallback(),
                    fell_back: true,
                }
            }
        }
    }
}

impl DatabaseSource {
    pub fn locate(&self, id: &str) -> Result<Located, LoadError> {
        let file = KNOWN_DATABASES
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, file)| *file)
            .ok_or_else(|| LoadError::UnknownDatabase(id.to_string()))?;
        match self {
            DatabaseSource::Bundled => match id {
                "integration-strategies" => Ok(Located::Embedded(BUNDLED_INTEGRATION)),
                "series-strategies" => Ok(Located::Embedded(BUNDLED_SERIES)),
                _ => Err(LoadError::UnknownDatabase(id.to_string())),
            },
            DatabaseSource::Directory(dir) => Ok(Located::File(dir.join(file))),
        }
    }

    pub fn load(&self, id: &str) -> Result<Database, LoadError> {
        match self.locate(id)? {
            Located::Embedded(raw) => Database::parse(id, raw),
            Located::File(path) => {
                let raw = fs::read_to_string(&path).map_err(|source| LoadError::Io {
                    path: path.clone(),
                    source,
                })?;
                Database::parse(id, &raw)
            }
        }
    }

    pub fn load_or_fallback(&self, id: &str) -> LoadedDatabase {
        LoadedDatabase::from_result(id, self.load(id))
    }
}
