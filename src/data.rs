use serde::{Deserialize, Serialize};

/// Serialized form of an expression database as served by a source.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseDocument {
    #[serde(default)]
    pub expressions: Vec<ExpressionRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpressionRecord {
    pub expression: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Any JSON number; records outside the `u8` integer range are dropped on load.
    pub difficulty: f64,
}

impl ExpressionRecord {
    pub fn new(expression: &str, groups: &[&str], difficulty: u8) -> Self {
        Self {
            expression: expression.to_string(),
            groups: groups.iter().map(|group| group.to_string()).collect(),
            difficulty: f64::from(difficulty),
        }
    }

    /// The difficulty as a whole `u8` level, if it is one.
    pub fn difficulty_level(&self) -> Option<u8> {
        let raw = self.difficulty;
        (raw.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(&raw)).then_some(raw as u8)
    }
}
