use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of groups in a puzzle, and of expressions in each group.
pub const GROUP_COUNT: usize = 4;
pub const GROUP_SIZE: usize = 4;

/// Visual tag attached to a group. Unrelated to numeric expression difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLabel {
    Yellow,
    Green,
    Blue,
    Purple,
}

impl DifficultyLabel {
    pub const ALL: [DifficultyLabel; 4] = [
        DifficultyLabel::Yellow,
        DifficultyLabel::Green,
        DifficultyLabel::Blue,
        DifficultyLabel::Purple,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyLabel::Yellow => "yellow",
            DifficultyLabel::Green => "green",
            DifficultyLabel::Blue => "blue",
            DifficultyLabel::Purple => "purple",
        }
    }
}

impl fmt::Display for DifficultyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub category: String,
    pub expressions: Vec<String>,
    pub label: DifficultyLabel,
}

impl Group {
    /// True when `selection` is exactly this group's expression set.
    pub fn matches(&self, selection: &[String]) -> bool {
        selection.len() == self.expressions.len()
            && selection.iter().all(|text| self.contains(text))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.expressions.iter().any(|expression| expression == text)
    }

    /// How many of `selection` belong to this group.
    pub fn overlap(&self, selection: &[String]) -> usize {
        selection.iter().filter(|text| self.contains(text)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Puzzle {
    pub groups: Vec<Group>,
}

impl Puzzle {
    /// The fixed puzzle served once generation exhausts its attempts.
    pub fn fallback() -> Self {
        let groups = [
            (
                "Expressions equal to 1",
                [
                    "$\\displaystyle \\sin^2\\theta + \\cos^2\\theta$",
                    "$\\displaystyle e^0$",
                    "$\\displaystyle \\lim_{x \\to 0} \\frac{\\sin x}{x}$",
                    "$\\displaystyle \\cos^2\\frac{\\pi}{4}$",
                ],
                DifficultyLabel::Yellow,
            ),
            (
                "Famous constants",
                [
                    "$\\displaystyle \\pi$",
                    "$\\displaystyle e$",
                    "$\\displaystyle \\phi = \\frac{1+\\sqrt{5}}{2}$",
                    "$\\displaystyle \\sqrt{2}$",
                ],
                DifficultyLabel::Green,
            ),
            (
                "Derivative rules",
                [
                    "$\\displaystyle \\frac{d}{dx}[x^n] = nx^{n-1}$",
                    "$\\displaystyle \\frac{d}{dx}[\\sin x] = \\cos x$",
                    "$\\displaystyle \\frac{d}{dx}[e^x] = e^x$",
                    "$\\displaystyle \\frac{d}{dx}[\\ln x] = \\frac{1}{x}$",
                ],
                DifficultyLabel::Blue,
            ),
            (
                "Complex numbers",
                [
                    "$\\displaystyle e^{i\\pi} + 1 = 0$",
                    "$\\displaystyle |z|^2 = z \\cdot \\overline{z}$",
                    "$\\displaystyle \\sqrt{-1} = i$",
                    "$\\displaystyle (a+bi)(a-bi) = a^2 + b^2$",
                ],
                DifficultyLabel::Purple,
            ),
        ];
        Self {
            groups: groups
                .into_iter()
                .map(|(category, expressions, label)| Group {
                    category: category.to_string(),
                    expressions: expressions.iter().map(|text| text.to_string()).collect(),
                    label,
                })
                .collect(),
        }
    }

    /// All expression texts, group by group.
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|group| group.expressions.iter().map(String::as_str))
    }

    pub fn category_names(&self) -> Vec<&str> {
        self.groups.iter().map(|group| group.category.as_str()).collect()
    }

    pub fn distinct_expression_count(&self) -> usize {
        self.expressions().collect::<HashSet<_>>().len()
    }

    pub fn group_of(&self, text: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.contains(text))
    }
}

/// Promotes a single-`$` inline expression to `$$…$$` display math.
pub fn display_math(text: &str) -> String {
    if text.len() >= 2 && text.starts_with('$') && text.ends_with('$') && !text.starts_with("$$") {
        format!("${text}$")
    } else {
        text.to_string()
    }
}
