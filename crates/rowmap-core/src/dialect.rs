//! Placeholder syntax for bound parameters.

use serde::{Deserialize, Serialize};

/// How positional parameters are written in statement text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL)
    #[default]
    Dollar,
    /// `?` for every parameter (MySQL, SQLite)
    QuestionMark,
}

impl PlaceholderStyle {
    /// Placeholder for the 1-based parameter `position`.
    pub fn placeholder(self, position: usize) -> String {
        match self {
            PlaceholderStyle::Dollar => format!("${position}"),
            PlaceholderStyle::QuestionMark => "?".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder() {
        assert_eq!(PlaceholderStyle::Dollar.placeholder(3), "$3");
        assert_eq!(PlaceholderStyle::QuestionMark.placeholder(3), "?");
    }
}
