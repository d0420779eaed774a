//! Statement text assembly.
//!
//! [`SqlBuilder`] keeps an ordered list of clauses and a running parameter
//! position, so placeholders are numbered in the order they are emitted no
//! matter which generator is writing.

use rowmap_core::{ConfigError, PlaceholderStyle};

#[derive(Debug, Clone)]
pub struct SqlBuilder {
    style: PlaceholderStyle,
    clauses: Vec<String>,
    bound: usize,
}

impl SqlBuilder {
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            style,
            clauses: Vec::new(),
            bound: 0,
        }
    }

    /// Start a new clause. Clauses are joined with single spaces.
    pub fn clause(&mut self, text: &str) -> &mut Self {
        self.clauses.push(text.to_string());
        self
    }

    /// Append to the current clause.
    pub fn push(&mut self, text: &str) -> &mut Self {
        match self.clauses.last_mut() {
            Some(last) => last.push_str(text),
            None => self.clauses.push(text.to_string()),
        }
        self
    }

    /// Append the next placeholder to the current clause.
    pub fn param(&mut self) -> &mut Self {
        let placeholder = self.next_placeholder();
        self.push(&placeholder)
    }

    pub fn next_placeholder(&mut self) -> String {
        self.bound += 1;
        self.style.placeholder(self.bound)
    }

    /// Append `items` separated by `sep`, rendering each with `render`.
    pub fn push_list<I, F>(&mut self, items: I, sep: &str, mut render: F) -> &mut Self
    where
        I: IntoIterator,
        F: FnMut(&mut Self, I::Item),
    {
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.push(sep);
            }
            render(self, item);
        }
        self
    }

    /// Append a caller-written fragment, turning each `?` outside quotes into
    /// the next placeholder. Returns the number of placeholders written.
    pub fn push_fragment(&mut self, fragment: &str) -> usize {
        let pieces = split_markers(fragment);
        let mut out = String::with_capacity(fragment.len());
        for (i, piece) in pieces.iter().enumerate() {
            if i > 0 {
                out.push_str(&self.next_placeholder());
            }
            out.push_str(piece);
        }
        self.push(&out);
        pieces.len() - 1
    }

    /// Like [`push_fragment`](Self::push_fragment), checking the placeholder
    /// count against the parameters supplied for the fragment.
    pub fn push_condition(&mut self, fragment: &str, params: usize) -> Result<(), ConfigError> {
        check_markers(fragment, params)?;
        self.push_fragment(fragment);
        Ok(())
    }

    /// Number of placeholders emitted so far.
    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn finish(self) -> String {
        self.clauses
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Number of `?` markers outside quoted literals in `fragment`.
pub fn count_markers(fragment: &str) -> usize {
    split_markers(fragment).len() - 1
}

/// Fail unless `fragment` has exactly one marker per parameter.
pub fn check_markers(fragment: &str, params: usize) -> Result<(), ConfigError> {
    let expected = count_markers(fragment);
    if expected == params {
        Ok(())
    } else {
        Err(ConfigError::ParamCountMismatch {
            expected,
            got: params,
        })
    }
}

/// Text between `?` markers; quoted `?` stay literal.
fn split_markers(fragment: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in fragment.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch == '?' => {
                pieces.push(&fragment[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    pieces.push(&fragment[start..]);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clauses_and_params() {
        let mut b = SqlBuilder::new(PlaceholderStyle::Dollar);
        b.clause("UPDATE users SET ");
        b.push_list(["name", "email"], ", ", |b, col| {
            b.push(col).push(" = ").param();
        });
        b.clause("WHERE id = ").param();
        assert_eq!(b.bound(), 3);
        assert_eq!(
            b.finish(),
            "UPDATE users SET name = $1, email = $2 WHERE id = $3"
        );
    }

    #[test]
    fn test_fragment_renumbering() {
        let mut b = SqlBuilder::new(PlaceholderStyle::Dollar);
        b.clause("SET deleted_at = ").param();
        b.clause("WHERE ");
        let n = b.push_fragment("name = ? AND note <> 'why?' AND age > ?");
        assert_eq!(n, 2);
        assert_eq!(
            b.finish(),
            "SET deleted_at = $1 WHERE name = $2 AND note <> 'why?' AND age > $3"
        );
    }

    #[test]
    fn test_question_mark_style() {
        let mut b = SqlBuilder::new(PlaceholderStyle::QuestionMark);
        b.clause("SELECT 1 FROM t WHERE ");
        b.push_fragment("a = ? AND b = ?");
        assert_eq!(b.finish(), "SELECT 1 FROM t WHERE a = ? AND b = ?");
    }

    #[test]
    fn test_condition_param_mismatch() {
        let mut b = SqlBuilder::new(PlaceholderStyle::Dollar);
        let err = b.push_condition("a = ? AND b = ?", 1).unwrap_err();
        assert_eq!(err, ConfigError::ParamCountMismatch { expected: 2, got: 1 });
    }

    #[test]
    fn test_marker_count_skips_quotes() {
        assert_eq!(count_markers("a = ?"), 1);
        assert_eq!(count_markers("note = 'why?' AND b = \"c?\""), 0);
        assert_eq!(count_markers(""), 0);
        assert!(check_markers("a = ? OR b = ?", 2).is_ok());
        assert!(check_markers("a = ?", 0).is_err());
    }
}
