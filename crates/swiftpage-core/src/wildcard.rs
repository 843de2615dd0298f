//! Shell-style URL wildcards (`*` and `?`).

use crate::error::Result;
use regex::Regex;
use std::fmt;

/// A compiled wildcard pattern.
#[derive(Clone)]
pub struct Wildcard {
    spec: String,
    regex: Regex,
}

impl Wildcard {
    /// Compiles a pattern where `*` matches any run of characters and `?`
    /// matches exactly one.
    pub fn new(spec: &str) -> Result<Self> {
        let mut pattern = String::with_capacity(spec.len() + 8);
        pattern.push('^');
        for c in spec.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        pattern.push('$');
        Ok(Self {
            spec: spec.to_string(),
            regex: Regex::new(&pattern)?,
        })
    }

    /// Returns true if `s` matches the whole pattern.
    pub fn matches(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    /// The pattern as written.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Number of literal characters; more literals is more specific.
    pub fn specificity(&self) -> usize {
        self.spec.chars().filter(|c| *c != '*' && *c != '?').count()
    }

    /// Whether the pattern has no wildcard characters.
    pub fn is_simple(&self) -> bool {
        !self.spec.contains(['*', '?'])
    }
}

impl fmt::Debug for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Wildcard").field(&self.spec).finish()
    }
}

impl PartialEq for Wildcard {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

/// An ordered allow/disallow list. The last matching entry decides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WildcardGroup {
    entries: Vec<(Wildcard, bool)>,
}

impl WildcardGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern that allows matching strings.
    pub fn allow(&mut self, spec: &str) -> Result<()> {
        self.entries.push((Wildcard::new(spec)?, true));
        Ok(())
    }

    /// Adds a pattern that disallows matching strings.
    pub fn disallow(&mut self, spec: &str) -> Result<()> {
        self.entries.push((Wildcard::new(spec)?, false));
        Ok(())
    }

    /// Returns the decision of the last matching entry, or `default`.
    pub fn matches(&self, s: &str, default: bool) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|(w, _)| w.matches(s))
            .map_or(default, |(_, allow)| *allow)
    }

    /// Whether the group has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question() {
        let w = Wildcard::new("http://*.example.com/a?.css").unwrap();
        assert!(w.matches("http://www.example.com/ab.css"));
        assert!(!w.matches("http://www.example.com/abc.css"));
        assert!(!w.matches("https://www.example.com/ab.css"));
    }

    #[test]
    fn regex_characters_are_literal() {
        let w = Wildcard::new("http://a.com/x+(y).css").unwrap();
        assert!(w.matches("http://a.com/x+(y).css"));
        assert!(!w.matches("http://aXcom/x+(y).css"));
    }

    #[test]
    fn specificity_counts_literals() {
        assert!(
            Wildcard::new("http://a.com/dir/*").unwrap().specificity()
                > Wildcard::new("http://a.com/*").unwrap().specificity()
        );
        assert!(Wildcard::new("http://a.com/").unwrap().is_simple());
    }

    #[test]
    fn group_last_match_wins() {
        let mut group = WildcardGroup::new();
        group.allow("*").unwrap();
        group.disallow("*.js").unwrap();
        group.allow("*/keep.js").unwrap();
        assert!(group.matches("http://a.com/a.css", false));
        assert!(!group.matches("http://a.com/a.js", true));
        assert!(group.matches("http://a.com/keep.js", false));
        assert!(!WildcardGroup::new().matches("x", false));
    }
}
