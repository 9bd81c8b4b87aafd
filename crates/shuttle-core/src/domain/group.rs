//! Group key patterns used by dequeue.
//!
//! A pattern is a group key in which `*` stands for any run of characters
//! (including none). Every other character is literal.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKeyPattern {
    raw: String,
}

impl GroupKeyPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.raw.contains('*')
    }

    /// Does `group_key` match this pattern?
    pub fn matches(&self, group_key: &str) -> bool {
        if !self.is_wildcard() {
            return self.raw == group_key;
        }

        let mut parts = self.raw.split('*');
        // split always yields at least one item
        let first = parts.next().unwrap_or_default();
        let Some(mut rest) = group_key.strip_prefix(first) else {
            return false;
        };

        let mut parts: Vec<&str> = parts.collect();
        let last = parts.pop().unwrap_or_default();
        for part in parts {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
        rest.len() >= last.len() && rest.ends_with(last)
    }

    /// SQLite `GLOB` expression equivalent to this pattern.
    ///
    /// `*` is kept; the other GLOB metacharacters (`?`, `[`) are escaped with
    /// a one-character class so they match literally.
    pub fn to_glob(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for c in self.raw.chars() {
            match c {
                '?' => out.push_str("[?]"),
                '[' => out.push_str("[[]"),
                _ => out.push(c),
            }
        }
        out
    }
}

impl fmt::Display for GroupKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for GroupKeyPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for GroupKeyPattern {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
