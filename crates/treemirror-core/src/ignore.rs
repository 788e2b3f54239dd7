//! Name-based ignore rules.

use regex::{Regex, RegexBuilder};

use crate::error::SyncError;

/// A single name pattern.
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// Exact name, compared case-insensitively. Stored lowercased.
    Literal(String),
    /// Case-insensitive regular expression that must match the whole name.
    Regex(Regex),
}

impl NamePattern {
    /// Create a literal pattern.
    pub fn literal(name: &str) -> Self {
        Self::Literal(name.to_lowercase())
    }

    /// Compile a full-match, case-insensitive regex pattern.
    pub fn regex(pattern: &str) -> Result<Self, SyncError> {
        RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(true)
            .build()
            .map(Self::Regex)
            .map_err(|source| SyncError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Check whether `name` matches this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Literal(literal) => name.to_lowercase() == *literal,
            Self::Regex(re) => re.is_match(name),
        }
    }
}

/// Exclusion rules for file and directory names.
///
/// Ignored names are excluded from every operation: they are never
/// compared, created, recursed into or deleted.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    files: Vec<NamePattern>,
    dirs: Vec<NamePattern>,
}

impl IgnoreFilter {
    /// Create an empty filter that ignores nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore files with exactly this name.
    pub fn ignore_file_name(&mut self, name: &str) -> &mut Self {
        self.files.push(NamePattern::literal(name));
        self
    }

    /// Ignore files whose whole name matches `pattern`.
    pub fn ignore_file_regex(&mut self, pattern: &str) -> Result<&mut Self, SyncError> {
        self.files.push(NamePattern::regex(pattern)?);
        Ok(self)
    }

    /// Ignore directories with exactly this name.
    pub fn ignore_dir_name(&mut self, name: &str) -> &mut Self {
        self.dirs.push(NamePattern::literal(name));
        self
    }

    /// Ignore directories whose whole name matches `pattern`.
    pub fn ignore_dir_regex(&mut self, pattern: &str) -> Result<&mut Self, SyncError> {
        self.dirs.push(NamePattern::regex(pattern)?);
        Ok(self)
    }

    /// Add a literal rule using the trailing-separator convention.
    ///
    /// `bin/` or `bin\` ignores directories named `bin`; anything else
    /// ignores files with that name.
    pub fn add_rule(&mut self, rule: &str) -> &mut Self {
        if rule.ends_with('/') || rule.ends_with('\\') {
            self.ignore_dir_name(rule.trim_matches(['/', '\\']))
        } else {
            self.ignore_file_name(rule)
        }
    }

    /// Check if a file name is ignored.
    pub fn test_file(&self, name: &str) -> bool {
        self.files.iter().any(|p| p.matches(name))
    }

    /// Check if a directory name is ignored.
    pub fn test_dir(&self, name: &str) -> bool {
        self.dirs.iter().any(|p| p.matches(name))
    }

    /// Check if the filter has no rules.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}
