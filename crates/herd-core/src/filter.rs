//! Path filters — anchored regular expressions over absolute paths.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One anchored path pattern, e.g. `/var/log/.*`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, CoreError> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            CoreError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl TryFrom<String> for PathPattern {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PathPattern::new(&value)
    }
}

impl From<PathPattern> for String {
    fn from(value: PathPattern) -> Self {
        value.source
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.source)
    }
}

/// A set of patterns. A path matching any of them is "filtered": images use
/// it to name paths the herd must leave alone, subs use it to skip scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    pub patterns: Vec<PathPattern>,
}

impl Filter {
    pub fn new<I, S>(lines: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = lines
            .into_iter()
            .map(|l| PathPattern::new(l.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }
}
