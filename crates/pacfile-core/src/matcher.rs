use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Glob,
    Regex,
}

/// A compiled query pattern.
///
/// Exact patterns compare for equality and are always case-sensitive. Glob
/// patterns are anchored to the whole candidate; regex patterns are used
/// as written.
#[derive(Debug, Clone)]
pub struct Matcher {
    mode: MatchMode,
    pattern: String,
    regex: Option<Regex>,
    literal_prefix: Option<String>,
}

impl Matcher {
    pub fn new(pattern: &str, mode: MatchMode, case_sensitive: bool) -> Result<Self, PatternError> {
        let source = match mode {
            MatchMode::Exact => None,
            MatchMode::Glob => Some(glob_to_regex(pattern)),
            MatchMode::Regex => Some(pattern.to_string()),
        };
        let regex = match source {
            Some(source) => Some(
                RegexBuilder::new(&source)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|source| PatternError::Invalid {
                        pattern: pattern.to_string(),
                        source,
                    })?,
            ),
            None => None,
        };
        let literal_prefix = match mode {
            MatchMode::Exact => Some(pattern.to_string()),
            MatchMode::Glob if case_sensitive => {
                let prefix: String = pattern
                    .chars()
                    .take_while(|ch| !matches!(ch, '*' | '?'))
                    .collect();
                Some(prefix).filter(|prefix| !prefix.is_empty())
            }
            _ => None,
        };
        Ok(Matcher {
            mode,
            pattern: pattern.to_string(),
            regex,
            literal_prefix,
        })
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The pattern itself when only an identical string can match.
    pub fn exact_value(&self) -> Option<&str> {
        match self.mode {
            MatchMode::Exact => Some(&self.pattern),
            _ => None,
        }
    }

    /// A prefix every match must start with, when one is known.
    pub fn literal_prefix(&self) -> Option<&str> {
        self.literal_prefix.as_deref()
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(candidate),
            None => candidate == self.pattern,
        }
    }
}

/// Translates a shell wildcard pattern into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out.push('$');
    out
}
