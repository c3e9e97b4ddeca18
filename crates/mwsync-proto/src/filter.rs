//! MQTT topic filter matching.
//!
//! A filter is compiled once into an anchored regular expression:
//!
//! - a trailing `#` (as `prefix/#`, or the whole filter) matches one or more
//!   remaining characters, i.e. at least one more segment;
//! - a `+` that forms a complete segment matches exactly one non-empty
//!   segment;
//! - everything else is literal, so `Foo/Bar+Baz` contains no wildcard.

use regex::Regex;
use std::fmt;

/// Compiled topic filter.
#[derive(Clone)]
pub struct TopicFilter {
    pattern: String,
    regex: Regex,
}

impl TopicFilter {
    /// Compile a filter.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is empty.
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        if pattern.is_empty() {
            return Err(FilterError::Empty);
        }

        let source = compile(pattern);
        let regex = Regex::new(&source).map_err(|e| FilterError::Invalid {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Whether `topic` matches this filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// The filter as written.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicFilter")
            .field("pattern", &self.pattern)
            .field("regex", &self.regex.as_str())
            .finish()
    }
}

fn compile(pattern: &str) -> String {
    let multi_level = pattern == "#" || pattern.ends_with("/#");
    let body = if multi_level {
        &pattern[..pattern.len() - 1]
    } else {
        pattern
    };

    let segments: Vec<String> = body
        .split('/')
        .map(|segment| {
            if segment == "+" {
                "[^/]+".to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect();

    let mut source = String::with_capacity(body.len() + 8);
    source.push('^');
    source.push_str(&segments.join("/"));
    if multi_level {
        source.push_str(".+");
    }
    source.push('$');
    source
}

/// Errors that can occur compiling a filter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilterError {
    /// Filter was empty
    #[error("empty topic filter")]
    Empty,
    /// Filter did not compile
    #[error("invalid topic filter '{pattern}': {reason}")]
    Invalid {
        /// The offending filter
        pattern: String,
        /// Compiler message
        reason: String,
    },
}
