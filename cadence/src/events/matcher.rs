//! Event type matchers shared by subscribers and workflow triggers.

use crate::core::{Error, Result};
use regex::Regex;
use std::fmt;

/// Wildcard event type.
pub const WILDCARD: &str = "*";

/// Which event types a subscriber or trigger reacts to.
#[derive(Clone)]
pub enum EventMatcher {
    /// Exactly this type.
    Exact(String),
    /// Any of these types. A `"*"` entry makes the list match everything.
    AnyOf(Vec<String>),
    /// Every event.
    Any,
    /// Types matching this regular expression.
    Pattern(Regex),
}

impl EventMatcher {
    /// Builds a matcher for a single type; `"*"` becomes [`EventMatcher::Any`].
    pub fn exact(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        if event_type == WILDCARD {
            EventMatcher::Any
        } else {
            EventMatcher::Exact(event_type)
        }
    }

    pub fn any_of<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventMatcher::AnyOf(event_types.into_iter().map(Into::into).collect())
    }

    /// Compiles `pattern` into a regex matcher.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(EventMatcher::Pattern)
            .map_err(|e| {
                Error::invalid_argument(format!("invalid event pattern '{}': {}", pattern, e))
            })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventMatcher::Exact(expected) => expected == event_type,
            EventMatcher::AnyOf(types) => types
                .iter()
                .any(|candidate| candidate == WILDCARD || candidate == event_type),
            EventMatcher::Any => true,
            EventMatcher::Pattern(regex) => regex.is_match(event_type),
        }
    }
}

impl From<&str> for EventMatcher {
    fn from(event_type: &str) -> Self {
        EventMatcher::exact(event_type)
    }
}

impl From<String> for EventMatcher {
    fn from(event_type: String) -> Self {
        EventMatcher::exact(event_type)
    }
}

impl From<Vec<String>> for EventMatcher {
    fn from(event_types: Vec<String>) -> Self {
        EventMatcher::AnyOf(event_types)
    }
}

impl From<Regex> for EventMatcher {
    fn from(regex: Regex) -> Self {
        EventMatcher::Pattern(regex)
    }
}

impl fmt::Debug for EventMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventMatcher::Exact(event_type) => f.debug_tuple("Exact").field(event_type).finish(),
            EventMatcher::AnyOf(types) => f.debug_tuple("AnyOf").field(types).finish(),
            EventMatcher::Any => f.write_str("Any"),
            EventMatcher::Pattern(regex) => {
                f.debug_tuple("Pattern").field(&regex.as_str()).finish()
            }
        }
    }
}

impl fmt::Display for EventMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventMatcher::Exact(event_type) => f.write_str(event_type),
            EventMatcher::AnyOf(types) => write!(f, "[{}]", types.join(", ")),
            EventMatcher::Any => f.write_str(WILDCARD),
            EventMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}
