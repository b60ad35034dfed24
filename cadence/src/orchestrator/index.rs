use crate::events::{EventMatcher, WILDCARD};
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Reverse index from event type to the workflows whose trigger can match
/// it.
///
/// Exact types are hashed, wildcard triggers are kept in a set that every
/// event hits, and regex triggers are tested one by one.
#[derive(Debug, Default)]
pub(crate) struct TriggerIndex {
    exact: HashMap<String, Vec<String>>,
    wildcard: Vec<String>,
    patterns: Vec<(String, Regex)>,
}

impl TriggerIndex {
    pub(crate) fn insert(&mut self, workflow_id: &str, matcher: &EventMatcher) {
        match matcher {
            EventMatcher::Exact(event_type) => self.insert_exact(workflow_id, event_type),
            EventMatcher::AnyOf(event_types) => {
                for event_type in event_types {
                    if event_type == WILDCARD {
                        self.insert_wildcard(workflow_id);
                    } else {
                        self.insert_exact(workflow_id, event_type);
                    }
                }
            }
            EventMatcher::Any => self.insert_wildcard(workflow_id),
            EventMatcher::Pattern(regex) => {
                self.patterns.push((workflow_id.to_string(), regex.clone()));
            }
        }
    }

    pub(crate) fn remove(&mut self, workflow_id: &str) {
        self.exact.retain(|_, ids| {
            ids.retain(|id| id != workflow_id);
            !ids.is_empty()
        });
        self.wildcard.retain(|id| id != workflow_id);
        self.patterns.retain(|(id, _)| id != workflow_id);
    }

    /// Workflow ids that may match `event_type`, without duplicates: direct
    /// hits first, then wildcards, then regex hits.
    pub(crate) fn candidates(&self, event_type: &str) -> Vec<String> {
        let direct = self.exact.get(event_type).into_iter().flatten();
        let patterns = self
            .patterns
            .iter()
            .filter(|(_, regex)| regex.is_match(event_type))
            .map(|(id, _)| id);

        let mut seen = HashSet::new();
        direct
            .chain(self.wildcard.iter())
            .chain(patterns)
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    fn insert_exact(&mut self, workflow_id: &str, event_type: &str) {
        let ids = self.exact.entry(event_type.to_string()).or_default();
        if !ids.iter().any(|id| id == workflow_id) {
            ids.push(workflow_id.to_string());
        }
    }

    fn insert_wildcard(&mut self, workflow_id: &str) {
        if !self.wildcard.iter().any(|id| id == workflow_id) {
            self.wildcard.push(workflow_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_by_kind() {
        let mut index = TriggerIndex::default();
        index.insert("exact", &EventMatcher::exact("order.created"));
        index.insert("star", &EventMatcher::exact("*"));
        index.insert("list", &EventMatcher::any_of(["order.created", "order.paid"]));
        index.insert("pattern", &EventMatcher::regex(r"^order\.").unwrap());
        index.insert("user", &EventMatcher::exact("user.created"));

        assert_eq!(
            index.candidates("order.created"),
            vec!["exact", "list", "star", "pattern"]
        );
        assert_eq!(index.candidates("user.created"), vec!["user", "star"]);
        assert_eq!(index.candidates("order.paid"), vec!["list", "star", "pattern"]);
    }

    #[test]
    fn test_wildcard_entry_in_list_and_removal() {
        let mut index = TriggerIndex::default();
        index.insert("both", &EventMatcher::any_of(["a", "*"]));
        assert_eq!(index.candidates("a"), vec!["both"]);
        assert_eq!(index.candidates("zzz"), vec!["both"]);

        index.remove("both");
        assert!(index.candidates("a").is_empty());
        assert!(index.exact.is_empty());
    }
}
