//! Query/Subscription Filters
//!
//! Mirrors the NIP-01 filter object. Every populated field must match;
//! within a field any listed value matches. `since`/`until` are inclusive.

use std::collections::BTreeMap;

use super::event::Event;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u16>,
    /// Single-letter tag filters (`#p`, `#e`, `#u`, ...)
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Match events tagging the given public key (`#p`)
    pub fn pubkey(self, pubkey: impl Into<String>) -> Self {
        self.custom_tag('p', [pubkey.into()])
    }

    /// Match events referencing the given event id (`#e`)
    pub fn event(self, event_id: impl Into<String>) -> Self {
        self.custom_tag('e', [event_id.into()])
    }

    pub fn custom_tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(letter)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every populated field
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(letter, values)| {
            let name = letter.to_string();
            event.tags.iter().any(|tag| {
                tag.name() == Some(name.as_str())
                    && tag.value().is_some_and(|v| values.iter().any(|x| x == v))
            })
        })
    }
}
