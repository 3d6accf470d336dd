use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use serde::Serialize;

#[derive(Clone, Debug, Default, Serialize)]
pub struct Span {
    pub name:       String,
    pub start:      u64,
    pub end:        u64,
    pub attributes: BTreeMap<String, String>,
    pub events:     Vec<Event>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Event {
    pub stream: &'static str,
    pub line:   String,
}

impl Span {
    pub fn new(name: &str, start: SystemTime) -> Self {
        Self {
            name:       name.to_owned(),
            start:      millis(start),
            end:        millis(SystemTime::now()),
            attributes: BTreeMap::new(),
            events:     Vec::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_owned(), value.into());
        self
    }

    pub fn events(mut self, stream: &'static str, lines: Vec<String>) -> Self {
        self.events.extend(lines.into_iter().map(|line| Event { stream, line }));
        self
    }
}

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
