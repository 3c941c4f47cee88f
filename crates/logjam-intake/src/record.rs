// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::str::FromStr;

/// A single accepted log event: field name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LogRecord {
    fields: Map<String, Value>,
}

/// Records from one multi-record submission. Each element is dispatched on its own.
pub type Batch = Vec<LogRecord>;

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Field names in ascending order.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names = self.fields.keys().map(String::as_str).collect::<Vec<&str>>();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Which occurrence of a repeated query parameter is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepeatedParam {
    #[default]
    FirstWins,
    LastWins,
}

impl RepeatedParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatedParam::FirstWins => "first",
            RepeatedParam::LastWins => "last",
        }
    }
}

impl FromStr for RepeatedParam {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(RepeatedParam::FirstWins),
            "last" => Ok(RepeatedParam::LastWins),
            other => Err(format!("expected 'first' or 'last', got '{other}'")),
        }
    }
}

/// Builds a record from a raw (still percent-encoded) query string. Every parameter becomes a
/// string field.
pub fn record_from_query(query: Option<&str>, repeated: RepeatedParam) -> LogRecord {
    let mut fields: HashMap<String, String> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match (fields.entry(key.into_owned()), repeated) {
            (Entry::Vacant(slot), _) => {
                slot.insert(value.into_owned());
            }
            (Entry::Occupied(mut slot), RepeatedParam::LastWins) => {
                slot.insert(value.into_owned());
            }
            (Entry::Occupied(_), RepeatedParam::FirstWins) => {}
        }
    }

    let mut record = LogRecord::new();
    for (key, value) in fields {
        record.insert(key, value);
    }
    record
}
