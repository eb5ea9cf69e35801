use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ExtractError;

pub const TITLE_KEY: &str = "_title";
pub const AUTHOR_KEY: &str = "_author";
pub const DATE_KEY: &str = "_date";

/// Metadata slots; never treated as dynamic attributes.
pub const RESERVED_KEYS: &[&str] = &[TITLE_KEY, AUTHOR_KEY, DATE_KEY];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_KEYS.contains(&name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub url: String,
}

/// One extracted document before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub title: Option<Title>,
    pub author: Option<Author>,
    pub date: Option<String>,
    /// Attribute name -> value, in document order. Extraction only
    /// produces strings; imported lines may carry anything.
    pub attributes: Map<String, Value>,
}

impl RawDocument {
    /// Split one JSON line's object into metadata and attributes.
    pub fn from_json(id: impl Into<String>, mut map: Map<String, Value>) -> Result<Self, ExtractError> {
        let id = id.into();
        let title = take_meta::<Title>(&id, &mut map, TITLE_KEY)?;
        let author = take_meta::<Author>(&id, &mut map, AUTHOR_KEY)?;
        let date = match map.shift_remove(DATE_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => {
                return Err(ExtractError::Metadata {
                    id,
                    field: DATE_KEY,
                })
            }
        };
        Ok(RawDocument {
            id,
            title,
            author,
            date,
            attributes: map,
        })
    }

    /// The JSON line form: metadata under reserved keys, then attributes
    /// under their trimmed names.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(title) = &self.title {
            out.insert(TITLE_KEY.into(), serde_json::json!(title));
        }
        if let Some(author) = &self.author {
            out.insert(AUTHOR_KEY.into(), serde_json::json!(author));
        }
        if let Some(date) = &self.date {
            out.insert(DATE_KEY.into(), Value::String(date.clone()));
        }
        for (name, value) in &self.attributes {
            let name = name.trim();
            if is_reserved(name) {
                warn!("{}: attribute '{}' shadows metadata, not exported", self.id, name);
                continue;
            }
            out.insert(name.to_string(), value.clone());
        }
        out
    }
}

fn take_meta<T: serde::de::DeserializeOwned>(
    id: &str,
    map: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<T>, ExtractError> {
    match map.shift_remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v).map(Some).map_err(|_| ExtractError::Metadata {
            id: id.to_string(),
            field,
        }),
    }
}

/// A normalized document, ready for the relational sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub title: Title,
    pub author: Author,
    pub date: Option<DateTime<FixedOffset>>,
    pub values: Vec<ValueRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRow {
    pub key_id: i64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub id: i64,
    pub name: String,
}
