//! Front-matter codec for synced notes.
//!
//! Notes carry a flat metadata block ahead of the body:
//! ```markdown
//! ---
//! remote_id: 1234
//! title: My Note
//! tags:
//!   - inbox
//!   - rust
//! sync_status: synced
//! ---
//!
//! Body text...
//! ```
//!
//! The block is YAML, read with `serde_yaml` into a flat ordered map of
//! strings and string lists. Numbers and booleans come back as strings and
//! nested mappings as their YAML text, so `encode(decode(x))` is not
//! byte-exact for arbitrary YAML.

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::str::FromStr;

pub const REMOTE_ID: &str = "remote_id";
pub const SERVICE: &str = "service";
pub const TITLE: &str = "title";
pub const TAGS: &str = "tags";
pub const SOURCE: &str = "source";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const SYNC_STATUS: &str = "sync_status";
pub const LAST_SYNCED: &str = "last_synced";

const DELIMITER: &str = "---";

/// A front-matter value: a plain string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

/// Per-note sync state recorded in front matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteSyncState {
    Synced,
    Pending,
    Conflict,
    Error,
}

impl NoteSyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteSyncState::Synced => "synced",
            NoteSyncState::Pending => "pending",
            NoteSyncState::Conflict => "conflict",
            NoteSyncState::Error => "error",
        }
    }
}

impl fmt::Display for NoteSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteSyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(NoteSyncState::Synced),
            "pending" => Ok(NoteSyncState::Pending),
            "conflict" => Ok(NoteSyncState::Conflict),
            "error" => Ok(NoteSyncState::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Ordered key/value metadata. Keys keep their insertion order on encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontMatter {
    fields: Vec<(String, FieldValue)>,
}

impl FrontMatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Scalar value for `key`. Empty strings read as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            FieldValue::Scalar(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// List value for `key`; a scalar reads as a one-element list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(FieldValue::List(items)) => items.clone(),
            Some(FieldValue::Scalar(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Insert or replace `key`, keeping its original position when replacing.
    pub fn set(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, FieldValue::Scalar(value.into()));
    }

    pub fn set_list(&mut self, key: impl Into<String>, items: Vec<String>) {
        self.set(key, FieldValue::List(items));
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.get_str(REMOTE_ID)
    }

    pub fn title(&self) -> Option<&str> {
        self.get_str(TITLE)
    }

    pub fn tags(&self) -> Vec<String> {
        self.get_list(TAGS)
    }

    pub fn sync_state(&self) -> Option<NoteSyncState> {
        self.get_str(SYNC_STATUS)?.parse().ok()
    }

    pub fn set_sync_state(&mut self, state: NoteSyncState) {
        self.set_str(SYNC_STATUS, state.as_str());
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.get_str(key)?)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn set_timestamp(&mut self, key: &str, at: DateTime<Utc>) {
        self.set_str(key, at.to_rfc3339());
    }
}

/// A note split into metadata and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNote {
    pub front_matter: FrontMatter,
    pub body: String,
}

impl ParsedNote {
    /// Parse `text`, treating anything without a valid block as plain body.
    pub fn from_text(text: &str) -> Self {
        decode(text).unwrap_or_else(|| ParsedNote {
            front_matter: FrontMatter::new(),
            body: text.to_string(),
        })
    }

    pub fn to_text(&self) -> String {
        encode(&self.front_matter, &self.body)
    }
}

/// Parse a leading front-matter block.
///
/// The block must open the text with a `---` line and end at the next `---`
/// line; its content is YAML. Returns `None` when there is no block or its
/// YAML is not a mapping; callers fall back to treating the whole text as body.
pub fn decode(text: &str) -> Option<ParsedNote> {
    let rest = text
        .strip_prefix("---\r\n")
        .or_else(|| text.strip_prefix("---\n"))?;

    // Find the closing delimiter line
    let mut offset = 0;
    let mut closing = None;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == DELIMITER {
            closing = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }
    let (yaml_end, body_start) = closing?;

    let yaml = &rest[..yaml_end];
    let front_matter = if yaml.trim().is_empty() {
        FrontMatter::new()
    } else {
        match serde_yaml::from_str::<Value>(yaml) {
            Ok(Value::Mapping(mapping)) => from_mapping(mapping),
            Ok(Value::Null) => FrontMatter::new(),
            // Invalid YAML or not key/value pairs
            _ => return None,
        }
    };

    let body = &rest[body_start..];
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);

    Some(ParsedNote {
        front_matter,
        body: body.to_string(),
    })
}

/// Serialize metadata and body into note text.
///
/// Keys are written in insertion order, scalars as YAML strings and lists as
/// block sequences, followed by a blank line and the body.
pub fn encode(front_matter: &FrontMatter, body: &str) -> String {
    if front_matter.is_empty() {
        return format!("---\n---\n\n{body}");
    }

    let mut mapping = Mapping::new();
    for (key, value) in front_matter.iter() {
        let value = match value {
            FieldValue::Scalar(s) => Value::String(s.clone()),
            FieldValue::List(items) => {
                Value::Sequence(items.iter().cloned().map(Value::String).collect())
            }
        };
        mapping.insert(Value::String(key.to_string()), value);
    }
    let yaml = serde_yaml::to_string(&mapping).unwrap_or_default();
    format!("---\n{yaml}---\n\n{body}")
}

fn from_mapping(mapping: Mapping) -> FrontMatter {
    let mut front_matter = FrontMatter::new();
    for (key, value) in mapping {
        let Some(key) = scalar_text(&key) else {
            continue;
        };
        let value = match value {
            Value::Sequence(items) => FieldValue::List(
                items
                    .iter()
                    .filter_map(scalar_text)
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            ),
            other => FieldValue::Scalar(scalar_text(&other).unwrap_or_else(|| nested_text(&other))),
        };
        front_matter.set(key, value);
    }
    front_matter
}

/// Text of a YAML scalar. Null reads as an empty string.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Tagged(tagged) => scalar_text(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

/// Nested mappings are kept as their YAML text.
fn nested_text(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|yaml| yaml.trim_end().to_string())
        .unwrap_or_default()
}
