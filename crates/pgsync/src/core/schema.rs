//! Catalog types shared by the data source, resolver and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A table, identified by schema and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Table {
    schema: String,
    name: String,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`. Returns `None` for unqualified names.
    pub fn parse_qualified(value: &str) -> Option<Self> {
        value
            .split_once('.')
            .map(|(schema, name)| Self::new(schema, name))
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `schema.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A sequence backing a column. Identity is schema and name only.
#[derive(Debug, Clone)]
pub struct Sequence {
    schema: String,
    name: String,
    column: String,
}

impl Sequence {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            column: column.into(),
        }
    }

    /// Parse the `schema.name` text returned by `pg_get_serial_sequence`,
    /// which may carry quotes around either part.
    pub fn from_regclass(value: &str, column: impl Into<String>) -> Option<Self> {
        let (schema, name) = split_regclass(value)?;
        Some(Self::new(schema, name, column))
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> &str {
        &self.column
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.name == other.name
    }
}

impl Eq for Sequence {}

impl Hash for Sequence {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Split a (possibly quoted) `schema.name` regclass text.
fn split_regclass(value: &str) -> Option<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    match parts.len() {
        2 => {
            let name = parts.pop()?;
            let schema = parts.pop()?;
            Some((schema, name))
        }
        _ => None,
    }
}

/// A column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A trigger on a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    /// System trigger (e.g. FK enforcement).
    pub internal: bool,
    pub enabled: bool,
    /// Backs a constraint.
    pub integrity: bool,
}

/// A foreign key constraint that cannot be deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonDeferrableConstraint {
    pub table: Table,
    pub name: String,
}

impl fmt::Display for NonDeferrableConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}
