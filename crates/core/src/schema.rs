//! CRM table and column metadata used as prompt context for query generation.
//!
//! The on-disk format is a JSON object keyed by table name:
//!
//! ```json
//! { "Account": { "sfdc_description": "...", "columns": [
//!     { "name": "Industry", "type": "varchar", "sfdc_description": "...",
//!       "possible_values": ["Banking", "Retail"] } ] } }
//! ```
//!
//! Keys this module does not interpret (`salesforce_name`, `salesforce_label`, ...)
//! are preserved on round trip.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const TABLE_DESCRIPTION_KEY: &str = "_table_description";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("could not read metadata file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not write metadata file `{path}`: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("metadata is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(rename = "sfdc_description", alias = "description", default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_values: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ColumnMetadata {
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            description: description.into(),
            possible_values: None,
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    #[serde(rename = "sfdc_description", alias = "description", default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<ColumnMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|column| column.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableMetadata>,
}

impl SchemaCatalog {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| SchemaError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&raw)
    }

    /// Like [`SchemaCatalog::load`] but an absent file yields an empty catalog.
    pub fn load_or_empty(path: &Path) -> Result<Self, SchemaError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        fs::write(path, rendered)
            .map_err(|source| SchemaError::Write { path: path.to_path_buf(), source })
    }

    pub fn insert(&mut self, name: impl Into<String>, table: TableMetadata) {
        self.tables.insert(name.into(), table);
    }

    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drops tables that the warehouse does not report. Returns the dropped names.
    pub fn retain_tables<S: AsRef<str>>(&mut self, existing: &[S]) -> Vec<String> {
        let mut dropped = Vec::new();
        self.tables.retain(|name, _| {
            let keep = existing.iter().any(|candidate| candidate.as_ref() == name);
            if !keep {
                dropped.push(name.clone());
            }
            keep
        });
        dropped
    }

    /// Previously recorded, non-empty description of a column.
    pub fn column_description(&self, table: &str, column: &str) -> Option<&str> {
        self.table(table)?
            .column(column)
            .map(|column| column.description.as_str())
            .filter(|description| !description.trim().is_empty())
    }

    pub fn table_description(&self, table: &str) -> Option<&str> {
        self.table(table)
            .map(|table| table.description.as_str())
            .filter(|description| !description.trim().is_empty())
    }

    /// Pretty JSON of the catalog as it is embedded into prompts.
    pub fn render(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Hand-written descriptions that take priority over anything recorded or generated.
/// Keyed by table, then column; the `_table_description` key describes the table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraDescriptions {
    tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl ExtraDescriptions {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| SchemaError::Read { path: path.to_path_buf(), source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&str> {
        self.tables
            .get(table)?
            .get(column)
            .map(String::as_str)
            .filter(|description| !description.trim().is_empty())
    }

    pub fn table(&self, table: &str) -> Option<&str> {
        self.column(table, TABLE_DESCRIPTION_KEY)
    }
}
