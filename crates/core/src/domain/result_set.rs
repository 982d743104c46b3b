use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self { name: name.into(), data_type: data_type.into() }
    }
}

/// Tabular query result. Rows are positional and aligned with `columns`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self, DomainError> {
        if let Some((index, row)) =
            rows.iter().enumerate().find(|(_, row)| row.len() != columns.len())
        {
            return Err(DomainError::InvariantViolation(format!(
                "row {index} has {} values but the result has {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    pub fn row_as_map(&self, row: usize) -> Option<Map<String, Value>> {
        let values = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .zip(values)
                .map(|(column, value)| (column.name.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn preview_rows(&self, limit: usize) -> Vec<Map<String, Value>> {
        (0..self.rows.len().min(limit)).filter_map(|row| self.row_as_map(row)).collect()
    }

    /// Distinct values of a column in first-seen order.
    pub fn distinct_values(&self, column: &str) -> Option<Vec<Value>> {
        let index = self.column_index(column)?;
        let mut seen: Vec<Value> = Vec::new();
        for row in &self.rows {
            if let Some(value) = row.get(index) {
                if !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }
        Some(seen)
    }

    /// Header plus at most `limit` rows as CSV. Nulls become empty cells.
    pub fn to_csv(&self, limit: usize) -> Result<String, DomainError> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(self.columns.iter().map(|column| column.name.as_str()))
            .map_err(csv_error)?;
        for row in self.rows.iter().take(limit) {
            writer.write_record(row.iter().map(render_cell)).map_err(csv_error)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|error| DomainError::InvariantViolation(error.to_string()))?;
        String::from_utf8(bytes).map_err(|error| DomainError::InvariantViolation(error.to_string()))
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn csv_error(error: csv::Error) -> DomainError {
    DomainError::InvariantViolation(format!("csv rendering failed: {error}"))
}
