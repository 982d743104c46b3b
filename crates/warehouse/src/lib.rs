//! Connector for a Presto-compatible serverless warehouse.
//!
//! [`Warehouse`] is the seam the pipeline depends on; [`PrestoClient`] speaks the
//! Presto REST statement protocol over `reqwest`.

pub mod error;
pub mod presto;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::domain::result_set::{Column, ResultSet};

pub use error::{QueryErrorBody, WarehouseError};
pub use presto::PrestoClient;

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn catalog(&self) -> &str;
    fn database(&self) -> &str;

    async fn execute(&self, sql: &str) -> Result<ResultSet, WarehouseError>;

    /// Plans the statement without running it.
    async fn validate(&self, sql: &str) -> Result<(), WarehouseError> {
        self.execute(&format!("EXPLAIN {sql}")).await.map(|_| ())
    }

    async fn list_tables(&self) -> Result<Vec<String>, WarehouseError> {
        let sql = format!(
            "SHOW TABLES FROM {}.{}",
            quote_identifier(self.catalog()),
            quote_identifier(self.database())
        );
        let result = self.execute(&sql).await?;
        Ok(first_column_strings(&result))
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<Column>, WarehouseError> {
        let sql = format!("DESCRIBE {}", self.qualified(table));
        let result = self.execute(&sql).await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?;
                let data_type = row.get(1).and_then(Value::as_str).unwrap_or_default();
                Some(Column::new(name, data_type))
            })
            .collect())
    }

    /// Up to `limit` non-null values of one column.
    async fn sample_column(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<Value>, WarehouseError> {
        let column = quote_identifier(column);
        let sql = format!(
            "SELECT {column} FROM {} WHERE {column} IS NOT NULL LIMIT {limit}",
            self.qualified(table)
        );
        let result = self.execute(&sql).await?;
        Ok(result.rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "{}.{}.{}",
            quote_identifier(self.catalog()),
            quote_identifier(self.database()),
            quote_identifier(table)
        )
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn first_column_strings(result: &ResultSet) -> Vec<String> {
    result
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_owned))
        .collect()
}
