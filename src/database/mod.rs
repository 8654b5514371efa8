//! Relational database surface used by dump, restore and search/replace.

pub mod mysql;
pub mod postgres;
pub mod sequence_reset;
pub mod sqlite;
pub mod value;

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::errors::{AppError, Result};
pub use mysql::MySqlDatabase;
pub use postgres::PgDatabase;
pub use sqlite::SqliteDatabase;
pub use value::{Dialect, SqlValue};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    /// Columns that can hold strings worth rewriting.
    pub fn is_textual(&self) -> bool {
        static TEXTUAL: OnceLock<Option<Regex>> = OnceLock::new();
        TEXTUAL
            .get_or_init(|| Regex::new(r"(?i)text|char|clob").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(&self.data_type))
    }
}

/// How rows of a table are addressed for updates.
#[derive(Debug, Clone, PartialEq)]
pub enum RowKey {
    Primary(Vec<String>),
    Unique(Vec<String>),
    /// No key; every column forms the predicate and duplicate rows are
    /// indistinguishable.
    AllColumns,
}

impl RowKey {
    pub fn columns<'a>(&'a self, all: &'a [ColumnInfo]) -> Vec<&'a str> {
        match self {
            RowKey::Primary(cols) | RowKey::Unique(cols) => cols.iter().map(String::as_str).collect(),
            RowKey::AllColumns => all.iter().map(|c| c.name.as_str()).collect(),
        }
    }
}

/// Statements needed to recreate one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableDefinition {
    pub drop: String,
    /// Run before data is inserted (sequences, CREATE TABLE, keys, indexes).
    pub create: Vec<String>,
    /// Run after every table has been loaded (foreign keys).
    pub deferred: Vec<String>,
}

#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn server_version(&self) -> Result<String>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn table_definition(&self, table: &str) -> Result<TableDefinition>;

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn row_key(&self, table: &str) -> Result<RowKey>;

    /// Reads `limit` rows starting at `offset`, in a stable order derived from
    /// `key`. Values come back in the order of `columns`.
    async fn fetch_rows(
        &self,
        table: &str,
        columns: &[ColumnInfo],
        key: &RowKey,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<SqlValue>>>;

    async fn execute(&self, sql: &str) -> Result<u64>;

    async fn update_row(
        &self,
        table: &str,
        set: &[(String, SqlValue)],
        predicate: &[(String, SqlValue)],
    ) -> Result<u64>;

    /// Statements written before the first table of a dump.
    fn dump_prologue(&self) -> Vec<String> {
        Vec::new()
    }

    /// Statements written after the last statement of a dump.
    fn dump_epilogue(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hook run after a dump has been replayed successfully.
    async fn finish_restore(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the `WHERE` clause for `update_row`, mapping NULL to `IS NULL`.
pub(crate) fn predicate_clause(
    dialect: Dialect,
    predicate: &[(String, SqlValue)],
    column_expr: impl Fn(&str) -> String,
) -> String {
    predicate
        .iter()
        .map(|(col, value)| {
            let expr = column_expr(col);
            if value.is_null() {
                format!("{} IS NULL", expr)
            } else {
                format!("{} = {}", expr, dialect.literal(value))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub async fn connect_database(url: &str) -> Result<Arc<dyn Database>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PgDatabase::connect(url).await?))
    } else if url.starts_with("mysql://") {
        Ok(Arc::new(MySqlDatabase::connect(url).await?))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteDatabase::connect(url).await?))
    } else {
        Err(AppError::Configuration(format!(
            "unsupported database url scheme: {}",
            url.split(':').next().unwrap_or(url)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textual_columns() {
        assert!(ColumnInfo::new("a", "TEXT").is_textual());
        assert!(ColumnInfo::new("a", "character varying(255)").is_textual());
        assert!(ColumnInfo::new("a", "longtext").is_textual());
        assert!(!ColumnInfo::new("a", "integer").is_textual());
        assert!(!ColumnInfo::new("a", "bytea").is_textual());
    }

    #[test]
    fn test_predicate_clause_handles_null() {
        let clause = predicate_clause(
            Dialect::Sqlite,
            &[
                ("id".to_string(), SqlValue::Int(3)),
                ("note".to_string(), SqlValue::Null),
            ],
            |c| Dialect::Sqlite.quote_ident(c),
        );
        assert_eq!(clause, "\"id\" = 3 AND \"note\" IS NULL");
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_configuration_error() {
        let result = connect_database("oracle://localhost/site").await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
