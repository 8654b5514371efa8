use async_trait::async_trait;
use regex::Regex;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, MySqlPool, Row};
use std::sync::OnceLock;

use super::{predicate_clause, ColumnInfo, Database, Dialect, RowKey, SqlValue, TableDefinition};
use crate::errors::{AppError, Result};

const DIALECT: Dialect = Dialect::Mysql;

/// MySQL or MariaDB schema named by the connection url. One connection, so
/// session settings such as `FOREIGN_KEY_CHECKS` hold across a whole restore.
#[derive(Debug, Clone)]
pub struct MySqlDatabase {
    pool: MySqlPool,
}

impl MySqlDatabase {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn binary_type_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)^(?:tiny|medium|long)?blob|^(?:var)?binary|^bit\b|^geometry|^point|^linestring|^polygon|^multi")
                .ok()
        })
        .as_ref()
}

fn integer_type_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^(?:tiny|small|medium|big)?int\b").ok())
        .as_ref()
}

/// Columns read as raw bytes instead of text.
fn is_binary(column: &ColumnInfo) -> bool {
    binary_type_pattern().is_some_and(|re| re.is_match(&column.data_type))
}

fn is_integer(column: &ColumnInfo) -> bool {
    integer_type_pattern().is_some_and(|re| re.is_match(&column.data_type))
}

/// Everything but binary data is selected as text, so temporal and decimal
/// values keep their exact server rendering.
fn select_expr(column: &ColumnInfo) -> String {
    let ident = DIALECT.quote_ident(&column.name);
    if is_binary(column) {
        ident
    } else {
        format!("CAST({} AS CHAR)", ident)
    }
}

fn decode_cell(row: &MySqlRow, idx: usize, column: &ColumnInfo) -> Result<SqlValue> {
    if is_binary(column) {
        let bytes: Option<Vec<u8>> = row.try_get_unchecked(idx)?;
        return Ok(bytes.map_or(SqlValue::Null, SqlValue::Bytes));
    }
    let text: Option<String> = row.try_get_unchecked(idx)?;
    Ok(match text {
        None => SqlValue::Null,
        // Unsigned bigints past i64 stay text; MySQL converts them on insert.
        Some(t) if is_integer(column) => t.parse().map_or(SqlValue::Text(t), SqlValue::Int),
        Some(t) => SqlValue::Text(t),
    })
}

/// Groups `(index, column)` rows into the first complete index.
fn first_index(rows: Vec<(String, Option<String>)>) -> Option<(String, Vec<String>)> {
    let mut current: Option<(String, Vec<String>)> = None;
    let mut broken = false;
    for (index, column) in rows {
        match &mut current {
            Some((name, columns)) if *name == index => match column {
                Some(c) if !broken => columns.push(c),
                _ => broken = true,
            },
            _ => {
                if let Some(done) = current.take().filter(|_| !broken) {
                    return Some(done);
                }
                broken = column.is_none();
                current = Some((index, column.into_iter().collect()));
            }
        }
    }
    current.filter(|_| !broken)
}

#[async_trait]
impl Database for MySqlDatabase {
    fn dialect(&self) -> Dialect {
        DIALECT
    }

    async fn server_version(&self) -> Result<String> {
        let version: String = sqlx::query_scalar("SELECT CAST(VERSION() AS CHAR)")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
             ORDER BY TABLE_NAME",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn table_definition(&self, table: &str) -> Result<TableDefinition> {
        // Keys, indexes and AUTO_INCREMENT all live in the one statement.
        // Foreign keys load in any order once checks are off.
        let row = sqlx::query(&format!("SHOW CREATE TABLE {}", DIALECT.quote_ident(table)))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("table {}", table)))?;
        let create: String = row.try_get_unchecked(1)?;
        Ok(TableDefinition {
            drop: format!("DROP TABLE IF EXISTS {}", DIALECT.quote_ident(table)),
            create: vec![create],
            deferred: Vec::new(),
        })
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR)
             FROM information_schema.COLUMNS
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
             ORDER BY ORDINAL_POSITION",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type)| ColumnInfo::new(name, data_type))
            .collect())
    }

    async fn row_key(&self, table: &str) -> Result<RowKey> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT CAST(INDEX_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR)
             FROM information_schema.STATISTICS
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND NON_UNIQUE = 0
             ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(match first_index(rows) {
            Some((name, columns)) if name == "PRIMARY" => RowKey::Primary(columns),
            Some((_, columns)) => RowKey::Unique(columns),
            None => RowKey::AllColumns,
        })
    }

    async fn fetch_rows(
        &self,
        table: &str,
        columns: &[ColumnInfo],
        key: &RowKey,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let select = columns.iter().map(select_expr).collect::<Vec<_>>().join(", ");
        let order_by = match key {
            RowKey::Primary(cols) | RowKey::Unique(cols) => cols
                .iter()
                .map(|c| DIALECT.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            // Identical rows are interchangeable, so full ordering is stable enough.
            RowKey::AllColumns => (1..=columns.len())
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let query = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT {} OFFSET {}",
            select,
            DIALECT.quote_ident(table),
            order_by,
            limit,
            offset
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                values.push(decode_cell(row, idx, column)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = self.pool.execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn update_row(
        &self,
        table: &str,
        set: &[(String, SqlValue)],
        predicate: &[(String, SqlValue)],
    ) -> Result<u64> {
        let assignments = set
            .iter()
            .map(|(col, value)| format!("{} = {}", DIALECT.quote_ident(col), DIALECT.literal(value)))
            .collect::<Vec<_>>()
            .join(", ");
        let clause = predicate_clause(DIALECT, predicate, |col| DIALECT.quote_ident(col));
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            DIALECT.quote_ident(table),
            assignments,
            clause
        );
        self.execute(&sql).await
    }

    fn dump_prologue(&self) -> Vec<String> {
        vec![
            "SET NAMES utf8mb4".to_string(),
            "SET FOREIGN_KEY_CHECKS=0".to_string(),
        ]
    }

    fn dump_epilogue(&self) -> Vec<String> {
        vec!["SET FOREIGN_KEY_CHECKS=1".to_string()]
    }
}
