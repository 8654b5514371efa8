use async_trait::async_trait;
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, SqlitePool, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::OnceLock;

use super::{predicate_clause, ColumnInfo, Database, Dialect, RowKey, SqlValue, TableDefinition};
use crate::errors::{AppError, Result};

const DIALECT: Dialect = Dialect::Sqlite;

/// SQLite database. A single pooled connection keeps `:memory:` databases
/// and connection-scoped pragmas alive for the whole session.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn table_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?is)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")+"|\[[^\]]+\]|`[^`]+`|[^\s(]+)"#,
            )
            .ok()
        })
        .as_ref()
}

fn index_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")+"|\[[^\]]+\]|`[^`]+`|[^\s(]+)"#,
            )
            .ok()
        })
        .as_ref()
}

fn index_target_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?is)\bON\s+(?:"(?:[^"]|"")+"|\[[^\]]+\]|`[^`]+`|[^\s(]+)\s*\("#).ok()
        })
        .as_ref()
}

/// Rewrites the stored DDL so the table name is always a double-quoted
/// identifier, whatever quoting the original statement used.
fn normalize_create_table(sql: &str, table: &str) -> Result<String> {
    let pattern = table_name_pattern()
        .ok_or_else(|| AppError::Validation("table name pattern failed to compile".into()))?;
    let replacement = format!("CREATE TABLE {}", DIALECT.quote_ident(table));
    Ok(pattern.replace(sql, regex::NoExpand(&replacement)).into_owned())
}

/// Quotes both the index name and its table.
fn normalize_create_index(sql: &str, name: &str, table: &str) -> Result<String> {
    let (Some(name_pattern), Some(target_pattern)) = (index_name_pattern(), index_target_pattern())
    else {
        return Err(AppError::Validation("index pattern failed to compile".into()));
    };
    let unique = name_pattern
        .captures(sql)
        .is_some_and(|caps| caps.get(1).is_some());
    let header = format!(
        "CREATE {}INDEX {}",
        if unique { "UNIQUE " } else { "" },
        DIALECT.quote_ident(name)
    );
    let sql = name_pattern.replace(sql, regex::NoExpand(&header));
    let target = format!("ON {} (", DIALECT.quote_ident(table));
    Ok(target_pattern.replace(&sql, regex::NoExpand(&target)).into_owned())
}

fn decode_cell(row: &SqliteRow, idx: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let storage_class = raw.type_info().name().to_string();
    Ok(match storage_class.as_str() {
        "INTEGER" => SqlValue::Int(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => SqlValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => SqlValue::Text(text),
            Err(_) => SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        },
    })
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        DIALECT
    }

    async fn server_version(&self) -> Result<String> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn table_definition(&self, table: &str) -> Result<TableDefinition> {
        let sql: Option<String> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        let sql = sql.ok_or_else(|| AppError::NotFound(format!("table {}", table)))?;

        let mut create = vec![normalize_create_table(&sql, table)?];

        let indexes: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
             ORDER BY name",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        for (name, index) in indexes {
            create.push(normalize_create_index(&index, &name, table)?);
        }

        Ok(TableDefinition {
            drop: format!("DROP TABLE IF EXISTS {}", DIALECT.quote_ident(table)),
            create,
            deferred: Vec::new(),
        })
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo::new(
                    row.try_get::<String, _>("name")?,
                    row.try_get::<String, _>("type")?,
                ))
            })
            .collect()
    }

    async fn row_key(&self, table: &str) -> Result<RowKey> {
        let primary: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if !primary.is_empty() {
            return Ok(RowKey::Primary(primary));
        }

        let unique_index: Option<String> = sqlx::query_scalar(
            "SELECT name FROM pragma_index_list(?1)
             WHERE \"unique\" = 1 AND partial = 0
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(index) = unique_index {
            let columns: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
            )
            .bind(&index)
            .fetch_all(&self.pool)
            .await?;
            if !columns.is_empty() {
                return Ok(RowKey::Unique(columns));
            }
        }

        Ok(RowKey::AllColumns)
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
        let select = columns
            .iter()
            .map(|c| DIALECT.quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let order_by = match key {
            RowKey::Primary(cols) | RowKey::Unique(cols) => cols
                .iter()
                .map(|c| DIALECT.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            // Keyless tables always have a rowid.
            RowKey::AllColumns => "rowid".to_string(),
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
            for idx in 0..columns.len() {
                values.push(decode_cell(row, idx)?);
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
        vec!["PRAGMA foreign_keys=OFF".to_string()]
    }

    fn dump_epilogue(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys=ON".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> anyhow::Result<SqliteDatabase> {
        Ok(SqliteDatabase::connect("sqlite::memory:").await?)
    }

    #[test]
    fn test_create_table_name_is_quoted() -> anyhow::Result<()> {
        let sql = "CREATE TABLE IF NOT EXISTS wp_posts (id INTEGER PRIMARY KEY)";
        assert_eq!(
            normalize_create_table(sql, "wp_posts")?,
            "CREATE TABLE \"wp_posts\" (id INTEGER PRIMARY KEY)"
        );
        let sql = "CREATE TABLE [wp_options](name TEXT)";
        assert_eq!(
            normalize_create_table(sql, "wp_options")?,
            "CREATE TABLE \"wp_options\"(name TEXT)"
        );
        let sql = "CREATE INDEX wp_meta_key ON wp_meta(key)";
        assert_eq!(
            normalize_create_index(sql, "wp_meta_key", "wp_meta")?,
            "CREATE INDEX \"wp_meta_key\" ON \"wp_meta\" (key)"
        );
        let sql = "CREATE UNIQUE INDEX IF NOT EXISTS [wp_slug] ON \"wp_posts\" (slug)";
        assert_eq!(
            normalize_create_index(sql, "wp_slug", "wp_posts")?,
            "CREATE UNIQUE INDEX \"wp_slug\" ON \"wp_posts\" (slug)"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_row_key_prefers_primary_then_unique() -> anyhow::Result<()> {
        let db = memory_db().await?;
        db.execute("CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT)").await?;
        db.execute("CREATE TABLE b (slug TEXT NOT NULL, v TEXT)").await?;
        db.execute("CREATE UNIQUE INDEX b_slug ON b (slug)").await?;
        db.execute("CREATE TABLE c (k TEXT, v TEXT)").await?;

        assert_eq!(db.row_key("a").await?, RowKey::Primary(vec!["id".into()]));
        assert_eq!(db.row_key("b").await?, RowKey::Unique(vec!["slug".into()]));
        assert_eq!(db.row_key("c").await?, RowKey::AllColumns);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_rows_preserves_storage_classes() -> anyhow::Result<()> {
        let db = memory_db().await?;
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, r REAL, s TEXT, b BLOB, n TEXT)")
            .await?;
        db.execute("INSERT INTO t VALUES (1, 2.5, 'x', X'0102', NULL)").await?;

        let columns = db.columns("t").await?;
        let key = db.row_key("t").await?;
        let rows = db.fetch_rows("t", &columns, &key, 0, 10).await?;
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Int(1),
                SqlValue::Float(2.5),
                SqlValue::Text("x".into()),
                SqlValue::Bytes(vec![1, 2]),
                SqlValue::Null,
            ]]
        );
        Ok(())
    }
}
