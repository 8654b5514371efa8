use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Row};
use std::sync::OnceLock;
use tracing::{info, warn};

use super::sequence_reset::reset_sequences_with_timeout;
use super::{predicate_clause, ColumnInfo, Database, Dialect, RowKey, SqlValue, TableDefinition};
use crate::errors::Result;

const DIALECT: Dialect = Dialect::Postgres;

/// PostgreSQL source/target restricted to the `public` schema.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(table: &str) -> String {
        format!("public.{}", DIALECT.quote_ident(table))
    }

    /// Indexes not backing a constraint, rebuilt with quoted names so a
    /// prefix rewrite reaches them.
    async fn index_defs(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT ic.relname::text AS index_name, i.indisunique AS is_unique,
                    pg_get_indexdef(i.indexrelid) AS def
             FROM pg_index i
             JOIN pg_class ic ON ic.oid = i.indexrelid
             WHERE i.indrelid = $1::text::regclass
               AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = i.indexrelid)
             ORDER BY ic.relname",
        )
        .bind(Self::qualified(table))
        .fetch_all(&self.pool)
        .await?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("index_name")?;
            let unique: bool = row.try_get("is_unique")?;
            let def: String = row.try_get("def")?;
            let Some(at) = def.find(" USING ") else {
                warn!("Skipping index {} with unexpected definition: {}", name, def);
                continue;
            };
            defs.push(format!(
                "CREATE {}INDEX {} ON {}{}",
                if unique { "UNIQUE " } else { "" },
                DIALECT.quote_ident(&name),
                DIALECT.quote_ident(table),
                &def[at..]
            ));
        }
        Ok(defs)
    }

    async fn foreign_key_defs(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT c.conname::text AS conname,
                    ARRAY(SELECT a.attname::text
                          FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
                          JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
                          ORDER BY k.ord) AS columns,
                    ref.relname::text AS ref_table,
                    ARRAY(SELECT a.attname::text
                          FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord)
                          JOIN pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum
                          ORDER BY k.ord) AS ref_columns,
                    c.confupdtype::text AS on_update,
                    c.confdeltype::text AS on_delete
             FROM pg_constraint c
             JOIN pg_class ref ON ref.oid = c.confrelid
             WHERE c.conrelid = $1::text::regclass AND c.contype = 'f'
             ORDER BY c.conname",
        )
        .bind(Self::qualified(table))
        .fetch_all(&self.pool)
        .await?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("conname")?;
            let columns: Vec<String> = row.try_get("columns")?;
            let ref_table: String = row.try_get("ref_table")?;
            let ref_columns: Vec<String> = row.try_get("ref_columns")?;
            let on_update: String = row.try_get("on_update")?;
            let on_delete: String = row.try_get("on_delete")?;
            defs.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
                DIALECT.quote_ident(table),
                DIALECT.quote_ident(&name),
                quote_list(&columns),
                DIALECT.quote_ident(&ref_table),
                quote_list(&ref_columns),
                referential_action(&on_update),
                referential_action(&on_delete)
            ));
        }
        Ok(defs)
    }

    async fn constraint_defs(&self, table: &str, contype: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT conname::text AS conname, pg_get_constraintdef(oid) AS def
             FROM pg_constraint
             WHERE conrelid = $1::text::regclass AND contype = $2::\"char\"
             ORDER BY conname",
        )
        .bind(Self::qualified(table))
        .bind(contype)
        .fetch_all(&self.pool)
        .await?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("conname")?;
            let def: String = row.try_get("def")?;
            defs.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                DIALECT.quote_ident(table),
                DIALECT.quote_ident(&name),
                def
            ));
        }
        Ok(defs)
    }
}

fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| DIALECT.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps `pg_constraint.confupdtype`/`confdeltype` codes to SQL.
fn referential_action(code: &str) -> &'static str {
    match code {
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => "NO ACTION",
    }
}

fn nextval_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"nextval\('((?:[^']|'')+)'::regclass\)").ok())
        .as_ref()
}

/// Sequence name out of a `regclass` literal such as `public.wp_posts_id_seq`
/// or `"Odd_seq"`.
fn sequence_name(raw: &str) -> String {
    let raw = raw.replace("''", "'");
    let unqualified = raw
        .strip_prefix("public.")
        .or_else(|| raw.strip_prefix("\"public\"."))
        .unwrap_or(&raw);
    match unqualified
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => unqualified.to_string(),
    }
}

/// Rewrites `nextval('seq'::regclass)` so the sequence is a quoted
/// identifier inside the literal. Returns the new default and the sequence.
fn quote_sequence_default(default: &str) -> (String, Option<String>) {
    let Some(pattern) = nextval_pattern() else {
        return (default.to_string(), None);
    };
    let Some(caps) = pattern.captures(default) else {
        return (default.to_string(), None);
    };
    let sequence = sequence_name(&caps[1]);
    let quoted = DIALECT.quote_ident(&sequence).replace('\'', "''");
    let rewritten = pattern
        .replace(default, regex::NoExpand(&format!("nextval('{}'::regclass)", quoted)))
        .into_owned();
    (rewritten, Some(sequence))
}

#[async_trait]
impl Database for PgDatabase {
    fn dialect(&self) -> Dialect {
        DIALECT
    }

    async fn server_version(&self) -> Result<String> {
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn table_definition(&self, table: &str) -> Result<TableDefinition> {
        let ident = DIALECT.quote_ident(table);

        let columns = sqlx::query(
            "SELECT a.attname::text AS column_name,
                    format_type(a.atttypid, a.atttypmod) AS column_type,
                    a.attnotnull AS not_null,
                    pg_get_expr(d.adbin, d.adrelid) AS column_default
             FROM pg_attribute a
             LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
             WHERE a.attrelid = $1::text::regclass AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum",
        )
        .bind(Self::qualified(table))
        .fetch_all(&self.pool)
        .await?;

        let mut column_defs = Vec::with_capacity(columns.len());
        // (sequence, owning column) pairs taken from nextval() defaults.
        let mut sequences: Vec<(String, String)> = Vec::new();
        for row in &columns {
            let name: String = row.try_get("column_name")?;
            let column_type: String = row.try_get("column_type")?;
            let not_null: bool = row.try_get("not_null")?;
            let default: Option<String> = row.try_get("column_default")?;

            let mut def = format!("  {} {}", DIALECT.quote_ident(&name), column_type);
            if let Some(default) = default {
                let (default, sequence) = quote_sequence_default(&default);
                if let Some(sequence) = sequence {
                    sequences.push((sequence, name.clone()));
                }
                def.push_str(&format!(" DEFAULT {}", default));
            }
            if not_null {
                def.push_str(" NOT NULL");
            }
            column_defs.push(def);
        }

        // Sequences must exist before the defaults that call them.
        let mut create: Vec<String> = sequences
            .iter()
            .map(|(seq, _)| format!("CREATE SEQUENCE IF NOT EXISTS {}", DIALECT.quote_ident(seq)))
            .collect();
        create.push(format!("CREATE TABLE {} (\n{}\n)", ident, column_defs.join(",\n")));
        for (seq, column) in &sequences {
            create.push(format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                DIALECT.quote_ident(seq),
                ident,
                DIALECT.quote_ident(column)
            ));
        }

        create.extend(self.constraint_defs(table, "p").await?);
        create.extend(self.constraint_defs(table, "u").await?);
        create.extend(self.index_defs(table).await?);

        // Foreign keys need every table; sequences need the data.
        let mut deferred = self.foreign_key_defs(table).await?;
        for (seq, column) in &sequences {
            deferred.push(format!(
                "SELECT setval('{}'::regclass, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                DIALECT.quote_ident(seq).replace('\'', "''"),
                DIALECT.quote_ident(column),
                ident
            ));
        }

        Ok(TableDefinition {
            drop: format!("DROP TABLE IF EXISTS {} CASCADE", ident),
            create,
            deferred,
        })
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type
             FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo::new(
                    row.try_get::<String, _>("column_name")?,
                    row.try_get::<String, _>("data_type")?,
                ))
            })
            .collect()
    }

    async fn row_key(&self, table: &str) -> Result<RowKey> {
        let rows = sqlx::query(
            "SELECT c.contype::text AS kind, c.conname::text AS name, a.attname::text AS column_name
             FROM pg_constraint c
             JOIN LATERAL unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord) ON true
             JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
             WHERE c.conrelid = $1::text::regclass AND c.contype IN ('p', 'u')
             ORDER BY c.contype, c.conname, k.ord",
        )
        .bind(Self::qualified(table))
        .fetch_all(&self.pool)
        .await?;

        let mut kind: Option<(String, String)> = None;
        let mut columns = Vec::new();
        for row in rows {
            let current: (String, String) = (row.try_get("kind")?, row.try_get("name")?);
            if kind.is_none() {
                kind = Some(current);
            } else if kind.as_ref() != Some(&current) {
                break;
            }
            columns.push(row.try_get::<String, _>("column_name")?);
        }

        Ok(match kind {
            Some((k, _)) if k == "p" => RowKey::Primary(columns),
            Some(_) => RowKey::Unique(columns),
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
        // Values travel as text; the server parses them back on insert.
        let select = columns
            .iter()
            .map(|c| format!("{}::text", DIALECT.quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let order_by = match key {
            RowKey::Primary(cols) | RowKey::Unique(cols) => cols
                .iter()
                .map(|c| DIALECT.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            RowKey::AllColumns => columns
                .iter()
                .map(|c| format!("{}::text", DIALECT.quote_ident(&c.name)))
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
        for row in rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: Option<String> = row.try_get(idx)?;
                values.push(value.map(SqlValue::Text).unwrap_or(SqlValue::Null));
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
        let clause = predicate_clause(DIALECT, predicate, |col| {
            format!("{}::text", DIALECT.quote_ident(col))
        });
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
            "SET client_encoding = 'UTF8'".to_string(),
            "SET standard_conforming_strings = on".to_string(),
        ]
    }

    async fn finish_restore(&self) -> Result<()> {
        match reset_sequences_with_timeout(&self.pool).await {
            Ok(count) => info!("Post-restore sequence reset finished ({} sequences)", count),
            Err(e) => warn!("Post-restore sequence reset failed: {:#}", e),
        }
        Ok(())
    }
}
