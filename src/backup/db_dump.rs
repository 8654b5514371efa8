// sitevault/src/backup/db_dump.rs
use chrono::Utc;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::database::{Database, Dialect, SqlValue};
use crate::errors::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub tables: usize,
    pub rows: u64,
}

/// Called with (tables done, tables total, current table).
pub type TableProgress<'a> = &'a (dyn Fn(usize, usize, &str) + Send + Sync);

/// Writes a replayable SQL dump of every non-excluded table to `dest`.
///
/// Each table gets an idempotent `DROP TABLE IF EXISTS`, its recreate
/// statements and multi-row `INSERT`s of at most `chunk_size` rows.
/// Constraints that reference other tables come last.
pub async fn dump_database(
    db: &dyn Database,
    dest: &Path,
    exclude_tables: &[String],
    chunk_size: usize,
    on_table: TableProgress<'_>,
) -> Result<DumpSummary> {
    let dialect = db.dialect();
    let chunk_size = chunk_size.max(1) as u64;
    let tables: Vec<String> = db
        .list_tables()
        .await?
        .into_iter()
        .filter(|t| !exclude_tables.iter().any(|ex| ex == t))
        .collect();

    let mut out = BufWriter::new(File::create(dest).await?);
    out.write_all(b"-- sitevault database dump\n").await?;
    out.write_all(format!("-- Dialect: {}\n", dialect).as_bytes()).await?;
    out.write_all(format!("-- Generated: {}\n\n", Utc::now().to_rfc3339()).as_bytes())
        .await?;
    for stmt in db.dump_prologue() {
        write_statement(&mut out, &stmt).await?;
    }

    let mut summary = DumpSummary::default();
    let mut deferred = Vec::new();
    let total = tables.len();

    for (idx, table) in tables.iter().enumerate() {
        on_table(idx, total, table);
        debug!("Dumping table {}", table);

        let definition = db.table_definition(table).await?;
        out.write_all(format!("\n-- Table: {}\n", table).as_bytes()).await?;
        write_statement(&mut out, &definition.drop).await?;
        for stmt in &definition.create {
            write_statement(&mut out, stmt).await?;
        }
        deferred.extend(definition.deferred);

        let columns = db.columns(table).await?;
        let key = db.row_key(table).await?;
        let column_list = columns
            .iter()
            .map(|c| dialect.quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut offset = 0u64;
        loop {
            let rows = db.fetch_rows(table, &columns, &key, offset, chunk_size).await?;
            if rows.is_empty() {
                break;
            }
            let insert = insert_statement(dialect, table, &column_list, &rows);
            write_statement(&mut out, &insert).await?;
            summary.rows += rows.len() as u64;
            offset += rows.len() as u64;
            if (rows.len() as u64) < chunk_size {
                break;
            }
        }
        summary.tables += 1;
    }

    if !deferred.is_empty() {
        out.write_all(b"\n-- Deferred constraints\n").await?;
        for stmt in &deferred {
            write_statement(&mut out, stmt).await?;
        }
    }
    for stmt in db.dump_epilogue() {
        write_statement(&mut out, &stmt).await?;
    }
    out.flush().await?;
    on_table(total, total, "");

    info!(
        "Database dump written to {} ({} tables, {} rows)",
        dest.display(),
        summary.tables,
        summary.rows
    );
    Ok(summary)
}

fn insert_statement(dialect: Dialect, table: &str, column_list: &str, rows: &[Vec<SqlValue>]) -> String {
    let values = rows
        .iter()
        .map(|row| {
            let cells = row.iter().map(|v| dialect.literal(v)).collect::<Vec<_>>();
            format!("({})", cells.join(", "))
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "INSERT INTO {} ({}) VALUES\n{}",
        dialect.quote_ident(table),
        column_list,
        values
    )
}

async fn write_statement(out: &mut BufWriter<File>, stmt: &str) -> Result<()> {
    out.write_all(stmt.trim_end().as_bytes()).await?;
    out.write_all(b";\n").await?;
    Ok(())
}
