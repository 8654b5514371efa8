// sitevault/src/database/sequence_reset.rs
use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const SEQUENCE_RESET_TIMEOUT: Duration = Duration::from_secs(300);

/// Moves every column-owned sequence in `public` past the column's current
/// maximum, so inserts after a restore do not collide with restored ids.
pub async fn reset_all_sequences(db_pool: &PgPool) -> Result<usize> {
    let sequences_query = r#"
        SELECT
            seq.relname AS sequence_name,
            tab.relname AS table_name,
            attr.attname AS column_name
        FROM pg_class seq
        JOIN pg_depend dep ON dep.objid = seq.oid AND dep.deptype = 'a'
        JOIN pg_class tab ON dep.refobjid = tab.oid
        JOIN pg_attribute attr ON dep.refobjid = attr.attrelid AND dep.refobjsubid = attr.attnum
        JOIN pg_namespace nsp ON seq.relnamespace = nsp.oid
        WHERE seq.relkind = 'S'
          AND tab.relkind = 'r'
          AND nsp.nspname = 'public'
        ORDER BY tab.relname, attr.attname
    "#;

    let sequences = sqlx::query_as::<_, (String, String, String)>(sequences_query)
        .fetch_all(db_pool)
        .await
        .context("Failed to fetch sequence information")?;

    if sequences.is_empty() {
        info!("No owned sequences found in public schema");
        return Ok(0);
    }

    let mut reset_count = 0;
    for (sequence_name, table_name, column_name) in sequences {
        let max_value_query = format!(
            "SELECT COALESCE(MAX(\"{}\"), 0)::bigint AS max_val FROM \"{}\"",
            column_name.replace('"', "\"\""),
            table_name.replace('"', "\"\"")
        );

        let max_val: i64 = match sqlx::query(&max_value_query).fetch_one(db_pool).await {
            Ok(row) => match row.try_get("max_val") {
                Ok(v) => v,
                Err(e) => {
                    warn!("Failed to read max value for {}.{}: {}", table_name, column_name, e);
                    continue;
                }
            },
            Err(e) => {
                warn!("Failed to get max value for table {}: {}", table_name, e);
                continue;
            }
        };

        let next_val = max_val + 1;
        let result = sqlx::query("SELECT setval(quote_ident($1)::regclass, $2, false)")
            .bind(&sequence_name)
            .bind(next_val)
            .execute(db_pool)
            .await;
        match result {
            Ok(_) => {
                info!(
                    "Reset sequence {} to {} (table: {}, column: {})",
                    sequence_name, next_val, table_name, column_name
                );
                reset_count += 1;
            }
            Err(e) => warn!("Failed to reset sequence {}: {}", sequence_name, e),
        }
    }

    Ok(reset_count)
}

/// `reset_all_sequences` bounded by a five minute timeout.
pub async fn reset_sequences_with_timeout(db_pool: &PgPool) -> Result<usize> {
    match timeout(SEQUENCE_RESET_TIMEOUT, reset_all_sequences(db_pool)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "Sequence reset timed out after {} seconds",
            SEQUENCE_RESET_TIMEOUT.as_secs()
        )),
    }
}
