use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::serialized::{self, looks_serialized};
use crate::database::{ColumnInfo, Database, RowKey, SqlValue};
use crate::errors::{AppError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct SearchReplaceOptions {
    /// Empty means every table.
    pub tables: Vec<String>,
    pub chunk_size: usize,
}

impl Default for SearchReplaceOptions {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchReplaceReport {
    pub tables_scanned: usize,
    pub rows_scanned: u64,
    pub cells_changed: u64,
    pub rows_updated: u64,
    pub errors: Vec<String>,
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    let mut changed = false;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
            changed = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    changed.then_some(out)
}

/// Replaces inside a PHP-serialized value. `None` when the text does not
/// parse, so the caller falls back to a literal replace.
fn replace_serialized(value: &str, search: &str, replace: &str) -> Option<String> {
    let mut parsed = match serialized::parse(value.trim().as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Serialized value did not parse ({}); replacing literally", e);
            return None;
        }
    };
    parsed.map_strings(&mut |leaf| match std::str::from_utf8(leaf) {
        Ok(text) => {
            let replaced = replace_text(text, search, replace);
            (replaced != text).then(|| replaced.into_bytes())
        }
        Err(_) => replace_bytes(leaf, search.as_bytes(), replace.as_bytes()),
    });
    String::from_utf8(parsed.to_bytes()).ok()
}

fn replace_json_leaves(value: &mut Value, search: &str, replace: &str) -> bool {
    match value {
        Value::String(text) => {
            let replaced = replace_text(text, search, replace);
            if replaced != *text {
                *text = replaced;
                true
            } else {
                false
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| replace_json_leaves(item, search, replace) | changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| replace_json_leaves(item, search, replace) | changed),
        _ => false,
    }
}

fn replace_json(value: &str, search: &str, replace: &str) -> Option<String> {
    let trimmed = value.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let mut parsed: Value = serde_json::from_str(value).ok()?;
    if !replace_json_leaves(&mut parsed, search, replace) {
        // Valid JSON without a match in any leaf stays byte-identical.
        return Some(value.to_string());
    }
    serde_json::to_string(&parsed).ok()
}

/// Structure-aware substitution for one text value. Serialized and JSON
/// composites are decoded so lengths and escapes stay valid; anything else
/// gets a plain substring replace.
pub fn replace_text(value: &str, search: &str, replace: &str) -> String {
    if search.is_empty() || search == replace {
        return value.to_string();
    }
    if looks_serialized(value) && value.contains(search) {
        if let Some(replaced) = replace_serialized(value, search, replace) {
            return replaced;
        }
    }
    if let Some(replaced) = replace_json(value, search, replace) {
        return replaced;
    }
    value.replace(search, replace)
}

/// Rewrites every textual cell of the selected tables. Failures are
/// collected per table and never stop the run.
pub async fn search_replace(
    db: &dyn Database,
    search: &str,
    replace: &str,
    options: &SearchReplaceOptions,
) -> SearchReplaceReport {
    let mut report = SearchReplaceReport::default();
    if search.is_empty() {
        return report;
    }

    let tables = if options.tables.is_empty() {
        match db.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                report.errors.push(format!("Failed to list tables: {}", e));
                return report;
            }
        }
    } else {
        options.tables.clone()
    };

    for table in tables {
        report.tables_scanned += 1;
        if let Err(e) = replace_in_table(db, &table, search, replace, options.chunk_size, &mut report).await {
            warn!("Search/replace failed on table {}: {}", table, e);
            report.errors.push(format!("{}: {}", table, e));
        }
    }

    info!(
        "Search/replace '{}' -> '{}': {} tables, {} rows, {} cells changed",
        search, replace, report.tables_scanned, report.rows_scanned, report.cells_changed
    );
    report
}

struct PendingUpdate {
    set: Vec<(String, SqlValue)>,
    /// Key values as read, before any rewrite.
    predicate: Vec<(String, SqlValue)>,
    moves_key: bool,
}

async fn replace_in_table(
    db: &dyn Database,
    table: &str,
    search: &str,
    replace: &str,
    chunk_size: usize,
    report: &mut SearchReplaceReport,
) -> Result<()> {
    let columns = db.columns(table).await?;
    if columns.is_empty() {
        return Err(AppError::NotFound(format!("table {}", table)));
    }
    let key = db.row_key(table).await?;
    let key_columns: Vec<String> = key.columns(&columns).into_iter().map(str::to_string).collect();

    let targets: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_textual())
        .map(|(i, _)| i)
        .collect();
    if targets.is_empty() {
        debug!("Table {} has no rewritable text columns", table);
        return Ok(());
    }

    // A rewritten key moves its row in the paging order; such updates are
    // applied after the scan, matched by the key values as read.
    let defer_all = matches!(key, RowKey::AllColumns);
    let mut deferred = Vec::new();
    let chunk = chunk_size.max(1) as u64;
    let mut offset = 0u64;

    loop {
        let rows = db.fetch_rows(table, &columns, &key, offset, chunk).await?;
        let fetched = rows.len() as u64;
        for row in rows {
            report.rows_scanned += 1;
            let Some(update) = rewrite_row(&columns, &row, &targets, &key_columns, search, replace, report)
            else {
                continue;
            };
            if defer_all || update.moves_key {
                deferred.push(update);
            } else {
                apply(db, table, update, report).await?;
            }
        }
        if fetched < chunk {
            break;
        }
        offset += chunk;
    }

    for update in deferred {
        apply(db, table, update, report).await?;
    }
    Ok(())
}

fn rewrite_row(
    columns: &[ColumnInfo],
    row: &[SqlValue],
    targets: &[usize],
    key_columns: &[String],
    search: &str,
    replace: &str,
    report: &mut SearchReplaceReport,
) -> Option<PendingUpdate> {
    let mut set = Vec::new();
    let mut moves_key = false;
    for &i in targets {
        let Some(SqlValue::Text(original)) = row.get(i) else {
            continue;
        };
        let replaced = replace_text(original, search, replace);
        if replaced != *original {
            report.cells_changed += 1;
            moves_key |= key_columns.contains(&columns[i].name);
            set.push((columns[i].name.clone(), SqlValue::Text(replaced)));
        }
    }
    if set.is_empty() {
        return None;
    }
    let predicate = columns
        .iter()
        .zip(row)
        .filter(|(c, _)| key_columns.contains(&c.name))
        .map(|(c, v)| (c.name.clone(), v.clone()))
        .collect();
    Some(PendingUpdate {
        set,
        predicate,
        moves_key,
    })
}

async fn apply(
    db: &dyn Database,
    table: &str,
    update: PendingUpdate,
    report: &mut SearchReplaceReport,
) -> Result<()> {
    let affected = db.update_row(table, &update.set, &update.predicate).await?;
    if affected > 0 {
        report.rows_updated += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;
    use crate::migration::serialized::{parse, Key, SerializedValue};

    #[test]
    fn test_serialized_lengths_are_recomputed() {
        let raw = r#"a:2:{s:4:"home";s:18:"http://example.com";s:5:"count";i:3;}"#;
        let out = replace_text(raw, "http://example.com", "https://example.org");
        assert_eq!(out, r#"a:2:{s:4:"home";s:19:"https://example.org";s:5:"count";i:3;}"#);
    }

    #[test]
    fn test_nested_structure_only_changes_matching_leaves() -> anyhow::Result<()> {
        let inner = r#"a:1:{s:3:"url";s:14:"http://old.com";}"#;
        let raw = format!(
            r#"a:3:{{s:14:"http://old.com";s:4:"keep";s:6:"nested";s:{}:"{}";s:4:"list";a:2:{{i:0;s:18:"see http://old.com";i:1;s:5:"other";}}}}"#,
            inner.len(),
            inner
        );
        let out = replace_text(&raw, "http://old.com", "https://new.example");

        let SerializedValue::Array(entries) = parse(out.as_bytes())? else {
            panic!("expected array");
        };
        // Keys are never rewritten.
        assert_eq!(entries[0].0, Key::Str(b"http://old.com".to_vec()));
        assert_eq!(entries[0].1, SerializedValue::Str(b"keep".to_vec()));

        let SerializedValue::Str(nested) = &entries[1].1 else {
            panic!("expected nested serialized string");
        };
        assert_eq!(
            parse(nested)?,
            SerializedValue::Array(vec![(
                Key::Str(b"url".to_vec()),
                SerializedValue::Str(b"https://new.example".to_vec())
            )])
        );

        let SerializedValue::Array(list) = &entries[2].1 else {
            panic!("expected list");
        };
        assert_eq!(list[0].1, SerializedValue::Str(b"see https://new.example".to_vec()));
        assert_eq!(list[1].1, SerializedValue::Str(b"other".to_vec()));
        Ok(())
    }

    #[test]
    fn test_structure_replace_matches_literal_replace_on_leaves() -> anyhow::Result<()> {
        let leaves = ["http://a.test/x", "plain", "http://a.test"];
        let value = SerializedValue::Array(
            leaves
                .iter()
                .enumerate()
                .map(|(i, s)| (Key::Int(i as i64), SerializedValue::Str(s.as_bytes().to_vec())))
                .collect(),
        );
        let raw = String::from_utf8(value.to_bytes())?;
        let out = parse(replace_text(&raw, "a.test", "b.example").as_bytes())?;

        let expected = SerializedValue::Array(
            leaves
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    (
                        Key::Int(i as i64),
                        SerializedValue::Str(s.replace("a.test", "b.example").into_bytes()),
                    )
                })
                .collect(),
        );
        assert_eq!(out, expected);
        Ok(())
    }

    #[test]
    fn test_broken_serialized_falls_back_to_literal() {
        let raw = r#"a:1:{s:3:"url";s:99:"http://old.com";}"#;
        assert_eq!(
            replace_text(raw, "old.com", "new.com"),
            r#"a:1:{s:3:"url";s:99:"http://new.com";}"#
        );
    }

    #[test]
    fn test_json_escaped_slashes_are_decoded() {
        let raw = r#"{"logo":"http:\/\/old.com\/logo.png","size":3}"#;
        assert_eq!(
            replace_text(raw, "http://old.com", "https://new.com"),
            r#"{"logo":"https://new.com/logo.png","size":3}"#
        );
        let untouched = r#"{"a": "b"}"#;
        assert_eq!(replace_text(untouched, "zzz", "y"), untouched);
    }

    #[test]
    fn test_plain_text_and_empty_search() {
        assert_eq!(replace_text("visit http://old.com now", "old.com", "new.com"), "visit http://new.com now");
        assert_eq!(replace_text("unchanged", "", "x"), "unchanged");
    }

    #[tokio::test]
    async fn test_search_replace_updates_rows_and_reports() -> anyhow::Result<()> {
        let db = SqliteDatabase::connect("sqlite::memory:").await?;
        db.execute("CREATE TABLE \"wp_options\" (option_id INTEGER PRIMARY KEY, option_name TEXT, option_value TEXT)")
            .await?;
        db.execute("CREATE TABLE \"wp_log\" (line TEXT, hits INTEGER)").await?;
        db.execute(
            "INSERT INTO \"wp_options\" VALUES (1, 'siteurl', 'http://old.com'), (2, 'widget', 'a:1:{s:3:\"url\";s:14:\"http://old.com\";}'), (3, 'blogname', 'My blog')",
        )
        .await?;
        db.execute("INSERT INTO \"wp_log\" VALUES ('GET http://old.com/', 1), ('GET http://old.com/', 1), ('other', 2)")
            .await?;

        let options = SearchReplaceOptions {
            tables: Vec::new(),
            chunk_size: 2,
        };
        let report = search_replace(&db, "http://old.com", "https://new.com", &options).await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.tables_scanned, 2);
        assert_eq!(report.rows_scanned, 6);
        assert_eq!(report.cells_changed, 4);

        let columns = db.columns("wp_options").await?;
        let rows = db
            .fetch_rows("wp_options", &columns, &RowKey::Primary(vec!["option_id".into()]), 0, 10)
            .await?;
        assert_eq!(rows[0][2], SqlValue::Text("https://new.com".into()));
        assert_eq!(
            rows[1][2],
            SqlValue::Text("a:1:{s:3:\"url\";s:15:\"https://new.com\";}".into())
        );
        assert_eq!(rows[2][2], SqlValue::Text("My blog".into()));

        let log_columns = db.columns("wp_log").await?;
        let log = db.fetch_rows("wp_log", &log_columns, &RowKey::AllColumns, 0, 10).await?;
        assert_eq!(log[0][0], SqlValue::Text("GET https://new.com/".into()));
        assert_eq!(log[1][0], SqlValue::Text("GET https://new.com/".into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_text_key_columns_are_rewritten() -> anyhow::Result<()> {
        let db = SqliteDatabase::connect("sqlite::memory:").await?;
        db.execute("CREATE TABLE \"redirects\" (url TEXT PRIMARY KEY, target TEXT)").await?;
        db.execute(
            "INSERT INTO \"redirects\" VALUES ('http://old.com/a', 'http://old.com/b'), ('http://old.com/c', 'local'), ('/keep', 'http://old.com/d')",
        )
        .await?;

        let options = SearchReplaceOptions {
            tables: Vec::new(),
            chunk_size: 1,
        };
        let report = search_replace(&db, "http://old.com", "https://new.com", &options).await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.rows_scanned, 3);
        assert_eq!(report.cells_changed, 4);
        assert_eq!(report.rows_updated, 3);

        let columns = db.columns("redirects").await?;
        let key = db.row_key("redirects").await?;
        let rows = db.fetch_rows("redirects", &columns, &key, 0, 10).await?;
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Text("/keep".into()), SqlValue::Text("https://new.com/d".into())],
                vec![
                    SqlValue::Text("https://new.com/a".into()),
                    SqlValue::Text("https://new.com/b".into())
                ],
                vec![SqlValue::Text("https://new.com/c".into()), SqlValue::Text("local".into())],
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_table_is_reported_not_fatal() -> anyhow::Result<()> {
        let db = SqliteDatabase::connect("sqlite::memory:").await?;
        db.execute("CREATE TABLE \"t\" (id INTEGER PRIMARY KEY, body TEXT)").await?;
        db.execute("INSERT INTO \"t\" VALUES (1, 'old')").await?;
        let options = SearchReplaceOptions {
            tables: vec!["nope".into(), "t".into()],
            chunk_size: 100,
        };
        let report = search_replace(&db, "old", "new", &options).await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("nope"));
        assert_eq!(report.rows_updated, 1);

        assert_eq!(search_replace(&db, "", "x", &options).await, SearchReplaceReport::default());
        Ok(())
    }
}
