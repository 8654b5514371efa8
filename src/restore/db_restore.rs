// sitevault/src/restore/db_restore.rs
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::database::Database;
use crate::errors::{AppError, Result};

/// Incremental statement splitter. Semicolons inside quoted text never end a
/// statement; `--` lines between statements are dropped.
#[derive(Debug, Default)]
struct StatementScanner {
    backslash_escapes: bool,
    current: String,
    quote: Option<char>,
    escaped: bool,
}

impl StatementScanner {
    fn new(backslash_escapes: bool) -> Self {
        Self {
            backslash_escapes,
            ..Self::default()
        }
    }

    fn feed(&mut self, chunk: &str, out: &mut VecDeque<String>) {
        if self.quote.is_none()
            && self.current.trim().is_empty()
            && chunk.trim_start().starts_with("--")
        {
            return;
        }

        for ch in chunk.chars() {
            if let Some(quote) = self.quote {
                self.current.push(ch);
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' && self.backslash_escapes && quote == '\'' {
                    self.escaped = true;
                } else if ch == quote {
                    self.quote = None;
                }
                continue;
            }

            match ch {
                '\'' | '"' | '`' => {
                    self.quote = Some(ch);
                    self.current.push(ch);
                }
                ';' => {
                    let stmt = self.current.trim();
                    if !stmt.is_empty() {
                        out.push_back(stmt.to_string());
                    }
                    self.current.clear();
                }
                _ => self.current.push(ch),
            }
        }
    }

    fn finish(&mut self) -> Option<String> {
        let stmt = self.current.trim().to_string();
        self.current.clear();
        self.quote = None;
        self.escaped = false;
        if stmt.is_empty() { None } else { Some(stmt) }
    }
}

/// Streams statements out of a SQL dump one line at a time.
pub struct SqlStatementReader<R> {
    reader: R,
    scanner: StatementScanner,
    ready: VecDeque<String>,
    line: String,
    bytes_read: u64,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> SqlStatementReader<R> {
    pub fn new(reader: R, backslash_escapes: bool) -> Self {
        Self {
            reader,
            scanner: StatementScanner::new(backslash_escapes),
            ready: VecDeque::new(),
            line: String::new(),
            bytes_read: 0,
            done: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next complete statement, `None` at end of input.
    pub async fn next_statement(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(stmt) = self.ready.pop_front() {
                return Ok(Some(stmt));
            }
            if self.done {
                return Ok(None);
            }
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => {
                    self.done = true;
                    if let Some(stmt) = self.scanner.finish() {
                        self.ready.push_back(stmt);
                    }
                }
                Ok(n) => {
                    self.bytes_read += n as u64;
                    self.scanner.feed(&self.line, &mut self.ready);
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }
}

/// Splits a complete SQL script into statements.
pub fn split_statements(sql: &str, backslash_escapes: bool) -> Vec<String> {
    let mut scanner = StatementScanner::new(backslash_escapes);
    let mut out = VecDeque::new();
    for line in sql.split_inclusive('\n') {
        scanner.feed(line, &mut out);
    }
    out.extend(scanner.finish());
    out.into_iter().collect()
}

/// Byte length of the quoted run at the start of `s`, closing quote
/// included. Doubled quotes stay inside the run.
fn quoted_len(s: &str, quote: char, backslash_escapes: bool) -> usize {
    let mut escaped = false;
    let mut chars = s.char_indices().skip(1).peekable();
    while let Some((idx, ch)) = chars.next() {
        if escaped {
            escaped = false;
        } else if ch == '\\' && backslash_escapes {
            escaped = true;
        } else if ch == quote {
            if chars.peek().map(|&(_, next)| next) == Some(quote) {
                chars.next();
                continue;
            }
            return idx + ch.len_utf8();
        }
    }
    s.len()
}

fn renamed(ident: &str, old_prefix: &str, new_prefix: &str) -> String {
    match ident.strip_prefix(old_prefix) {
        Some(rest) => format!("{}{}", new_prefix, rest),
        None => ident.to_string(),
    }
}

/// Renames quoted identifiers (`"..."` or `` `...` ``) that start with
/// `old_prefix`. Single-quoted literals are left untouched, except a
/// `'"name"'::regclass` reference, which names a relation.
pub fn rewrite_table_prefix(
    stmt: &str,
    old_prefix: &str,
    new_prefix: &str,
    backslash_escapes: bool,
) -> String {
    if old_prefix.is_empty() || old_prefix == new_prefix {
        return stmt.to_string();
    }

    let mut out = String::with_capacity(stmt.len());
    let mut rest = stmt;
    while let Some(ch) = rest.chars().next() {
        match ch {
            '\'' => {
                let len = quoted_len(rest, '\'', backslash_escapes);
                let (literal, after) = rest.split_at(len);
                let relation = literal
                    .strip_prefix("'\"")
                    .and_then(|l| l.strip_suffix("\"'"))
                    .filter(|_| after.starts_with("::regclass"));
                match relation {
                    Some(ident) => {
                        out.push_str("'\"");
                        out.push_str(&renamed(ident, old_prefix, new_prefix));
                        out.push_str("\"'");
                    }
                    None => out.push_str(literal),
                }
                rest = after;
            }
            '"' | '`' => {
                let len = quoted_len(rest, ch, false);
                let (quoted, after) = rest.split_at(len);
                let inner = &quoted[1..];
                let (ident, closed) = match inner.strip_suffix(ch) {
                    Some(ident) if len > 1 => (ident, true),
                    _ => (inner, false),
                };
                out.push(ch);
                out.push_str(&renamed(ident, old_prefix, new_prefix));
                if closed {
                    out.push(ch);
                }
                rest = after;
            }
            _ => {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct PrefixRewrite {
    pub from: String,
    pub to: String,
}

/// Called with (bytes consumed, total bytes).
pub type ReplayProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Replays a dump statement by statement. Stops at the first failing
/// statement with its 1-based index.
pub async fn restore_database(
    db: &dyn Database,
    sql_path: &Path,
    prefix: Option<&PrefixRewrite>,
    on_progress: ReplayProgress<'_>,
) -> Result<usize> {
    let backslash = db.dialect().backslash_escapes();
    let file = File::open(sql_path).await?;
    let total = file.metadata().await?.len();
    let mut reader = SqlStatementReader::new(BufReader::new(file), backslash);

    let mut executed = 0usize;
    while let Some(stmt) = reader.next_statement().await? {
        let index = executed + 1;
        let stmt = match prefix {
            Some(p) => rewrite_table_prefix(&stmt, &p.from, &p.to, backslash),
            None => stmt,
        };
        db.execute(&stmt).await.map_err(|e| AppError::Query {
            index,
            message: e.to_string(),
        })?;
        executed = index;
        if executed % 100 == 0 {
            debug!("Replayed {} statements", executed);
            on_progress(reader.bytes_read(), total);
        }
    }
    on_progress(total, total);

    db.finish_restore().await?;
    info!("Database restore replayed {} statements", executed);
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{SqliteDatabase, SqlValue};
    use std::io::Cursor;

    #[test]
    fn test_semicolons_inside_literals_do_not_split() {
        let sql = "INSERT INTO t VALUES ('a;b', 'c\\'d;e');";
        let stmts = split_statements(sql, true);
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b', 'c\\'d;e')".to_string()]);
    }

    #[test]
    fn test_doubled_quotes_and_comments() {
        let sql = "-- header\n\nINSERT INTO \"t\" VALUES ('it''s; fine');\n-- between\nDELETE FROM \"t\";";
        let stmts = split_statements(sql, false);
        assert_eq!(
            stmts,
            vec![
                "INSERT INTO \"t\" VALUES ('it''s; fine')".to_string(),
                "DELETE FROM \"t\"".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_streams_multiline_statements() -> anyhow::Result<()> {
        let sql = "CREATE TABLE \"a\" (\n  x TEXT\n);\nINSERT INTO \"a\" VALUES\n('line1\nline2; still');";
        let mut reader = SqlStatementReader::new(Cursor::new(sql), false);
        let mut stmts = Vec::new();
        while let Some(stmt) = reader.next_statement().await? {
            stmts.push(stmt);
        }
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].ends_with("('line1\nline2; still')"));
        assert_eq!(reader.bytes_read(), sql.len() as u64);
        Ok(())
    }

    #[test]
    fn test_prefix_rewrite_only_touches_identifiers() {
        let stmt = "INSERT INTO \"wp_options\" (\"option_value\") VALUES ('see \"wp_posts\" table')";
        let rewritten = rewrite_table_prefix(stmt, "wp_", "site2_", false);
        assert_eq!(
            rewritten,
            "INSERT INTO \"site2_options\" (\"option_value\") VALUES ('see \"wp_posts\" table')"
        );
        assert_eq!(rewrite_table_prefix(stmt, "wp_", "wp_", false), stmt);
    }

    #[test]
    fn test_prefix_rewrite_reaches_relation_literals_and_backticks() {
        let stmt = "CREATE TABLE \"wp_posts\" (\n  \"id\" integer DEFAULT nextval('\"wp_posts_id_seq\"'::regclass) NOT NULL\n)";
        assert_eq!(
            rewrite_table_prefix(stmt, "wp_", "site2_", true),
            "CREATE TABLE \"site2_posts\" (\n  \"id\" integer DEFAULT nextval('\"site2_posts_id_seq\"'::regclass) NOT NULL\n)"
        );

        let data = "INSERT INTO \"wp_posts\" VALUES (1, '\"wp_posts_id_seq\"')";
        assert_eq!(
            rewrite_table_prefix(data, "wp_", "site2_", true),
            "INSERT INTO \"site2_posts\" VALUES (1, '\"wp_posts_id_seq\"')"
        );

        let mysql = "CREATE TABLE `wp_comments` (CONSTRAINT `wp_fk` FOREIGN KEY (`post`) REFERENCES `wp_posts` (`id`), note TEXT DEFAULT 'it\\'s `wp_x`')";
        assert_eq!(
            rewrite_table_prefix(mysql, "wp_", "s_", true),
            "CREATE TABLE `s_comments` (CONSTRAINT `s_fk` FOREIGN KEY (`post`) REFERENCES `s_posts` (`id`), note TEXT DEFAULT 'it\\'s `wp_x`')"
        );
        assert_eq!(
            rewrite_table_prefix("SELECT \"we\"\"ird_t\"", "we", "x", false),
            "SELECT \"x\"\"ird_t\""
        );
    }

    #[tokio::test]
    async fn test_failure_reports_statement_index() -> anyhow::Result<()> {
        let db = SqliteDatabase::connect("sqlite::memory:").await?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("database.sql");
        std::fs::write(
            &path,
            "CREATE TABLE \"t\" (id INTEGER);\nINSERT INTO \"t\" VALUES (1);\nINSERT INTO \"missing\" VALUES (2);\n",
        )?;

        let result = restore_database(&db, &path, None, &|_, _| {}).await;
        match result {
            Err(AppError::Query { index, .. }) => assert_eq!(index, 3),
            other => panic!("expected query error, got {:?}", other.map(|_| ())),
        }

        let rows = db
            .fetch_rows(
                "t",
                &db.columns("t").await?,
                &crate::database::RowKey::AllColumns,
                0,
                10,
            )
            .await?;
        assert_eq!(rows, vec![vec![SqlValue::Int(1)]]);
        Ok(())
    }

    mod postgres {
        use super::*;
        use crate::backup::db_dump::dump_database;
        use crate::database::PgDatabase;

        /// Postgres tests run only when `DATABASE_URL` points at a server.
        async fn connect() -> anyhow::Result<Option<PgDatabase>> {
            match std::env::var("DATABASE_URL") {
                Ok(url) if url.starts_with("postgres") => Ok(Some(PgDatabase::connect(&url).await?)),
                _ => Ok(None),
            }
        }

        fn unique_prefix() -> String {
            format!("sv{}_", &uuid::Uuid::new_v4().simple().to_string()[..8])
        }

        async fn dump_prefixed(db: &PgDatabase, prefix: &str, dest: &Path) -> anyhow::Result<String> {
            let others: Vec<String> = db
                .list_tables()
                .await?
                .into_iter()
                .filter(|t| !t.starts_with(prefix))
                .collect();
            dump_database(db, dest, &others, 100, &|_, _, _| {}).await?;
            Ok(std::fs::read_to_string(dest)?)
        }

        async fn drop_prefixed(db: &PgDatabase, prefixes: &[&str]) -> anyhow::Result<()> {
            for table in db.list_tables().await? {
                if prefixes.iter().any(|p| table.starts_with(p)) {
                    db.execute(&format!("DROP TABLE IF EXISTS \"{}\" CASCADE", table)).await?;
                }
            }
            Ok(())
        }

        async fn scalar(db: &PgDatabase, sql: &str) -> anyhow::Result<i64> {
            Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(db.pool()).await?)
        }

        #[tokio::test]
        async fn test_inserts_after_restore_get_fresh_ids() -> anyhow::Result<()> {
            let Some(db) = connect().await? else {
                return Ok(());
            };
            let p = unique_prefix();
            db.execute(&format!("CREATE TABLE {p}posts (id serial PRIMARY KEY, title text)"))
                .await?;
            db.execute(&format!("INSERT INTO {p}posts (title) VALUES ('a'), ('b'), ('c')"))
                .await?;

            let dir = tempfile::tempdir()?;
            let dump = dump_prefixed(&db, &p, &dir.path().join("database.sql")).await?;
            assert!(dump.contains(&format!("OWNED BY \"{p}posts\".\"id\"")));
            assert!(dump.contains("setval("));

            restore_database(&db, &dir.path().join("database.sql"), None, &|_, _| {}).await?;
            let id = scalar(&db, &format!("INSERT INTO {p}posts (title) VALUES ('d') RETURNING id::bigint"))
                .await?;
            assert_eq!(id, 4);

            // The restored sequence is owned again, so a second dump keeps it.
            let again = dump_prefixed(&db, &p, &dir.path().join("again.sql")).await?;
            assert!(again.contains(&format!("CREATE SEQUENCE IF NOT EXISTS \"{p}posts_id_seq\"")));

            drop_prefixed(&db, &[&p]).await?;
            Ok(())
        }

        #[tokio::test]
        async fn test_prefix_change_moves_sequences_indexes_and_foreign_keys() -> anyhow::Result<()> {
            let Some(db) = connect().await? else {
                return Ok(());
            };
            let p = unique_prefix();
            let q = unique_prefix();
            db.execute(&format!("CREATE TABLE {p}users (id serial PRIMARY KEY, login text UNIQUE)"))
                .await?;
            db.execute(&format!(
                "CREATE TABLE {p}posts (id serial PRIMARY KEY, author integer REFERENCES {p}users(id) ON DELETE CASCADE, title text)"
            ))
            .await?;
            db.execute(&format!("CREATE INDEX {p}posts_title_idx ON {p}posts (title)")).await?;
            db.execute(&format!("INSERT INTO {p}users (login) VALUES ('admin')")).await?;
            db.execute(&format!("INSERT INTO {p}posts (author, title) VALUES (1, 'hello')")).await?;

            let dir = tempfile::tempdir()?;
            let path = dir.path().join("database.sql");
            dump_prefixed(&db, &p, &path).await?;
            let rewrite = PrefixRewrite {
                from: p.clone(),
                to: q.clone(),
            };
            restore_database(&db, &path, Some(&rewrite), &|_, _| {}).await?;

            let id = scalar(
                &db,
                &format!("INSERT INTO {q}posts (author, title) VALUES (1, 'again') RETURNING id::bigint"),
            )
            .await?;
            assert_eq!(id, 2);
            let foreign_keys = scalar(
                &db,
                &format!(
                    "SELECT count(*) FROM pg_constraint WHERE conrelid = '{q}posts'::regclass AND confrelid = '{q}users'::regclass AND confdeltype = 'c'"
                ),
            )
            .await?;
            assert_eq!(foreign_keys, 1);
            let indexes = scalar(
                &db,
                &format!(
                    "SELECT count(*) FROM pg_indexes WHERE tablename = '{q}posts' AND indexname = '{q}posts_title_idx'"
                ),
            )
            .await?;
            assert_eq!(indexes, 1);

            // The source tables are untouched.
            assert_eq!(scalar(&db, &format!("SELECT count(*) FROM {p}posts")).await?, 1);

            drop_prefixed(&db, &[&p, &q]).await?;
            Ok(())
        }
    }
}
