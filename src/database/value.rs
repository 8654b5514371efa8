use serde::{Deserialize, Serialize};
use std::fmt;

/// A single cell as read from the source database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
    Mysql,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
        }
    }

    /// Whether a backslash inside a quoted literal escapes the next character
    /// in the dumps this crate writes.
    pub fn backslash_escapes(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Mysql)
    }

    pub fn quote_ident(self, name: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
            _ => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    pub fn literal(self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => float_literal(*v),
            SqlValue::Text(s) => self.text_literal(s),
            SqlValue::Bytes(b) => match self {
                Dialect::Sqlite | Dialect::Mysql => format!("X'{}'", hex::encode(b)),
                Dialect::Postgres => format!("'\\x{}'::bytea", hex::encode(b)),
            },
        }
    }

    fn text_literal(self, s: &str) -> String {
        match self {
            Dialect::Sqlite => format!("'{}'", s.replace('\'', "''")),
            Dialect::Mysql => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("''"),
                        '\0' => out.push_str("\\0"),
                        '\u{1a}' => out.push_str("\\Z"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
                out
            }
            Dialect::Postgres => {
                if s.contains('\\') || s.contains('\'') {
                    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
                    format!("E'{}'", escaped)
                } else {
                    format!("'{}'", s)
                }
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "NULL".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "9e999".to_string() } else { "-9e999".to_string() }
    } else {
        // Debug output always carries a decimal point or exponent.
        format!("{:?}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_literals() {
        let d = Dialect::Sqlite;
        assert_eq!(d.literal(&SqlValue::Null), "NULL");
        assert_eq!(d.literal(&SqlValue::Int(-4)), "-4");
        assert_eq!(d.literal(&SqlValue::Float(1.0)), "1.0");
        assert_eq!(d.literal(&SqlValue::Float(f64::INFINITY)), "9e999");
        assert_eq!(d.literal(&SqlValue::Text("it's".into())), "'it''s'");
        assert_eq!(d.literal(&SqlValue::Text("a\\b".into())), "'a\\b'");
        assert_eq!(d.literal(&SqlValue::Bytes(vec![0, 255])), "X'00ff'");
    }

    #[test]
    fn test_postgres_literals_escape_backslashes() {
        let d = Dialect::Postgres;
        assert_eq!(d.literal(&SqlValue::Text("plain".into())), "'plain'");
        assert_eq!(d.literal(&SqlValue::Text("c'd".into())), "E'c\\'d'");
        assert_eq!(d.literal(&SqlValue::Text("\\x00".into())), "E'\\\\x00'");
        assert_eq!(d.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_mysql_literals_and_identifiers() {
        let d = Dialect::Mysql;
        assert_eq!(d.literal(&SqlValue::Text("it's".into())), "'it''s'");
        assert_eq!(d.literal(&SqlValue::Text("C:\\temp".into())), "'C:\\\\temp'");
        assert_eq!(d.literal(&SqlValue::Text("a\0b".into())), "'a\\0b'");
        assert_eq!(d.literal(&SqlValue::Bytes(vec![0xde, 0xad])), "X'dead'");
        assert_eq!(d.quote_ident("wp_`x"), "`wp_``x`");
        assert!(d.backslash_escapes());
    }
}
