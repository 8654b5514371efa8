//! Codec for the PHP `serialize()` format used by CMS option and meta
//! tables. Strings are byte strings; `s:` lengths count bytes.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SerializedError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("expected '{expected}' at byte {pos}")]
    Expected { expected: char, pos: usize },
    #[error("invalid number at byte {0}")]
    InvalidNumber(usize),
    #[error("unsupported type tag '{0}'")]
    Unsupported(char),
    #[error("trailing data at byte {0}")]
    TrailingData(usize),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Arrays and objects nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Int(i64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Kept as written so re-serialization is byte-exact.
    Float(String),
    Str(Vec<u8>),
    Array(Vec<(Key, SerializedValue)>),
    Object {
        class: Vec<u8>,
        properties: Vec<(Key, SerializedValue)>,
    },
}

/// Cheap shape check before attempting a full parse.
pub fn looks_serialized(data: &str) -> bool {
    let data = data.trim();
    if data == "N;" {
        return true;
    }
    let bytes = data.as_bytes();
    if bytes.len() < 4 || bytes[1] != b':' {
        return false;
    }
    match bytes[0] {
        b'a' | b'O' => data.ends_with('}'),
        b's' | b'i' | b'd' | b'b' => data.ends_with(';'),
        _ => false,
    }
}

pub fn parse(input: &[u8]) -> Result<SerializedValue, SerializedError> {
    let mut parser = Parser {
        input,
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    if parser.pos != input.len() {
        return Err(SerializedError::TrailingData(parser.pos));
    }
    Ok(value)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, SerializedError> {
        self.input.get(self.pos).copied().ok_or(SerializedError::UnexpectedEnd)
    }

    fn expect(&mut self, expected: u8) -> Result<(), SerializedError> {
        if self.peek()? != expected {
            return Err(SerializedError::Expected {
                expected: expected as char,
                pos: self.pos,
            });
        }
        self.pos += 1;
        Ok(())
    }

    /// Raw text up to (not including) `terminator`, which is consumed.
    fn until(&mut self, terminator: u8) -> Result<&'a [u8], SerializedError> {
        let input = self.input;
        let start = self.pos;
        let len = input[start..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or(SerializedError::UnexpectedEnd)?;
        self.pos = start + len + 1;
        Ok(&input[start..start + len])
    }

    fn number<T: std::str::FromStr>(&mut self, terminator: u8) -> Result<T, SerializedError> {
        let start = self.pos;
        let raw = self.until(terminator)?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(SerializedError::InvalidNumber(start))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, SerializedError> {
        let end = self.pos.checked_add(len).ok_or(SerializedError::UnexpectedEnd)?;
        let slice = self.input.get(self.pos..end).ok_or(SerializedError::UnexpectedEnd)?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    /// `len:"bytes"` as used by strings and class names.
    fn quoted(&mut self) -> Result<Vec<u8>, SerializedError> {
        let len: usize = self.number(b':')?;
        self.expect(b'"')?;
        let bytes = self.bytes(len)?;
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn entries(&mut self) -> Result<Vec<(Key, SerializedValue)>, SerializedError> {
        if self.depth >= MAX_DEPTH {
            return Err(SerializedError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let entries = self.entry_list();
        self.depth -= 1;
        entries
    }

    fn entry_list(&mut self) -> Result<Vec<(Key, SerializedValue)>, SerializedError> {
        let count: usize = self.number(b':')?;
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = match self.value()? {
                SerializedValue::Int(i) => Key::Int(i),
                SerializedValue::Str(s) => Key::Str(s),
                _ => {
                    return Err(SerializedError::Expected {
                        expected: 's',
                        pos: self.pos,
                    });
                }
            };
            entries.push((key, self.value()?));
        }
        self.expect(b'}')?;
        Ok(entries)
    }

    fn value(&mut self) -> Result<SerializedValue, SerializedError> {
        let tag = self.peek()?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(SerializedValue::Null);
        }
        self.expect(b':')?;
        match tag {
            b'b' => match self.until(b';')? {
                b"0" => Ok(SerializedValue::Bool(false)),
                b"1" => Ok(SerializedValue::Bool(true)),
                _ => Err(SerializedError::InvalidNumber(self.pos)),
            },
            b'i' => Ok(SerializedValue::Int(self.number(b';')?)),
            b'd' => {
                let start = self.pos;
                let raw = self.until(b';')?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| SerializedError::InvalidNumber(start))?
                    .to_string();
                Ok(SerializedValue::Float(text))
            }
            b's' => {
                let bytes = self.quoted()?;
                self.expect(b';')?;
                Ok(SerializedValue::Str(bytes))
            }
            b'a' => Ok(SerializedValue::Array(self.entries()?)),
            b'O' => {
                let class = self.quoted()?;
                self.expect(b':')?;
                Ok(SerializedValue::Object {
                    class,
                    properties: self.entries()?,
                })
            }
            other => Err(SerializedError::Unsupported(other as char)),
        }
    }
}

impl SerializedValue {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            SerializedValue::Null => out.extend_from_slice(b"N;"),
            SerializedValue::Bool(b) => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
            SerializedValue::Int(i) => out.extend_from_slice(format!("i:{};", i).as_bytes()),
            SerializedValue::Float(raw) => out.extend_from_slice(format!("d:{};", raw).as_bytes()),
            SerializedValue::Str(bytes) => {
                write_quoted(out, b's', bytes);
                out.push(b';');
            }
            SerializedValue::Array(entries) => {
                out.extend_from_slice(format!("a:{}:", entries.len()).as_bytes());
                write_entries(out, entries);
            }
            SerializedValue::Object { class, properties } => {
                write_quoted(out, b'O', class);
                out.extend_from_slice(format!(":{}:", properties.len()).as_bytes());
                write_entries(out, properties);
            }
        }
    }

    /// Applies `f` to every leaf string; keys and structure stay as they are.
    pub fn map_strings(&mut self, f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>) -> bool {
        match self {
            SerializedValue::Str(bytes) => match f(bytes) {
                Some(replaced) => {
                    *bytes = replaced;
                    true
                }
                None => false,
            },
            SerializedValue::Array(entries) | SerializedValue::Object { properties: entries, .. } => {
                let mut changed = false;
                for (_, value) in entries.iter_mut() {
                    changed |= value.map_strings(f);
                }
                changed
            }
            _ => false,
        }
    }
}

fn write_quoted(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    out.extend_from_slice(format!(":{}:\"", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
    out.push(b'"');
}

fn write_entries(out: &mut Vec<u8>, entries: &[(Key, SerializedValue)]) {
    out.push(b'{');
    for (key, value) in entries {
        match key {
            Key::Int(i) => out.extend_from_slice(format!("i:{};", i).as_bytes()),
            Key::Str(s) => {
                write_quoted(out, b's', s);
                out.push(b';');
            }
        }
        value.write(out);
    }
    out.push(b'}');
}

impl fmt::Display for SerializedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_nested_structures() -> anyhow::Result<()> {
        let raw = br#"a:2:{s:4:"home";s:18:"http://example.com";i:0;O:8:"stdClass":1:{s:3:"ids";a:1:{i:0;i:7;}}}"#;
        let value = parse(raw)?;
        let SerializedValue::Array(entries) = &value else {
            panic!("expected array");
        };
        assert_eq!(entries[0].0, Key::Str(b"home".to_vec()));
        assert_eq!(entries[0].1, SerializedValue::Str(b"http://example.com".to_vec()));
        assert!(matches!(entries[1].1, SerializedValue::Object { .. }));
        assert_eq!(value.to_bytes(), raw.to_vec());
        Ok(())
    }

    #[test]
    fn test_lengths_count_bytes() -> anyhow::Result<()> {
        let raw = "s:5:\"café\";";
        assert_eq!(parse(raw.as_bytes())?, SerializedValue::Str("café".as_bytes().to_vec()));
        assert!(parse(b"s:4:\"caf\xc3\xa9\";").is_err());
        Ok(())
    }

    #[test]
    fn test_scalars_keep_their_text() -> anyhow::Result<()> {
        for raw in ["N;", "b:1;", "i:-42;", "d:0.1;", "d:1.0E+25;"] {
            assert_eq!(parse(raw.as_bytes())?.to_bytes(), raw.as_bytes());
        }
        Ok(())
    }

    #[test]
    fn test_rejects_references_and_garbage() {
        assert_eq!(parse(b"a:1:{i:0;r:1;}"), Err(SerializedError::Unsupported('r')));
        assert_eq!(parse(b"i:1;x"), Err(SerializedError::TrailingData(4)));
        assert!(parse(b"s:10:\"short\";").is_err());
        assert!(parse(b"a:2:{i:0;i:1;}").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected_not_overflowed() -> anyhow::Result<()> {
        let depth = 200_000;
        let mut raw = "a:1:{i:0;".repeat(depth).into_bytes();
        raw.extend_from_slice(b"i:1;");
        raw.extend(std::iter::repeat_n(b'}', depth));
        assert_eq!(parse(&raw), Err(SerializedError::TooDeep(MAX_DEPTH)));

        let mut ok = "a:1:{i:0;".repeat(MAX_DEPTH).into_bytes();
        ok.extend_from_slice(b"i:1;");
        ok.extend(std::iter::repeat_n(b'}', MAX_DEPTH));
        assert_eq!(parse(&ok)?.to_bytes(), ok);
        Ok(())
    }

    #[test]
    fn test_looks_serialized() {
        assert!(looks_serialized("a:1:{i:0;s:1:\"x\";}"));
        assert!(looks_serialized(" s:1:\"x\"; "));
        assert!(looks_serialized("N;"));
        assert!(!looks_serialized("http://example.com"));
        assert!(!looks_serialized("a:b"));
    }
}
