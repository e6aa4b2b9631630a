//! The restricted literal grammar used on the wire (spec: a bounded
//! recursive-descent reader/writer standing in for `ast.literal_eval`).
//!
//! Only strings, integers, booleans, `None`, ordered lists, string-to-string
//! maps and nested tuples are accepted. Nothing here ever evaluates code;
//! malformed input is always a parse error, never a panic.

use std::fmt::{self, Write as _};

/// A value in the command-record wire grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    /// A string-to-string mapping (the only kind of mapping the grammar allows).
    Map(Vec<(String, String)>),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Literal]> {
        match self {
            Literal::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, String)]> {
        match self {
            Literal::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<Vec<&str>> {
        self.as_list()?.iter().map(Literal::as_str).collect()
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_owned())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::Str(s)
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

/// Error produced when a payload fails to parse as the restricted grammar.
///
/// Per spec, this is never fatal to the channel: callers log it and drop
/// the record.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid literal: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Parse a single literal value from `input`, requiring the entire
/// (trimmed) string to be consumed.
pub fn parse(input: &str) -> Result<Literal, ParseError> {
    let mut p = Parser {
        s: input.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.s.len() {
        return Err(ParseError(format!("trailing data at byte {}", p.pos)));
    }
    Ok(value)
}

struct Parser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError(format!(
                "expected {:?} at byte {}",
                b as char, self.pos
            )))
        }
    }

    fn value(&mut self) -> Result<Literal, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'') | Some(b'"') => self.string().map(Literal::Str),
            Some(b'[') => self.list(),
            Some(b'(') => self.tuple(),
            Some(b'{') => self.map(),
            Some(b'-') | Some(b'0'..=b'9') => self.integer(),
            Some(b'T') | Some(b'F') => self.boolean(),
            Some(b'N') => self.none(),
            other => Err(ParseError(format!(
                "unexpected byte {:?} at position {}",
                other, self.pos
            ))),
        }
    }

    fn literal_word(&mut self, word: &str) -> bool {
        let bytes = word.as_bytes();
        if self.s[self.pos..].starts_with(bytes) {
            self.pos += bytes.len();
            true
        } else {
            false
        }
    }

    fn boolean(&mut self) -> Result<Literal, ParseError> {
        if self.literal_word("True") {
            Ok(Literal::Bool(true))
        } else if self.literal_word("False") {
            Ok(Literal::Bool(false))
        } else {
            Err(ParseError(format!("expected bool at byte {}", self.pos)))
        }
    }

    fn none(&mut self) -> Result<Literal, ParseError> {
        if self.literal_word("None") {
            Ok(Literal::None)
        } else {
            Err(ParseError(format!("expected None at byte {}", self.pos)))
        }
    }

    fn integer(&mut self) -> Result<Literal, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(ParseError(format!("expected digits at byte {}", self.pos)));
        }
        let text = std::str::from_utf8(&self.s[start..self.pos]).unwrap();
        text.parse::<i64>()
            .map(Literal::Int)
            .map_err(|e| ParseError(format!("invalid integer {:?}: {}", text, e)))
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let quote = self.peek().unwrap();
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError("unterminated string".into())),
                Some(b) if b == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let esc = self
                        .peek()
                        .ok_or_else(|| ParseError("unterminated escape".into()))?;
                    self.pos += 1;
                    match esc {
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'r' => out.push('\r'),
                        b'\\' => out.push('\\'),
                        b'\'' => out.push('\''),
                        b'"' => out.push('"'),
                        b'0' => out.push('\0'),
                        b'x' => {
                            let hex = self.take_hex(2)?;
                            out.push(hex as u8 as char);
                        }
                        b'u' => {
                            let code = self.take_hex(4)?;
                            out.push(
                                char::from_u32(code)
                                    .ok_or_else(|| ParseError("invalid \\u escape".into()))?,
                            );
                        }
                        other => return Err(ParseError(format!("unknown escape \\{}", other as char))),
                    }
                }
                Some(_) => {
                    // Find the UTF-8 char boundary starting here.
                    let rest = std::str::from_utf8(&self.s[self.pos..])
                        .map_err(|_| ParseError("invalid utf-8 in string literal".into()))?;
                    let ch = rest.chars().next().unwrap();
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
        Ok(out)
    }

    fn take_hex(&mut self, n: usize) -> Result<u32, ParseError> {
        let start = self.pos;
        if start + n > self.s.len() {
            return Err(ParseError("truncated hex escape".into()));
        }
        let text = std::str::from_utf8(&self.s[start..start + n]).unwrap();
        self.pos += n;
        u32::from_str_radix(text, 16).map_err(|e| ParseError(format!("bad hex escape: {e}")))
    }

    fn list(&mut self) -> Result<Literal, ParseError> {
        self.expect(b'[')?;
        let items = self.comma_separated(b']')?;
        Ok(Literal::List(items))
    }

    fn tuple(&mut self) -> Result<Literal, ParseError> {
        self.expect(b'(')?;
        let items = self.comma_separated(b')')?;
        Ok(Literal::Tuple(items))
    }

    fn comma_separated(&mut self, close: u8) -> Result<Vec<Literal>, ParseError> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.peek() == Some(close) {
                        self.pos += 1;
                        break;
                    }
                }
                Some(b) if b == close => {
                    self.pos += 1;
                    break;
                }
                other => {
                    return Err(ParseError(format!(
                        "expected ',' or {:?}, got {:?} at byte {}",
                        close as char, other, self.pos
                    )))
                }
            }
        }
        Ok(items)
    }

    fn map(&mut self) -> Result<Literal, ParseError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Literal::Map(entries));
        }
        loop {
            self.skip_ws();
            let key = match self.peek() {
                Some(b'\'') | Some(b'"') => self.string()?,
                other => {
                    return Err(ParseError(format!(
                        "expected string map key, got {:?} at byte {}",
                        other, self.pos
                    )))
                }
            };
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            let value = match self.peek() {
                Some(b'\'') | Some(b'"') => self.string()?,
                other => {
                    return Err(ParseError(format!(
                        "expected string map value, got {:?} at byte {}",
                        other, self.pos
                    )))
                }
            };
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.peek() == Some(b'}') {
                        self.pos += 1;
                        break;
                    }
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                other => {
                    return Err(ParseError(format!(
                        "expected ',' or '}}', got {:?} at byte {}",
                        other, self.pos
                    )))
                }
            }
        }
        Ok(Literal::Map(entries))
    }
}

/// Render a literal back to the textual form used on the wire.
///
/// Matches the quoting conventions of Python's `repr()` closely enough that
/// round-tripping fixtures captured from the upstream askpass client line
/// up byte-for-byte: single-quoted strings unless the string contains a
/// single quote and no double quote.
pub fn write(value: &Literal, out: &mut String) {
    match value {
        Literal::None => out.push_str("None"),
        Literal::Bool(true) => out.push_str("True"),
        Literal::Bool(false) => out.push_str("False"),
        Literal::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Literal::Str(s) => write_str(s, out),
        Literal::List(items) => {
            out.push('[');
            write_joined(items, out);
            out.push(']');
        }
        Literal::Tuple(items) => {
            out.push('(');
            write_joined(items, out);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Literal::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_str(k, out);
                out.push_str(": ");
                write_str(v, out);
            }
            out.push('}');
        }
    }
}

fn write_joined(items: &[Literal], out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write(item, out);
    }
}

fn write_str(s: &str, out: &mut String) {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Convenience: render a `Literal` to an owned `String`.
pub fn to_string(value: &Literal) -> String {
    let mut s = String::new();
    write(value, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        for lit in [
            Literal::None,
            Literal::Bool(true),
            Literal::Bool(false),
            Literal::Int(-42),
            Literal::Int(0),
            Literal::Str("hello world".into()),
        ] {
            let text = to_string(&lit);
            assert_eq!(parse(&text).unwrap(), lit);
        }
    }

    #[test]
    fn parses_askpass_command_record() {
        let text = "(['some', 'data'], {'answer': 42})";
        // note: 42 here is not a string, so this should fail to parse as our
        // map-of-strings grammar; real askpass env dicts are always
        // string-to-string.
        assert!(parse(text).is_err());

        let text = "(['some', 'data'], {'answer': '42'})";
        let parsed = parse(text).unwrap();
        let tuple = parsed.as_tuple().unwrap();
        assert_eq!(tuple[0].as_str_list().unwrap(), vec!["some", "data"]);
        assert_eq!(
            tuple[1].as_map().unwrap(),
            &[("answer".to_string(), "42".to_string())]
        );
    }

    #[test]
    fn parses_ferny_end() {
        let parsed = parse("('ferny.end', ())").unwrap();
        let tuple = parsed.as_tuple().unwrap();
        assert_eq!(tuple[0].as_str(), Some("ferny.end"));
        assert_eq!(tuple[1].as_tuple(), Some(&[][..]));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("import os; os.system('rm -rf /')").is_err());
        assert!(parse("[1, 2,").is_err());
        assert!(parse("'unterminated").is_err());
    }

    #[test]
    fn singleton_tuple_has_trailing_comma() {
        assert_eq!(to_string(&Literal::Tuple(vec![Literal::Int(1)])), "(1,)");
        assert_eq!(to_string(&Literal::Tuple(vec![])), "()");
    }

    #[test]
    fn string_quoting_prefers_single_unless_it_contains_one() {
        assert_eq!(to_string(&Literal::Str("it's".into())), "\"it's\"");
        assert_eq!(to_string(&Literal::Str("plain".into())), "'plain'");
    }
}
