// Copyright 2021 The Mtn Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The stanza-oriented text format used for every persistent text object:
//! manifests, rosters, revisions, the pending workspace revision, options,
//! and bisect state.
//!
//! A file is a sequence of stanzas separated by blank lines. Each stanza
//! line is a symbol followed by zero or more values; a value is either an
//! escaped double-quoted string or a bracketed hex id. Within one stanza
//! the symbols are right-aligned to the longest symbol, so the values
//! start in the same column. Serializations are canonical: the same value
//! always prints to the same bytes, which is what makes hashing printed
//! forms meaningful.

use std::fmt::Write as _;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BasicIoError {
    #[error("parse error at line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("parse error at line {line}: expected symbol {expected:?}, got {actual:?}")]
    WrongSymbol {
        line: usize,
        expected: String,
        actual: String,
    },
    #[error("unexpected trailing data at line {line}")]
    TrailingData { line: usize },
}

type Result<T> = std::result::Result<T, BasicIoError>;

/// One printable value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Printed as an escaped, double-quoted string.
    Str(String),
    /// Printed as a bracketed lowercase hex id.
    Hex(String),
}

/// Escapes `\` and `"` for double-quoted output.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A stanza being assembled for printing.
#[derive(Clone, Debug, Default)]
pub struct Stanza {
    entries: Vec<(&'static str, Vec<Value>)>,
}

impl Stanza {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, sym: &'static str, value: impl Into<String>) -> &mut Self {
        self.entries.push((sym, vec![Value::Str(value.into())]));
        self
    }

    pub fn push_hex(&mut self, sym: &'static str, hex: impl Into<String>) -> &mut Self {
        self.entries.push((sym, vec![Value::Hex(hex.into())]));
        self
    }

    pub fn push_values(&mut self, sym: &'static str, values: Vec<Value>) -> &mut Self {
        self.entries.push((sym, values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Prints stanzas with one blank line between consecutive stanzas.
#[derive(Debug, Default)]
pub struct Printer {
    out: String,
    any: bool,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stanza(&mut self, stanza: &Stanza) {
        if stanza.is_empty() {
            return;
        }
        if self.any {
            self.out.push('\n');
        }
        self.any = true;
        let width = stanza
            .entries
            .iter()
            .map(|(sym, _)| sym.len())
            .max()
            .unwrap();
        for (sym, values) in &stanza.entries {
            for _ in 0..width - sym.len() {
                self.out.push(' ');
            }
            self.out.push_str(sym);
            for value in values {
                match value {
                    Value::Str(s) => write!(self.out, " \"{}\"", escape(s)).unwrap(),
                    Value::Hex(h) => write!(self.out, " [{h}]").unwrap(),
                }
            }
            self.out.push('\n');
        }
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Symbol(String),
    Str(String),
    Hex(String),
}

/// Pull parser with one token of lookahead.
#[derive(Debug)]
pub struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    lookahead: Option<Token>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Result<Self> {
        let mut parser = Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            lookahead: None,
        };
        parser.lookahead = parser.scan()?;
        Ok(parser)
    }

    fn syntax(&self, reason: impl Into<String>) -> BasicIoError {
        BasicIoError::Syntax {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn scan(&mut self) -> Result<Option<Token>> {
        while let Some(&b) = self.input.get(self.pos) {
            if b == b'\n' {
                self.line += 1;
            }
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let Some(&b) = self.input.get(self.pos) else {
            return Ok(None);
        };
        match b {
            b'"' => {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.input.get(self.pos) {
                        None => return Err(self.syntax("unterminated string")),
                        Some(b'\\') => {
                            let escaped = self
                                .input
                                .get(self.pos + 1)
                                .ok_or_else(|| self.syntax("unterminated escape"))?;
                            if *escaped != b'"' && *escaped != b'\\' {
                                return Err(self.syntax("bad escape sequence"));
                            }
                            value.push(*escaped as char);
                            self.pos += 2;
                        }
                        Some(b'"') => {
                            self.pos += 1;
                            break;
                        }
                        Some(b'\n') => {
                            self.line += 1;
                            value.push('\n');
                            self.pos += 1;
                        }
                        Some(&c) => {
                            // The format is UTF-8; multibyte sequences pass
                            // through byte-by-byte.
                            value.push(c as char);
                            self.pos += 1;
                        }
                    }
                }
                // Re-validate multibyte content in one go.
                let value = String::from_utf8(value.chars().map(|c| c as u8).collect())
                    .map_err(|_| self.syntax("string is not valid UTF-8"))?;
                Ok(Some(Token::Str(value)))
            }
            b'[' => {
                self.pos += 1;
                let start = self.pos;
                while let Some(&c) = self.input.get(self.pos) {
                    if c == b']' {
                        break;
                    }
                    if !c.is_ascii_hexdigit() {
                        return Err(self.syntax("bad hex digit"));
                    }
                    self.pos += 1;
                }
                if self.input.get(self.pos) != Some(&b']') {
                    return Err(self.syntax("unterminated hex id"));
                }
                let hex = std::str::from_utf8(&self.input[start..self.pos])
                    .unwrap()
                    .to_owned();
                self.pos += 1;
                Ok(Some(Token::Hex(hex)))
            }
            c if c.is_ascii_lowercase() || c == b'_' => {
                let start = self.pos;
                while let Some(&c) = self.input.get(self.pos) {
                    if c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let sym = std::str::from_utf8(&self.input[start..self.pos])
                    .unwrap()
                    .to_owned();
                Ok(Some(Token::Symbol(sym)))
            }
            c => Err(self.syntax(format!("unexpected byte {:?}", c as char))),
        }
    }

    fn advance(&mut self) -> Result<Option<Token>> {
        let next = self.scan()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    pub fn at_eof(&self) -> bool {
        self.lookahead.is_none()
    }

    pub fn expect_eof(&self) -> Result<()> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(BasicIoError::TrailingData { line: self.line })
        }
    }

    /// Whether the next token is any symbol.
    pub fn at_symbol(&self) -> bool {
        matches!(self.lookahead, Some(Token::Symbol(_)))
    }

    /// Whether the next token is the given symbol.
    pub fn at(&self, sym: &str) -> bool {
        matches!(&self.lookahead, Some(Token::Symbol(s)) if s == sym)
    }

    /// Consumes the next token, which must be a symbol.
    pub fn symbol(&mut self) -> Result<String> {
        match self.advance()? {
            Some(Token::Symbol(s)) => Ok(s),
            other => Err(self.syntax(format!("expected a symbol, got {other:?}"))),
        }
    }

    /// Consumes the given symbol.
    pub fn expect(&mut self, sym: &str) -> Result<()> {
        let actual = self.symbol()?;
        if actual == sym {
            Ok(())
        } else {
            Err(BasicIoError::WrongSymbol {
                line: self.line,
                expected: sym.to_owned(),
                actual,
            })
        }
    }

    /// Consumes a quoted string value.
    pub fn str_value(&mut self) -> Result<String> {
        match self.advance()? {
            Some(Token::Str(s)) => Ok(s),
            other => Err(self.syntax(format!("expected a string, got {other:?}"))),
        }
    }

    /// Consumes a bracketed hex value.
    pub fn hex_value(&mut self) -> Result<String> {
        match self.advance()? {
            Some(Token::Hex(h)) => Ok(h),
            other => Err(self.syntax(format!("expected a hex id, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn aligned_printing() {
        let mut printer = Printer::new();
        printer.stanza(Stanza::new().push_str("format_version", "1"));
        printer.stanza(
            Stanza::new()
                .push_str("patch", "changed-file.cc")
                .push_hex("from", "588fd8a7bcde43a46f0bde1dd1d13e9e77cf25a1")
                .push_hex("to", "559133b166c3154c864f912e9f9452bfc452dfdd"),
        );
        assert_eq!(
            printer.finish(),
            indoc! {r#"
                format_version "1"

                patch "changed-file.cc"
                 from [588fd8a7bcde43a46f0bde1dd1d13e9e77cf25a1]
                   to [559133b166c3154c864f912e9f9452bfc452dfdd]
            "#}
        );
    }

    #[test]
    fn escaping_round_trip() {
        let mut printer = Printer::new();
        printer.stanza(Stanza::new().push_str("set", r#"we"ird\name"#));
        let text = printer.finish();
        assert_eq!(text, "set \"we\\\"ird\\\\name\"\n");
        let mut parser = Parser::new(&text).unwrap();
        parser.expect("set").unwrap();
        assert_eq!(parser.str_value().unwrap(), r#"we"ird\name"#);
        parser.expect_eof().unwrap();
    }

    #[test]
    fn parser_walks_tokens() {
        let text = indoc! {r#"
            delete "gone"

            rename "old"
                to "new"

            add_file "f"
             content [f572d396fae9206628714fb2ce00f72e94f2258f]
        "#};
        let mut parser = Parser::new(text).unwrap();
        parser.expect("delete").unwrap();
        assert_eq!(parser.str_value().unwrap(), "gone");
        assert!(parser.at("rename"));
        parser.expect("rename").unwrap();
        parser.str_value().unwrap();
        parser.expect("to").unwrap();
        parser.str_value().unwrap();
        parser.expect("add_file").unwrap();
        parser.str_value().unwrap();
        parser.expect("content").unwrap();
        assert_eq!(
            parser.hex_value().unwrap(),
            "f572d396fae9206628714fb2ce00f72e94f2258f"
        );
        parser.expect_eof().unwrap();
    }

    #[test]
    fn rejects_garbage() {
        assert!(Parser::new("Δ").is_err());
        let mut parser = Parser::new("[zz]").unwrap_err();
        assert_matches::assert_matches!(parser, BasicIoError::Syntax { .. });
        parser = Parser::new("\"abc").unwrap_err();
        assert_matches::assert_matches!(parser, BasicIoError::Syntax { .. });
    }
}
