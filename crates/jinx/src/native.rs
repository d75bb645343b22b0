//! Recovering typed values from rendered output.

use indexmap::IndexMap;
use jinx_templates::Value;

/// Combine the fragments of a native render into one value.
///
/// A single non-string fragment is returned untouched. Otherwise the
/// fragments are joined as text and parsed as a literal; text that is not a
/// literal comes back as a string. With `preserve_quotes`, a literal that
/// parses to a string keeps its surrounding quote characters.
pub fn native_concat(fragments: Vec<Value>, preserve_quotes: bool) -> Result<Value, jinx_templates::Error> {
    let raw = match fragments.len() {
        0 => return Ok(Value::None),
        1 => match fragments.into_iter().next() {
            Some(Value::Str(text)) => text.to_string(),
            Some(value) => return Ok(value),
            None => return Ok(Value::None),
        },
        _ => fragments
            .iter()
            .map(Value::to_output)
            .collect::<Result<String, _>>()?,
    };

    match literal_eval(&raw) {
        Some(Value::Str(text)) if preserve_quotes => {
            let quote = raw.trim_start().chars().next().unwrap_or('"');
            Ok(Value::from(format!("{quote}{text}{quote}")))
        }
        Some(value) => Ok(value),
        None => Ok(Value::from(raw)),
    }
}

/// Parse a Jinja-style literal: numbers, strings, booleans, `None`, lists,
/// tuples and dicts with string keys. Tuples become lists.
#[must_use]
pub fn literal_eval(source: &str) -> Option<Value> {
    let mut parser = LiteralParser {
        source: source.trim_start_matches([' ', '\t']),
        pos: 0,
        depth: 0,
    };
    let value = parser.parse_tuple(false)?;
    parser.skip_trailing();
    (parser.pos == parser.source.len()).then_some(value)
}

/// Bracket nesting beyond this leaves the text unparsed.
const MAX_LITERAL_DEPTH: usize = 100;

struct LiteralParser<'a> {
    source: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> LiteralParser<'a> {
    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(offset)
    }

    fn enter(&mut self) -> Option<()> {
        self.depth += 1;
        (self.depth <= MAX_LITERAL_DEPTH).then_some(())
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    // newlines only separate tokens inside brackets
    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '\n' | '\r' if self.depth > 0 => self.pos += 1,
                '\\' if matches!(self.peek_at(1), Some('\n')) => self.pos += 2,
                '#' => self.skip_comment(),
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn skip_trailing(&mut self) {
        loop {
            self.skip_ws();
            match self.peek() {
                Some('\n' | '\r') => self.pos += 1,
                _ => break,
            }
        }
    }

    fn at_close(&mut self) -> bool {
        self.skip_ws();
        matches!(self.peek(), None | Some(')' | ']' | '}' | '\n' | '\r'))
    }

    /// One or more comma-separated items; a comma anywhere makes a list.
    fn parse_tuple(&mut self, allow_empty: bool) -> Option<Value> {
        if allow_empty && self.at_close() {
            return Some(Value::list(Vec::new()));
        }
        let first = self.parse_item()?;
        if !self.eat(',') {
            return Some(first);
        }
        let mut items = vec![first];
        while !self.at_close() {
            items.push(self.parse_item()?);
            if !self.eat(',') {
                break;
            }
        }
        Some(Value::list(items))
    }

    fn parse_item(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '+' | '-' => {
                let negative = self.bump()? == '-';
                self.skip_ws();
                match self.parse_number()? {
                    Value::Int(i) if negative => i.checked_neg().map(Value::Int),
                    Value::Float(f) if negative => Some(Value::Float(-f)),
                    value => Some(value),
                }
            }
            '0'..='9' => self.parse_number(),
            '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.parse_number(),
            '[' => {
                self.bump();
                self.enter()?;
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.parse_item()?);
                    if !self.eat(',') {
                        let closed = self.eat(']');
                        self.depth -= 1;
                        return closed.then(|| Value::list(items));
                    }
                }
                self.depth -= 1;
                Some(Value::list(items))
            }
            '(' => {
                self.bump();
                self.enter()?;
                let value = self.parse_tuple(true)?;
                let closed = self.eat(')');
                self.depth -= 1;
                closed.then_some(value)
            }
            '{' => self.parse_dict(),
            '\'' | '"' => self.parse_strings(),
            c if c.is_alphabetic() || c == '_' => {
                let word = self.take_word();
                match word {
                    "True" => Some(Value::Bool(true)),
                    "False" => Some(Value::Bool(false)),
                    "None" => Some(Value::None),
                    "u" | "U" | "r" | "R" if matches!(self.peek(), Some('\'' | '"')) => {
                        self.pos -= 1;
                        self.parse_strings()
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn take_word(&mut self) -> &'a str {
        let source = self.source;
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        &source[start..self.pos]
    }

    fn parse_dict(&mut self) -> Option<Value> {
        self.bump();
        self.enter()?;
        let mut entries = IndexMap::new();
        while !self.eat('}') {
            let Value::Str(key) = self.parse_item()? else {
                return None;
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.parse_item()?;
            entries.insert(key.to_string(), value);
            if !self.eat(',') {
                if !self.eat('}') {
                    return None;
                }
                break;
            }
        }
        self.depth -= 1;
        Some(Value::map(entries))
    }

    fn parse_number(&mut self) -> Option<Value> {
        let start = self.pos;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            self.bump();
            let radix = match self.bump()? {
                'x' | 'X' => 16,
                'o' | 'O' => 8,
                _ => 2,
            };
            let digits = self.take_digits(|c| c.is_digit(radix));
            return i64::from_str_radix(&digits, radix).ok().map(Value::Int);
        }

        let mut text = self.take_digits(|c| c.is_ascii_digit());
        let mut is_float = false;
        if self.peek() == Some('.') {
            self.bump();
            is_float = true;
            text.push('.');
            text.push_str(&self.take_digits(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_at(1).filter(|c| matches!(*c, '+' | '-'));
            let digit_at = if sign.is_some() { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.bump();
                text.push('e');
                if let Some(sign) = sign {
                    self.bump();
                    text.push(sign);
                }
                text.push_str(&self.take_digits(|c| c.is_ascii_digit()));
            }
        }
        if self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            // `1j`, `1abc`
            return None;
        }
        if self.pos == start {
            return None;
        }

        if is_float {
            text.parse::<f64>().ok().map(Value::Float)
        } else {
            if text.len() > 1 && text.starts_with('0') && text.chars().any(|c| c != '0') {
                return None;
            }
            text.parse::<i64>().ok().map(Value::Int)
        }
    }

    /// Digits accepted by `valid`, with single underscores between them dropped.
    fn take_digits(&mut self, valid: impl Fn(char) -> bool) -> String {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if valid(c) {
                digits.push(c);
            } else if c == '_' && !digits.is_empty() && self.peek_at(1).is_some_and(&valid) {
                // separator
            } else {
                break;
            }
            self.bump();
        }
        digits
    }

    /// One string literal, or several adjacent ones concatenated.
    fn parse_strings(&mut self) -> Option<Value> {
        let mut text = self.parse_string()?;
        loop {
            let checkpoint = self.pos;
            self.skip_ws();
            let prefixed = matches!(self.peek(), Some('u' | 'U' | 'r' | 'R'))
                && matches!(self.peek_at(1), Some('\'' | '"'));
            if prefixed || matches!(self.peek(), Some('\'' | '"')) {
                text.push_str(&self.parse_string()?);
            } else {
                self.pos = checkpoint;
                break;
            }
        }
        Some(Value::from(text))
    }

    fn parse_string(&mut self) -> Option<String> {
        let raw = match self.peek()? {
            'r' | 'R' => {
                self.bump();
                true
            }
            'u' | 'U' => {
                self.bump();
                false
            }
            _ => false,
        };
        let quote = self.bump()?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let c = self.bump()?;
            if c == quote {
                if !triple {
                    return Some(out);
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    return Some(out);
                }
                out.push(c);
            } else if c == '\n' && !triple {
                return None;
            } else if c == '\\' {
                let escaped = self.bump()?;
                if raw {
                    out.push('\\');
                    out.push(escaped);
                } else {
                    self.unescape(escaped, &mut out)?;
                }
            } else {
                out.push(c);
            }
        }
    }

    fn unescape(&mut self, escaped: char, out: &mut String) -> Option<()> {
        match escaped {
            '\n' => {}
            '\\' | '\'' | '"' => out.push(escaped),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut code = escaped.to_digit(8)?;
                for _ in 0..2 {
                    match self.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            code = code * 8 + digit;
                            self.bump();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code)?);
            }
            'x' => out.push(self.hex_escape(2)?),
            'u' => out.push(self.hex_escape(4)?),
            'U' => out.push(self.hex_escape(8)?),
            // `\N{...}` names are not supported
            'N' => return None,
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Some(())
    }

    fn hex_escape(&mut self, len: usize) -> Option<char> {
        let mut code = 0;
        for _ in 0..len {
            code = code * 16 + self.bump()?.to_digit(16)?;
        }
        char::from_u32(code)
    }
}
