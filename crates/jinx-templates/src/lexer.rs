use jinx_source::Span;
use memchr::memchr;

use crate::error::Error;
use crate::tokens::Token;
use crate::tokens::TokenKind;

const BLOCK_TAG_END: &str = "%}";
const VARIABLE_TAG_END: &str = "}}";
const COMMENT_TAG_END: &str = "#}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Construct {
    Block,
    Variable,
    Comment,
}

impl Construct {
    fn describe(self) -> &'static str {
        match self {
            Construct::Block => "block tag",
            Construct::Variable => "variable",
            Construct::Comment => "comment",
        }
    }
}

/// Turns template source into one flat token stream.
///
/// Text between constructs becomes [`TokenKind::Data`]; the inside of `{% %}`
/// and `{{ }}` is split into expression tokens. Comments vanish, `{% raw %}`
/// regions come out as plain data, and `-` whitespace control is applied to the
/// neighbouring data here so the parser never sees it.
pub struct Lexer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    tokens: Vec<Token>,
    strip_next: bool,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        // a single trailing newline is not part of the output
        let source = source.strip_suffix('\n').unwrap_or(source);
        let source = source.strip_suffix('\r').unwrap_or(source);
        Lexer {
            source,
            start: 0,
            current: 0,
            tokens: Vec::new(),
            strip_next: false,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, Error> {
        while !self.is_at_end() {
            let Some((open, construct)) = self.find_construct() else {
                self.push_data(self.source.len(), false);
                self.current = self.source.len();
                break;
            };

            let strip_before = self.source[open + 2..].starts_with('-');
            self.push_data(open, strip_before);
            self.start = open;
            self.current = open + 2 + usize::from(strip_before);

            match construct {
                Construct::Comment => self.lex_comment()?,
                Construct::Variable => {
                    self.push(TokenKind::VariableStart, open);
                    self.lex_expression(Construct::Variable)?;
                }
                Construct::Block => {
                    self.push(TokenKind::BlockStart, open);
                    self.lex_expression(Construct::Block)?;
                    if self.opened_raw() {
                        self.lex_raw()?;
                    }
                }
            }
        }

        let end = self.source.len();
        self.tokens
            .push(Token::new(TokenKind::Eof, Span::from_parts(end, 0)));
        Ok(self.tokens)
    }

    fn find_construct(&self) -> Option<(usize, Construct)> {
        let bytes = self.source.as_bytes();
        let mut search = self.current;
        while let Some(rel) = memchr(b'{', &bytes[search..]) {
            let open = search + rel;
            let construct = match bytes.get(open + 1) {
                Some(b'%') => Construct::Block,
                Some(b'{') => Construct::Variable,
                Some(b'#') => Construct::Comment,
                _ => {
                    search = open + 1;
                    continue;
                }
            };
            return Some((open, construct));
        }
        None
    }

    fn push_data(&mut self, end: usize, strip_trailing: bool) {
        let mut start = self.current;
        let mut text = &self.source[start..end];
        if std::mem::take(&mut self.strip_next) {
            let trimmed = text.trim_start();
            start += text.len() - trimmed.len();
            text = trimmed;
        }
        if strip_trailing {
            text = text.trim_end();
        }
        if !text.is_empty() {
            self.tokens.push(Token::new(
                TokenKind::Data(text.to_string()),
                Span::from_parts(start, text.len()),
            ));
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.tokens
            .push(Token::new(kind, Span::from_bounds(start, self.current)));
    }

    fn lex_comment(&mut self) -> Result<(), Error> {
        let Some(rel) = self.source[self.current..].find(COMMENT_TAG_END) else {
            return Err(self.unterminated(Construct::Comment));
        };
        let close = self.current + rel;
        if close > self.current && self.source.as_bytes()[close - 1] == b'-' {
            self.strip_next = true;
        }
        self.current = close + COMMENT_TAG_END.len();
        Ok(())
    }

    fn lex_expression(&mut self, construct: Construct) -> Result<(), Error> {
        let (end, end_kind) = match construct {
            Construct::Variable => (VARIABLE_TAG_END, TokenKind::VariableEnd),
            _ => (BLOCK_TAG_END, TokenKind::BlockEnd),
        };
        let mut balance: Vec<char> = Vec::new();

        loop {
            self.skip_whitespace();
            if self.is_at_end() {
                return Err(self.unterminated(construct));
            }
            self.start = self.current;
            let rest = &self.source[self.current..];

            if balance.is_empty() {
                if rest.starts_with('-') && rest[1..].starts_with(end) {
                    self.strip_next = true;
                    self.consume_n(1 + end.len());
                    self.push(end_kind, self.start);
                    return Ok(());
                }
                if rest.starts_with(end) {
                    self.consume_n(end.len());
                    self.push(end_kind, self.start);
                    return Ok(());
                }
            }

            match self.peek() {
                c if c.is_ascii_alphabetic() || c == '_' => self.lex_name(),
                c if c.is_ascii_digit() => self.lex_number()?,
                quote @ ('\'' | '"') => self.lex_string(quote)?,
                _ => self.lex_operator(&mut balance)?,
            }
        }
    }

    fn lex_name(&mut self) {
        while !self.is_at_end() && (self.peek().is_ascii_alphanumeric() || self.peek() == '_') {
            self.consume();
        }
        let name = self.source[self.start..self.current].to_string();
        self.push(TokenKind::Name(name), self.start);
    }

    fn lex_number(&mut self) -> Result<(), Error> {
        self.consume_digits();
        let mut is_float = false;

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            self.consume();
            self.consume_digits();
        }

        if matches!(self.peek(), 'e' | 'E') {
            let rest = &self.source[self.current + 1..];
            let signed = rest.starts_with(['+', '-']);
            let digits = if signed { &rest[1..] } else { rest };
            if digits.starts_with(|c: char| c.is_ascii_digit()) {
                is_float = true;
                self.consume_n(1 + usize::from(signed));
                self.consume_digits();
            }
        }

        let text: String = self.source[self.start..self.current]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let span = Span::from_bounds(self.start, self.current);
        let kind = if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| Error::syntax(format!("invalid float literal '{text}'"), span))?
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| Error::syntax(format!("integer literal '{text}' is too large"), span))?
        };
        self.push(kind, self.start);
        Ok(())
    }

    fn consume_digits(&mut self) {
        while !self.is_at_end() && (self.peek().is_ascii_digit() || self.peek() == '_') {
            self.consume();
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<(), Error> {
        self.consume();
        let mut value = String::new();
        loop {
            if self.is_at_end() {
                return Err(Error::syntax(
                    "unterminated string literal",
                    Span::from_bounds(self.start, self.current),
                ));
            }
            let c = self.consume();
            match c {
                c if c == quote => break,
                '\\' if !self.is_at_end() => match self.consume() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    c @ ('\\' | '\'' | '"') => value.push(c),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                },
                c => value.push(c),
            }
        }
        self.push(TokenKind::Str(value), self.start);
        Ok(())
    }

    fn lex_operator(&mut self, balance: &mut Vec<char>) -> Result<(), Error> {
        let rest = &self.source[self.current..];
        let two = rest.get(..2).and_then(TokenKind::operator);
        let (kind, width) = match two {
            Some(kind) => (kind, 2),
            None => {
                let c = self.peek();
                let kind = TokenKind::operator(&rest[..c.len_utf8()]).ok_or_else(|| {
                    Error::syntax(
                        format!("unexpected character '{c}'"),
                        Span::from_parts(self.current, c.len_utf8()),
                    )
                })?;
                (kind, c.len_utf8())
            }
        };

        match kind {
            TokenKind::LParen => balance.push(')'),
            TokenKind::LBracket => balance.push(']'),
            TokenKind::LBrace => balance.push('}'),
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                let closing = self.peek();
                if balance.pop() != Some(closing) {
                    return Err(Error::syntax(
                        format!("unexpected '{closing}'"),
                        Span::from_parts(self.current, 1),
                    ));
                }
            }
            _ => {}
        }

        self.consume_n(width);
        self.push(kind, self.start);
        Ok(())
    }

    fn opened_raw(&self) -> bool {
        matches!(
            self.tokens.as_slice(),
            [.., open, name, close]
                if open.kind == TokenKind::BlockStart
                    && name.is_name("raw")
                    && close.kind == TokenKind::BlockEnd
        )
    }

    fn lex_raw(&mut self) -> Result<(), Error> {
        let open = self.tokens.len() - 3;
        let raw_start = self.tokens[open].span;
        self.tokens.truncate(open);

        let Some((close, strip_before, end, strip_after)) = self.find_endraw() else {
            return Err(Error::syntax("missing end of raw directive", raw_start));
        };
        self.push_data(close, strip_before);
        self.strip_next = strip_after;
        self.current = end;
        Ok(())
    }

    fn find_endraw(&self) -> Option<(usize, bool, usize, bool)> {
        let mut search = self.current;
        while let Some(rel) = self.source[search..].find("{%") {
            let open = search + rel;
            let mut pos = open + 2;
            let strip_before = self.source[pos..].starts_with('-');
            pos += usize::from(strip_before);
            pos = self.skip_whitespace_from(pos);
            if self.source[pos..].starts_with("endraw") {
                pos = self.skip_whitespace_from(pos + "endraw".len());
                let strip_after = self.source[pos..].starts_with('-');
                pos += usize::from(strip_after);
                if self.source[pos..].starts_with(BLOCK_TAG_END) {
                    return Some((open, strip_before, pos + BLOCK_TAG_END.len(), strip_after));
                }
            }
            search = open + 2;
        }
        None
    }

    fn unterminated(&self, construct: Construct) -> Error {
        Error::syntax(
            format!(
                "unexpected end of template, expected end of {}",
                construct.describe()
            ),
            Span::from_bounds(self.start, self.source.len()),
        )
    }

    fn skip_whitespace(&mut self) {
        self.current = self.skip_whitespace_from(self.current);
    }

    fn skip_whitespace_from(&self, mut pos: usize) -> usize {
        while let Some(c) = self.source[pos..].chars().next() {
            if !c.is_whitespace() {
                break;
            }
            pos += c.len_utf8();
        }
        pos
    }

    fn peek(&self) -> char {
        self.source[self.current..].chars().next().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    fn consume(&mut self) -> char {
        let c = self.peek();
        self.current += c.len_utf8();
        c
    }

    fn consume_n(&mut self, bytes: usize) {
        self.current = (self.current + bytes).min(self.source.len());
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(source).tokenize()
}
