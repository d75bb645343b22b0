use std::fmt;

use jinx_source::Span;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TokenKind {
    /// Literal template text between constructs.
    Data(String),
    BlockStart,
    BlockEnd,
    VariableStart,
    VariableEnd,
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Tilde,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Dot,
    Comma,
    Colon,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Eof,
}

impl TokenKind {
    pub(crate) fn operator(text: &str) -> Option<TokenKind> {
        let kind = match text {
            "+" => TokenKind::Add,
            "-" => TokenKind::Sub,
            "*" => TokenKind::Mul,
            "/" => TokenKind::Div,
            "//" => TokenKind::FloorDiv,
            "%" => TokenKind::Mod,
            "**" => TokenKind::Pow,
            "~" => TokenKind::Tilde,
            "==" => TokenKind::Eq,
            "!=" => TokenKind::Ne,
            "<" => TokenKind::Lt,
            "<=" => TokenKind::Le,
            ">" => TokenKind::Gt,
            ">=" => TokenKind::Ge,
            "=" => TokenKind::Assign,
            "." => TokenKind::Dot,
            "," => TokenKind::Comma,
            ":" => TokenKind::Colon,
            "|" => TokenKind::Pipe,
            "(" => TokenKind::LParen,
            ")" => TokenKind::RParen,
            "[" => TokenKind::LBracket,
            "]" => TokenKind::RBracket,
            "{" => TokenKind::LBrace,
            "}" => TokenKind::RBrace,
            _ => return None,
        };
        Some(kind)
    }

    fn symbol(&self) -> Option<&'static str> {
        let symbol = match self {
            TokenKind::BlockStart => "{%",
            TokenKind::BlockEnd => "%}",
            TokenKind::VariableStart => "{{",
            TokenKind::VariableEnd => "}}",
            TokenKind::Add => "+",
            TokenKind::Sub => "-",
            TokenKind::Mul => "*",
            TokenKind::Div => "/",
            TokenKind::FloorDiv => "//",
            TokenKind::Mod => "%",
            TokenKind::Pow => "**",
            TokenKind::Tilde => "~",
            TokenKind::Eq => "==",
            TokenKind::Ne => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::Assign => "=",
            TokenKind::Dot => ".",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Pipe => "|",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            _ => return None,
        };
        Some(symbol)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(symbol) = self.symbol() {
            return write!(f, "'{symbol}'");
        }
        match self {
            TokenKind::Data(_) => f.write_str("template data"),
            TokenKind::Name(name) => write!(f, "'{name}'"),
            TokenKind::Str(_) => f.write_str("string"),
            TokenKind::Int(_) => f.write_str("integer"),
            TokenKind::Float(_) => f.write_str("float"),
            TokenKind::Eof => f.write_str("end of template"),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// The identifier if this is a name token.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(name) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_name(&self, expected: &str) -> bool {
        self.name() == Some(expected)
    }
}
