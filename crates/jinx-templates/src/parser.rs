use std::sync::Arc;

use jinx_source::Span;

use crate::ast::BinOp;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::ForLoop;
use crate::ast::MacroDef;
use crate::ast::Param;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::Target;
use crate::ast::UnaryOp;
use crate::error::Error;
use crate::ext::Extensions;
use crate::lexer::tokenize;
use crate::tokens::Token;
use crate::tokens::TokenKind;
use crate::value::Value;

/// Combined depth of nested blocks and sub-expressions.
const MAX_NESTING: usize = 100;

const RESERVED_NAMES: &[&str] = &["true", "false", "none", "True", "False", "None"];

// Names that end a bare test argument: `x is defined and y`
const TEST_ARG_STOPWORDS: &[&str] = &["and", "or", "else", "if", "in", "is", "not"];

/// Recursive-descent parser over the token stream.
///
/// The primitives tag extensions need (`parse_assign_name`,
/// `parse_expression`, `parse_signature`, `parse_statements`, and the token
/// helpers) are public; everything else is internal.
pub struct Parser<'a> {
    tokens: Vec<Token>,
    current: usize,
    extensions: &'a Extensions,
    end_tags: Vec<Vec<String>>,
    depth: usize,
}

impl<'a> Parser<'a> {
    #[must_use]
    pub fn new(tokens: Vec<Token>, extensions: &'a Extensions) -> Self {
        let mut tokens = tokens;
        if !matches!(tokens.last().map(|token| &token.kind), Some(TokenKind::Eof)) {
            let end = tokens.last().map_or(0, |token| token.span.end_usize());
            tokens.push(Token::new(TokenKind::Eof, Span::from_parts(end, 0)));
        }
        Parser {
            tokens,
            current: 0,
            extensions,
            end_tags: Vec::new(),
            depth: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>, Error> {
        self.subparse(&[])
    }

    #[must_use]
    pub fn current(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, ahead: usize) -> &TokenKind {
        let index = (self.current + ahead).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn previous_span(&self) -> Span {
        self.current
            .checked_sub(1)
            .map_or_else(|| self.current().span, |index| self.tokens[index].span)
    }

    /// Consume and return the current token. The end-of-template token is never consumed.
    pub fn next_token(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.current += 1;
        }
        token
    }

    pub fn skip_if(&mut self, kind: &TokenKind) -> bool {
        if &self.current().kind == kind {
            self.next_token();
            true
        } else {
            false
        }
    }

    pub fn skip_name(&mut self, name: &str) -> bool {
        if self.current().is_name(name) {
            self.next_token();
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, kind: &TokenKind) -> Result<Token, Error> {
        if &self.current().kind == kind {
            return Ok(self.next_token());
        }
        let token = self.current();
        let message = if token.kind == TokenKind::Eof {
            format!("unexpected end of template, expected token {kind}")
        } else {
            format!("expected token {kind}, got {}", token.kind)
        };
        Err(self.fail(message, token.span))
    }

    #[must_use]
    pub fn fail(&self, message: impl Into<String>, span: Span) -> Error {
        Error::syntax(message, span)
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        if self.depth >= MAX_NESTING {
            return Err(self.fail("template is nested too deeply", self.current().span));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// A single identifier that may be assigned to.
    pub fn parse_assign_name(&mut self) -> Result<(String, Span), Error> {
        let token = self.current().clone();
        match token.name() {
            Some(name) if RESERVED_NAMES.contains(&name) => {
                Err(self.fail(format!("can't assign to '{name}'"), token.span))
            }
            Some(name) => {
                let name = name.to_string();
                self.next_token();
                Ok((name, token.span))
            }
            None => Err(self.fail(
                format!("expected token 'name', got {}", token.kind),
                token.span,
            )),
        }
    }

    /// Parse `(a, b=default, ...)`.
    pub fn parse_signature(&mut self) -> Result<Vec<Param>, Error> {
        self.expect(&TokenKind::LParen)?;
        let mut params: Vec<Param> = Vec::new();
        while self.current().kind != TokenKind::RParen {
            if !params.is_empty() {
                self.expect(&TokenKind::Comma)?;
                if self.current().kind == TokenKind::RParen {
                    break;
                }
            }
            let (name, span) = self.parse_assign_name()?;
            if params.iter().any(|param| param.name == name) {
                return Err(self.fail(format!("duplicate argument '{name}'"), span));
            }
            let default = if self.skip_if(&TokenKind::Assign) {
                Some(self.parse_expression()?)
            } else if params.iter().any(|param| param.default.is_some()) {
                return Err(self.fail("non-default argument follows default argument", span));
            } else {
                None
            };
            params.push(Param { name, default });
        }
        self.expect(&TokenKind::RParen)?;
        Ok(params)
    }

    /// Parse the body of a tag up to one of `end_tags`.
    ///
    /// Expects the parser to sit on the `%}` that closes the opening tag. When
    /// `drop_needle` is set the end tag's keyword is consumed too, leaving the
    /// parser on its closing `%}`.
    pub fn parse_statements(&mut self, end_tags: &[&str], drop_needle: bool) -> Result<Vec<Stmt>, Error> {
        self.skip_if(&TokenKind::Colon);
        self.expect(&TokenKind::BlockEnd)?;
        let body = self.subparse(end_tags)?;
        if drop_needle {
            self.next_token();
        }
        Ok(body)
    }

    fn subparse(&mut self, end_tags: &[&str]) -> Result<Vec<Stmt>, Error> {
        if !end_tags.is_empty() {
            self.end_tags
                .push(end_tags.iter().map(ToString::to_string).collect());
        }
        let result = self.nested(|parser| parser.subparse_inner(end_tags));
        if !end_tags.is_empty() {
            self.end_tags.pop();
        }
        result
    }

    fn subparse_inner(&mut self, end_tags: &[&str]) -> Result<Vec<Stmt>, Error> {
        let mut body = Vec::new();
        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::Data(text) => {
                    self.next_token();
                    body.push(Stmt::new(StmtKind::Text(text), token.span));
                }
                TokenKind::VariableStart => {
                    self.next_token();
                    let expr = self.parse_tuple_expr(true, false)?;
                    let end = self.expect(&TokenKind::VariableEnd)?;
                    body.push(Stmt::new(StmtKind::Output(expr), token.span.cover(end.span)));
                }
                TokenKind::BlockStart => {
                    self.next_token();
                    if let Some(name) = self.current().name() {
                        if end_tags.contains(&name) {
                            return Ok(body);
                        }
                    }
                    let stmt = self.parse_statement()?;
                    self.expect(&TokenKind::BlockEnd)?;
                    body.push(stmt);
                }
                TokenKind::Eof => {
                    if end_tags.is_empty() {
                        return Ok(body);
                    }
                    return Err(self.fail(
                        format!(
                            "unexpected end of template, expected {}",
                            describe_tags(end_tags)
                        ),
                        token.span,
                    ));
                }
                other => {
                    return Err(self.fail(format!("unexpected {other}"), token.span));
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, Error> {
        let token = self.current().clone();
        let Some(keyword) = token.name() else {
            return Err(self.fail("tag name expected", token.span));
        };

        if let Some(extension) = self.extensions.get(keyword) {
            let extension = Arc::clone(extension);
            return extension.parse(self);
        }

        match keyword {
            "if" => self.parse_if(),
            "for" => self.parse_for(),
            "set" => self.parse_set(),
            "macro" => self.parse_macro(),
            "call" => self.parse_call_block(),
            _ => {
                let mut message = format!("encountered unknown tag '{keyword}'");
                if let Some(expected) = self.end_tags.last() {
                    let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
                    message.push_str(&format!(", expected {}", describe_tags(&expected)));
                }
                Err(self.fail(message, token.span))
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, Error> {
        let start = self.next_token().span;
        let mut branches = Vec::new();
        let mut otherwise = Vec::new();
        loop {
            let test = self.parse_tuple_expr(false, false)?;
            let body = self.parse_statements(&["elif", "else", "endif"], false)?;
            branches.push((test, body));
            let token = self.next_token();
            match token.name() {
                Some("elif") => {}
                Some("else") => {
                    otherwise = self.parse_statements(&["endif"], true)?;
                    break;
                }
                _ => break,
            }
        }
        Ok(Stmt::new(
            StmtKind::If {
                branches,
                otherwise,
            },
            start.cover(self.previous_span()),
        ))
    }

    fn parse_for(&mut self) -> Result<Stmt, Error> {
        let start = self.next_token().span;
        let target = self.parse_assign_target()?;
        if !self.skip_name("in") {
            let token = self.current();
            return Err(self.fail(
                format!("expected token 'in', got {}", token.kind),
                token.span,
            ));
        }
        let iter = self.parse_tuple_expr(false, false)?;
        let filter = if self.skip_name("if") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        if self.current().is_name("recursive") {
            return Err(self.fail("recursive loops are not supported", self.current().span));
        }
        let body = self.parse_statements(&["endfor", "else"], false)?;
        let otherwise = if self.next_token().is_name("else") {
            self.parse_statements(&["endfor"], true)?
        } else {
            Vec::new()
        };
        Ok(Stmt::new(
            StmtKind::For(Box::new(ForLoop {
                target,
                iter,
                filter,
                body,
                otherwise,
            })),
            start.cover(self.previous_span()),
        ))
    }

    fn parse_set(&mut self) -> Result<Stmt, Error> {
        let start = self.next_token().span;
        let target = self.parse_assign_target()?;
        if self.skip_if(&TokenKind::Assign) {
            let value = self.parse_tuple_expr(true, false)?;
            return Ok(Stmt::new(
                StmtKind::Set { target, value },
                start.cover(self.previous_span()),
            ));
        }
        let body = self.parse_statements(&["endset"], true)?;
        Ok(Stmt::new(
            StmtKind::SetBlock { target, body },
            start.cover(self.previous_span()),
        ))
    }

    fn parse_macro(&mut self) -> Result<Stmt, Error> {
        let start = self.next_token().span;
        let (name, _) = self.parse_assign_name()?;
        let params = self.parse_signature()?;
        let body = self.parse_statements(&["endmacro"], true)?;
        Ok(Stmt::macro_def(name, params, body, start))
    }

    fn parse_call_block(&mut self) -> Result<Stmt, Error> {
        let start = self.next_token().span;
        let params = if self.current().kind == TokenKind::LParen {
            self.parse_signature()?
        } else {
            Vec::new()
        };
        let call = self.parse_expression()?;
        if !matches!(call.kind, ExprKind::Call { .. }) {
            return Err(self.fail("expected call", call.span));
        }
        let body = self.parse_statements(&["endcall"], true)?;
        let caller = Arc::new(MacroDef::new("caller".to_string(), params, body, start));
        Ok(Stmt::new(
            StmtKind::CallBlock { call, caller },
            start.cover(self.previous_span()),
        ))
    }

    fn parse_assign_target(&mut self) -> Result<Target, Error> {
        let parenthesized = self.skip_if(&TokenKind::LParen);
        let (first, _) = self.parse_assign_name()?;
        if !parenthesized && self.current().kind != TokenKind::Comma {
            return Ok(Target::Name(first));
        }

        let mut names = vec![first];
        while self.skip_if(&TokenKind::Comma) {
            let token = self.current();
            if token.is_name("in") || matches!(token.kind, TokenKind::Assign | TokenKind::RParen) {
                break;
            }
            names.push(self.parse_assign_name()?.0);
        }
        if parenthesized {
            self.expect(&TokenKind::RParen)?;
            if names.len() == 1 {
                return Ok(Target::Name(names.remove(0)));
            }
        }
        Ok(Target::Tuple(names))
    }

    /// An expression, or several separated by commas (which build a list).
    pub fn parse_tuple(&mut self) -> Result<Expr, Error> {
        self.parse_tuple_expr(true, false)
    }

    fn parse_tuple_expr(&mut self, with_condexpr: bool, explicit_parens: bool) -> Result<Expr, Error> {
        let start = self.current().span;
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if !items.is_empty() {
                self.expect(&TokenKind::Comma)?;
            }
            if self.is_tuple_end() {
                break;
            }
            let item = if with_condexpr {
                self.parse_expression()?
            } else {
                self.parse_or()?
            };
            items.push(item);
            if self.current().kind == TokenKind::Comma {
                is_tuple = true;
            } else {
                break;
            }
        }

        if !is_tuple {
            if items.len() == 1 {
                return Ok(items.remove(0));
            }
            if !explicit_parens {
                let token = self.current();
                return Err(self.fail(
                    format!("expected an expression, got {}", token.kind),
                    token.span,
                ));
            }
        }
        Ok(Expr::new(ExprKind::List(items), start.cover(self.previous_span())))
    }

    fn is_tuple_end(&self) -> bool {
        matches!(
            self.current().kind,
            TokenKind::VariableEnd | TokenKind::BlockEnd | TokenKind::RParen | TokenKind::Eof
        )
    }

    pub fn parse_expression(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_or()?;
        while self.skip_name("if") {
            let test = self.parse_or()?;
            let otherwise = if self.skip_name("else") {
                Some(Box::new(self.nested(Self::parse_expression)?))
            } else {
                None
            };
            let span = expr.span.cover(self.previous_span());
            expr = Expr::new(
                ExprKind::Cond {
                    test: Box::new(test),
                    then: Box::new(expr),
                    otherwise,
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_and()?;
        while self.skip_name("or") {
            let right = self.parse_and()?;
            left = binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_not()?;
        while self.skip_name("and") {
            let right = self.parse_not()?;
            left = binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, Error> {
        if self.current().is_name("not") {
            let start = self.next_token().span;
            let expr = self.nested(Self::parse_not)?;
            let span = start.cover(expr.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_math1()?;
        loop {
            let (op, width) = match &self.current().kind {
                TokenKind::Eq => (BinOp::Eq, 1),
                TokenKind::Ne => (BinOp::Ne, 1),
                TokenKind::Lt => (BinOp::Lt, 1),
                TokenKind::Le => (BinOp::Le, 1),
                TokenKind::Gt => (BinOp::Gt, 1),
                TokenKind::Ge => (BinOp::Ge, 1),
                TokenKind::Name(name) if name == "in" => (BinOp::In, 1),
                TokenKind::Name(name) if name == "not" && self.peek_kind(1) == &TokenKind::Name("in".to_string()) => {
                    (BinOp::NotIn, 2)
                }
                _ => break,
            };
            for _ in 0..width {
                self.next_token();
            }
            let right = self.parse_math1()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_math1(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Add => BinOp::Add,
                TokenKind::Sub => BinOp::Sub,
                _ => break,
            };
            self.next_token();
            let right = self.parse_concat()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_math2()?;
        while self.skip_if(&TokenKind::Tilde) {
            let right = self.parse_math2()?;
            left = binary(BinOp::Concat, left, right);
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Mul => BinOp::Mul,
                TokenKind::Div => BinOp::Div,
                TokenKind::FloorDiv => BinOp::FloorDiv,
                TokenKind::Mod => BinOp::Mod,
                _ => break,
            };
            self.next_token();
            let right = self.parse_pow()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_unary(true)?;
        while self.skip_if(&TokenKind::Pow) {
            let right = self.parse_unary(true)?;
            left = binary(BinOp::Pow, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self, with_filter: bool) -> Result<Expr, Error> {
        self.nested(|parser| parser.parse_unary_inner(with_filter))
    }

    fn parse_unary_inner(&mut self, with_filter: bool) -> Result<Expr, Error> {
        let op = match self.current().kind {
            TokenKind::Sub => Some(UnaryOp::Neg),
            TokenKind::Add => Some(UnaryOp::Pos),
            _ => None,
        };
        let expr = if let Some(op) = op {
            let start = self.next_token().span;
            let operand = self.parse_unary(false)?;
            let span = start.cover(operand.span);
            Expr::new(
                ExprKind::Unary {
                    op,
                    expr: Box::new(operand),
                },
                span,
            )
        } else {
            let primary = self.parse_primary()?;
            self.parse_postfix(primary)?
        };
        if with_filter {
            self.parse_filter_expr(expr)
        } else {
            Ok(expr)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        let token = self.next_token();
        let kind = match token.kind {
            TokenKind::Name(name) => match name.as_str() {
                "true" | "True" => ExprKind::Const(Value::Bool(true)),
                "false" | "False" => ExprKind::Const(Value::Bool(false)),
                "none" | "None" => ExprKind::Const(Value::None),
                _ => ExprKind::Name(name),
            },
            TokenKind::Str(mut value) => {
                while let TokenKind::Str(next) = &self.current().kind {
                    value.push_str(next);
                    self.next_token();
                }
                ExprKind::Const(Value::from(value))
            }
            TokenKind::Int(value) => ExprKind::Const(Value::Int(value)),
            TokenKind::Float(value) => ExprKind::Const(Value::Float(value)),
            TokenKind::LParen => {
                let expr = self.parse_tuple_expr(true, true)?;
                let end = self.expect(&TokenKind::RParen)?;
                return Ok(Expr::new(expr.kind, token.span.cover(end.span)));
            }
            TokenKind::LBracket => ExprKind::List(self.parse_items(&TokenKind::RBracket)?),
            TokenKind::LBrace => self.parse_dict()?,
            TokenKind::Eof => {
                return Err(self.fail("unexpected end of template, expected an expression", token.span));
            }
            other => {
                return Err(self.fail(format!("unexpected {other}"), token.span));
            }
        };
        Ok(Expr::new(kind, token.span.cover(self.previous_span())))
    }

    fn parse_items(&mut self, close: &TokenKind) -> Result<Vec<Expr>, Error> {
        let mut items = Vec::new();
        while &self.current().kind != close {
            if !items.is_empty() {
                self.expect(&TokenKind::Comma)?;
                if &self.current().kind == close {
                    break;
                }
            }
            items.push(self.parse_expression()?);
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_dict(&mut self) -> Result<ExprKind, Error> {
        let mut pairs = Vec::new();
        while self.current().kind != TokenKind::RBrace {
            if !pairs.is_empty() {
                self.expect(&TokenKind::Comma)?;
                if self.current().kind == TokenKind::RBrace {
                    break;
                }
            }
            let key = self.parse_expression()?;
            self.expect(&TokenKind::Colon)?;
            let value = self.parse_expression()?;
            pairs.push((key, value));
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(ExprKind::Dict(pairs))
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, Error> {
        loop {
            expr = match self.current().kind {
                TokenKind::Dot | TokenKind::LBracket => self.parse_subscript(expr)?,
                TokenKind::LParen => self.parse_call(expr)?,
                _ => return Ok(expr),
            };
        }
    }

    fn parse_filter_expr(&mut self, mut expr: Expr) -> Result<Expr, Error> {
        loop {
            expr = match &self.current().kind {
                TokenKind::Pipe => self.parse_filter(expr)?,
                TokenKind::Name(name) if name == "is" => self.parse_test(expr)?,
                TokenKind::LParen => self.parse_call(expr)?,
                _ => return Ok(expr),
            };
        }
    }

    fn parse_subscript(&mut self, obj: Expr) -> Result<Expr, Error> {
        let token = self.next_token();
        if token.kind == TokenKind::Dot {
            let attr = self.next_token();
            let span = obj.span.cover(attr.span);
            return match attr.kind {
                TokenKind::Name(name) => Ok(Expr::new(
                    ExprKind::GetAttr {
                        obj: Box::new(obj),
                        attr: name,
                    },
                    span,
                )),
                TokenKind::Int(index) => Ok(Expr::new(
                    ExprKind::GetItem {
                        obj: Box::new(obj),
                        key: Box::new(Expr::new(ExprKind::Const(Value::Int(index)), attr.span)),
                    },
                    span,
                )),
                other => Err(self.fail(format!("expected name or number, got {other}"), attr.span)),
            };
        }

        let key = self.parse_expression()?;
        if self.current().kind == TokenKind::Colon {
            return Err(self.fail("slices are not supported", self.current().span));
        }
        let end = self.expect(&TokenKind::RBracket)?;
        let span = obj.span.cover(end.span);
        Ok(Expr::new(
            ExprKind::GetItem {
                obj: Box::new(obj),
                key: Box::new(key),
            },
            span,
        ))
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), Error> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        let mut first = true;
        while self.current().kind != TokenKind::RParen {
            if !first {
                self.expect(&TokenKind::Comma)?;
                if self.current().kind == TokenKind::RParen {
                    break;
                }
            }
            first = false;

            let token = self.current().clone();
            if matches!(token.kind, TokenKind::Mul | TokenKind::Pow) {
                return Err(self.fail("argument unpacking is not supported", token.span));
            }
            let keyword = match token.name() {
                Some(name) if *self.peek_kind(1) == TokenKind::Assign => Some(name.to_string()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.next_token();
                self.next_token();
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.fail(format!("keyword argument '{name}' repeated"), token.span));
                }
                kwargs.push((name, self.parse_expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.fail("positional argument follows keyword argument", token.span));
                }
                args.push(self.parse_expression()?);
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_call(&mut self, func: Expr) -> Result<Expr, Error> {
        let (args, kwargs) = self.parse_call_args()?;
        let span = func.span.cover(self.previous_span());
        Ok(Expr::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                kwargs,
            },
            span,
        ))
    }

    fn parse_dotted_name(&mut self) -> Result<String, Error> {
        let (mut name, _) = self.parse_assign_name()?;
        while self.current().kind == TokenKind::Dot {
            self.next_token();
            name.push('.');
            name.push_str(&self.parse_assign_name()?.0);
        }
        Ok(name)
    }

    fn parse_filter(&mut self, expr: Expr) -> Result<Expr, Error> {
        self.next_token();
        let name = self.parse_dotted_name()?;
        let (args, kwargs) = if self.current().kind == TokenKind::LParen {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        let span = expr.span.cover(self.previous_span());
        Ok(Expr::new(
            ExprKind::Filter {
                expr: Box::new(expr),
                name,
                args,
                kwargs,
            },
            span,
        ))
    }

    fn parse_test(&mut self, expr: Expr) -> Result<Expr, Error> {
        self.next_token();
        let negated = self.skip_name("not");
        let name = self.parse_dotted_name()?;
        let args = match &self.current().kind {
            TokenKind::LParen => {
                let (args, kwargs) = self.parse_call_args()?;
                if let Some((name, _)) = kwargs.first() {
                    return Err(self.fail(
                        format!("tests take no keyword argument '{name}'"),
                        self.previous_span(),
                    ));
                }
                args
            }
            TokenKind::Name(next) if TEST_ARG_STOPWORDS.contains(&next.as_str()) => Vec::new(),
            TokenKind::Name(_)
            | TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::LBracket
            | TokenKind::LBrace => {
                let primary = self.parse_primary()?;
                vec![self.parse_postfix(primary)?]
            }
            _ => Vec::new(),
        };
        let span = expr.span.cover(self.previous_span());
        Ok(Expr::new(
            ExprKind::Test {
                expr: Box::new(expr),
                name,
                args,
                negated,
            },
            span,
        ))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.cover(right.span);
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn describe_tags(tags: &[&str]) -> String {
    tags.iter()
        .map(|tag| format!("'{tag}'"))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Lex and parse a template with the given tag extensions.
pub fn parse(source: &str, extensions: &Extensions) -> Result<Vec<Stmt>, Error> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, extensions).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        parse(source, &Extensions::default()).unwrap()
    }

    fn parse_err(source: &str) -> Error {
        parse(source, &Extensions::default()).unwrap_err()
    }

    fn output_expr(source: &str) -> ExprKind {
        let mut body = parse_ok(source);
        match body.remove(0).kind {
            StmtKind::Output(expr) => expr.kind,
            other => panic!("expected output, got {other:?}"),
        }
    }

    mod expressions {
        use super::*;

        #[test]
        fn test_precedence() {
            let ExprKind::Binary { op, right, .. } = output_expr("{{ 1 + 2 * 3 }}") else {
                panic!("expected binary");
            };
            assert_eq!(op, BinOp::Add);
            assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
        }

        #[test]
        fn test_not_in() {
            let kind = output_expr("{{ a not in b }}");
            assert!(matches!(kind, ExprKind::Binary { op: BinOp::NotIn, .. }));
        }

        #[test]
        fn test_filter_applies_after_negation() {
            let ExprKind::Filter { expr, name, .. } = output_expr("{{ -x|abs }}") else {
                panic!("expected filter");
            };
            assert_eq!(name, "abs");
            assert!(matches!(expr.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
        }

        #[test]
        fn test_is_not_with_bare_argument() {
            let ExprKind::Test {
                name,
                args,
                negated,
                ..
            } = output_expr("{{ x is not sameas none }}")
            else {
                panic!("expected test");
            };
            assert_eq!(name, "sameas");
            assert!(negated);
            assert_eq!(args.len(), 1);
        }

        #[test]
        fn test_test_stops_at_boolean_operator() {
            let kind = output_expr("{{ x is defined and y }}");
            assert!(matches!(kind, ExprKind::Binary { op: BinOp::And, .. }));
        }

        #[test]
        fn test_conditional_expression() {
            let kind = output_expr("{{ 'a' if x else 'b' }}");
            assert!(matches!(kind, ExprKind::Cond { otherwise: Some(_), .. }));
        }

        #[test]
        fn test_tuple_becomes_list() {
            let ExprKind::List(items) = output_expr("{{ (1, 2) }}") else {
                panic!("expected list");
            };
            assert_eq!(items.len(), 2);
        }

        #[test]
        fn test_call_with_keywords() {
            let ExprKind::Call { args, kwargs, .. } = output_expr("{{ f(1, b=2,) }}") else {
                panic!("expected call");
            };
            assert_eq!(args.len(), 1);
            assert_eq!(kwargs[0].0, "b");
        }

        #[test]
        fn test_adjacent_strings_concatenate() {
            let kind = output_expr("{{ 'a' \"b\" }}");
            assert!(matches!(kind, ExprKind::Const(Value::Str(s)) if &*s == "ab"));
        }

        #[test]
        fn test_positional_after_keyword_rejected() {
            let err = parse_err("{{ f(a=1, 2) }}");
            assert_eq!(err.detail(), "positional argument follows keyword argument");
        }
    }

    mod statements {
        use super::*;

        #[test]
        fn test_if_elif_else() {
            let body = parse_ok("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
            let StmtKind::If {
                branches,
                otherwise,
            } = &body[0].kind
            else {
                panic!("expected if");
            };
            assert_eq!(branches.len(), 2);
            assert_eq!(otherwise.len(), 1);
        }

        #[test]
        fn test_for_with_tuple_target_filter_and_else() {
            let body = parse_ok("{% for k, v in items if v %}{{ k }}{% else %}none{% endfor %}");
            let StmtKind::For(for_loop) = &body[0].kind else {
                panic!("expected for");
            };
            assert_eq!(
                for_loop.target,
                Target::Tuple(vec!["k".to_string(), "v".to_string()])
            );
            assert!(for_loop.filter.is_some());
            assert_eq!(for_loop.otherwise.len(), 1);
        }

        #[test]
        fn test_set_forms() {
            let body = parse_ok("{% set a = 1 %}{% set b %}x{% endset %}");
            assert!(matches!(body[0].kind, StmtKind::Set { .. }));
            assert!(matches!(body[1].kind, StmtKind::SetBlock { .. }));
        }

        #[test]
        fn test_macro_signature() {
            let body = parse_ok("{% macro m(a, b=2) %}{{ varargs }}{% endmacro %}");
            let StmtKind::Macro(def) = &body[0].kind else {
                panic!("expected macro");
            };
            assert_eq!(def.name, "m");
            assert_eq!(def.params.len(), 2);
            assert!(def.params[1].default.is_some());
            assert!(def.catch_varargs);
            assert!(!def.catch_kwargs);
        }

        #[test]
        fn test_call_block() {
            let body = parse_ok("{% call(x) m() %}{{ x }}{% endcall %}");
            let StmtKind::CallBlock { caller, .. } = &body[0].kind else {
                panic!("expected call block");
            };
            assert_eq!(caller.name, "caller");
            assert_eq!(caller.params.len(), 1);
        }

        #[test]
        fn test_non_default_after_default() {
            let err = parse_err("{% macro m(a=1, b) %}{% endmacro %}");
            assert_eq!(err.detail(), "non-default argument follows default argument");
        }

        #[test]
        fn test_unknown_tag_names_expected_end() {
            let err = parse_err("{% if a %}{% endfor %}");
            assert_eq!(err.kind(), ErrorKind::SyntaxError);
            assert_eq!(
                err.detail(),
                "encountered unknown tag 'endfor', expected 'elif' or 'else' or 'endif'"
            );
        }

        #[test]
        fn test_deep_nesting_is_a_syntax_error() {
            let source = format!("{{{{ {}1{} }}}}", "(".repeat(20_000), ")".repeat(20_000));
            let err = parse_err(&source);
            assert_eq!(err.kind(), ErrorKind::SyntaxError);
            assert_eq!(err.detail(), "template is nested too deeply");
            assert!(err.span().is_some());

            for source in [
                format!("{{{{ {}1 }}}}", "-".repeat(20_000)),
                format!("{{{{ {}x }}}}", "not ".repeat(20_000)),
                format!("{{{{ {}1 }}}}", "x if y else ".repeat(20_000)),
                format!("{{{{ {}1{} }}}}", "[".repeat(20_000), "]".repeat(20_000)),
                "{% if x %}".repeat(20_000),
            ] {
                assert_eq!(parse_err(&source).kind(), ErrorKind::SyntaxError);
            }
        }

        #[test]
        fn test_moderate_nesting_parses() {
            let source = format!("{{{{ {}1{} }}}}", "(".repeat(40), ")".repeat(40));
            assert!(matches!(output_expr(&source), ExprKind::Const(Value::Int(1))));
        }

        #[test]
        fn test_unclosed_block() {
            let err = parse_err("{% macro m() %}body");
            assert_eq!(err.detail(), "unexpected end of template, expected 'endmacro'");
        }

        #[test]
        fn test_do_is_not_builtin() {
            let err = parse_err("{% do x %}");
            assert_eq!(err.detail(), "encountered unknown tag 'do'");
        }
    }

    mod extensions {
        use super::*;
        use crate::ext::Extension;

        struct Shout;

        impl Extension for Shout {
            fn tags(&self) -> &[&'static str] {
                &["macro"]
            }

            fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error> {
                let start = parser.next_token().span;
                let (name, _) = parser.parse_assign_name()?;
                let params = parser.parse_signature()?;
                let body = parser.parse_statements(&["endmacro"], true)?;
                Ok(Stmt::macro_def(name.to_uppercase(), params, body, start))
            }
        }

        #[test]
        fn test_extension_overrides_builtin_keyword() {
            let mut extensions = Extensions::default();
            extensions.register(Arc::new(Shout));
            let body = parse("{% macro quiet() %}{% endmacro %}", &extensions).unwrap();
            let StmtKind::Macro(def) = &body[0].kind else {
                panic!("expected macro");
            };
            assert_eq!(def.name, "QUIET");
        }
    }
}
