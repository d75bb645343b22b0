//! Splitting raw template text into top-level blocks without a full parse.
//!
//! The scanner only understands enough of the template syntax to stay out of
//! trouble: comments, expressions, quoted strings and `{% raw %}` regions are
//! skipped as opaque spans, `if`/`for` nesting is tracked, and every other tag
//! is reported with its keyword and optional name.

use jinx_source::ByteOffset;
use jinx_source::LineCol;
use jinx_source::LineIndex;
use jinx_source::Span;
use memchr::memchr;
use memchr::memchr2;
use memchr::memmem;
use serde::Serialize;
use thiserror::Error;

use crate::error::CompilationError;
use crate::error::ErrorKind;

/// Kind reported for the text between blocks.
pub const RAW_DATA_KIND: &str = "__data";

/// Block kinds extracted when the caller does not name any.
pub const DEFAULT_BLOCK_KINDS: &[&str] = &["snapshot", "macro", "test", "materialization", "docs"];

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum ParseError {
    #[error("unexpected EOF, expected {expected} (searched from {position})")]
    UnexpectedEof {
        expected: &'static str,
        position: LineCol,
    },

    #[error(
        "got an unexpected control flow end tag, got {got} but never saw a preceding {expected} ({position})"
    )]
    UnmatchedEndTag {
        got: String,
        expected: String,
        position: LineCol,
    },

    #[error("got an unexpected control flow end tag, got {got} but expected {expected} next ({position})")]
    MismatchedEndTag {
        got: String,
        expected: String,
        position: LineCol,
    },

    #[error(
        "got nested tags: {outer} (started at {outer_position}) did not have a matching \
         {{% end{outer} %}} before a subsequent {inner} was found (started at {inner_position})"
    )]
    NestedBlock {
        outer: String,
        outer_position: LineCol,
        inner: String,
        inner_position: LineCol,
    },

    #[error("reached EOF without finding a close tag for {kind} (opened at {position})")]
    UnclosedBlock { kind: String, position: LineCol },
}

impl ParseError {
    #[must_use]
    pub fn position(&self) -> Option<LineCol> {
        match self {
            ParseError::UnexpectedEof { position, .. }
            | ParseError::UnmatchedEndTag { position, .. }
            | ParseError::MismatchedEndTag { position, .. }
            | ParseError::UnclosedBlock { position, .. } => Some(*position),
            ParseError::NestedBlock { inner_position, .. } => Some(*inner_position),
        }
    }
}

impl From<ParseError> for CompilationError {
    fn from(err: ParseError) -> Self {
        CompilationError::new(ErrorKind::Syntax, err.to_string()).at(err.position(), None)
    }
}

impl From<ParseError> for crate::error::Error {
    fn from(err: ParseError) -> Self {
        crate::error::Error::Compilation(err.into())
    }
}

/// A complete top-level block, from its opening tag to its end tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockTag<'a> {
    pub kind: &'a str,
    pub name: Option<&'a str>,
    /// Text between the opening and closing tags.
    pub contents: &'a str,
    /// The whole block including both tags.
    pub full_block: &'a str,
    pub span: Span,
}

/// Text between blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockData<'a> {
    pub contents: &'a str,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum BlockItem<'a> {
    Tag(BlockTag<'a>),
    Data(BlockData<'a>),
}

impl<'a> BlockItem<'a> {
    #[must_use]
    pub fn kind(&self) -> &'a str {
        match self {
            BlockItem::Tag(tag) => tag.kind,
            BlockItem::Data(_) => RAW_DATA_KIND,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&'a str> {
        match self {
            BlockItem::Tag(tag) => tag.name,
            BlockItem::Data(_) => None,
        }
    }

    #[must_use]
    pub fn full_block(&self) -> &'a str {
        match self {
            BlockItem::Tag(tag) => tag.full_block,
            BlockItem::Data(data) => data.contents,
        }
    }

    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            BlockItem::Tag(tag) => tag.span,
            BlockItem::Data(data) => data.span,
        }
    }
}

/// Extract the top-level blocks of `data` whose kind is in `allowed_blocks`
/// (or [`DEFAULT_BLOCK_KINDS`]).
///
/// With `collect_raw_data`, the text between blocks is returned as
/// [`BlockItem::Data`] and the items cover the input exactly. Blocks opened
/// inside `if`/`for` are not top-level and stay part of the surrounding text.
pub fn extract_toplevel_blocks<'a>(
    data: &'a str,
    allowed_blocks: Option<&[&str]>,
    collect_raw_data: bool,
) -> Result<Vec<BlockItem<'a>>, ParseError> {
    let allowed = allowed_blocks.unwrap_or(DEFAULT_BLOCK_KINDS);
    let mut scanner = TagScanner::new(data);
    let mut items = Vec::new();
    let mut control: Vec<Tag<'a>> = Vec::new();
    let mut skipped: Vec<&'a str> = Vec::new();
    let mut current: Option<Tag<'a>> = None;
    let mut last_position = 0;

    while let Some(tag) = scanner.next_tag()? {
        if matches!(tag.kind, "if" | "for") {
            control.push(tag.clone());
        } else if let Some(opener) = control_opener(tag.kind) {
            let Some(open) = control.pop() else {
                return Err(ParseError::UnmatchedEndTag {
                    got: tag.kind.to_string(),
                    expected: opener.to_string(),
                    position: scanner.position(tag.start),
                });
            };
            if open.kind != opener {
                return Err(ParseError::MismatchedEndTag {
                    got: tag.kind.to_string(),
                    expected: format!("end{}", open.kind),
                    position: scanner.position(tag.start),
                });
            }
        }

        if allowed.contains(&tag.kind) {
            if !control.is_empty() {
                tracing::trace!("skipping {} block nested in control flow at {}", tag.kind, tag.start);
                skipped.push(tag.kind);
                continue;
            }
            if let Some(outer) = &current {
                return Err(ParseError::NestedBlock {
                    outer: outer.kind.to_string(),
                    outer_position: scanner.position(outer.start),
                    inner: tag.kind.to_string(),
                    inner_position: scanner.position(tag.start),
                });
            }
            if collect_raw_data && tag.start > last_position {
                items.push(BlockItem::Data(BlockData {
                    contents: &data[last_position..tag.start],
                    span: Span::from_bounds(last_position, tag.start),
                }));
            }
            last_position = tag.start;
            tracing::trace!("block {} opened at {}", tag.kind, tag.start);
            current = Some(tag);
        } else if let Some(kind) = tag.kind.strip_prefix("end") {
            if skipped.last() == Some(&kind) {
                skipped.pop();
                continue;
            }
            if let Some(open) = current.take_if(|open| open.kind == kind) {
                tracing::trace!("block {} closed at {}", open.kind, tag.end);
                items.push(BlockItem::Tag(BlockTag {
                    kind: open.kind,
                    name: open.name,
                    contents: &data[open.end..tag.start],
                    full_block: &data[open.start..tag.end],
                    span: Span::from_bounds(open.start, tag.end),
                }));
                last_position = tag.end;
            }
        }
    }

    if let Some(open) = current {
        return Err(ParseError::UnclosedBlock {
            kind: open.kind.to_string(),
            position: scanner.position(open.start),
        });
    }

    if collect_raw_data && last_position < data.len() {
        items.push(BlockItem::Data(BlockData {
            contents: &data[last_position..],
            span: Span::from_bounds(last_position, data.len()),
        }));
    }
    Ok(items)
}

fn control_opener(kind: &str) -> Option<&'static str> {
    match kind {
        "endif" => Some("if"),
        "endfor" => Some("for"),
        _ => None,
    }
}

#[derive(Clone, Debug)]
struct Tag<'a> {
    kind: &'a str,
    name: Option<&'a str>,
    start: usize,
    end: usize,
}

struct TagScanner<'a> {
    data: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line_index: Option<LineIndex>,
}

impl<'a> TagScanner<'a> {
    fn new(data: &'a str) -> Self {
        Self {
            data,
            bytes: data.as_bytes(),
            pos: 0,
            line_index: None,
        }
    }

    fn position(&mut self, offset: usize) -> LineCol {
        self.line_index
            .get_or_insert_with(|| LineIndex::from_text(self.data))
            .to_line_col(ByteOffset::from_usize(offset))
    }

    fn eof(&mut self, expected: &'static str, from: usize) -> ParseError {
        ParseError::UnexpectedEof {
            expected,
            position: self.position(from),
        }
    }

    /// The next `{% ... %}` tag, skipping comments and expressions.
    fn next_tag(&mut self) -> Result<Option<Tag<'a>>, ParseError> {
        while let Some(found) = memchr(b'{', &self.bytes[self.pos..]) {
            let at = self.pos + found;
            match self.bytes.get(at + 1) {
                Some(b'#') => self.skip_comment(at)?,
                Some(b'{') => self.skip_expression(at)?,
                Some(b'%') => {
                    if let Some(tag) = self.read_tag(at)? {
                        return Ok(Some(tag));
                    }
                }
                _ => self.pos = at + 1,
            }
        }
        self.pos = self.bytes.len();
        Ok(None)
    }

    fn skip_comment(&mut self, at: usize) -> Result<(), ParseError> {
        match memmem::find(&self.bytes[at + 2..], b"#}") {
            Some(end) => {
                self.pos = at + 2 + end + 2;
                Ok(())
            }
            None => Err(self.eof("#}", at)),
        }
    }

    // Only strings can hide the closing `}}` of an expression.
    fn skip_expression(&mut self, at: usize) -> Result<(), ParseError> {
        let mut cursor = at + 2;
        loop {
            let Some(found) = memchr::memchr3(b'}', b'\'', b'"', &self.bytes[cursor..]) else {
                return Err(self.eof("}}", at));
            };
            let i = cursor + found;
            match self.bytes[i] {
                b'}' if self.bytes.get(i + 1) == Some(&b'}') => {
                    self.pos = i + 2;
                    return Ok(());
                }
                b'}' => cursor = i + 1,
                _ => cursor = self.skip_string(i)?,
            }
        }
    }

    /// Offset just past the string literal opening at `at`.
    fn skip_string(&mut self, at: usize) -> Result<usize, ParseError> {
        let quote = self.bytes[at];
        let mut cursor = at + 1;
        loop {
            let Some(found) = memchr2(quote, b'\\', &self.bytes[cursor..]) else {
                return Err(self.eof("string", at));
            };
            let i = cursor + found;
            if self.bytes[i] == quote {
                return Ok(i + 1);
            }
            cursor = i + 2;
            if cursor > self.bytes.len() {
                return Err(self.eof("string", at));
            }
        }
    }

    fn skip_whitespace(&self, mut cursor: usize) -> usize {
        while self.bytes.get(cursor).is_some_and(u8::is_ascii_whitespace) {
            cursor += 1;
        }
        cursor
    }

    fn identifier(&self, cursor: usize) -> Option<&'a str> {
        let rest = &self.bytes[cursor.min(self.bytes.len())..];
        let first = rest.first()?;
        if !(first.is_ascii_alphabetic() || *first == b'_') {
            return None;
        }
        let len = rest
            .iter()
            .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
            .unwrap_or(rest.len());
        Some(&self.data[cursor..cursor + len])
    }

    /// Read the tag whose `{%` sits at `at`. Returns `None` (and moves past the
    /// brace) when no keyword follows.
    fn read_tag(&mut self, at: usize) -> Result<Option<Tag<'a>>, ParseError> {
        let trims = self.bytes.get(at + 2) == Some(&b'-');
        let mut cursor = self.skip_whitespace(at + if trims { 3 } else { 2 });
        let Some(kind) = self.identifier(cursor) else {
            self.pos = at + 1;
            return Ok(None);
        };
        cursor += kind.len();

        let after_space = self.skip_whitespace(cursor);
        let name = if after_space > cursor {
            self.identifier(after_space)
        } else {
            None
        };
        if let Some(name) = name {
            cursor = after_space + name.len();
        }

        // `{%-` also claims the whitespace it trims
        let start = if trims {
            let mut start = at;
            while start > self.pos && self.bytes[start - 1].is_ascii_whitespace() {
                start -= 1;
            }
            start
        } else {
            at
        };

        let end = if kind == "raw" {
            self.skip_raw(start, cursor)?
        } else {
            self.find_tag_close(start, cursor)?
        };
        self.pos = end;
        Ok(Some(Tag {
            kind,
            name,
            start,
            end,
        }))
    }

    /// Offset past the `%}` (or `-%}` and the whitespace after it) closing a tag.
    fn find_tag_close(&mut self, start: usize, mut cursor: usize) -> Result<usize, ParseError> {
        loop {
            let Some(found) = memchr::memchr3(b'%', b'\'', b'"', &self.bytes[cursor..]) else {
                return Err(self.eof("tag close (\"%}\")", start));
            };
            let i = cursor + found;
            match self.bytes[i] {
                b'%' if self.bytes.get(i + 1) == Some(&b'}') => {
                    if i > cursor && self.bytes[i - 1] == b'-' {
                        return Ok(self.skip_whitespace(i + 2));
                    }
                    return Ok(i + 2);
                }
                b'%' => cursor = i + 1,
                _ => cursor = self.skip_string(i)?,
            }
        }
    }

    fn tag_close_at(&self, cursor: usize) -> Option<usize> {
        let cursor = self.skip_whitespace(cursor);
        if self.bytes[cursor..].starts_with(b"-%}") {
            Some(self.skip_whitespace(cursor + 3))
        } else if self.bytes[cursor..].starts_with(b"%}") {
            Some(cursor + 2)
        } else {
            None
        }
    }

    /// Offset past the `{% endraw %}` matching a `{% raw %}` whose keyword ends at `cursor`.
    fn skip_raw(&mut self, start: usize, cursor: usize) -> Result<usize, ParseError> {
        const EXPECTED: &str = "{% raw %}...{% endraw %}";
        let Some(mut cursor) = self.tag_close_at(cursor) else {
            return Err(self.eof(EXPECTED, start));
        };
        while let Some(found) = memmem::find(&self.bytes[cursor..], b"{%") {
            let at = cursor + found;
            let mut inner = at + 2;
            if self.bytes.get(inner) == Some(&b'-') {
                inner += 1;
            }
            let inner = self.skip_whitespace(inner);
            if self.identifier(inner) == Some("endraw") {
                if let Some(end) = self.tag_close_at(inner + "endraw".len()) {
                    return Ok(end);
                }
            }
            cursor = at + 2;
        }
        Err(self.eof(EXPECTED, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(data: &str) -> Vec<BlockItem<'_>> {
        extract_toplevel_blocks(data, None, true).unwrap()
    }

    fn summary(items: &[BlockItem<'_>]) -> Vec<String> {
        items
            .iter()
            .map(|item| match item.name() {
                Some(name) => format!("{} {name}: {}", item.kind(), item.full_block()),
                None => format!("{}: {}", item.kind(), item.full_block()),
            })
            .collect()
    }

    fn reassemble(items: &[BlockItem<'_>]) -> String {
        items.iter().map(BlockItem::full_block).collect()
    }

    mod extraction {
        use super::*;

        #[test]
        fn test_blocks_and_data() {
            let data = "{% macro a() %}A{% endmacro %}\n{% docs d %}D{% enddocs %}\ntext";
            let items = extract(data);
            insta::assert_debug_snapshot!(summary(&items), @r#"
            [
                "macro a: {% macro a() %}A{% endmacro %}",
                "__data: \n",
                "docs d: {% docs d %}D{% enddocs %}",
                "__data: \ntext",
            ]
            "#);
            assert_eq!(reassemble(&items), data);
        }

        #[test]
        fn test_contents_and_spans() {
            let data = "x{% materialization table, adapter='pg' %}body{% endmaterialization %}";
            let items = extract(data);
            let BlockItem::Tag(tag) = &items[1] else {
                panic!("expected a block");
            };
            assert_eq!(tag.kind, "materialization");
            assert_eq!(tag.name, Some("table"));
            assert_eq!(tag.contents, "body");
            assert_eq!(tag.span, Span::from_bounds(1, data.len()));
        }

        #[test]
        fn test_without_raw_data() {
            let data = "a{% macro m() %}{% endmacro %}b{% macro n() %}{% endmacro %}c";
            let items = extract_toplevel_blocks(data, None, false).unwrap();
            assert_eq!(items.len(), 2);
            assert!(items.iter().all(|item| matches!(item, BlockItem::Tag(_))));
        }

        #[test]
        fn test_allowed_kinds() {
            let data = "{% macro m() %}{% endmacro %}{% docs d %}{% enddocs %}";
            let items = extract_toplevel_blocks(data, Some(&["docs"]), true).unwrap();
            assert_eq!(
                summary(&items),
                vec![
                    "__data: {% macro m() %}{% endmacro %}",
                    "docs d: {% docs d %}{% enddocs %}",
                ]
            );
        }

        #[test]
        fn test_other_tags_inside_block_are_ignored() {
            let data = "{% macro m(x) %}{% set y = x %}{% if y %}{{ y }}{% endif %}{% endmacro %}";
            let items = extract(data);
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].full_block(), data);
        }

        #[test]
        fn test_whitespace_control_extends_block() {
            let data = "a  {%- macro m() -%}  x  {%- endmacro -%}  \nb";
            let items = extract(data);
            assert_eq!(
                summary(&items),
                vec![
                    "__data: a",
                    "macro m:   {%- macro m() -%}  x  {%- endmacro -%}  \n",
                    "__data: b",
                ]
            );
            let BlockItem::Tag(tag) = &items[1] else {
                panic!("expected a block");
            };
            assert_eq!(tag.contents, "x");
        }
    }

    mod opaque_spans {
        use super::*;

        #[test]
        fn test_tags_in_comments_and_strings() {
            let data = "{# {% macro hidden() %} #}{{ '{% macro also_hidden() %}' }}\
                        {% macro m(a='{% endmacro %}') %}{% endmacro %}";
            let items = extract(data);
            let names: Vec<_> = items.iter().filter_map(BlockItem::name).collect();
            assert_eq!(names, vec!["m"]);
            assert_eq!(reassemble(&items), data);
        }

        #[test]
        fn test_raw_regions() {
            let data = "{% raw %}{% macro nope() %}{% endraw %}{% macro yes() %}{% endmacro %}";
            let items = extract(data);
            assert_eq!(
                summary(&items),
                vec![
                    "__data: {% raw %}{% macro nope() %}{% endraw %}",
                    "macro yes: {% macro yes() %}{% endmacro %}",
                ]
            );
        }

        #[test]
        fn test_expression_with_braces_in_string() {
            let data = "{{ '}}' }}{% docs d %}{% enddocs %}";
            let items = extract(data);
            assert_eq!(items[1].kind(), "docs");
        }
    }

    mod control_flow {
        use super::*;

        #[test]
        fn test_block_inside_if_is_not_top_level() {
            let data = "{% if x %}{% macro m() %}{% endmacro %}{% endif %}";
            let items = extract(data);
            assert_eq!(summary(&items), vec![format!("__data: {data}")]);
        }

        #[test]
        fn test_nested_skip_does_not_close_outer_block() {
            let data = "{% macro outer() %}{% for i in x %}{% macro inner() %}{% endmacro %}\
                        {% endfor %}{% endmacro %}";
            let items = extract(data);
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].name(), Some("outer"));
            assert_eq!(items[0].full_block(), data);
        }

        #[test]
        fn test_unmatched_end_tag() {
            let err = extract_toplevel_blocks("x\n{% endif %}", None, true).unwrap_err();
            assert_eq!(
                err,
                ParseError::UnmatchedEndTag {
                    got: "endif".to_string(),
                    expected: "if".to_string(),
                    position: LineCol::new(2, 1),
                }
            );
        }

        #[test]
        fn test_mismatched_end_tag() {
            let err = extract_toplevel_blocks("{% for x in y %}{% endif %}", None, true).unwrap_err();
            assert!(matches!(
                err,
                ParseError::MismatchedEndTag { ref expected, .. } if expected == "endfor"
            ));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn test_unclosed_block() {
            let err = extract_toplevel_blocks("\n\n  {% macro m() %}\nbody", None, true).unwrap_err();
            assert_eq!(
                err,
                ParseError::UnclosedBlock {
                    kind: "macro".to_string(),
                    position: LineCol::new(3, 3),
                }
            );
            assert_eq!(err.position(), Some(LineCol::new(3, 3)));
            assert_eq!(
                err.to_string(),
                "reached EOF without finding a close tag for macro (opened at line 3, column 3)"
            );
        }

        #[test]
        fn test_nested_blocks() {
            let err = extract_toplevel_blocks("{% macro a() %}{% docs b %}", None, true).unwrap_err();
            assert!(matches!(err, ParseError::NestedBlock { ref outer, ref inner, .. }
                if outer == "macro" && inner == "docs"));
        }

        #[test]
        fn test_unterminated_constructs() {
            assert!(matches!(
                extract_toplevel_blocks("{{ x ", None, true),
                Err(ParseError::UnexpectedEof { expected: "}}", .. })
            ));
            assert!(matches!(
                extract_toplevel_blocks("{# x ", None, true),
                Err(ParseError::UnexpectedEof { expected: "#}", .. })
            ));
            assert!(matches!(
                extract_toplevel_blocks("{% macro m(a='x) %}", None, true),
                Err(ParseError::UnexpectedEof { expected: "string", .. })
            ));
            assert!(matches!(
                extract_toplevel_blocks("{% raw %}never closed", None, true),
                Err(ParseError::UnexpectedEof { .. })
            ));
        }

        #[test]
        fn test_converts_to_syntax_error() {
            let err = extract_toplevel_blocks("{% docs d %}", None, true).unwrap_err();
            let compilation = CompilationError::from(err);
            assert_eq!(compilation.kind(), ErrorKind::Syntax);
            assert_eq!(compilation.position(), Some(LineCol::new(1, 1)));
        }
    }
}
