//! Tag handlers installed into every compiler environment.

use jinx_templates::Error;
use jinx_templates::Extension;
use jinx_templates::Parser;
use jinx_templates::Stmt;
use jinx_templates::StmtKind;
use jinx_templates::TokenKind;

use crate::mangle::mangle_docs;
use crate::mangle::mangle_macro;
use crate::mangle::mangle_materialization;

/// `{% macro name(args) %}`, bound under its mangled name.
#[derive(Debug, Default)]
pub struct MacroFuzzExtension;

impl Extension for MacroFuzzExtension {
    fn tags(&self) -> &[&'static str] {
        &["macro"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error> {
        let start = parser.next_token().span;
        let (name, _) = parser.parse_assign_name()?;
        let params = parser.parse_signature()?;
        let body = parser.parse_statements(&["endmacro"], true)?;
        Ok(Stmt::macro_def(mangle_macro(&name), params, body, start))
    }
}

/// `{% materialization name[, default][, adapter='x'] %}`.
#[derive(Debug, Default)]
pub struct MaterializationExtension;

impl Extension for MaterializationExtension {
    fn tags(&self) -> &[&'static str] {
        &["materialization"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error> {
        let start = parser.next_token().span;
        let (materialization, _) = parser.parse_assign_name()?;

        let mut adapter = None;
        while parser.skip_if(&TokenKind::Comma) {
            let (argument, span) = parser.parse_assign_name()?;
            match argument.as_str() {
                "default" => {}
                "adapter" => {
                    parser.expect(&TokenKind::Assign)?;
                    let value = parser.parse_expression()?;
                    let Some(name) = value.as_const_str() else {
                        return Err(parser.fail(
                            format!(
                                "materialization '{materialization}' adapter must be a string literal"
                            ),
                            value.span,
                        ));
                    };
                    adapter = Some(name.to_string());
                }
                _ => {
                    return Err(parser.fail(
                        format!(
                            "materialization '{materialization}' received unknown argument '{argument}'"
                        ),
                        span,
                    ));
                }
            }
        }

        let body = parser.parse_statements(&["endmaterialization"], true)?;
        let name = mangle_materialization(&materialization, adapter.as_deref());
        Ok(Stmt::macro_def(name, Vec::new(), body, start))
    }
}

/// `{% docs name %}`.
#[derive(Debug, Default)]
pub struct DocumentationExtension;

impl Extension for DocumentationExtension {
    fn tags(&self) -> &[&'static str] {
        &["docs"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error> {
        let start = parser.next_token().span;
        let (name, _) = parser.parse_assign_name()?;
        let body = parser.parse_statements(&["enddocs"], true)?;
        Ok(Stmt::macro_def(mangle_docs(&name), Vec::new(), body, start))
    }
}

/// `{% do expr %}`: evaluate for side effects only.
#[derive(Debug, Default)]
pub struct DoExtension;

impl Extension for DoExtension {
    fn tags(&self) -> &[&'static str] {
        &["do"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error> {
        let start = parser.next_token().span;
        let expr = parser.parse_tuple()?;
        let span = start.cover(expr.span);
        Ok(Stmt::new(StmtKind::Do(expr), span))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jinx_templates::parse;
    use jinx_templates::ErrorKind;
    use jinx_templates::Extensions;

    use super::*;

    fn extensions() -> Extensions {
        let mut extensions = Extensions::default();
        extensions.register(Arc::new(MacroFuzzExtension));
        extensions.register(Arc::new(MaterializationExtension));
        extensions.register(Arc::new(DocumentationExtension));
        extensions.register(Arc::new(DoExtension));
        extensions
    }

    fn macro_names(source: &str) -> Vec<String> {
        parse(source, &extensions())
            .unwrap()
            .into_iter()
            .filter_map(|stmt| match stmt.kind {
                StmtKind::Macro(def) => Some(def.name.clone()),
                _ => None,
            })
            .collect()
    }

    mod macros {
        use super::*;

        #[test]
        fn test_macro_is_mangled() {
            let source = "{% macro my_macro(a, b=1) %}{{ a }}{% endmacro %}";
            assert_eq!(macro_names(source), vec!["macro__my_macro"]);
        }
    }

    mod materializations {
        use super::*;

        #[test]
        fn test_default_adapter() {
            let source = "{% materialization table %}x{% endmaterialization %}";
            assert_eq!(
                macro_names(source),
                vec!["macro__materialization:table:default"]
            );
        }

        #[test]
        fn test_default_marker_and_adapter() {
            let source = "{% materialization table, default %}x{% endmaterialization %}\
                          {% materialization table, adapter='postgres' %}y{% endmaterialization %}";
            assert_eq!(
                macro_names(source),
                vec![
                    "macro__materialization:table:default",
                    "macro__materialization:table:postgres",
                ]
            );
        }

        #[test]
        fn test_unknown_argument_is_named() {
            let source = "{% materialization foo, bogus=1 %}{% endmaterialization %}";
            let err = parse(source, &extensions()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SyntaxError);
            assert_eq!(
                err.detail(),
                "materialization 'foo' received unknown argument 'bogus'"
            );
        }

        #[test]
        fn test_adapter_must_be_literal() {
            let source = "{% materialization foo, adapter=name %}{% endmaterialization %}";
            let err = parse(source, &extensions()).unwrap_err();
            assert!(err.detail().contains("must be a string literal"));
        }

        #[test]
        fn test_missing_end_tag() {
            let err = parse("{% materialization foo %}body", &extensions()).unwrap_err();
            assert!(err.detail().contains("endmaterialization"));
        }
    }

    mod docs {
        use super::*;

        #[test]
        fn test_docs_block() {
            let source = "{% docs orders %}The orders table.{% enddocs %}";
            assert_eq!(macro_names(source), vec!["docs__orders"]);
        }

        #[test]
        fn test_docs_takes_no_arguments() {
            assert!(parse("{% docs orders(a) %}{% enddocs %}", &extensions()).is_err());
        }
    }

    mod do_statement {
        use super::*;

        #[test]
        fn test_do_parses_expression() {
            let body = parse("{% do items.append(1) %}", &extensions()).unwrap();
            assert!(matches!(body[0].kind, StmtKind::Do(_)));
        }
    }
}
