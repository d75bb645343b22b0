use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ast::Stmt;
use crate::error::Error;
use crate::parser::Parser;

/// A tag handler plugged into the parser.
///
/// Handlers are looked up by tag keyword before the built-in statements, so an
/// extension may take over a built-in keyword such as `macro`.
pub trait Extension: Send + Sync {
    /// Keywords this extension parses.
    fn tags(&self) -> &[&'static str];

    /// Parse one tag. The parser is positioned on the keyword token and the
    /// handler must stop before the closing `%}`.
    fn parse(&self, parser: &mut Parser<'_>) -> Result<Stmt, Error>;
}

#[derive(Clone, Default)]
pub struct Extensions {
    by_tag: FxHashMap<String, Arc<dyn Extension>>,
}

impl Extensions {
    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        for tag in extension.tags() {
            self.by_tag.insert((*tag).to_string(), Arc::clone(&extension));
        }
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn Extension>> {
        self.by_tag.get(tag)
    }

    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.by_tag.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
