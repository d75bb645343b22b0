use std::sync::Arc;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use dashmap::DashMap;
use jinx_templates::Context;
use jinx_templates::Template;

use crate::error::Error;
use crate::node::Node;
use crate::render::get_template;

type CacheKey = (String, Utf8PathBuf);

/// Compiled templates of macro files, keyed by package and file path.
///
/// There is no eviction. Call [`TemplateCache::clear`] between compilation runs.
#[derive(Debug, Default)]
pub struct TemplateCache {
    file_cache: DashMap<CacheKey, Arc<Template>>,
}

impl TemplateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The compiled template for `node`'s source, compiling it on first use.
    ///
    /// Two threads missing the same key both compile; the last insert wins.
    pub fn get_node_template(&self, node: &Arc<dyn Node>) -> Result<Arc<Template>, Error> {
        let key = (
            node.package_name().to_string(),
            node.original_file_path().to_owned(),
        );
        if let Some(template) = self.file_cache.get(&key) {
            tracing::debug!("template cache hit for {}", key.1);
            return Ok(Arc::clone(template.value()));
        }

        tracing::debug!("template cache miss for {}, compiling", key.1);
        let template = Arc::new(get_template(
            node.raw_source(),
            Context::new(),
            Some(node),
            false,
            false,
        )?);
        self.file_cache.insert(key, Arc::clone(&template));
        Ok(template)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.file_cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_cache.is_empty()
    }

    pub fn clear(&self) {
        self.file_cache.clear();
    }
}

static TEMPLATE_CACHE: LazyLock<Arc<TemplateCache>> = LazyLock::new(|| Arc::new(TemplateCache::new()));

/// The process-wide cache used by generators that were not given their own.
#[must_use]
pub fn template_cache() -> &'static Arc<TemplateCache> {
    &TEMPLATE_CACHE
}
