//! Internal names for macro-like definitions.
//!
//! Definitions and lookups both go through these functions, so a macro defined
//! under one tag is always found under the same name at call time.

pub const MACRO_PREFIX: &str = "macro__";
pub const DOCS_PREFIX: &str = "docs__";
pub const DEFAULT_ADAPTER: &str = "default";

/// Internal name of a `{% macro %}` definition.
#[must_use]
pub fn mangle_macro(name: &str) -> String {
    format!("{MACRO_PREFIX}{name}")
}

/// The user-visible name of a materialization for `adapter`.
///
/// `:` cannot appear in an identifier, so these names never collide with a
/// plain macro named e.g. `materialization_table_default`.
#[must_use]
pub fn materialization_name(name: &str, adapter: Option<&str>) -> String {
    format!("materialization:{name}:{}", adapter.unwrap_or(DEFAULT_ADAPTER))
}

/// Internal name of a `{% materialization %}` definition.
#[must_use]
pub fn mangle_materialization(name: &str, adapter: Option<&str>) -> String {
    mangle_macro(&materialization_name(name, adapter))
}

/// Internal name of a `{% docs %}` block.
#[must_use]
pub fn mangle_docs(name: &str) -> String {
    format!("{DOCS_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_names() {
        assert_eq!(mangle_macro("my_macro"), "macro__my_macro");
        assert_eq!(mangle_docs("my_doc"), "docs__my_doc");
    }

    #[test]
    fn test_materialization_adapter_defaults() {
        assert_eq!(
            mangle_materialization("table", None),
            "macro__materialization:table:default"
        );
        assert_eq!(
            mangle_materialization("table", None),
            mangle_materialization("table", Some(DEFAULT_ADAPTER))
        );
        assert_ne!(
            mangle_materialization("table", None),
            mangle_materialization("table", Some("postgres"))
        );
    }

    #[test]
    fn test_no_collision_between_kinds() {
        assert_ne!(mangle_macro("x"), mangle_docs("x"));
        assert_ne!(
            mangle_materialization("table", Some("x")),
            mangle_macro("materialization_table_x")
        );
    }
}
