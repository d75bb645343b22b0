//! Macro-aware template compilation.
//!
//! Macro files are compiled once per package and path ([`TemplateCache`]) and
//! their macros are called through [`MacroGenerator`]s, which record each
//! outermost call as a dependency of the node being compiled. Block tags can
//! be pulled out of raw text without a full parse ([`extract_toplevel_blocks`]).
//!
//! ## Example
//!
//! ```
//! use jinx::{extract_toplevel_blocks, BlockItem};
//!
//! let blocks = extract_toplevel_blocks("{% macro a() %}1{% endmacro %}", None, false).unwrap();
//! assert!(matches!(&blocks[0], BlockItem::Tag(tag) if tag.name == Some("a")));
//! ```

mod blocks;
mod cache;
pub mod debug;
mod error;
mod extensions;
pub mod flags;
mod generator;
mod mangle;
mod native;
mod node;
pub mod render;
mod stack;
mod test_kwargs;
mod undefined;

pub use blocks::extract_toplevel_blocks;
pub use blocks::BlockData;
pub use blocks::BlockItem;
pub use blocks::BlockTag;
pub use blocks::ParseError;
pub use blocks::DEFAULT_BLOCK_KINDS;
pub use blocks::RAW_DATA_KIND;
pub use cache::template_cache;
pub use cache::TemplateCache;
pub use error::macro_return;
pub use error::CompilationError;
pub use error::Error;
pub use error::ErrorKind;
pub use error::InternalError;
pub use error::MacroReturn;
pub use extensions::DoExtension;
pub use extensions::DocumentationExtension;
pub use extensions::MacroFuzzExtension;
pub use extensions::MaterializationExtension;
pub use generator::return_function;
pub use generator::MacroGenerator;
pub use generator::MacroOutcome;
pub use generator::QueryCommentGenerator;
pub use generator::SharedContext;
pub use mangle::mangle_docs;
pub use mangle::mangle_macro;
pub use mangle::mangle_materialization;
pub use mangle::materialization_name;
pub use mangle::DEFAULT_ADAPTER;
pub use native::literal_eval;
pub use native::native_concat;
pub use node::Attribution;
pub use node::MacroNode;
pub use node::Node;
pub use node::ParsedNode;
pub use node::TestMetadata;
pub use render::get_environment;
pub use render::get_rendered;
pub use render::get_template;
pub use render::parse;
pub use render::render_template;
pub use render::undefined_error;
pub use stack::MacroStack;
pub use test_kwargs::add_rendered_test_kwargs;
pub use test_kwargs::looks_like_function_call;
pub use test_kwargs::SCHEMA_TEST_KWARGS_NAME;
pub use undefined::CaptureUndefined;
pub use undefined::DeferredReference;
