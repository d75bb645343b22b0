//! A sandboxed template engine in the Jinja family.
//!
//! The crate covers the whole pipeline from source text to rendered output:
//!
//! 1. **Lexing**: [`tokenize`] splits text into data and `{% %}` / `{{ }}` constructs
//! 2. **Parsing**: [`Parser`] builds a statement tree; tags it does not know are
//!    handed to registered [`Extension`]s
//! 3. **Evaluation**: a [`Template`] renders against a [`Context`], either as text or
//!    as a list of values ([`OutputMode::Native`])
//!
//! Missing names are produced by an [`UndefinedFactory`], so an embedding application
//! decides how lenient a missing variable is. Host values plug in through [`Object`].
//! Attribute names starting with `_` are rejected with [`ErrorKind::SecurityError`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use jinx_templates::{Context, Environment, Value};
//!
//! let env = Arc::new(Environment::new());
//! let template = env.template_from_str("hello {{ name }}", Context::new()).unwrap();
//! let mut ctx = Context::new();
//! ctx.insert("name".to_string(), Value::from("world"));
//! assert_eq!(template.render(ctx).unwrap(), "hello world");
//! ```

mod ast;
mod environment;
mod error;
mod eval;
mod ext;
mod filters;
mod lexer;
mod macros;
mod methods;
mod object;
mod ops;
mod parser;
mod tokens;
mod undefined;
mod value;

pub use ast::BinOp;
pub use ast::Expr;
pub use ast::ExprKind;
pub use ast::ForLoop;
pub use ast::MacroDef;
pub use ast::Param;
pub use ast::Stmt;
pub use ast::StmtKind;
pub use ast::Target;
pub use ast::UnaryOp;
pub use environment::CompileHook;
pub use environment::Environment;
pub use environment::Module;
pub use environment::OutputMode;
pub use environment::Template;
pub use environment::DEFAULT_TEMPLATE_NAME;
pub use error::Error;
pub use error::ErrorKind;
pub use ext::Extension;
pub use ext::Extensions;
pub use lexer::tokenize;
pub use lexer::Lexer;
pub use macros::Macro;
pub use object::CallArgs;
pub use object::Object;
pub use parser::parse;
pub use parser::Parser;
pub use tokens::Token;
pub use tokens::TokenKind;
pub use undefined::LenientUndefined;
pub use undefined::Undefined;
pub use undefined::UndefinedFactory;
pub use value::Context;
pub use value::Function;
pub use value::ListRef;
pub use value::MapRef;
pub use value::Value;
