//! # Garden Template
//!
//! Template expression resolver and config context hierarchy.
//!
//! A template string is a concatenation of literal fragments and `${...}`
//! clauses: identifier paths, primitive literals, arithmetic/comparison/
//! logical operators, conditional blocks (`${if}`/`${else}`/`${endif}`),
//! a `}?` suffix for non-fatal references, and the `$${` escape. Object
//! trees support the reserved `$merge` spread key.
//!
//! Resolution is a pure function of `(input, context, options)`. Partial
//! resolution keeps the source text of clauses whose references are not yet
//! available, so the same input can be re-resolved later against a richer
//! context. Scan mode records every key a template touches without needing
//! any values, which is how implicit action dependencies are discovered.

mod error;

pub mod context;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod resolver;

pub use context::{
    display_path, ConfigContext, LayeredContext, LazyOutputsContext, Lookup, MapContext,
    OutputsProvider, PathSegment, ScanContext,
};
pub use error::TemplateError;
pub use eval::{evaluate, truthy, Evaluated};
pub use lexer::contains_template;
pub use parser::{parse_expr, Expr};
pub use resolver::{
    resolve_string, resolve_value, scan_string, scan_value, ResolveOptions, MERGE_KEY,
};
