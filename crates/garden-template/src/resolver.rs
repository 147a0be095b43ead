//! Template resolution driver.
//!
//! Assembles lexed segments into a block tree (`${if}`/`${else}`/`${endif}`),
//! evaluates it against a context, and walks value trees resolving strings in
//! place. Resolution is a pure function; laziness is achieved by re-running it
//! against progressively richer contexts, with `allow_partial` keeping the
//! source text of anything that cannot resolve yet.

use serde_json::{Map, Value};

use crate::context::{ConfigContext, ScanContext};
use crate::error::TemplateError;
use crate::eval::{evaluate, truthy, type_name, Evaluated};
use crate::lexer::{contains_template, lex, Segment};
use crate::parser::{collect_refs, parse_clause, Clause, Expr};

/// Reserved object key whose resolved mapping is spread into the enclosing
/// object.
pub const MERGE_KEY: &str = "$merge";

/// Options controlling template resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Keep the source text of clauses whose references cannot resolve yet,
    /// instead of failing with a missing-key error.
    pub allow_partial: bool,
    /// Strip the `$${` escape down to `${` after resolution.
    pub unescape: bool,
}

impl ResolveOptions {
    pub fn partial() -> Self {
        Self {
            allow_partial: true,
            unescape: false,
        }
    }

    pub fn full() -> Self {
        Self {
            allow_partial: false,
            unescape: true,
        }
    }
}

/// A node of the assembled template tree.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(String),
    Escaped(String),
    Expr {
        expr: Expr,
        optional: bool,
        raw: String,
    },
    Conditional {
        cond: Expr,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
        /// Source text of the whole block, kept for partial resolution.
        raw: String,
    },
}

impl Node {
    fn raw(&self) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Escaped(inner) => format!("$${{{}}}", inner),
            Self::Expr { raw, .. } => raw.clone(),
            Self::Conditional { raw, .. } => raw.clone(),
        }
    }
}

/// Assemble lexed segments into a tree; `if` opens a node, `else` swaps the
/// active branch, `endif` pops.
fn assemble(segments: Vec<Segment>) -> Result<Vec<Node>, TemplateError> {
    struct Frame {
        cond: Expr,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
        in_else: bool,
        raw: String,
    }

    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    fn push(root: &mut Vec<Node>, stack: &mut [Frame], node: Node) {
        match stack.last_mut() {
            Some(frame) => {
                frame.raw.push_str(&node.raw());
                if frame.in_else {
                    frame.else_branch.push(node);
                } else {
                    frame.then_branch.push(node);
                }
            }
            None => root.push(node),
        }
    }

    for segment in segments {
        match segment {
            Segment::Literal(s) => push(&mut root, &mut stack, Node::Literal(s)),
            Segment::Escaped(inner) => push(&mut root, &mut stack, Node::Escaped(inner)),
            Segment::Clause {
                body,
                optional,
                raw,
            } => match parse_clause(&body)? {
                Clause::Expr(expr) => push(
                    &mut root,
                    &mut stack,
                    Node::Expr {
                        expr,
                        optional,
                        raw,
                    },
                ),
                Clause::If(cond) => stack.push(Frame {
                    cond,
                    then_branch: Vec::new(),
                    else_branch: Vec::new(),
                    in_else: false,
                    raw,
                }),
                Clause::Else => match stack.last_mut() {
                    Some(frame) if !frame.in_else => {
                        frame.in_else = true;
                        frame.raw.push_str(&raw);
                    }
                    _ => {
                        return Err(TemplateError::Structure(
                            "found ${else} without a matching ${if}".into(),
                        ))
                    }
                },
                Clause::Endif => match stack.pop() {
                    Some(mut frame) => {
                        frame.raw.push_str(&raw);
                        let node = Node::Conditional {
                            cond: frame.cond,
                            then_branch: frame.then_branch,
                            else_branch: frame.else_branch,
                            raw: frame.raw,
                        };
                        push(&mut root, &mut stack, node);
                    }
                    None => {
                        return Err(TemplateError::Structure(
                            "found ${endif} without a matching ${if}".into(),
                        ))
                    }
                },
            },
        }
    }

    if !stack.is_empty() {
        return Err(TemplateError::Structure(
            "missing ${endif} for ${if} block".into(),
        ));
    }
    Ok(root)
}

/// One resolved piece of output.
#[derive(Debug, Clone)]
enum Part {
    /// Clause resolved to a concrete value.
    Value(Value),
    /// Literal text, or kept source text under partial resolution.
    Text(String),
}

fn resolve_nodes(
    nodes: &[Node],
    ctx: &dyn ConfigContext,
    opts: &ResolveOptions,
    out: &mut Vec<Part>,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Literal(s) => out.push(Part::Text(s.clone())),
            Node::Escaped(inner) => {
                let text = if opts.unescape {
                    format!("${{{}}}", inner)
                } else {
                    format!("$${{{}}}", inner)
                };
                out.push(Part::Text(text));
            }
            Node::Expr {
                expr,
                optional,
                raw,
            } => match evaluate(expr, ctx)? {
                Evaluated::Value(v) => out.push(Part::Value(v)),
                missing => {
                    if *optional {
                        out.push(Part::Value(Value::Null));
                    } else if opts.allow_partial {
                        out.push(Part::Text(raw.clone()));
                    } else {
                        return Err(missing.into_missing_error());
                    }
                }
            },
            Node::Conditional {
                cond,
                then_branch,
                else_branch,
                raw,
            } => match evaluate(cond, ctx)? {
                Evaluated::Value(v) => {
                    let branch = if truthy(&v) { then_branch } else { else_branch };
                    resolve_nodes(branch, ctx, opts, out)?;
                }
                missing => {
                    if opts.allow_partial {
                        out.push(Part::Text(raw.clone()));
                    } else {
                        return Err(missing.into_missing_error());
                    }
                }
            },
        }
    }
    Ok(())
}

/// Resolve a template string to a value.
///
/// A string that consists of exactly one clause returns the clause's value
/// unchanged (so `"${var.ports}"` can yield a list); any other shape
/// stringifies its resolved parts. Non-templated strings pass through.
pub fn resolve_string(
    input: &str,
    ctx: &dyn ConfigContext,
    opts: &ResolveOptions,
) -> Result<Value, TemplateError> {
    if !contains_template(input) {
        return Ok(Value::String(input.to_string()));
    }

    let nodes = assemble(lex(input)?)?;

    // Single-expression template: pass the value through untouched.
    if let [Node::Expr { .. }] = nodes.as_slice() {
        let mut parts = Vec::with_capacity(1);
        resolve_nodes(&nodes, ctx, opts, &mut parts)?;
        return Ok(match parts.remove(0) {
            Part::Value(v) => v,
            Part::Text(text) => Value::String(text),
        });
    }

    let mut parts = Vec::new();
    resolve_nodes(&nodes, ctx, opts, &mut parts)?;

    let mut output = String::new();
    for part in parts {
        match part {
            Part::Text(text) => output.push_str(&text),
            Part::Value(v) => output.push_str(&stringify(&v)?),
        }
    }
    Ok(Value::String(output))
}

fn stringify(value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::TypeMismatch(format!(
            "cannot interpolate {} into a string",
            type_name(value)
        ))),
    }
}

/// Resolve every templated string in a value tree, spreading `$merge` keys
/// depth-first, leaves-first. A later literal key overrides a value produced
/// by `$merge`.
pub fn resolve_value(
    input: &Value,
    ctx: &dyn ConfigContext,
    opts: &ResolveOptions,
) -> Result<Value, TemplateError> {
    match input {
        Value::String(s) => resolve_string(s, ctx, opts),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, ctx, opts)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let resolved = resolve_value(value, ctx, opts)?;
                if key == MERGE_KEY {
                    match resolved {
                        Value::Object(merged) => {
                            for (mk, mv) in merged {
                                out.insert(mk, mv);
                            }
                        }
                        // Unresolved template kept for a later pass.
                        Value::String(s) if opts.allow_partial && contains_template(&s) => {
                            out.insert(key.clone(), Value::String(s));
                        }
                        other => {
                            return Err(TemplateError::TypeMismatch(format!(
                                "{} value must resolve to a mapping, got {}",
                                MERGE_KEY,
                                type_name(&other)
                            )))
                        }
                    }
                } else {
                    out.insert(key.clone(), resolved);
                }
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Record every key referenced by a template string into the scan context.
///
/// Unlike resolution, scanning visits both branches of conditionals and both
/// operands of short-circuit operators.
pub fn scan_string(input: &str, scan: &ScanContext) -> Result<(), TemplateError> {
    if !contains_template(input) {
        return Ok(());
    }
    let nodes = assemble(lex(input)?)?;
    scan_nodes(&nodes, scan)
}

fn scan_nodes(nodes: &[Node], scan: &ScanContext) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Literal(_) | Node::Escaped(_) => {}
            Node::Expr { expr, .. } => scan_expr(expr, scan)?,
            Node::Conditional {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                scan_expr(cond, scan)?;
                scan_nodes(then_branch, scan)?;
                scan_nodes(else_branch, scan)?;
            }
        }
    }
    Ok(())
}

fn scan_expr(expr: &Expr, scan: &ScanContext) -> Result<(), TemplateError> {
    let mut refs = Vec::new();
    collect_refs(expr, &mut refs);
    for path in refs {
        // Lookup records the key; circular errors still surface.
        scan.lookup(&path)?;
    }
    Ok(())
}

/// Scan a whole value tree.
pub fn scan_value(input: &Value, scan: &ScanContext) -> Result<(), TemplateError> {
    match input {
        Value::String(s) => scan_string(s, scan),
        Value::Array(items) => {
            for item in items {
                scan_value(item, scan)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for value in map.values() {
                scan_value(value, scan)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
