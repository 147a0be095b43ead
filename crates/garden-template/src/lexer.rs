//! Template string lexer.
//!
//! Splits a template string into literal fragments and `${...}` clauses.
//! The escape `$${` produces a literal `${` (kept escaped unless the
//! resolver is asked to unescape), and a `}?` suffix marks a clause whose
//! missing references are non-fatal.

use crate::error::TemplateError;

/// A lexed piece of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Plain text outside any clause.
    Literal(String),
    /// `$${inner}` — renders as `${inner}` once unescaped.
    Escaped(String),
    /// A `${...}` clause, body unparsed.
    Clause {
        body: String,
        optional: bool,
        /// Original source text including delimiters and any `?` suffix.
        raw: String,
    },
}

impl Segment {
    /// Source text this segment was lexed from.
    pub fn raw(&self) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Escaped(inner) => format!("$${{{}}}", inner),
            Self::Clause { raw, .. } => raw.clone(),
        }
    }
}

/// Quick check used to skip non-templated strings.
pub fn contains_template(input: &str) -> bool {
    input.contains("${")
}

/// Lex a template string into segments.
pub fn lex(input: &str) -> Result<Vec<Segment>, TemplateError> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        if starts_with(&chars, i, "$${") {
            match find_closing(&chars, i + 3) {
                Some(end) => {
                    flush_literal(&mut segments, &mut literal);
                    let inner: String = chars[i + 3..end].iter().collect();
                    segments.push(Segment::Escaped(inner));
                    i = end + 1;
                }
                None => {
                    // Unterminated escape; treat the rest as literal text.
                    literal.extend(&chars[i..]);
                    i = chars.len();
                }
            }
        } else if starts_with(&chars, i, "${") {
            let end = find_clause_end(&chars, i + 2).ok_or_else(|| {
                TemplateError::Structure(format!(
                    "unclosed template clause starting at character {}",
                    i
                ))
            })?;
            flush_literal(&mut segments, &mut literal);
            let body: String = chars[i + 2..end].iter().collect();
            let optional = chars.get(end + 1) == Some(&'?');
            let raw_end = if optional { end + 2 } else { end + 1 };
            let raw: String = chars[i..raw_end].iter().collect();
            segments.push(Segment::Clause {
                body,
                optional,
                raw,
            });
            i = raw_end;
        } else {
            literal.push(chars[i]);
            i += 1;
        }
    }

    flush_literal(&mut segments, &mut literal);
    Ok(segments)
}

fn flush_literal(segments: &mut Vec<Segment>, literal: &mut String) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

fn starts_with(chars: &[char], at: usize, pat: &str) -> bool {
    pat.chars()
        .enumerate()
        .all(|(j, c)| chars.get(at + j) == Some(&c))
}

/// First unquoted `}` from `start`, honouring string literals in the body.
fn find_clause_end(chars: &[char], start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1; // skip escaped character inside a string
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '}' => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Plain `}` search for escaped clauses (no expression inside).
fn find_closing(chars: &[char], start: usize) -> Option<usize> {
    (start..chars.len()).find(|&i| chars[i] == '}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lex_literals_and_clauses() {
        let segments = lex("image: ${var.image}:latest").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("image: ".to_string()),
                Segment::Clause {
                    body: "var.image".to_string(),
                    optional: false,
                    raw: "${var.image}".to_string(),
                },
                Segment::Literal(":latest".to_string()),
            ]
        );
    }

    #[test]
    fn test_lex_optional_suffix() {
        let segments = lex("${var.replicas}?").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Clause {
                body: "var.replicas".to_string(),
                optional: true,
                raw: "${var.replicas}?".to_string(),
            }]
        );
    }

    #[test]
    fn test_lex_escape() {
        let segments = lex("literal $${var.x} text").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("literal ".to_string()),
                Segment::Escaped("var.x".to_string()),
                Segment::Literal(" text".to_string()),
            ]
        );
        assert_eq!(segments[1].raw(), "$${var.x}");
    }

    #[test]
    fn test_lex_brace_inside_string_literal() {
        let segments = lex(r#"${var.x == "}"}"#).unwrap();
        assert_eq!(
            segments,
            vec![Segment::Clause {
                body: r#"var.x == "}""#.to_string(),
                optional: false,
                raw: r#"${var.x == "}"}"#.to_string(),
            }]
        );
    }

    #[test]
    fn test_lex_unclosed_clause_fails() {
        let err = lex("${var.x").unwrap_err();
        assert!(matches!(err, TemplateError::Structure(_)));
    }
}
