//! Config context hierarchy.
//!
//! A context is a lookup scope for template references. Scopes are layered
//! (project, environment, provider outputs, action outputs, runtime) and each
//! layer is written exactly once, then read-only. Lazy layers resolve the
//! producing entity on demand with cycle detection; scan contexts record every
//! key touched without requiring a value.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::TemplateError;

/// One segment of a reference path such as `a.b[0].c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn key(k: impl Into<String>) -> Self {
        Self::Key(k.into())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{}", k),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Render a path in `a.b.0.c` form for error messages and scan records.
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Outcome of a context lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The key resolved to a concrete value.
    Found(Value),
    /// The key is not (yet) available.
    Missing {
        /// Whether the key may become available later (partial resolution
        /// keeps the source text instead of failing).
        partial: bool,
        /// Optional explanation surfaced in error messages.
        message: Option<String>,
    },
}

impl Lookup {
    pub fn missing() -> Self {
        Self::Missing {
            partial: false,
            message: None,
        }
    }

    pub fn missing_partial() -> Self {
        Self::Missing {
            partial: true,
            message: None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// A lookup scope for template references.
pub trait ConfigContext: Send + Sync {
    /// Resolve a key path to a value, or report it missing.
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError>;
}

/// Descend into a value tree following the remaining path segments.
pub fn descend<'a>(mut value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    for segment in path {
        value = match segment {
            PathSegment::Key(k) => value.get(k.as_str())?,
            PathSegment::Index(i) => value.get(*i)?,
        };
    }
    Some(value)
}

/// Static map context backed by a single JSON object.
#[derive(Debug, Clone, Default)]
pub struct MapContext {
    root: Value,
}

impl MapContext {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Build from `(key, value)` pairs at the top level.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut map = serde_json::Map::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Self {
            root: Value::Object(map),
        }
    }
}

impl ConfigContext for MapContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        Ok(match descend(&self.root, path) {
            Some(v) => Lookup::Found(v.clone()),
            None => Lookup::missing(),
        })
    }
}

/// Ordered chain of context layers; later layers shadow earlier ones.
///
/// The Garden hierarchy is project ⊃ environment ⊃ provider outputs ⊃ action
/// outputs ⊃ runtime; each layer is sealed before the next one is added.
#[derive(Clone, Default)]
pub struct LayeredContext {
    layers: Vec<Arc<dyn ConfigContext>>,
}

impl LayeredContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal a layer onto the top of the stack.
    pub fn push_layer(&mut self, layer: Arc<dyn ConfigContext>) {
        self.layers.push(layer);
    }

    pub fn with_layer(mut self, layer: Arc<dyn ConfigContext>) -> Self {
        self.push_layer(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl ConfigContext for LayeredContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        let mut partial = false;
        let mut message = None;
        for layer in self.layers.iter().rev() {
            match layer.lookup(path)? {
                Lookup::Found(v) => return Ok(Lookup::Found(v)),
                Lookup::Missing {
                    partial: p,
                    message: m,
                } => {
                    partial = partial || p;
                    if message.is_none() {
                        message = m;
                    }
                }
            }
        }
        Ok(Lookup::Missing { partial, message })
    }
}

/// Supplies outputs of a named entity (provider or action) on demand.
pub trait OutputsProvider: Send + Sync {
    /// Return the outputs object for the entity, `None` if the entity is
    /// known but its outputs are not yet available, or an error for unknown
    /// entities.
    fn outputs(&self, entity: &str) -> Result<Option<Value>, TemplateError>;
}

/// Lazy context over entity outputs with cycle detection.
///
/// Lookups of the form `<prefix>.<entity>.<rest...>` trigger the provider.
/// Re-entering an entity that is already on the resolution stack is a
/// circular reference.
pub struct LazyOutputsContext {
    prefix: String,
    provider: Arc<dyn OutputsProvider>,
    stack: Mutex<Vec<String>>,
}

impl LazyOutputsContext {
    pub fn new(prefix: impl Into<String>, provider: Arc<dyn OutputsProvider>) -> Self {
        Self {
            prefix: prefix.into(),
            provider,
            stack: Mutex::new(Vec::new()),
        }
    }
}

impl ConfigContext for LazyOutputsContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        let mut segments = path.iter();
        match segments.next() {
            Some(PathSegment::Key(k)) if k == &self.prefix => {}
            _ => return Ok(Lookup::missing()),
        }
        let entity = match segments.next() {
            Some(PathSegment::Key(k)) => k.clone(),
            _ => return Ok(Lookup::missing()),
        };

        {
            let stack = self.stack.lock().expect("resolution stack poisoned");
            if stack.contains(&entity) {
                return Err(TemplateError::Circular {
                    path: display_path(path),
                });
            }
        }

        self.stack
            .lock()
            .expect("resolution stack poisoned")
            .push(entity.clone());
        let outcome = self.provider.outputs(&entity);
        self.stack.lock().expect("resolution stack poisoned").pop();

        let rest: Vec<PathSegment> = segments.cloned().collect();
        match outcome? {
            Some(outputs) => Ok(match descend(&outputs, &rest) {
                Some(v) => Lookup::Found(v.clone()),
                None => Lookup::missing_partial(),
            }),
            None => Ok(Lookup::missing_partial()),
        }
    }
}

/// Records every key path requested; reports everything as partial.
///
/// Used to discover `template_refs` before a config can actually resolve.
pub struct ScanContext {
    inner: Option<Arc<dyn ConfigContext>>,
    found: Mutex<BTreeSet<String>>,
}

impl ScanContext {
    pub fn new() -> Self {
        Self {
            inner: None,
            found: Mutex::new(BTreeSet::new()),
        }
    }

    /// Scan while still resolving whatever the wrapped context can supply.
    pub fn wrapping(inner: Arc<dyn ConfigContext>) -> Self {
        Self {
            inner: Some(inner),
            found: Mutex::new(BTreeSet::new()),
        }
    }

    /// Every key path touched during the scan, in `a.b.c` form.
    pub fn found_keys(&self) -> BTreeSet<String> {
        self.found.lock().expect("scan set poisoned").clone()
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigContext for ScanContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        self.found
            .lock()
            .expect("scan set poisoned")
            .insert(display_path(path));
        match &self.inner {
            Some(inner) => match inner.lookup(path)? {
                Lookup::Found(v) => Ok(Lookup::Found(v)),
                Lookup::Missing { message, .. } => Ok(Lookup::Missing {
                    partial: true,
                    message,
                }),
            },
            None => Ok(Lookup::missing_partial()),
        }
    }
}
