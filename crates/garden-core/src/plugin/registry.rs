//! Plugin registry and handler router.
//!
//! Handler resolution walks the plugin `base` chain: the most-derived
//! contribution is invoked, and the remainder of the override stack is
//! exposed as `base` so an override can delegate to what it replaced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use garden_config::ActionKind;

use crate::error::GardenError;
use crate::plugin::{
    ActionHandlers, BuildHandler, DeployHandler, PluginDefinition, RunHandler, TestHandler,
};

/// A resolved handler override stack: `current()` is the most derived
/// implementation, `base()` is the rest of the stack.
pub struct ResolvedHandlers<H: ?Sized> {
    stack: Vec<Arc<H>>,
}

impl<H: ?Sized> ResolvedHandlers<H> {
    pub fn current(&self) -> Arc<H> {
        self.stack
            .last()
            .cloned()
            .expect("resolved handler stacks are never empty")
    }

    /// The override stack below the current handler, if any.
    pub fn base(&self) -> Option<ResolvedHandlers<H>> {
        if self.stack.len() <= 1 {
            return None;
        }
        Some(ResolvedHandlers {
            stack: self.stack[..self.stack.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

impl<H: ?Sized> fmt::Debug for ResolvedHandlers<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandlers")
            .field("depth", &self.stack.len())
            .finish()
    }
}

/// Registry of loaded plugins with handler routing.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginDefinition>,
    by_name: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: PluginDefinition) -> Result<(), GardenError> {
        if self.by_name.contains_key(&plugin.name) {
            return Err(GardenError::Configuration(format!(
                "plugin '{}' registered twice",
                plugin.name
            )));
        }
        self.by_name.insert(plugin.name.clone(), self.plugins.len());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginDefinition> {
        self.by_name.get(name).map(|idx| &self.plugins[*idx])
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name.as_str()).collect()
    }

    /// Validate base references and type-definition conflicts.
    pub fn validate(&self) -> Result<(), GardenError> {
        for plugin in &self.plugins {
            self.chain(&plugin.name)?;
            for ext in &plugin.extensions {
                // Extensions must override a type some base defines.
                let chain = self.chain(&plugin.name)?;
                let defined = chain.iter().any(|p| {
                    p.name != plugin.name
                        && p.action_types
                            .iter()
                            .any(|t| t.kind() == ext.kind() && t.type_name == ext.type_name)
                });
                if !defined {
                    return Err(GardenError::Configuration(format!(
                        "plugin '{}' extends unknown action type {}/{}",
                        plugin.name,
                        ext.kind(),
                        ext.type_name
                    )));
                }
            }
        }
        for kind in ActionKind::ALL {
            let mut seen: HashMap<&str, &str> = HashMap::new();
            for plugin in &self.plugins {
                for def in &plugin.action_types {
                    if def.kind() != kind {
                        continue;
                    }
                    if let Some(other) = seen.insert(def.type_name.as_str(), plugin.name.as_str())
                    {
                        if !self.related(other, &plugin.name)? {
                            return Err(GardenError::Configuration(format!(
                                "action type {}/{} defined by unrelated plugins '{}' and '{}'",
                                kind, def.type_name, other, plugin.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Base chain for a plugin, base-most first.
    fn chain(&self, name: &str) -> Result<Vec<&PluginDefinition>, GardenError> {
        let mut chain = Vec::new();
        let mut current = Some(name.to_string());
        let mut visited = Vec::new();
        while let Some(plugin_name) = current {
            if visited.contains(&plugin_name) {
                return Err(GardenError::Configuration(format!(
                    "plugin base cycle involving '{}'",
                    plugin_name
                )));
            }
            visited.push(plugin_name.clone());
            let plugin = self.get(&plugin_name).ok_or_else(|| {
                GardenError::Configuration(format!("unknown plugin '{}'", plugin_name))
            })?;
            chain.push(plugin);
            current = plugin.base.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Whether one plugin appears on the other's base chain.
    fn related(&self, a: &str, b: &str) -> Result<bool, GardenError> {
        let in_chain = |owner: &str, other: &str| -> Result<bool, GardenError> {
            Ok(self.chain(owner)?.iter().any(|p| p.name == other))
        };
        Ok(in_chain(a, b)? || in_chain(b, a)?)
    }

    /// Resolve the handler override stack for `(kind, type_name)`.
    fn resolve_stack(
        &self,
        kind: ActionKind,
        type_name: &str,
    ) -> Result<Vec<ActionHandlers>, GardenError> {
        // Contributors: plugins that define or extend the type.
        let contributors: Vec<&PluginDefinition> = self
            .plugins
            .iter()
            .filter(|p| {
                p.action_types
                    .iter()
                    .chain(p.extensions.iter())
                    .any(|t| t.kind() == kind && t.type_name == type_name)
            })
            .collect();

        if contributors.is_empty() {
            return Err(GardenError::Configuration(format!(
                "no registered plugin implements action type {}/{}",
                kind, type_name
            )));
        }

        // The top contributor's chain must cover every other contributor.
        let mut top: Option<&PluginDefinition> = None;
        for candidate in &contributors {
            let chain_names: Vec<&str> = self
                .chain(&candidate.name)?
                .iter()
                .map(|p| p.name.as_str())
                .collect();
            if contributors
                .iter()
                .all(|c| chain_names.contains(&c.name.as_str()))
            {
                top = Some(candidate);
            }
        }
        let top = top.ok_or_else(|| {
            GardenError::Configuration(format!(
                "action type {}/{} has conflicting implementations",
                kind, type_name
            ))
        })?;

        let mut stack = Vec::new();
        for plugin in self.chain(&top.name)? {
            for def in &plugin.action_types {
                if def.kind() == kind && def.type_name == type_name {
                    stack.push(def.handlers.clone());
                }
            }
            for ext in &plugin.extensions {
                if ext.kind() == kind && ext.type_name == type_name {
                    stack.push(ext.handlers.clone());
                }
            }
        }
        if stack.is_empty() {
            return Err(GardenError::Internal(format!(
                "contributor chain for {}/{} produced no handlers",
                kind, type_name
            )));
        }
        Ok(stack)
    }

    pub fn resolve_build(
        &self,
        type_name: &str,
    ) -> Result<ResolvedHandlers<dyn BuildHandler>, GardenError> {
        let stack = self.resolve_stack(ActionKind::Build, type_name)?;
        let stack = stack
            .into_iter()
            .map(|h| match h {
                ActionHandlers::Build(handler) => Ok(handler),
                other => Err(kind_mismatch(ActionKind::Build, other.kind(), type_name)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedHandlers { stack })
    }

    pub fn resolve_deploy(
        &self,
        type_name: &str,
    ) -> Result<ResolvedHandlers<dyn DeployHandler>, GardenError> {
        let stack = self.resolve_stack(ActionKind::Deploy, type_name)?;
        let stack = stack
            .into_iter()
            .map(|h| match h {
                ActionHandlers::Deploy(handler) => Ok(handler),
                other => Err(kind_mismatch(ActionKind::Deploy, other.kind(), type_name)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedHandlers { stack })
    }

    pub fn resolve_run(
        &self,
        type_name: &str,
    ) -> Result<ResolvedHandlers<dyn RunHandler>, GardenError> {
        let stack = self.resolve_stack(ActionKind::Run, type_name)?;
        let stack = stack
            .into_iter()
            .map(|h| match h {
                ActionHandlers::Run(handler) => Ok(handler),
                other => Err(kind_mismatch(ActionKind::Run, other.kind(), type_name)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedHandlers { stack })
    }

    pub fn resolve_test(
        &self,
        type_name: &str,
    ) -> Result<ResolvedHandlers<dyn TestHandler>, GardenError> {
        let stack = self.resolve_stack(ActionKind::Test, type_name)?;
        let stack = stack
            .into_iter()
            .map(|h| match h {
                ActionHandlers::Test(handler) => Ok(handler),
                other => Err(kind_mismatch(ActionKind::Test, other.kind(), type_name)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedHandlers { stack })
    }

    /// Whether any plugin implements `(kind, type_name)`; used by graph
    /// validation.
    pub fn has_action_type(&self, kind: ActionKind, type_name: &str) -> bool {
        self.plugins.iter().any(|p| {
            p.action_types
                .iter()
                .any(|t| t.kind() == kind && t.type_name == type_name)
        })
    }
}

fn kind_mismatch(expected: ActionKind, found: ActionKind, type_name: &str) -> GardenError {
    GardenError::Internal(format!(
        "action type '{}' registered for kind {} but resolved as {}",
        type_name, found, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ActionTypeDefinition, HandlerParams, HandlerResult};
    use async_trait::async_trait;

    struct NamedBuild(&'static str);

    #[async_trait]
    impl BuildHandler for NamedBuild {
        async fn build(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            Ok(HandlerResult::ready(serde_json::json!({"by": self.0})))
        }
    }

    fn plugin_with_build(name: &str, type_name: &str, marker: &'static str) -> PluginDefinition {
        PluginDefinition::new(name).with_action_type(ActionTypeDefinition::new(
            type_name,
            ActionHandlers::Build(Arc::new(NamedBuild(marker))),
        ))
    }

    #[test]
    fn test_resolution_without_base_has_single_entry() {
        let mut registry = PluginRegistry::new();
        registry
            .register(plugin_with_build("exec", "exec", "exec"))
            .unwrap();
        registry.validate().unwrap();

        let resolved = registry.resolve_build("exec").unwrap();
        assert_eq!(resolved.depth(), 1);
        assert!(resolved.base().is_none());
    }

    #[test]
    fn test_extension_overrides_base_definition() {
        let mut registry = PluginRegistry::new();
        registry
            .register(plugin_with_build("container", "container", "base"))
            .unwrap();
        registry
            .register(
                PluginDefinition::new("kubernetes")
                    .with_base("container")
                    .with_extension(ActionTypeDefinition::new(
                        "container",
                        ActionHandlers::Build(Arc::new(NamedBuild("derived"))),
                    )),
            )
            .unwrap();
        registry.validate().unwrap();

        let resolved = registry.resolve_build("container").unwrap();
        assert_eq!(resolved.depth(), 2);
        // current() is the extension, base() exposes the overridden handler.
        let base = resolved.base().expect("base present");
        assert_eq!(base.depth(), 1);
    }

    #[test]
    fn test_unknown_type_is_configuration_error() {
        let registry = PluginRegistry::new();
        let err = registry.resolve_build("ghost").unwrap_err();
        assert!(matches!(err, GardenError::Configuration(_)));
    }

    #[test]
    fn test_unknown_base_fails_validation() {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginDefinition::new("derived").with_base("missing"))
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("unknown plugin 'missing'"));
    }

    #[test]
    fn test_base_cycle_fails_validation() {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginDefinition::new("a").with_base("b"))
            .unwrap();
        registry
            .register(PluginDefinition::new("b").with_base("a"))
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("base cycle"));
    }

    #[test]
    fn test_conflicting_unrelated_definitions_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(plugin_with_build("one", "shared", "one"))
            .unwrap();
        registry
            .register(plugin_with_build("two", "shared", "two"))
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("unrelated plugins"));
    }

    #[test]
    fn test_extension_of_unknown_type_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDefinition::new("lonely").with_extension(ActionTypeDefinition::new(
                    "ghost",
                    ActionHandlers::Build(Arc::new(NamedBuild("x"))),
                )),
            )
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("extends unknown action type"));
    }
}
