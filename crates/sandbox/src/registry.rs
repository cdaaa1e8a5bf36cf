use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::adapters::{CAdapter, LanguageAdapter, ScriptAdapter};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

#[derive(Clone)]
pub struct LanguageCapability {
    name: String,
    aliases: Vec<String>,
    adapter: Arc<dyn LanguageAdapter>,
}

impl LanguageCapability {
    pub fn new<I, S>(name: impl Into<String>, aliases: I, adapter: Arc<dyn LanguageAdapter>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: normalize(&name.into()),
            aliases: aliases
                .into_iter()
                .map(|alias| normalize(&alias.into()))
                .collect(),
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn adapter(&self) -> &Arc<dyn LanguageAdapter> {
        &self.adapter
    }
}

impl fmt::Debug for LanguageCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageCapability")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Maps language names and aliases to capabilities.
///
/// Lookups trim whitespace and ignore ASCII case, so `" JavaScript"` and
/// `"node"` resolve to the same adapter.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<LanguageCapability>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// python, node, bash and c with their common aliases.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LanguageCapability::new(
            "python",
            ["py", "python3"],
            Arc::new(ScriptAdapter::python()),
        ));
        registry.register(LanguageCapability::new(
            "node",
            ["javascript", "js", "nodejs"],
            Arc::new(ScriptAdapter::node()),
        ));
        registry.register(LanguageCapability::new(
            "bash",
            ["shell", "sh"],
            Arc::new(ScriptAdapter::bash()),
        ));
        registry.register(LanguageCapability::new("c", ["gcc"], Arc::new(CAdapter)));
        registry
    }

    /// The builtin registry restricted to `languages`, which may be given by
    /// canonical name or alias.
    pub fn builtin_subset<S: AsRef<str>>(languages: &[S]) -> Result<Self, UnsupportedLanguage> {
        let builtin = Self::builtin();
        let mut registry = Self::new();
        for language in languages {
            let capability = builtin.resolve(language.as_ref())?;
            if registry.resolve(capability.name()).is_err() {
                registry.register(capability.clone());
            }
        }
        Ok(registry)
    }

    /// Adds a capability. Names already taken by an earlier capability keep
    /// pointing at it.
    pub fn register(&mut self, capability: LanguageCapability) {
        let slot = self.capabilities.len();
        for key in std::iter::once(&capability.name).chain(capability.aliases.iter()) {
            self.index.entry(key.clone()).or_insert(slot);
        }
        self.capabilities.push(capability);
    }

    pub fn resolve(&self, language: &str) -> Result<&LanguageCapability, UnsupportedLanguage> {
        self.index
            .get(&normalize(language))
            .and_then(|slot| self.capabilities.get(*slot))
            .ok_or_else(|| UnsupportedLanguage(language.trim().to_owned()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(LanguageCapability::name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

fn normalize(language: &str) -> String {
    language.trim().to_ascii_lowercase()
}
