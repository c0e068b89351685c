//! Starter lookup by service kind, and alias resolution for service names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::runtime::ServiceStarter;

/// Service-kind starters, looked up once when a service is registered.
#[derive(Clone, Default)]
pub struct StarterRegistry {
    starters: HashMap<String, Arc<dyn ServiceStarter>>,
}

impl fmt::Debug for StarterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.starters.keys().collect();
        kinds.sort();
        f.debug_struct("StarterRegistry").field("kinds", &kinds).finish()
    }
}

impl StarterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `starter` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: &str, starter: Arc<dyn ServiceStarter>) {
        self.starters.insert(normalize_name(kind), starter);
    }

    pub fn with(mut self, kind: &str, starter: Arc<dyn ServiceStarter>) -> Self {
        self.register(kind, starter);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ServiceStarter>> {
        self.starters.get(&normalize_name(kind)).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.starters.contains_key(&normalize_name(kind))
    }

    pub fn len(&self) -> usize {
        self.starters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starters.is_empty()
    }
}

/// Trim and lower-case a user-supplied name.
pub fn normalize_name(input: &str) -> String {
    input.trim().to_lowercase()
}

const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("llm", "ai"),
    ("ollama", "ai"),
    ("inference", "ai"),
    ("db", "database"),
    ("postgres", "database"),
    ("postgresql", "database"),
    ("pg", "database"),
    ("pgvector", "database"),
    ("vector", "database"),
    ("vector-db", "database"),
    ("vectordb", "database"),
    ("redis", "cache"),
    ("queue", "cache"),
    ("s3", "storage"),
    ("minio", "storage"),
    ("object-storage", "storage"),
];

/// Maps alternate names to canonical service names.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-filled with the common names for the built-in services.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for (alias, canonical) in DEFAULT_ALIASES {
            table.insert(alias, canonical);
        }
        table
    }

    pub fn insert(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(normalize_name(alias), normalize_name(canonical));
    }

    /// Normalize `input` and follow its alias, if any.
    pub fn resolve(&self, input: &str) -> String {
        let normalized = normalize_name(input);
        match self.aliases.get(&normalized) {
            Some(canonical) => canonical.clone(),
            None => normalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RuntimeError;
    use crate::runtime::{starter_fn, ContainerRef};

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  PostgreSQL "), "postgresql");
    }

    #[test]
    fn test_resolve_default_aliases() {
        let aliases = AliasTable::with_defaults();
        assert_eq!(aliases.resolve("LLM"), "ai");
        assert_eq!(aliases.resolve(" minio"), "storage");
        assert_eq!(aliases.resolve("pgvector"), "database");
        assert_eq!(aliases.resolve("Redis"), "cache");
        assert_eq!(aliases.resolve("database"), "database");
        assert_eq!(aliases.resolve("Custom"), "custom");
    }

    #[test]
    fn test_custom_alias_overrides_default() {
        let mut aliases = AliasTable::with_defaults();
        aliases.insert("vector", "qdrant");
        assert_eq!(aliases.resolve("vector"), "qdrant");
    }

    #[tokio::test]
    async fn test_registry_lookup_is_case_insensitive() {
        let registry = StarterRegistry::new().with(
            "Postgres",
            Arc::new(starter_fn(|| async { Ok::<_, RuntimeError>(ContainerRef::new("pg-1")) })),
        );

        assert!(registry.contains("postgres"));
        assert!(!registry.contains("redis"));
        let starter = registry.get(" POSTGRES ").unwrap();
        assert_eq!(starter.start().await.unwrap(), ContainerRef::new("pg-1"));
    }
}
