//! Project/tenant registry (spec §1): a key-value lookup returning
//! `{ signingSecrets[], publicFlag, corsOrigins[], readerKey? }`. Modeled
//! as a trait so a real deployment can swap in a KV-backed client; an
//! in-memory map backs tests and the default binary.

use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub signing_secrets: Vec<String>,
    pub public: bool,
    pub cors_origins: Vec<String>,
    pub reader_key: Option<String>,
}

pub trait ProjectRegistry: Send + Sync {
    fn lookup(&self, project_id: &str) -> Option<ProjectConfig>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    projects: DashMap<String, ProjectConfig>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: impl Into<String>, config: ProjectConfig) {
        self.projects.insert(project_id.into(), config);
    }
}

impl ProjectRegistry for InMemoryRegistry {
    fn lookup(&self, project_id: &str) -> Option<ProjectConfig> {
        self.projects.get(project_id).map(|entry| entry.clone())
    }
}

/// Registry used when no project has been explicitly registered: every
/// project (including the legacy `_default`) resolves to an open, public
/// project with no CORS restriction. Suited to local development and the
/// integration tests in this crate.
pub struct PermissiveRegistry;

impl ProjectRegistry for PermissiveRegistry {
    fn lookup(&self, _project_id: &str) -> Option<ProjectConfig> {
        Some(ProjectConfig {
            signing_secrets: Vec::new(),
            public: true,
            cors_origins: vec!["*".to_owned()],
            reader_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_registry_round_trips_config() {
        let registry = InMemoryRegistry::new();
        registry.insert(
            "acme",
            ProjectConfig {
                signing_secrets: vec!["s1".into()],
                public: false,
                cors_origins: vec!["https://acme.example".into()],
                reader_key: Some("rk123".into()),
            },
        );
        let found = registry.lookup("acme").expect("project should exist");
        assert!(!found.public);
        assert_eq!(found.reader_key.as_deref(), Some("rk123"));
        assert!(registry.lookup("missing").is_none());
    }
}
