//! Cross-context object addressing

use std::fmt;

/// Address of a namespaced object on one of the configured contexts.
///
/// Remote objects are never held across reconciliation passes; they are
/// re-fetched by key every time, so the key carries the context explicitly
/// instead of relying on an ambient "current cluster".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub context: String,
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same context and namespace, different object name
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.context, self.namespace, self.name)
    }
}

/// Kinds of objects the controller reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    DatabaseCluster,
    Datacenter,
    RebuildTask,
    Deployment,
    Service,
    ConfigMap,
    Secret,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::DatabaseCluster => "DatabaseCluster",
            ObjectKind::Datacenter => "Datacenter",
            ObjectKind::RebuildTask => "RebuildTask",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Service => "Service",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let key = ClusterKey::new("east", "db", "dc1");
        assert_eq!(key.to_string(), "east:db/dc1");
        assert_eq!(key.with_name("dc1-rebuild").to_string(), "east:db/dc1-rebuild");
    }
}
