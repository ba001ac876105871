use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a configured repository, used to partition cached results.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A specific version of a named module.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleRevisionId {
    pub organisation: String,
    pub name: String,
    pub revision: String,
    /// Extra qualifiers (e.g. `branch`) that take part in the identity.
    #[serde(default)]
    pub extra_attributes: BTreeMap<String, String>,
}

impl ModuleRevisionId {
    pub fn new(
        organisation: impl Into<String>,
        name: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            organisation: organisation.into(),
            name: name.into(),
            revision: revision.into(),
            extra_attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_attributes.insert(key.into(), value.into());
        self
    }

    /// Stable, unambiguous string form used as part of cache keys.
    ///
    /// Every field is length-prefixed so no choice of separator characters in
    /// the coordinates can make two different ids encode the same way.
    pub fn encode_to_string(&self) -> String {
        let mut out = String::new();
        for field in [&self.organisation, &self.name, &self.revision] {
            push_encoded(&mut out, field);
        }
        for (key, value) in &self.extra_attributes {
            push_encoded(&mut out, key);
            push_encoded(&mut out, value);
        }
        out
    }
}

fn push_encoded(out: &mut String, field: &str) {
    out.push_str(&field.len().to_string());
    out.push(':');
    out.push_str(field);
}

impl fmt::Display for ModuleRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{};{}", self.organisation, self.name, self.revision)
    }
}

/// A single file published under a module revision.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactRevisionId {
    pub module: ModuleRevisionId,
    pub name: String,
    /// Artifact type, e.g. `jar`, `source`, `ivy`.
    pub kind: String,
    pub ext: String,
    /// Extra qualifiers such as `classifier`.
    #[serde(default)]
    pub extra_attributes: BTreeMap<String, String>,
}

impl ArtifactRevisionId {
    pub fn new(
        module: ModuleRevisionId,
        name: impl Into<String>,
        kind: impl Into<String>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            module,
            name: name.into(),
            kind: kind.into(),
            ext: ext.into(),
            extra_attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_attributes.insert(key.into(), value.into());
        self
    }

    pub fn classifier(&self) -> Option<&str> {
        self.extra_attributes.get("classifier").map(String::as_str)
    }
}

impl fmt::Display for ArtifactRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.module, self.name)?;
        if let Some(classifier) = self.classifier() {
            write!(f, "-{classifier}")?;
        }
        write!(f, ".{}({})", self.ext, self.kind)
    }
}

/// Metadata for a module revision: what it publishes and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: ModuleRevisionId,
    /// Resolved publication timestamp, in milliseconds since the Unix epoch.
    pub published_at_millis: u64,
    pub status: String,
    pub configurations: Vec<String>,
    pub artifacts: Vec<ArtifactRevisionId>,
}

impl ModuleDescriptor {
    pub fn new(id: ModuleRevisionId, published_at_millis: u64) -> Self {
        Self {
            id,
            published_at_millis,
            status: "release".to_string(),
            configurations: vec!["default".to_string()],
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRevisionId) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Every distinct artifact of the module, in declaration order.
    pub fn all_artifacts(&self) -> impl Iterator<Item = &ArtifactRevisionId> {
        let mut seen = std::collections::HashSet::new();
        self.artifacts
            .iter()
            .filter(move |artifact| seen.insert(*artifact))
    }
}
