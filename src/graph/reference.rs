//! Repository references and the store that maps them to image ids.
//!
//! A reference is `repo:tag` (mutable) or `repo@algorithm:hex` (content
//! derived). The store is loaded once from `repositories-<driver>` and owned
//! by whoever opened it; every access goes through its internal lock.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{ImageGraph, ImageId};
use crate::error::{GraphError, Result};

/// Tag used when a name carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// repository name → (tag or digest → image id)
pub type RepositoryMap = BTreeMap<String, BTreeMap<String, ImageId>>;

/// Whether a ref-string is a digest (`algorithm:encoded`) rather than a tag.
pub fn is_digest(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((algorithm, encoded)) => {
            !algorithm.is_empty()
                && !encoded.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        }
        None => false,
    }
}

/// Display form of a `(repository, ref)` pair.
pub fn image_reference(repository: &str, reference: &str) -> String {
    if is_digest(reference) {
        format!("{repository}@{reference}")
    } else {
        format!("{repository}:{reference}")
    }
}

/// Parsed `(repository, ref-string)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub repository: String,
    pub reference: String,
}

impl Reference {
    /// Parse `repo`, `repo:tag` or `repo@digest`.
    ///
    /// A colon followed later by a `/` belongs to a registry port
    /// (`registry:5000/app`), not to a tag.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();

        let (repository, reference) = if let Some((repo, digest)) = name.rsplit_once('@') {
            if !is_digest(digest) {
                return Err(GraphError::ReferenceNotFound(format!(
                    "{name} (invalid digest, expected algorithm:hex)"
                )));
            }
            (repo, digest)
        } else {
            match name.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo, tag),
                _ => (name, DEFAULT_TAG),
            }
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(GraphError::ReferenceNotFound(name.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    pub fn is_digest(&self) -> bool {
        is_digest(&self.reference)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&image_reference(&self.repository, &self.reference))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RepositoriesFile {
    #[serde(rename = "Repositories", default)]
    repositories: RepositoryMap,
}

/// Name → id mapping guarded by a coarse lock.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    repositories: Mutex<RepositoryMap>,
}

impl ReferenceStore {
    pub fn new(repositories: RepositoryMap) -> Self {
        Self {
            repositories: Mutex::new(repositories),
        }
    }

    /// Load `repositories-<driver>`. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No repositories file, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let file: RepositoriesFile = serde_json::from_slice(&data)?;
        Ok(Self::new(file.repositories))
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryMap> {
        // A panic while holding the lock cannot leave the map half-written
        self.repositories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the map with the lock held for its whole duration.
    pub fn with_repositories<R>(&self, f: impl FnOnce(&RepositoryMap) -> R) -> R {
        let repositories = self.lock();
        f(&repositories)
    }

    pub fn get(&self, repository: &str, reference: &str) -> Option<ImageId> {
        self.lock()
            .get(repository)
            .and_then(|refs| refs.get(reference))
            .cloned()
    }

    /// Point `repository:reference` at `id`, replacing any previous target.
    pub fn set(&self, repository: &str, reference: &str, id: ImageId) {
        self.lock()
            .entry(repository.to_string())
            .or_default()
            .insert(reference.to_string(), id);
    }

    /// Remove a reference; drops the repository once it is empty.
    pub fn delete(&self, repository: &str, reference: &str) -> bool {
        let mut repositories = self.lock();
        let Some(refs) = repositories.get_mut(repository) else {
            return false;
        };
        let removed = refs.remove(reference).is_some();
        if refs.is_empty() {
            repositories.remove(repository);
        }
        removed
    }

    /// Resolve a name to an image id present in `graph`.
    ///
    /// Tries the name as a reference first (bare names mean
    /// [`DEFAULT_TAG`]), then as a full image id, then as a unique id prefix.
    pub fn resolve(&self, name: &str, graph: &ImageGraph) -> Result<ImageId> {
        if let Ok(reference) = Reference::parse(name) {
            if let Some(id) = self.get(&reference.repository, &reference.reference) {
                if graph.contains(id.as_str()) {
                    tracing::debug!(name, id = %id, "Resolved reference");
                    return Ok(id);
                }
                tracing::warn!(reference = %reference, id = %id, "Reference points at a missing image");
                return Err(GraphError::ReferenceNotFound(reference.to_string()));
            }
        }

        if let Some(node) = graph.get(name) {
            return Ok(node.id.clone());
        }

        graph.lookup_prefix(name).map(|node| node.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ImageNode;
    use chrono::Utc;

    fn store_and_graph() -> (ReferenceStore, ImageGraph) {
        let graph = ImageGraph::from_nodes([
            ImageNode::new("1a2b3c", None, Utc::now()),
            ImageNode::new("4d5e6f", None, Utc::now()),
        ]);
        let store = ReferenceStore::default();
        store.set("app", "latest", "1a2b3c".into());
        store.set("app", "v2", "4d5e6f".into());
        store.set("app", "sha256:feed", "4d5e6f".into());
        store.set("localhost:5000/tools", "1.0", "1a2b3c".into());
        (store, graph)
    }

    #[test]
    fn digest_classification_needs_algorithm_prefix() {
        assert!(is_digest("sha256:abc"));
        assert!(is_digest("tarsum.v1+sha256:abc"));
        assert!(!is_digest("v1.0"));
        assert!(!is_digest(":abc"));
        assert!(!is_digest("sha256:"));
        assert!(!is_digest("SHA256:abc"));
    }

    #[test]
    fn parse_handles_tags_digests_and_ports() {
        let r = Reference::parse("app:v2").unwrap();
        assert_eq!((r.repository.as_str(), r.reference.as_str()), ("app", "v2"));

        let r = Reference::parse("app@sha256:feed").unwrap();
        assert!(r.is_digest());
        assert_eq!(r.to_string(), "app@sha256:feed");

        let r = Reference::parse("localhost:5000/tools").unwrap();
        assert_eq!(r.repository, "localhost:5000/tools");
        assert_eq!(r.reference, DEFAULT_TAG);

        assert!(Reference::parse("app@notadigest").is_err());
        assert!(Reference::parse(":v1").is_err());
    }

    #[test]
    fn resolve_by_tag_digest_and_default() {
        let (store, graph) = store_and_graph();
        assert_eq!(store.resolve("app", &graph).unwrap().as_str(), "1a2b3c");
        assert_eq!(store.resolve("app:v2", &graph).unwrap().as_str(), "4d5e6f");
        assert_eq!(store.resolve("app@sha256:feed", &graph).unwrap().as_str(), "4d5e6f");
        assert_eq!(
            store.resolve("localhost:5000/tools:1.0", &graph).unwrap().as_str(),
            "1a2b3c"
        );
    }

    #[test]
    fn resolve_falls_back_to_ids() {
        let (store, graph) = store_and_graph();
        assert_eq!(store.resolve("4d5e6f", &graph).unwrap().as_str(), "4d5e6f");
        assert_eq!(store.resolve("1a2", &graph).unwrap().as_str(), "1a2b3c");
    }

    #[test]
    fn resolve_unknown_names_fail() {
        let (store, graph) = store_and_graph();
        for name in ["app:v9", "other", "app@sha256:0000", "ffff"] {
            assert!(
                matches!(store.resolve(name, &graph), Err(GraphError::ReferenceNotFound(_))),
                "{name} should not resolve"
            );
        }
    }

    #[test]
    fn delete_drops_empty_repositories() {
        let (store, _) = store_and_graph();
        assert!(store.delete("localhost:5000/tools", "1.0"));
        assert!(!store.delete("localhost:5000/tools", "1.0"));
        store.with_repositories(|repos| assert!(!repos.contains_key("localhost:5000/tools")));
    }

    #[test]
    fn load_reads_repositories_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repositories-vfs");
        std::fs::write(
            &path,
            r#"{"Repositories":{"busybox":{"latest":"abc","sha256:01":"abc"}}}"#,
        )
        .unwrap();

        let store = ReferenceStore::load(&path).unwrap();
        assert_eq!(store.get("busybox", "latest").unwrap().as_str(), "abc");
        assert_eq!(store.get("busybox", "sha256:01").unwrap().as_str(), "abc");

        let empty = ReferenceStore::load(&dir.path().join("missing")).unwrap();
        empty.with_repositories(|repos| assert!(repos.is_empty()));
    }
}
