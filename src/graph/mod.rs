//! Content-addressable image graph.
//!
//! Reads the legacy Docker graph layout, where every image lives in
//! `<root>/graph/<id>/` with a `json` metadata document and an optional
//! `layersize` file. The whole graph is loaded once; broken entries are
//! logged and left out.

pub mod list;
pub mod reference;

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Immutable content-hash identifier of one image layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as shown in listings.
    pub fn short(&self) -> &str {
        let hex = self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h);
        match hex.char_indices().nth(12) {
            Some((end, _)) => &hex[..end],
            None => hex,
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ImageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Metadata for a single node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageNode {
    pub id: ImageId,
    pub parent: Option<ImageId>,
    pub created: DateTime<Utc>,
    /// Size of this layer alone, in bytes
    pub size: i64,
    /// Labels from the container config that produced the layer
    pub labels: BTreeMap<String, String>,
}

impl ImageNode {
    pub fn new(id: impl Into<ImageId>, parent: Option<ImageId>, created: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            parent,
            created,
            size: 0,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---- On-disk `json` document ----

#[derive(Deserialize)]
struct RawImage {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    created: DateTime<Utc>,
    #[serde(default)]
    container_config: Option<RawContainerConfig>,
    #[serde(rename = "Size", default)]
    size: Option<i64>,
}

#[derive(Deserialize)]
struct RawContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// In-memory view of every image node in the store.
#[derive(Debug, Default)]
pub struct ImageGraph {
    nodes: BTreeMap<ImageId, ImageNode>,
}

impl ImageGraph {
    /// Load every node under `graph_dir` (usually `<root>/graph`).
    ///
    /// A missing directory yields an empty graph.
    pub fn open(graph_dir: &Path) -> Result<Self> {
        let mut graph = Self::default();

        let entries = match std::fs::read_dir(graph_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %graph_dir.display(), "No graph directory, starting empty");
                return Ok(graph);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Interrupted registrations leave `_tmp` directories behind
            if name.starts_with('_') || !entry.file_type()?.is_dir() {
                continue;
            }

            match load_node(&entry.path()) {
                Ok(node) if node.id.as_str() == name => graph.insert(node),
                Ok(node) => {
                    tracing::warn!(dir = %name, id = %node.id, "Image id does not match its directory, skipping");
                }
                Err(e) => {
                    tracing::warn!(id = %name, error = %e, "Couldn't load image, skipping");
                }
            }
        }

        tracing::debug!(images = graph.len(), "Loaded image graph");
        Ok(graph)
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = ImageNode>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.insert(node);
        }
        graph
    }

    /// Insert or replace a node. An id always maps to a single node.
    pub fn insert(&mut self, node: ImageNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &str) -> Option<&ImageNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ImageNode> {
        self.nodes.values()
    }

    /// Find the single node whose id starts with `prefix`.
    pub fn lookup_prefix(&self, prefix: &str) -> Result<&ImageNode> {
        let prefix = prefix.strip_prefix("sha256:").unwrap_or(prefix);
        if prefix.is_empty() {
            return Err(GraphError::ReferenceNotFound(prefix.to_string()));
        }

        let mut matches = self
            .nodes
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(id, _)| id.as_str().starts_with(prefix))
            .map(|(_, node)| node);

        match (matches.next(), matches.next()) {
            (Some(node), None) => Ok(node),
            (Some(_), Some(_)) => Err(GraphError::ReferenceNotFound(format!(
                "{prefix} (ambiguous id prefix)"
            ))),
            (None, _) => Err(GraphError::ReferenceNotFound(prefix.to_string())),
        }
    }

    /// Images that are not the parent of any other image.
    pub fn heads(&self) -> BTreeSet<ImageId> {
        let parents: BTreeSet<&ImageId> = self
            .nodes
            .values()
            .filter_map(|node| node.parent.as_ref())
            .collect();

        self.nodes
            .keys()
            .filter(|id| !parents.contains(id))
            .cloned()
            .collect()
    }

    /// Ids from the root layer down to `id`, inclusive.
    pub fn ancestor_chain(&self, id: &str) -> Result<Vec<ImageId>> {
        let mut node = self
            .get(id)
            .ok_or_else(|| GraphError::ReferenceNotFound(id.to_string()))?;
        let mut chain = vec![node.id.clone()];

        while let Some(parent) = &node.parent {
            if chain.len() > self.nodes.len() {
                return Err(GraphError::CorruptGraph(format!("parent chain of {id} loops")));
            }
            node = self.get(parent.as_str()).ok_or_else(|| {
                GraphError::CorruptGraph(format!("{} refers to missing parent {parent}", node.id))
            })?;
            chain.push(node.id.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Cumulative size of every ancestor of `id`, excluding `id` itself.
    pub fn parents_size(&self, id: &str) -> Result<i64> {
        let chain = self.ancestor_chain(id)?;
        Ok(chain[..chain.len() - 1]
            .iter()
            .filter_map(|ancestor| self.get(ancestor.as_str()))
            .map(|node| node.size)
            .sum())
    }
}

fn load_node(dir: &Path) -> Result<ImageNode> {
    let data = std::fs::read(dir.join("json"))?;
    let raw: RawImage = serde_json::from_slice(&data)?;

    let size = match std::fs::read_to_string(dir.join("layersize")) {
        Ok(s) => s.trim().parse::<i64>().unwrap_or_else(|_| raw.size.unwrap_or(0)),
        Err(_) => raw.size.unwrap_or(0),
    };

    let labels = raw
        .container_config
        .and_then(|c| c.labels)
        .map(|l| l.into_iter().collect())
        .unwrap_or_default();

    Ok(ImageNode {
        id: ImageId::new(raw.id),
        parent: raw.parent.filter(|p| !p.is_empty()).map(ImageId::new),
        created: raw.created,
        size,
        labels,
    })
}
