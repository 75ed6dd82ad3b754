//! Filtered image listings.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use glob::{MatchOptions, Pattern};
use serde::Serialize;

use super::reference::{image_reference, is_digest, ReferenceStore};
use super::{ImageGraph, ImageId, ImageNode};
use crate::error::{GraphError, Result};

/// Placeholder tag for images no repository points at.
pub const NONE_TAG: &str = "<none>:<none>";
/// Placeholder digest for images no repository points at.
pub const NONE_DIGEST: &str = "<none>@<none>";

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One row of an image listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: ImageId,
    pub parent_id: Option<ImageId>,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    /// Unix seconds
    pub created: i64,
    pub size: i64,
    /// Size of the layer plus all of its ancestors
    pub virtual_size: i64,
    pub labels: BTreeMap<String, String>,
}

/// `label=key` or `label=key=value` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPredicate {
    pub key: String,
    pub value: Option<String>,
}

impl LabelPredicate {
    pub fn parse(s: &str) -> Result<Self> {
        let (key, value) = match s.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (s, None),
        };
        if key.is_empty() {
            return Err(GraphError::InvalidFilter(format!(
                "label filter '{s}' has no key"
            )));
        }
        Ok(Self {
            key: key.to_string(),
            value,
        })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match (&self.value, labels.get(&self.key)) {
            (Some(want), Some(have)) => want == have,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Parsed `--filter key=value` arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageFilters {
    pub dangling: bool,
    pub labels: Vec<LabelPredicate>,
}

impl ImageFilters {
    /// Accepted keys are `dangling` and `label`.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut filters = Self::default();

        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                GraphError::InvalidFilter(format!("'{arg}' is not of the form key=value"))
            })?;

            match key {
                "dangling" => match value.to_ascii_lowercase().as_str() {
                    "true" | "1" => filters.dangling = true,
                    "false" | "0" => {}
                    _ => {
                        return Err(GraphError::InvalidFilter(format!(
                            "invalid dangling value '{value}'"
                        )));
                    }
                },
                "label" => filters.labels.push(LabelPredicate::parse(value)?),
                _ => return Err(GraphError::InvalidFilter(format!("Invalid filter '{key}'"))),
            }
        }

        Ok(filters)
    }

    /// All label predicates must hold; no predicates always holds.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|p| p.matches(labels))
    }
}

/// `name[:tag]` glob pair applied to repositories and their refs.
#[derive(Debug, Clone)]
pub struct NamePattern {
    name: Pattern,
    tag: Option<Pattern>,
}

impl NamePattern {
    pub fn parse(s: &str) -> Result<Self> {
        let (name, tag) = match s.rsplit_once(':') {
            Some((n, t)) if !t.contains('/') => (n, Some(t)),
            _ => (s, None),
        };

        let compile = |p: &str| {
            Pattern::new(p)
                .map_err(|e| GraphError::InvalidFilter(format!("bad pattern '{p}': {e}")))
        };

        Ok(Self {
            name: compile(name)?,
            tag: tag.filter(|t| !t.is_empty()).map(compile).transpose()?,
        })
    }

    pub fn matches_repository(&self, repository: &str) -> bool {
        self.name.matches_with(repository, GLOB_OPTIONS)
    }

    pub fn matches_reference(&self, reference: &str) -> bool {
        self.tag
            .as_ref()
            .is_none_or(|t| t.matches_with(reference, GLOB_OPTIONS))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Include intermediate layers, not only heads
    pub all: bool,
    pub filters: ImageFilters,
    pub pattern: Option<NamePattern>,
}

/// Produces listings from a reference store and the graph it points into.
pub struct ImageLister<'a> {
    graph: &'a ImageGraph,
    references: &'a ReferenceStore,
}

impl<'a> ImageLister<'a> {
    pub fn new(graph: &'a ImageGraph, references: &'a ReferenceStore) -> Self {
        Self { graph, references }
    }

    pub fn list(&self, options: &ListOptions) -> Vec<ImageSummary> {
        let filters = &options.filters;
        let dangling = filters.dangling;

        let mut unclaimed: BTreeSet<ImageId> = if options.all && !dangling {
            self.graph.nodes().map(|n| n.id.clone()).collect()
        } else {
            self.graph.heads()
        };

        let mut rows: Vec<ImageSummary> = Vec::new();
        let mut row_index: HashMap<ImageId, usize> = HashMap::new();

        self.references.with_repositories(|repositories| {
            for (repository, refs) in repositories {
                if let Some(pattern) = &options.pattern {
                    if !pattern.matches_repository(repository) {
                        continue;
                    }
                }

                for (reference, id) in refs {
                    if let Some(pattern) = &options.pattern {
                        if !pattern.matches_reference(reference) {
                            continue;
                        }
                    }

                    let image_ref = image_reference(repository, reference);
                    let Some(node) = self.graph.get(id.as_str()) else {
                        tracing::warn!(id = %id, reference = %image_ref, "Couldn't load image, skipping");
                        continue;
                    };

                    if let Some(&i) = row_index.get(id) {
                        push_reference(&mut rows[i], reference, image_ref);
                        continue;
                    }

                    unclaimed.remove(id);
                    if dangling || !filters.matches_labels(&node.labels) {
                        continue;
                    }

                    let Some(mut row) = self.summarize(node) else {
                        continue;
                    };
                    push_reference(&mut row, reference, image_ref);
                    row_index.insert(id.clone(), rows.len());
                    rows.push(row);
                }
            }
        });

        if options.pattern.is_none() || !filters.labels.is_empty() {
            for id in &unclaimed {
                let Some(node) = self.graph.get(id.as_str()) else {
                    continue;
                };
                if !filters.matches_labels(&node.labels) {
                    continue;
                }
                let Some(mut row) = self.summarize(node) else {
                    continue;
                };
                if !dangling {
                    row.repo_tags.push(NONE_TAG.to_string());
                    row.repo_digests.push(NONE_DIGEST.to_string());
                }
                rows.push(row);
            }
        }

        rows.sort_by(|a, b| b.created.cmp(&a.created));
        rows
    }

    fn summarize(&self, node: &ImageNode) -> Option<ImageSummary> {
        let parents_size = match self.graph.parents_size(node.id.as_str()) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(id = %node.id, error = %e, "Couldn't compute image size, skipping");
                return None;
            }
        };

        Some(ImageSummary {
            id: node.id.clone(),
            parent_id: node.parent.clone(),
            repo_tags: Vec::new(),
            repo_digests: Vec::new(),
            created: node.created.timestamp(),
            size: node.size,
            virtual_size: parents_size + node.size,
            labels: node.labels.clone(),
        })
    }
}

fn push_reference(row: &mut ImageSummary, reference: &str, image_ref: String) {
    if is_digest(reference) {
        row.repo_digests.push(image_ref);
    } else {
        row.repo_tags.push(image_ref);
    }
}
