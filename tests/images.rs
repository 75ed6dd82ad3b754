use std::fs;
use std::path::Path;

use graphtool::graph::list::{ImageFilters, ImageLister, ListOptions, NamePattern, NONE_TAG};
use graphtool::graph::reference::ReferenceStore;
use graphtool::graph::ImageGraph;
use graphtool::GraphError;
use serde_json::json;

const BASE: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const APP: &str = "2222222222222222222222222222222222222222222222222222222222222222";
const TOOLS: &str = "3333333333333333333333333333333333333333333333333333333333333333";
const ORPHAN: &str = "4444444444444444444444444444444444444444444444444444444444444444";
const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn write_image(graph_dir: &Path, id: &str, parent: Option<&str>, created: &str, size: i64, labels: serde_json::Value) {
    let dir = graph_dir.join(id);
    fs::create_dir_all(&dir).unwrap();
    let doc = json!({
        "id": id,
        "parent": parent,
        "created": created,
        "container_config": { "Labels": labels },
    });
    fs::write(dir.join("json"), serde_json::to_vec(&doc).unwrap()).unwrap();
    fs::write(dir.join("layersize"), size.to_string()).unwrap();
}

/// base <- app (app:v1, app:v2, digest), base <- tools (tools:latest),
/// orphan with no references.
fn store(root: &Path) -> (ImageGraph, ReferenceStore) {
    let graph_dir = root.join("graph");
    write_image(&graph_dir, BASE, None, "2024-01-01T00:00:00Z", 100, json!(null));
    write_image(&graph_dir, APP, Some(BASE), "2024-03-01T00:00:00Z", 20, json!({"tier": "web"}));
    write_image(&graph_dir, TOOLS, Some(BASE), "2024-02-01T00:00:00Z", 5, json!({"tier": "ops"}));
    write_image(&graph_dir, ORPHAN, None, "2024-04-01T00:00:00Z", 1, json!(null));
    fs::create_dir_all(graph_dir.join("_tmp")).unwrap();

    let repositories = json!({
        "Repositories": {
            "app": { "v1": APP, "v2": APP, DIGEST: APP },
            "tools": { "latest": TOOLS },
        }
    });
    fs::write(root.join("repositories-vfs"), serde_json::to_vec(&repositories).unwrap()).unwrap();

    let graph = ImageGraph::open(&graph_dir).unwrap();
    let references = ReferenceStore::load(&root.join("repositories-vfs")).unwrap();
    (graph, references)
}

#[test]
fn tags_of_one_image_share_a_row() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, references) = store(dir.path());
    assert_eq!(graph.len(), 4);

    let rows = ImageLister::new(&graph, &references).list(&ListOptions::default());
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![ORPHAN, APP, TOOLS]);

    let app = &rows[1];
    assert_eq!(app.repo_tags, vec!["app:v1", "app:v2"]);
    assert_eq!(app.repo_digests, vec![format!("app@{DIGEST}")]);
    assert_eq!(app.virtual_size, 120);
    assert_eq!(rows[0].repo_tags, vec![NONE_TAG]);
}

#[test]
fn all_includes_intermediate_layers() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, references) = store(dir.path());

    let options = ListOptions {
        all: true,
        ..Default::default()
    };
    let rows = ImageLister::new(&graph, &references).list(&options);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.last().unwrap().id.as_str(), BASE);
}

#[test]
fn dangling_lists_unreferenced_heads_only() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, references) = store(dir.path());

    let options = ListOptions {
        all: true,
        filters: ImageFilters::parse(&["dangling=true"]).unwrap(),
        ..Default::default()
    };
    let rows = ImageLister::new(&graph, &references).list(&options);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id.as_str(), ORPHAN);
    assert!(rows[0].repo_tags.is_empty());
}

#[test]
fn label_filter_and_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, references) = store(dir.path());
    let lister = ImageLister::new(&graph, &references);

    let by_label = ListOptions {
        filters: ImageFilters::parse(&["label=tier=ops"]).unwrap(),
        ..Default::default()
    };
    let rows = lister.list(&by_label);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].repo_tags, vec!["tools:latest"]);

    let by_tag = ListOptions {
        pattern: Some(NamePattern::parse("app:v2").unwrap()),
        ..Default::default()
    };
    let rows = lister.list(&by_tag);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].repo_tags, vec!["app:v2"]);
}

#[test]
fn unknown_filter_is_rejected() {
    assert!(matches!(
        ImageFilters::parse(&["before=app"]),
        Err(GraphError::InvalidFilter(_))
    ));
}

#[test]
fn names_resolve_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, references) = store(dir.path());

    assert_eq!(references.resolve("app:v1", &graph).unwrap().as_str(), APP);
    assert_eq!(references.resolve("tools", &graph).unwrap().as_str(), TOOLS);
    assert_eq!(references.resolve("4444", &graph).unwrap().as_str(), ORPHAN);
    assert!(matches!(
        references.resolve("app", &graph),
        Err(GraphError::ReferenceNotFound(_))
    ));
}
