//! Unit tests for snapshot rendering and inventory transforms
//!
//! Byte-exact YAML/CSV output, determinism under input reordering, tag
//! filtering, manifest-list child pruning, and edge projection.

use promoter::edges::to_promotion_edges;
use promoter::inventory::{
    edges_to_reg_inv_image, filter_by_tag, remove_child_digest_entries, ManifestListChildren,
    RegInvImage, TagSet,
};
use promoter::manifest::{Image, Manifest, RegistryContext};
use promoter::snapshot::{to_csv, to_yaml};
use std::collections::BTreeMap;

fn inv(entries: &[(&str, &str, &[&str])]) -> RegInvImage {
    let mut out = RegInvImage::new();
    for (image, digest, tags) in entries {
        let tag_set: TagSet = tags.iter().map(|t| t.to_string()).collect();
        out.entry(image.to_string())
            .or_default()
            .entry(digest.to_string())
            .or_default()
            .extend(tag_set);
    }
    out
}

#[test]
fn test_yaml_rendering_is_byte_exact() {
    // Input declared b-first; output must come back sorted.
    let inventory = inv(&[
        ("b", "sha256:22", &["t2"]),
        ("a", "sha256:11", &[]),
    ]);

    let expected = "- name: a\n  dmap:\n    \"sha256:11\": []\n- name: b\n  dmap:\n    \"sha256:22\":\n    - t2\n";
    assert_eq!(to_yaml(&inventory), expected);
}

#[test]
fn test_yaml_sorts_digests_and_tags() {
    let inventory = inv(&[
        ("app", "sha256:bb", &["z", "a"]),
        ("app", "sha256:aa", &["latest"]),
    ]);

    let expected = "- name: app\n  dmap:\n    \"sha256:aa\":\n    - latest\n    \"sha256:bb\":\n    - a\n    - z\n";
    assert_eq!(to_yaml(&inventory), expected);
}

#[test]
fn test_csv_rendering() {
    let inventory = inv(&[
        ("b", "sha256:22", &["t2"]),
        ("a", "sha256:11", &[]),
    ]);

    let expected = "image,digest,tag\na,sha256:11,\nb,sha256:22,t2\n";
    assert_eq!(to_csv(&inventory), expected);
}

#[test]
fn test_rendering_is_deterministic_under_reordering() {
    let forward = inv(&[
        ("a", "sha256:11", &["x", "y"]),
        ("b", "sha256:22", &["t2"]),
    ]);
    let reversed = inv(&[
        ("b", "sha256:22", &["t2"]),
        ("a", "sha256:11", &["y", "x"]),
    ]);

    assert_eq!(to_yaml(&forward), to_yaml(&reversed));
    assert_eq!(to_csv(&forward), to_csv(&reversed));
    // Two renders of the same inventory are byte-identical.
    assert_eq!(to_yaml(&forward), to_yaml(&forward));
}

#[test]
fn test_filter_by_tag_keeps_only_matching_entries() {
    let inventory = inv(&[
        ("app", "sha256:11", &["v1", "latest"]),
        ("app", "sha256:22", &["v2"]),
        ("db", "sha256:33", &[]),
    ]);

    let filtered = filter_by_tag(&inventory, "v1");
    assert_eq!(filtered.len(), 1);
    let dmap = &filtered["app"];
    assert_eq!(dmap.len(), 1);
    assert!(dmap["sha256:11"].contains("v1"));
    // Other tags on the matching digest are dropped from the view.
    assert!(!dmap["sha256:11"].contains("latest"));
}

#[test]
fn test_prune_removes_only_tagless_children() {
    let inventory = inv(&[
        ("app", "sha256:parent", &["v1"]),
        ("app", "sha256:child1", &[]),
        ("app", "sha256:child2", &["pinned"]),
        ("app", "sha256:orphan", &[]),
    ]);
    let mut children = ManifestListChildren::new();
    children.insert(
        "sha256:parent".to_string(),
        vec!["sha256:child1".to_string(), "sha256:child2".to_string()],
    );

    let pruned = remove_child_digest_entries(&inventory, &children);
    let dmap = &pruned["app"];
    // Tagless child removed; tagged child kept; unrelated tagless digest kept.
    assert!(!dmap.contains_key("sha256:child1"));
    assert!(dmap.contains_key("sha256:child2"));
    assert!(dmap.contains_key("sha256:orphan"));
    assert!(dmap.contains_key("sha256:parent"));

    // No remaining tagless digest is a child of any manifest list.
    let child_set: Vec<&String> = children.values().flatten().collect();
    for (digest, tags) in dmap {
        if tags.is_empty() {
            assert!(!child_set.contains(&digest));
        }
    }
}

#[test]
fn test_projection_onto_destination_registry() {
    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    let mut dmap = BTreeMap::new();
    dmap.insert(digest('a'), vec!["v1".to_string(), "latest".to_string()]);
    dmap.insert(digest('b'), Vec::new());
    let manifests = vec![Manifest {
        registries: vec![
            RegistryContext::source("gcr.io/stage", None),
            RegistryContext::new("gcr.io/prod"),
            RegistryContext::new("gcr.io/prod-eu"),
        ],
        images: vec![Image {
            name: "app".to_string(),
            dmap,
        }],
        file_path: None,
    }];

    let edges = to_promotion_edges(&manifests).unwrap();
    let projected = edges_to_reg_inv_image(&edges, "gcr.io/prod");

    assert_eq!(projected.len(), 1);
    let dmap = &projected["app"];
    assert_eq!(dmap[&digest('a')].len(), 2);
    assert!(dmap[&digest('b')].is_empty());

    // Projection answers for one registry only.
    let other = edges_to_reg_inv_image(&edges, "gcr.io/prod-eu");
    assert_eq!(other.len(), 1);
    let none = edges_to_reg_inv_image(&edges, "gcr.io/unknown");
    assert!(none.is_empty());
}

#[test]
fn test_projection_retains_noop_edges() {
    use promoter::edges::{PromotionEdge, TagOp};

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    fn edge(d: char, tag: Option<&str>, op: TagOp) -> PromotionEdge {
        PromotionEdge {
            src_registry: RegistryContext::source("gcr.io/stage", None),
            src_image: "app".to_string(),
            dst_registry: RegistryContext::new("gcr.io/prod"),
            dst_image: "app".to_string(),
            digest: digest(d),
            tag: tag.map(String::from),
            op,
        }
    }

    // A NoOp edge is destination state that already matches the intent; the
    // projected inventory must include it.
    let edges: std::collections::BTreeSet<PromotionEdge> = [
        edge('a', Some("v1"), TagOp::NoOp),
        edge('b', Some("v2"), TagOp::Add),
        edge('c', Some("old"), TagOp::Delete),
    ]
    .into_iter()
    .collect();

    let projected = edges_to_reg_inv_image(&edges, "gcr.io/prod");
    let dmap = &projected["app"];
    assert!(dmap[&digest('a')].contains("v1"));
    assert!(dmap[&digest('b')].contains("v2"));
    // Only Delete edges are excluded from the projection.
    assert!(!dmap.contains_key(&digest('c')));
}
