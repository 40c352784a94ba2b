//! Observed registry state.
//!
//! An inventory maps image name -> digest -> tag set for one registry; the
//! master inventory covers every registry a run touches. Ordered maps keep
//! snapshot rendering deterministic without a separate sort pass.

use crate::edges::{PromotionEdge, TagOp};
use crate::manifest::{Digest, ImageName, RegistryName, Tag};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type TagSet = BTreeSet<Tag>;
pub type DigestTags = BTreeMap<Digest, TagSet>;

/// Per-registry inventory: image name -> digest -> tags.
///
/// A digest with an empty tag set is a "tagless" entry; it may be a child of
/// a manifest list and is significant for snapshot pruning.
pub type RegInvImage = BTreeMap<ImageName, DigestTags>;

/// Registry name -> inventory, for every registry named in the manifest set.
pub type MasterInventory = HashMap<RegistryName, RegInvImage>;

/// Parent manifest-list digest -> child digests, per registry.
pub type ManifestListChildren = BTreeMap<Digest, Vec<Digest>>;

/// Keep only entries carrying `tag`. Digests that lose all their tags are
/// dropped entirely, as are images left with no digests.
pub fn filter_by_tag(inv: &RegInvImage, tag: &str) -> RegInvImage {
    let mut out = RegInvImage::new();
    for (image, dmap) in inv {
        let mut kept = DigestTags::new();
        for (digest, tags) in dmap {
            if tags.contains(tag) {
                let mut only: TagSet = TagSet::new();
                only.insert(tag.to_string());
                kept.insert(digest.clone(), only);
            }
        }
        if !kept.is_empty() {
            out.insert(image.clone(), kept);
        }
    }
    out
}

/// Remove tagless digests that are children of some manifest list.
///
/// Registries surface every child of a multi-arch index as its own tagless
/// entry; a snapshot that keeps them over-reports. Tagged digests are never
/// removed, even when they appear as children.
pub fn remove_child_digest_entries(
    inv: &RegInvImage,
    children: &ManifestListChildren,
) -> RegInvImage {
    let child_set: BTreeSet<&Digest> = children.values().flatten().collect();

    let mut out = RegInvImage::new();
    for (image, dmap) in inv {
        let mut kept = DigestTags::new();
        for (digest, tags) in dmap {
            if tags.is_empty() && child_set.contains(digest) {
                continue;
            }
            kept.insert(digest.clone(), tags.clone());
        }
        if !kept.is_empty() {
            out.insert(image.clone(), kept);
        }
    }
    out
}

/// Project an edge set onto one destination registry: the inventory that
/// registry would hold if every matching edge were already promoted.
///
/// Answers "what will registry R look like after promotion?" without reading
/// R. Only Delete edges are skipped; a NoOp edge describes destination state
/// that already matches the intent and still belongs in the projection.
pub fn edges_to_reg_inv_image(
    edges: &BTreeSet<PromotionEdge>,
    destination: &str,
) -> RegInvImage {
    let mut out = RegInvImage::new();
    for edge in edges {
        if edge.dst_registry.name != destination {
            continue;
        }
        if matches!(edge.op, TagOp::Delete) {
            continue;
        }
        let dmap = out.entry(edge.dst_image.clone()).or_default();
        let tags = dmap.entry(edge.digest.clone()).or_default();
        if let Some(tag) = &edge.tag {
            tags.insert(tag.clone());
        }
    }
    out
}
