//! Promotion edge derivation and filtering.
//!
//! An edge is one atomic unit of intended work: make `digest` exist in the
//! destination registry under `tag` (or untagged). Candidates are derived from
//! the manifests alone, then filtered against the observed inventory to decide
//! what actually has to happen.

use crate::error::PromoterError;
use crate::inventory::{DigestTags, MasterInventory};
use crate::manifest::{Digest, ImageName, Manifest, RegistryContext, Tag};
use std::collections::BTreeSet;
use std::fmt;

/// What to do with the destination tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagOp {
    /// Copy the digest and/or attach the tag; the destination tag is free.
    Add,
    /// The destination tag exists on a different digest and must be moved.
    Move,
    /// Destination already matches the intent; nothing to execute.
    NoOp,
    /// Remove the destination tag.
    Delete,
}

impl fmt::Display for TagOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TagOp::Add => "add",
            TagOp::Move => "move",
            TagOp::NoOp => "noop",
            TagOp::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// One atomic promotion intent. Immutable once filtered; the executor only
/// reads these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromotionEdge {
    pub src_registry: RegistryContext,
    pub src_image: ImageName,
    pub dst_registry: RegistryContext,
    pub dst_image: ImageName,
    pub digest: Digest,
    /// `None` promotes the bare digest without tagging it.
    pub tag: Option<Tag>,
    pub op: TagOp,
}

impl fmt::Display for PromotionEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(
                f,
                "{}/{}@{} -> {}/{}:{} ({})",
                self.src_registry.name,
                self.src_image,
                self.digest,
                self.dst_registry.name,
                self.dst_image,
                tag,
                self.op
            ),
            None => write!(
                f,
                "{}/{}@{} -> {}/{} ({})",
                self.src_registry.name,
                self.src_image,
                self.digest,
                self.dst_registry.name,
                self.dst_image,
                self.op
            ),
        }
    }
}

/// Result of filtering candidates against observed registry state.
#[derive(Debug)]
pub struct FilterOutcome {
    /// Surviving edges, with their op rewritten to match reality.
    pub edges: BTreeSet<PromotionEdge>,
    /// Human-readable rejection reasons, one per unsafe edge.
    pub rejected: Vec<PromoterError>,
    /// False when any edge was rejected; the run must refuse to execute.
    pub ok: bool,
}

/// Derive candidate edges from the manifest set.
///
/// Every destination x image x (digest, tag) entry yields one Add candidate;
/// entries without tags yield a single untagged candidate. The BTreeSet
/// collapses duplicates declared across manifests.
pub fn to_promotion_edges(manifests: &[Manifest]) -> crate::error::Result<BTreeSet<PromotionEdge>> {
    let mut edges = BTreeSet::new();

    for manifest in manifests {
        let src = manifest.source_registry().ok_or_else(|| {
            PromoterError::Load("manifest has no source registry".to_string())
        })?;

        for dest in manifest.destination_registries() {
            for image in &manifest.images {
                for (digest, tags) in &image.dmap {
                    if tags.is_empty() {
                        edges.insert(PromotionEdge {
                            src_registry: src.clone(),
                            src_image: image.name.clone(),
                            dst_registry: dest.clone(),
                            dst_image: image.name.clone(),
                            digest: digest.clone(),
                            tag: None,
                            op: TagOp::Add,
                        });
                        continue;
                    }
                    for tag in tags {
                        edges.insert(PromotionEdge {
                            src_registry: src.clone(),
                            src_image: image.name.clone(),
                            dst_registry: dest.clone(),
                            dst_image: image.name.clone(),
                            digest: digest.clone(),
                            tag: Some(tag.clone()),
                            op: TagOp::Add,
                        });
                    }
                }
            }
        }
    }

    Ok(edges)
}

/// Which digest (if any) currently carries `tag` in this image.
fn digest_holding_tag<'a>(dmap: &'a DigestTags, tag: &str) -> Option<&'a Digest> {
    dmap.iter()
        .find(|(_, tags)| tags.contains(tag))
        .map(|(digest, _)| digest)
}

/// Classify each candidate against the observed destination state.
///
/// Pure over (edges, inventory): filtering a filtered set against the same
/// inventory reproduces it. Rejected edges are excluded from the output and
/// flip `ok` to false; they never reach the executor.
pub fn filter_promotion_edges(
    candidates: &BTreeSet<PromotionEdge>,
    inventory: &MasterInventory,
) -> FilterOutcome {
    let mut edges = BTreeSet::new();
    let mut rejected = Vec::new();

    for candidate in candidates {
        // The source must actually hold the digest; promoting a phantom digest
        // can silently break a tag move halfway through.
        let src_has_digest = inventory
            .get(&candidate.src_registry.name)
            .and_then(|inv| inv.get(&candidate.src_image))
            .map(|dmap| dmap.contains_key(&candidate.digest))
            .unwrap_or(false);

        if !src_has_digest {
            tracing::error!(
                "Rejecting edge {}: digest not found in source registry {}",
                candidate,
                candidate.src_registry.name
            );
            rejected.push(PromoterError::EdgeSafety(format!(
                "{}: digest {} not found in source registry {}",
                candidate, candidate.digest, candidate.src_registry.name
            )));
            continue;
        }

        let dst_dmap = inventory
            .get(&candidate.dst_registry.name)
            .and_then(|inv| inv.get(&candidate.dst_image));

        let dst_has_digest = dst_dmap
            .map(|dmap| dmap.contains_key(&candidate.digest))
            .unwrap_or(false);

        let op = match &candidate.tag {
            None => {
                if dst_has_digest {
                    TagOp::NoOp
                } else {
                    TagOp::Add
                }
            }
            Some(tag) => match dst_dmap.and_then(|dmap| digest_holding_tag(dmap, tag)) {
                Some(holder) if holder == &candidate.digest => TagOp::NoOp,
                Some(holder) => {
                    tracing::info!(
                        "Tag {}/{}:{} moves from {} to {}",
                        candidate.dst_registry.name,
                        candidate.dst_image,
                        tag,
                        holder,
                        candidate.digest
                    );
                    TagOp::Move
                }
                None => TagOp::Add,
            },
        };

        let mut edge = candidate.clone();
        edge.op = op;
        edges.insert(edge);
    }

    let ok = rejected.is_empty();
    FilterOutcome { edges, rejected, ok }
}
