//! Snapshot rendering.
//!
//! Serializes an inventory as YAML or CSV. Output is byte-deterministic:
//! images, digests, and tags all render in lexicographic order, which the
//! ordered maps in the inventory model already guarantee.

use crate::inventory::RegInvImage;
use std::fmt::Write;

/// Render as a YAML sequence of `{name, dmap}` entries.
///
/// Digest keys are double-quoted (they contain `:`); a tagless digest renders
/// as an empty flow sequence.
pub fn to_yaml(inv: &RegInvImage) -> String {
    let mut out = String::new();
    for (image, dmap) in inv {
        let _ = writeln!(out, "- name: {}", image);
        if dmap.is_empty() {
            let _ = writeln!(out, "  dmap: {{}}");
            continue;
        }
        let _ = writeln!(out, "  dmap:");
        for (digest, tags) in dmap {
            if tags.is_empty() {
                let _ = writeln!(out, "    \"{}\": []", digest);
            } else {
                let _ = writeln!(out, "    \"{}\":", digest);
                for tag in tags {
                    let _ = writeln!(out, "    - {}", tag);
                }
            }
        }
    }
    out
}

/// Render as CSV with an `image,digest,tag` header.
///
/// One row per (image, digest, tag); tagless digests contribute a row with an
/// empty tag column. The value grammar (image paths, digests, tags) excludes
/// commas and quotes, so no field ever needs escaping.
pub fn to_csv(inv: &RegInvImage) -> String {
    let mut out = String::from("image,digest,tag\n");
    for (image, dmap) in inv {
        for (digest, tags) in dmap {
            if tags.is_empty() {
                let _ = writeln!(out, "{},{},", image, digest);
            } else {
                for tag in tags {
                    let _ = writeln!(out, "{},{},{}", image, digest, tag);
                }
            }
        }
    }
    out
}
