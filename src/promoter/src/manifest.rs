//! Promotion manifest data model and loader.
//!
//! A manifest declares which image digests should exist in which destination
//! registries and under which tags. Manifests are read once at startup and are
//! immutable afterwards; the rest of the pipeline only borrows them.

use crate::error::{PromoterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name that directory walks look for.
pub const MANIFEST_FILE_NAME: &str = "promoter-manifest.yaml";

pub type RegistryName = String;
pub type ImageName = String;
pub type Digest = String;
pub type Tag = String;

/// A registry reference: repository path plus the identity used to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegistryContext {
    pub name: RegistryName,

    #[serde(rename = "service-account", default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Exactly one registry per manifest is the promotion source.
    #[serde(default)]
    pub src: bool,
}

impl RegistryContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_account: None,
            src: false,
        }
    }

    pub fn source(name: impl Into<String>, service_account: Option<String>) -> Self {
        Self {
            name: name.into(),
            service_account,
            src: true,
        }
    }
}

impl fmt::Display for RegistryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One image: a short name and its digest -> tags mapping.
///
/// Digests are the primary key; tags are movable labels. An entry with an
/// empty tag list promotes the digest without tagging it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: ImageName,
    pub dmap: BTreeMap<Digest, Vec<Tag>>,
}

/// A fully materialized promotion manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub registries: Vec<RegistryContext>,

    #[serde(default)]
    pub images: Vec<Image>,

    /// Where this manifest was loaded from; used in conflict reports.
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

/// Thin manifest form: the images list lives in a sibling file.
#[derive(Debug, Deserialize)]
struct ThinManifest {
    registries: Vec<RegistryContext>,

    #[serde(rename = "imagesPath", default)]
    images_path: Option<String>,
}

impl Manifest {
    /// The registry marked `src: true`. Validation guarantees there is exactly
    /// one, so this only returns `None` for hand-built unvalidated manifests.
    pub fn source_registry(&self) -> Option<&RegistryContext> {
        self.registries.iter().find(|r| r.src)
    }

    /// All destination registries, in declaration order.
    pub fn destination_registries(&self) -> impl Iterator<Item = &RegistryContext> {
        self.registries.iter().filter(|r| !r.src)
    }

    fn origin(&self) -> String {
        self.file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }

    /// Per-manifest invariants: exactly one source registry, well-formed
    /// digests and tags, and no tag bound to two digests of the same image.
    pub fn validate(&self) -> Result<()> {
        let src_count = self.registries.iter().filter(|r| r.src).count();
        if src_count != 1 {
            return Err(PromoterError::Load(format!(
                "{}: expected exactly 1 source registry, found {}",
                self.origin(),
                src_count
            )));
        }

        for image in &self.images {
            let mut tag_owner: HashMap<&str, &str> = HashMap::new();
            for (digest, tags) in &image.dmap {
                if !is_valid_digest(digest) {
                    return Err(PromoterError::Load(format!(
                        "{}: image '{}' has malformed digest '{}'",
                        self.origin(),
                        image.name,
                        digest
                    )));
                }
                for tag in tags {
                    if !is_valid_tag(tag) {
                        return Err(PromoterError::Load(format!(
                            "{}: image '{}' has malformed tag '{}'",
                            self.origin(),
                            image.name,
                            tag
                        )));
                    }
                    if let Some(other) = tag_owner.insert(tag.as_str(), digest.as_str()) {
                        if other != digest.as_str() {
                            return Err(PromoterError::Load(format!(
                                "{}: image '{}' binds tag '{}' to both {} and {}",
                                self.origin(),
                                image.name,
                                tag,
                                other,
                                digest
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// `sha256:` followed by 64 lowercase hex characters.
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
        None => false,
    }
}

/// Registry tag grammar: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn is_valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() || b == b'_' => {}
        _ => return false,
    }
    tag.len() <= 128
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// Parse a single fully materialized manifest file.
pub fn parse_manifest_from_file(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PromoterError::Load(format!("{}: {}", path.display(), e))
    })?;
    let mut manifest: Manifest = serde_yaml::from_str(&content).map_err(|e| {
        PromoterError::Load(format!("{}: {}", path.display(), e))
    })?;
    manifest.file_path = Some(path.to_path_buf());
    manifest.validate()?;
    Ok(manifest)
}

/// Parse a thin manifest file, resolving its `imagesPath` relative to the
/// manifest's own directory. A thin manifest without `imagesPath` is a stub
/// (a registry declared ahead of its first promotion) and loads with an empty
/// image list.
pub fn parse_thin_manifest_from_file(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PromoterError::Load(format!("{}: {}", path.display(), e))
    })?;
    let thin: ThinManifest = serde_yaml::from_str(&content).map_err(|e| {
        PromoterError::Load(format!("{}: {}", path.display(), e))
    })?;

    let images = match &thin.images_path {
        None => Vec::new(),
        Some(rel) => {
            let images_file = path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(rel);
            let images_content = std::fs::read_to_string(&images_file).map_err(|e| {
                PromoterError::Load(format!(
                    "{}: imagesPath {}: {}",
                    path.display(),
                    images_file.display(),
                    e
                ))
            })?;
            serde_yaml::from_str::<Vec<Image>>(&images_content).map_err(|e| {
                PromoterError::Load(format!("{}: {}", images_file.display(), e))
            })?
        }
    };

    let manifest = Manifest {
        registries: thin.registries,
        images,
        file_path: Some(path.to_path_buf()),
    };
    manifest.validate()?;
    Ok(manifest)
}

/// Recursively collect every `promoter-manifest.yaml` under `dir`.
fn walk_manifest_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            found.extend(walk_manifest_files(&path)?);
        } else if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE_NAME) {
            found.push(path);
        }
    }
    Ok(found)
}

/// Parse every manifest under a directory tree and validate the merged set.
///
/// `thin` selects the thin-manifest schema for every file. Files are parsed in
/// sorted path order so conflict reports are stable.
pub fn parse_manifests_from_dir(dir: &Path, thin: bool) -> Result<Vec<Manifest>> {
    let mut files = walk_manifest_files(dir).map_err(|e| {
        PromoterError::Load(format!("{}: {}", dir.display(), e))
    })?;
    files.sort();

    if files.is_empty() {
        return Err(PromoterError::Load(format!(
            "no {} files found under {}",
            MANIFEST_FILE_NAME,
            dir.display()
        )));
    }

    let mut manifests = Vec::with_capacity(files.len());
    for file in &files {
        let manifest = if thin {
            parse_thin_manifest_from_file(file)?
        } else {
            parse_manifest_from_file(file)?
        };
        manifests.push(manifest);
    }
    tracing::debug!("Loaded {} manifest(s) from {}", manifests.len(), dir.display());

    validate_manifest_set(&manifests)?;
    Ok(manifests)
}

/// Cross-manifest invariant: no two manifests may bind the same (destination
/// registry, image, tag) to different digests. The conflict report names both
/// offending files.
pub fn validate_manifest_set(manifests: &[Manifest]) -> Result<()> {
    // (dest registry, image, tag) -> (digest, declaring file)
    let mut bindings: HashMap<(String, String, String), (String, String)> = HashMap::new();

    for manifest in manifests {
        let origin = manifest.origin();
        for dest in manifest.destination_registries() {
            for image in &manifest.images {
                for (digest, tags) in &image.dmap {
                    for tag in tags {
                        let key = (dest.name.clone(), image.name.clone(), tag.clone());
                        match bindings.get(&key) {
                            Some((existing_digest, existing_origin))
                                if existing_digest != digest =>
                            {
                                return Err(PromoterError::Conflict(format!(
                                    "{}/{}:{} is bound to {} (in {}) and {} (in {})",
                                    dest.name,
                                    image.name,
                                    tag,
                                    existing_digest,
                                    existing_origin,
                                    digest,
                                    origin
                                )));
                            }
                            _ => {
                                bindings.insert(key, (digest.clone(), origin.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// True when no manifest in the set declares any image (a stub-only set).
pub fn manifests_are_empty(manifests: &[Manifest]) -> bool {
    manifests.iter().all(|m| m.images.is_empty())
}
