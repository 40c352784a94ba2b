//! Registry CLI client.
//!
//! Builds `gcloud` invocations for the read and write command families and
//! parses their JSON stdout. The client is stateless; invocations can be built
//! and run from any number of workers.

use crate::edges::{PromotionEdge, TagOp};
use crate::error::{PromoterError, Result};
use crate::manifest::Digest;
use crate::registry::command::{run_with_retry, CommandRunner, Invocation, LIST_TIMEOUT};
use serde::Deserialize;

/// The registry-native CLI this tool drives.
pub const REGISTRY_CLI: &str = "gcloud";

/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image index (the OCI spelling of a manifest list).
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Is this media type a multi-arch parent whose children show up as tagless
/// digests in listings?
pub fn is_manifest_list(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_IMAGE_INDEX
}

/// Fully qualified image name: pinned by digest.
pub fn fqin(registry: &str, image: &str, digest: &str) -> String {
    format!("{}/{}@{}", registry, image, digest)
}

/// Partially qualified image name: addressed by tag.
pub fn pqin(registry: &str, image: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry, image, tag)
}

fn with_account(mut argv: Vec<String>, account: Option<&str>) -> Invocation {
    if let Some(account) = account {
        argv.push(format!("--account={}", account));
    }
    Invocation { argv }
}

fn account_for(service_account: Option<&String>, use_service_account: bool) -> Option<&str> {
    if use_service_account {
        service_account.map(|s| s.as_str())
    } else {
        None
    }
}

/// List the direct child repositories of `registry[/repo]`.
pub fn list_children_cmd(
    registry: &str,
    repo: &str,
    service_account: Option<&String>,
    use_service_account: bool,
) -> Invocation {
    let repository = if repo.is_empty() {
        registry.to_string()
    } else {
        format!("{}/{}", registry, repo)
    };
    let argv = vec![
        REGISTRY_CLI.to_string(),
        "--quiet".to_string(),
        "container".to_string(),
        "images".to_string(),
        "list".to_string(),
        "--format=json".to_string(),
        format!("--repository={}", repository),
    ];
    with_account(argv, account_for(service_account, use_service_account))
}

/// List every digest (and its tags and media type) of one image path.
pub fn list_tags_cmd(
    registry: &str,
    image: &str,
    service_account: Option<&String>,
    use_service_account: bool,
) -> Invocation {
    let argv = vec![
        REGISTRY_CLI.to_string(),
        "--quiet".to_string(),
        "container".to_string(),
        "images".to_string(),
        "list-tags".to_string(),
        "--format=json".to_string(),
        format!("{}/{}", registry, image),
    ];
    with_account(argv, account_for(service_account, use_service_account))
}

/// Fetch the manifest of one digest; for manifest lists the JSON carries the
/// child digests.
pub fn read_manifest_list_cmd(
    registry: &str,
    image: &str,
    digest: &str,
    service_account: Option<&String>,
    use_service_account: bool,
) -> Invocation {
    let argv = vec![
        REGISTRY_CLI.to_string(),
        "--quiet".to_string(),
        "container".to_string(),
        "images".to_string(),
        "describe".to_string(),
        "--format=json".to_string(),
        fqin(registry, image, digest),
    ];
    with_account(argv, account_for(service_account, use_service_account))
}

/// Render the write command for one filtered edge.
///
/// Add and Move are both a tag overwrite at the destination (the registry
/// moves the tag atomically on overwrite); untagged promotions address the
/// destination by digest. Delete removes the destination tag and never touches
/// the source.
pub fn write_cmd(edge: &PromotionEdge, use_service_account: bool) -> Invocation {
    let source = fqin(&edge.src_registry.name, &edge.src_image, &edge.digest);
    let account = account_for(edge.dst_registry.service_account.as_ref(), use_service_account);

    let argv = match (edge.op, &edge.tag) {
        (TagOp::Delete, Some(tag)) => vec![
            REGISTRY_CLI.to_string(),
            "--quiet".to_string(),
            "container".to_string(),
            "images".to_string(),
            "untag".to_string(),
            pqin(&edge.dst_registry.name, &edge.dst_image, tag),
        ],
        (_, Some(tag)) => vec![
            REGISTRY_CLI.to_string(),
            "--quiet".to_string(),
            "container".to_string(),
            "images".to_string(),
            "add-tag".to_string(),
            source,
            pqin(&edge.dst_registry.name, &edge.dst_image, tag),
        ],
        (_, None) => vec![
            REGISTRY_CLI.to_string(),
            "--quiet".to_string(),
            "container".to_string(),
            "images".to_string(),
            "add-tag".to_string(),
            source,
            fqin(&edge.dst_registry.name, &edge.dst_image, &edge.digest),
        ],
    };

    with_account(argv, account)
}

/// One entry of `list-tags --format=json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct ListedDigest {
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "mediaType")]
    pub media_type: Option<String>,
}

/// Parse `list-tags` stdout.
pub fn parse_list_tags(stdout: &str) -> Result<Vec<ListedDigest>> {
    serde_json::from_str(stdout).map_err(PromoterError::Json)
}

#[derive(Debug, Deserialize)]
struct ListedRepo {
    name: String,
}

/// Parse `list --repository=...` stdout into repo paths relative to the
/// registry root.
pub fn parse_list_children(stdout: &str, registry: &str) -> Result<Vec<String>> {
    let repos: Vec<ListedRepo> = serde_json::from_str(stdout)?;
    let prefix = format!("{}/", registry);
    Ok(repos
        .into_iter()
        .map(|r| match r.name.strip_prefix(&prefix) {
            Some(rel) => rel.to_string(),
            None => r.name,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct ManifestListEntry {
    digest: Digest,
}

#[derive(Debug, Deserialize)]
struct ManifestListDoc {
    #[serde(default)]
    manifests: Vec<ManifestListEntry>,
}

/// Parse a fetched manifest-list document into its child digests.
pub fn parse_manifest_list(stdout: &str) -> Result<Vec<Digest>> {
    let doc: ManifestListDoc = serde_json::from_str(stdout)?;
    Ok(doc.manifests.into_iter().map(|m| m.digest).collect())
}

/// Activate the given service-account key files.
///
/// This is the whole interface to the credential collaborator: one CLI call
/// per key file, ambient state owned by the CLI itself.
pub async fn activate_service_accounts(
    runner: &dyn CommandRunner,
    key_files: &[String],
) -> Result<()> {
    for key_file in key_files {
        let invocation = Invocation {
            argv: vec![
                REGISTRY_CLI.to_string(),
                "--quiet".to_string(),
                "auth".to_string(),
                "activate-service-account".to_string(),
                format!("--key-file={}", key_file),
            ],
        };
        let output = run_with_retry(runner, &invocation, LIST_TIMEOUT).await?;
        if !output.success() {
            return Err(PromoterError::Config(format!(
                "failed to activate service account from {}: {}",
                key_file,
                output.stderr.trim()
            )));
        }
        tracing::info!("Activated service account from {}", key_file);
    }
    Ok(())
}
