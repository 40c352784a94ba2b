//! Inventory read pool.
//!
//! Populates the master inventory by recursively listing registries. Listing
//! failures are logged and accumulated but never abort the run on their own;
//! a hole in the inventory surfaces later as a per-edge safety rejection.

use crate::error::{PromoterError, Result};
use crate::inventory::{ManifestListChildren, MasterInventory, RegInvImage, TagSet};
use crate::manifest::{Digest, ImageName, RegistryContext, RegistryName};
use crate::registry::client;
use crate::registry::command::{run_with_retry, CommandRunner, LIST_TIMEOUT};
use futures::stream::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Everything one registry listing produced: the inventory plus the media
/// types seen per digest (needed to find manifest-list parents later).
#[derive(Debug, Default)]
pub struct RegistryScan {
    pub inventory: RegInvImage,
    pub media_types: BTreeMap<(ImageName, Digest), String>,
}

impl RegistryScan {
    /// Digests whose listed media type marks them as manifest lists.
    pub fn manifest_list_parents(&self) -> Vec<(ImageName, Digest)> {
        self.media_types
            .iter()
            .filter(|(_, media_type)| client::is_manifest_list(media_type))
            .map(|((image, digest), _)| (image.clone(), digest.clone()))
            .collect()
    }
}

/// All registry scans of one run plus the accumulated listing errors.
#[derive(Debug, Default)]
pub struct ScanSet {
    pub scans: HashMap<RegistryName, RegistryScan>,
    pub errors: Vec<PromoterError>,
}

impl ScanSet {
    pub fn master_inventory(&self) -> MasterInventory {
        self.scans
            .iter()
            .map(|(name, scan)| (name.clone(), scan.inventory.clone()))
            .collect()
    }
}

/// Concurrent registry reader. Stateless apart from its knobs; one instance
/// serves a whole run.
pub struct InventoryReader {
    runner: Arc<dyn CommandRunner>,
    threads: usize,
    use_service_account: bool,
}

struct RepoListing {
    digests: Vec<client::ListedDigest>,
    children: Vec<String>,
}

impl InventoryReader {
    pub fn new(runner: Arc<dyn CommandRunner>, threads: usize, use_service_account: bool) -> Self {
        Self {
            runner,
            threads: threads.max(1),
            use_service_account,
        }
    }

    /// Read every given registry into a fresh `ScanSet`.
    ///
    /// One task per registry; all listing commands across registries share one
    /// semaphore so total subprocess concurrency stays at `threads`.
    pub async fn read_registries(
        &self,
        registries: &[RegistryContext],
        recursive: bool,
    ) -> ScanSet {
        let semaphore = Arc::new(Semaphore::new(self.threads));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();

        for rc in registries {
            let rc = rc.clone();
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let use_service_account = self.use_service_account;
            let threads = self.threads;
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let (scan, errors) = scan_registry(
                    runner.as_ref(),
                    &rc,
                    recursive,
                    threads,
                    semaphore,
                    use_service_account,
                )
                .await;
                let _ = tx.send((rc.name.clone(), scan, errors));
            }));
        }
        drop(tx);

        let mut set = ScanSet::default();
        while let Some((name, scan, errors)) = rx.recv().await {
            tracing::info!(
                "Read registry {}: {} image(s), {} error(s)",
                name,
                scan.inventory.len(),
                errors.len()
            );
            set.scans.insert(name, scan);
            set.errors.extend(errors);
        }
        for handle in handles {
            let _ = handle.await;
        }
        set
    }

    /// Second pass: fetch the children of every manifest-list digest the scan
    /// saw. Returns parent -> children for the prune step.
    pub async fn read_manifest_lists(
        &self,
        rc: &RegistryContext,
        scan: &RegistryScan,
    ) -> (ManifestListChildren, Vec<PromoterError>) {
        let parents = scan.manifest_list_parents();
        tracing::debug!(
            "Fetching {} manifest list(s) from {}",
            parents.len(),
            rc.name
        );

        let results = futures::stream::iter(parents.into_iter().map(|(image, digest)| {
            let runner = self.runner.clone();
            let rc = rc.clone();
            let use_service_account = self.use_service_account;
            async move {
                let invocation = client::read_manifest_list_cmd(
                    &rc.name,
                    &image,
                    &digest,
                    rc.service_account.as_ref(),
                    use_service_account,
                );
                let children = async {
                    let output =
                        run_with_retry(runner.as_ref(), &invocation, LIST_TIMEOUT).await?;
                    if !output.success() {
                        return Err(PromoterError::Inventory {
                            registry: rc.name.clone(),
                            reason: format!(
                                "manifest fetch for {}@{} failed: {}",
                                image,
                                digest,
                                output.stderr.trim()
                            ),
                        });
                    }
                    client::parse_manifest_list(&output.stdout)
                }
                .await;
                (digest, children)
            }
        }))
        .buffer_unordered(self.threads)
        .collect::<Vec<_>>()
        .await;

        let mut children_map = ManifestListChildren::new();
        let mut errors = Vec::new();
        for (digest, result) in results {
            match result {
                Ok(children) => {
                    children_map.insert(digest, children);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    errors.push(e);
                }
            }
        }
        (children_map, errors)
    }
}

/// Breadth-first listing of one registry.
///
/// The frontier starts at the registry root (children only, no tags); every
/// listed repo contributes its digests and, when `recursive`, its children to
/// the next frontier.
async fn scan_registry(
    runner: &dyn CommandRunner,
    rc: &RegistryContext,
    recursive: bool,
    threads: usize,
    semaphore: Arc<Semaphore>,
    use_service_account: bool,
) -> (RegistryScan, Vec<PromoterError>) {
    let mut scan = RegistryScan::default();
    let mut errors = Vec::new();
    let mut frontier: Vec<String> = vec![String::new()];

    while !frontier.is_empty() {
        let batch: Vec<String> = std::mem::take(&mut frontier);
        let results = futures::stream::iter(batch.into_iter().map(|repo| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                // List children at the root always (the root itself holds no
                // tags) and below the root only when recursing.
                let want_children = repo.is_empty() || recursive;
                let listing = list_repo(runner, rc, &repo, want_children, use_service_account).await;
                (repo, listing)
            }
        }))
        .buffer_unordered(threads)
        .collect::<Vec<_>>()
        .await;

        for (repo, listing) in results {
            match listing {
                Ok(RepoListing { digests, children }) => {
                    if !repo.is_empty() {
                        merge_digests(&mut scan, &repo, digests);
                    }
                    frontier.extend(children);
                }
                Err(e) => {
                    tracing::warn!("Listing {}/{} failed: {}", rc.name, repo, e);
                    errors.push(e);
                }
            }
        }
    }

    (scan, errors)
}

fn merge_digests(scan: &mut RegistryScan, image: &str, digests: Vec<client::ListedDigest>) {
    let dmap = scan.inventory.entry(image.to_string()).or_default();
    for entry in digests {
        let tags: TagSet = entry.tags.into_iter().collect();
        dmap.entry(entry.digest.clone()).or_default().extend(tags);
        if let Some(media_type) = entry.media_type {
            scan.media_types
                .insert((image.to_string(), entry.digest), media_type);
        }
    }
}

async fn list_repo(
    runner: &dyn CommandRunner,
    rc: &RegistryContext,
    repo: &str,
    want_children: bool,
    use_service_account: bool,
) -> Result<RepoListing> {
    let mut digests = Vec::new();
    if !repo.is_empty() {
        let invocation =
            client::list_tags_cmd(&rc.name, repo, rc.service_account.as_ref(), use_service_account);
        let output = run_with_retry(runner, &invocation, LIST_TIMEOUT).await?;
        if !output.success() {
            return Err(PromoterError::Inventory {
                registry: rc.name.clone(),
                reason: format!("list-tags {} failed: {}", repo, output.stderr.trim()),
            });
        }
        digests = client::parse_list_tags(&output.stdout)?;
    }

    let mut children = Vec::new();
    if want_children {
        let invocation = client::list_children_cmd(
            &rc.name,
            repo,
            rc.service_account.as_ref(),
            use_service_account,
        );
        let output = run_with_retry(runner, &invocation, LIST_TIMEOUT).await?;
        if !output.success() {
            return Err(PromoterError::Inventory {
                registry: rc.name.clone(),
                reason: format!("list {} failed: {}", repo, output.stderr.trim()),
            });
        }
        children = client::parse_list_children(&output.stdout, &rc.name)?;
    }

    Ok(RepoListing { digests, children })
}
