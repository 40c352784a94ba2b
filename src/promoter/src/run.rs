//! Orchestration of the user-facing modes.
//!
//! Wires the loader, reader, edge engine, executor, and renderer together.
//! Each mode is one async function; the binary only parses flags, builds the
//! `RunConfig`, and forwards here.

use crate::config::{ManifestSource, OutputFormat, RunConfig, RunMode};
use crate::edges::{filter_promotion_edges, to_promotion_edges, PromotionEdge};
use crate::error::{PromoterError, Result};
use crate::executor::{EdgeResult, Executor};
use crate::inventory::{
    edges_to_reg_inv_image, filter_by_tag, remove_child_digest_entries, RegInvImage,
};
use crate::manifest::{
    self, manifests_are_empty, validate_manifest_set, Manifest, RegistryContext,
};
use crate::reader::InventoryReader;
use crate::registry::client;
use crate::registry::command::CommandRunner;
use crate::snapshot;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Hook that runs between edge filtering and execution. The vulnerability
/// scanner integrates here; the built-in set is empty.
#[async_trait]
pub trait PreCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, edges: &BTreeSet<PromotionEdge>) -> Result<()>;
}

/// What a run produced.
#[derive(Debug)]
pub enum RunOutcome {
    /// Manifests parsed and validated; nothing else requested.
    ParsedOnly,
    /// The manifest set declares no images (stub manifests only).
    NothingToDo,
    /// Rendered snapshot text, ready for stdout.
    Snapshot(String),
    /// Per-edge results of a promotion run.
    Promotion(Vec<EdgeResult>),
}

impl RunOutcome {
    pub fn failed_edges(&self) -> usize {
        match self {
            RunOutcome::Promotion(results) => results.iter().filter(|r| r.is_failure()).count(),
            _ => 0,
        }
    }
}

/// Run one mode with no pre-checks.
pub async fn run(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: Arc<AtomicBool>,
) -> Result<RunOutcome> {
    run_with_checks(config, runner, cancel, &[]).await
}

/// Run one mode, applying `checks` between filtering and execution.
pub async fn run_with_checks(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: Arc<AtomicBool>,
    checks: &[Box<dyn PreCheck>],
) -> Result<RunOutcome> {
    if config.use_service_account && !config.key_files.is_empty() {
        client::activate_service_accounts(runner.as_ref(), &config.key_files).await?;
    }

    match &config.mode {
        RunMode::ParseOnly(source) => {
            let manifests = load_manifests(source)?;
            tracing::info!("Parsed {} manifest(s)", manifests.len());
            Ok(RunOutcome::ParsedOnly)
        }
        RunMode::Snapshot(registry) => snapshot_registry(config, runner, registry).await,
        RunMode::ManifestSnapshot { source, registry } => {
            manifest_snapshot(config, runner, source, registry).await
        }
        RunMode::Promote(source) => promote(config, runner, cancel, checks, source).await,
    }
}

fn load_manifests(source: &ManifestSource) -> Result<Vec<Manifest>> {
    let manifests = match source {
        ManifestSource::File(path) => vec![manifest::parse_manifest_from_file(path)?],
        ManifestSource::ThinDir(dir) => manifest::parse_manifests_from_dir(dir, true)?,
    };
    validate_manifest_set(&manifests)?;
    Ok(manifests)
}

fn render(format: OutputFormat, inv: &RegInvImage) -> String {
    match format {
        OutputFormat::Yaml => snapshot::to_yaml(inv),
        OutputFormat::Csv => snapshot::to_csv(inv),
    }
}

async fn snapshot_registry(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    registry: &str,
) -> Result<RunOutcome> {
    let rc = RegistryContext::source(registry, config.snapshot_service_account.clone());
    let reader = InventoryReader::new(runner, config.threads, config.use_service_account);

    let scan_set = reader.read_registries(std::slice::from_ref(&rc), true).await;
    let scan = scan_set.scans.get(registry).ok_or_else(|| {
        PromoterError::Inventory {
            registry: registry.to_string(),
            reason: "registry produced no scan".to_string(),
        }
    })?;

    let mut inv = scan.inventory.clone();
    if let Some(tag) = &config.snapshot_tag {
        inv = filter_by_tag(&inv, tag);
    }
    if config.minimal_snapshot {
        tracing::info!("Removing tagless child digests of manifest lists");
        let (children, _errors) = reader.read_manifest_lists(&rc, scan).await;
        inv = remove_child_digest_entries(&inv, &children);
    }

    Ok(RunOutcome::Snapshot(render(config.output_format, &inv)))
}

async fn manifest_snapshot(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    source: &ManifestSource,
    registry: &str,
) -> Result<RunOutcome> {
    let manifests = load_manifests(source)?;
    let edges = to_promotion_edges(&manifests)?;
    let mut inv = edges_to_reg_inv_image(&edges, registry);

    if config.minimal_snapshot {
        let rc = RegistryContext::source(registry, config.snapshot_service_account.clone());
        let reader = InventoryReader::new(runner, config.threads, config.use_service_account);
        let scan_set = reader.read_registries(std::slice::from_ref(&rc), true).await;
        if let Some(scan) = scan_set.scans.get(registry) {
            let (children, _errors) = reader.read_manifest_lists(&rc, scan).await;
            inv = remove_child_digest_entries(&inv, &children);
        }
    }

    Ok(RunOutcome::Snapshot(render(config.output_format, &inv)))
}

/// Every registry the manifest set references, first declaration wins.
fn referenced_registries(manifests: &[Manifest]) -> Vec<RegistryContext> {
    let mut seen = BTreeSet::new();
    let mut registries = Vec::new();
    for manifest in manifests {
        for rc in &manifest.registries {
            if seen.insert(rc.name.clone()) {
                registries.push(rc.clone());
            }
        }
    }
    registries
}

async fn promote(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: Arc<AtomicBool>,
    checks: &[Box<dyn PreCheck>],
    source: &ManifestSource,
) -> Result<RunOutcome> {
    let manifests = load_manifests(source)?;

    if manifests_are_empty(&manifests) {
        tracing::info!("No images in manifest(s) --- nothing to do.");
        return Ok(RunOutcome::NothingToDo);
    }

    if config.dry_run {
        tracing::info!("********** START (DRY RUN) **********");
    } else {
        tracing::info!("********** START **********");
    }

    let candidates = to_promotion_edges(&manifests)?;
    tracing::info!("Derived {} candidate edge(s)", candidates.len());

    let reader = InventoryReader::new(runner.clone(), config.threads, config.use_service_account);
    let scan_set = reader
        .read_registries(&referenced_registries(&manifests), true)
        .await;
    if !scan_set.errors.is_empty() {
        tracing::warn!(
            "{} listing error(s); the inventory may be incomplete",
            scan_set.errors.len()
        );
    }

    let outcome = filter_promotion_edges(&candidates, &scan_set.master_inventory());
    if !outcome.ok {
        return Err(PromoterError::EdgeSafety(format!(
            "{} promotion edge(s) rejected during filtering: {}",
            outcome.rejected.len(),
            outcome
                .rejected
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        )));
    }

    for check in checks {
        tracing::info!("Running pre-check: {}", check.name());
        check.check(&outcome.edges).await?;
    }

    let executor = Executor::new(
        runner,
        config.threads,
        config.dry_run,
        config.use_service_account,
    )
    .with_cancel(cancel);
    let results = executor.promote(&outcome.edges).await;

    let failed = results.iter().filter(|r| r.is_failure()).count();
    if failed > 0 {
        tracing::error!("{} edge(s) failed", failed);
    }
    if config.dry_run {
        tracing::info!("********** FINISHED (DRY RUN) **********");
    } else {
        tracing::info!("********** FINISHED **********");
    }

    Ok(RunOutcome::Promotion(results))
}
