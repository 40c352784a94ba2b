//! Run configuration.
//!
//! A single immutable record, built and validated once by the binary and
//! passed by reference everywhere else. Invalid flag combinations are rejected
//! here, not at point of use.

use crate::error::{PromoterError, Result};
use crate::manifest::RegistryName;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Default parallelism for both the read pool and the executor.
pub const DEFAULT_THREADS: usize = 10;

/// Snapshot output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "YAML" => Ok(OutputFormat::Yaml),
            "CSV" => Ok(OutputFormat::Csv),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for OutputFormat {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        OutputFormat::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Where manifests come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// A single fully materialized manifest file.
    File(PathBuf),
    /// A directory tree of thin manifests named `promoter-manifest.yaml`.
    ThinDir(PathBuf),
}

/// The five user-facing modes (version is handled by the CLI parser).
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Reconcile destinations with the manifests.
    Promote(ManifestSource),
    /// Read one registry and print its inventory.
    Snapshot(RegistryName),
    /// Print what a registry would hold after promotion, from manifests only.
    ManifestSnapshot {
        source: ManifestSource,
        registry: RegistryName,
    },
    /// Validate manifests and exit.
    ParseOnly(ManifestSource),
}

/// Immutable knobs for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub threads: usize,
    pub dry_run: bool,
    pub use_service_account: bool,
    pub key_files: Vec<String>,
    pub snapshot_tag: Option<String>,
    pub minimal_snapshot: bool,
    pub output_format: OutputFormat,
    pub snapshot_service_account: Option<String>,
}

impl RunConfig {
    /// Build and validate a configuration from raw CLI inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Option<PathBuf>,
        thin_manifest_dir: Option<PathBuf>,
        snapshot: Option<String>,
        manifest_based_snapshot_of: Option<String>,
        parse_only: bool,
        threads: usize,
        dry_run: bool,
        use_service_account: bool,
        key_files: Vec<String>,
        snapshot_tag: Option<String>,
        minimal_snapshot: bool,
        output_format: OutputFormat,
        snapshot_service_account: Option<String>,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(PromoterError::Config(
                "threads must be at least 1".to_string(),
            ));
        }

        if manifest.is_some() && thin_manifest_dir.is_some() {
            return Err(PromoterError::Config(
                "--manifest and --thin-manifest-dir are mutually exclusive".to_string(),
            ));
        }
        let source = manifest
            .map(ManifestSource::File)
            .or(thin_manifest_dir.map(ManifestSource::ThinDir));

        let mode = if let Some(registry) = snapshot {
            if manifest_based_snapshot_of.is_some() {
                return Err(PromoterError::Config(
                    "--snapshot and --manifest-based-snapshot-of are mutually exclusive"
                        .to_string(),
                ));
            }
            RunMode::Snapshot(registry)
        } else if let Some(registry) = manifest_based_snapshot_of {
            let source = source.ok_or_else(|| {
                PromoterError::Config(
                    "--manifest-based-snapshot-of requires --manifest or --thin-manifest-dir"
                        .to_string(),
                )
            })?;
            RunMode::ManifestSnapshot { source, registry }
        } else if parse_only {
            let source = source.ok_or_else(|| {
                PromoterError::Config(
                    "--parse-only requires --manifest or --thin-manifest-dir".to_string(),
                )
            })?;
            RunMode::ParseOnly(source)
        } else {
            let source = source.ok_or_else(|| {
                PromoterError::Config(
                    "one of --manifest, --thin-manifest-dir, --snapshot, or \
                     --manifest-based-snapshot-of is required"
                        .to_string(),
                )
            })?;
            RunMode::Promote(source)
        };

        Ok(Self {
            mode,
            threads,
            dry_run,
            use_service_account,
            key_files,
            snapshot_tag,
            minimal_snapshot,
            output_format,
            snapshot_service_account,
        })
    }
}
