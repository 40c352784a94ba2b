//! promoter binary: flag parsing and process exit codes. All real work lives
//! in the library.

use clap::Parser;
use promoter::config::{OutputFormat, RunConfig, DEFAULT_THREADS};
use promoter::registry::command::SubprocessRunner;
use promoter::run::RunOutcome;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "promoter",
    version,
    about = "Promote container images from staging registries to production registries"
)]
struct Args {
    /// The manifest file to load
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Recursively read all thin manifests named 'promoter-manifest.yaml'
    /// under this directory
    #[arg(long = "thin-manifest-dir")]
    thin_manifest_dir: Option<PathBuf>,

    /// Read all images in a repository and print them to stdout
    #[arg(long)]
    snapshot: Option<String>,

    /// Print all images the manifests would promote to the given registry,
    /// without reading it
    #[arg(long = "manifest-based-snapshot-of")]
    manifest_based_snapshot_of: Option<String>,

    /// Only check that the given manifests parse and validate
    #[arg(long = "parse-only")]
    parse_only: bool,

    /// Number of concurrent workers for registry reads and writes
    #[arg(long, default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Print what would happen without modifying any registry
    #[arg(long = "dry-run", default_value_t = true, action = clap::ArgAction::Set)]
    dry_run: bool,

    /// Pass '--account=...' to every registry CLI call
    #[arg(long = "use-service-account")]
    use_service_account: bool,

    /// Comma-separated service account key files to activate before promoting
    #[arg(long = "key-files", value_delimiter = ',')]
    key_files: Vec<String>,

    /// Only snapshot images carrying this tag
    #[arg(long = "snapshot-tag")]
    snapshot_tag: Option<String>,

    /// Discard tagless digests referenced by a manifest list from snapshots
    #[arg(long = "minimal-snapshot")]
    minimal_snapshot: bool,

    /// Snapshot output format: YAML or CSV (unknown values fall back to YAML)
    #[arg(long = "output-format", default_value = "YAML")]
    output_format: String,

    /// Service account identity used when reading for a snapshot
    #[arg(long = "snapshot-service-account")]
    snapshot_service_account: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let output_format = match OutputFormat::from_str(&args.output_format) {
        Ok(format) => format,
        Err(_) => {
            tracing::warn!(
                "Invalid value '{}' for --output-format; defaulting to YAML",
                args.output_format
            );
            OutputFormat::Yaml
        }
    };

    let config = match RunConfig::new(
        args.manifest,
        args.thin_manifest_dir,
        args.snapshot,
        args.manifest_based_snapshot_of,
        args.parse_only,
        args.threads,
        args.dry_run,
        args.use_service_account,
        args.key_files,
        args.snapshot_tag,
        args.minimal_snapshot,
        output_format,
        args.snapshot_service_account,
    ) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; finishing in-flight commands");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let runner = Arc::new(SubprocessRunner);
    match promoter::run(&config, runner, cancel).await {
        Ok(RunOutcome::Snapshot(text)) => {
            print!("{}", text);
        }
        Ok(outcome) => {
            let failed = outcome.failed_edges();
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }
}
