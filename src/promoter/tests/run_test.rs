//! Integration tests for the orchestrator
//!
//! Drives the run modes end to end over a scripted registry CLI: parse-only,
//! promotion (dry and wet), safety refusal, and snapshots including the
//! manifest-list prune.

use async_trait::async_trait;
use promoter::config::{OutputFormat, RunConfig};
use promoter::error::{PromoterError, Result};
use promoter::executor::EdgeStatus;
use promoter::registry::command::{CommandOutput, CommandRunner, Invocation};
use promoter::run::RunOutcome;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn digest(c: char) -> String {
    format!("sha256:{}", c.to_string().repeat(64))
}

fn cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

/// Scripted registry CLI: read commands answer from a canned argv -> stdout
/// map, write commands are recorded and succeed.
#[derive(Default)]
struct FakeRegistryCli {
    responses: HashMap<String, String>,
    writes: Mutex<Vec<Invocation>>,
}

impl FakeRegistryCli {
    fn respond(&mut self, argv: &str, stdout: &str) {
        self.responses.insert(argv.to_string(), stdout.to_string());
    }

    fn writes(&self) -> Vec<Invocation> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRegistryCli {
    async fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<CommandOutput> {
        if invocation.argv.iter().any(|a| a == "add-tag" || a == "untag") {
            self.writes.lock().unwrap().push(invocation.clone());
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        match self.responses.get(&invocation.to_string()) {
            Some(stdout) => Ok(CommandOutput {
                exit_code: 0,
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            None => Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("unknown repository: {}", invocation),
            }),
        }
    }
}

/// Panics if any command is issued.
struct NoCommandsRunner;

#[async_trait]
impl CommandRunner for NoCommandsRunner {
    async fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<CommandOutput> {
        panic!("no command expected, got: {}", invocation);
    }
}

fn write_manifest(dir: &Path, tags: &str, d: char) -> std::path::PathBuf {
    let path = dir.join("promoter-manifest.yaml");
    std::fs::write(
        &path,
        format!(
            r#"registries:
- name: gcr.io/stage
  src: true
- name: gcr.io/prod
images:
- name: app
  dmap:
    "{}": {}
"#,
            digest(d),
            tags
        ),
    )
    .unwrap();
    path
}

fn promotion_config(manifest: std::path::PathBuf, dry_run: bool) -> RunConfig {
    RunConfig::new(
        Some(manifest),
        None,
        None,
        None,
        false,
        4,
        dry_run,
        false,
        Vec::new(),
        None,
        false,
        OutputFormat::Yaml,
        None,
    )
    .unwrap()
}

fn stage_and_prod_responses(cli: &mut FakeRegistryCli, stage_tags_json: &str) {
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/stage",
        r#"[{"name": "gcr.io/stage/app"}]"#,
    );
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/stage/app",
        "[]",
    );
    cli.respond(
        "gcloud --quiet container images list-tags --format=json gcr.io/stage/app",
        stage_tags_json,
    );
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/prod",
        "[]",
    );
}

#[tokio::test]
async fn test_parse_only_reads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), r#"["v1"]"#, 'a');

    let config = RunConfig::new(
        Some(manifest),
        None,
        None,
        None,
        true,
        4,
        true,
        false,
        Vec::new(),
        None,
        false,
        OutputFormat::Yaml,
        None,
    )
    .unwrap();

    let outcome = promoter::run(&config, Arc::new(NoCommandsRunner), cancel_flag())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::ParsedOnly));
}

#[tokio::test]
async fn test_stub_manifest_promotion_is_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promoter-manifest.yaml");
    std::fs::write(
        &path,
        r#"registries:
- name: gcr.io/stage
  src: true
- name: gcr.io/prod
"#,
    )
    .unwrap();

    let config = promotion_config(path, true);
    let outcome = promoter::run(&config, Arc::new(NoCommandsRunner), cancel_flag())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::NothingToDo));
}

#[tokio::test]
async fn test_promotion_wet_run_invokes_one_write() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), r#"["v1"]"#, 'a');

    let mut cli = FakeRegistryCli::default();
    stage_and_prod_responses(
        &mut cli,
        &format!(r#"[{{"digest": "{}", "tags": ["v1"]}}]"#, digest('a')),
    );
    let cli = Arc::new(cli);

    let config = promotion_config(manifest, false);
    let outcome = promoter::run(&config, cli.clone(), cancel_flag())
        .await
        .unwrap();

    let RunOutcome::Promotion(results) = outcome else {
        panic!("expected promotion outcome");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, EdgeStatus::Ok);
    assert_eq!(outcome_failed(&results), 0);

    let writes = cli.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].to_string(),
        format!(
            "gcloud --quiet container images add-tag gcr.io/stage/app@{} gcr.io/prod/app:v1",
            digest('a')
        )
    );
}

fn outcome_failed(results: &[promoter::executor::EdgeResult]) -> usize {
    results.iter().filter(|r| r.is_failure()).count()
}

#[tokio::test]
async fn test_promotion_dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), r#"["v1"]"#, 'a');

    let mut cli = FakeRegistryCli::default();
    stage_and_prod_responses(
        &mut cli,
        &format!(r#"[{{"digest": "{}", "tags": ["v1"]}}]"#, digest('a')),
    );
    let cli = Arc::new(cli);

    let config = promotion_config(manifest, true);
    let outcome = promoter::run(&config, cli.clone(), cancel_flag())
        .await
        .unwrap();

    let RunOutcome::Promotion(results) = outcome else {
        panic!("expected promotion outcome");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, EdgeStatus::SkippedDryRun);
    assert!(cli.writes().is_empty());
}

#[tokio::test]
async fn test_promotion_refuses_on_missing_source_digest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), r#"["v1"]"#, 'c');

    let mut cli = FakeRegistryCli::default();
    // Source registry exists but holds a different digest.
    stage_and_prod_responses(
        &mut cli,
        &format!(r#"[{{"digest": "{}", "tags": ["v1"]}}]"#, digest('a')),
    );
    let cli = Arc::new(cli);

    let config = promotion_config(manifest, false);
    let err = promoter::run(&config, cli.clone(), cancel_flag())
        .await
        .unwrap_err();

    assert!(matches!(err, PromoterError::EdgeSafety(_)), "got: {}", err);
    assert!(err.to_string().contains(&digest('c')), "got: {}", err);
    assert!(cli.writes().is_empty(), "no writes after a refusal");
}

#[tokio::test]
async fn test_registry_snapshot_renders_yaml() {
    let mut cli = FakeRegistryCli::default();
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/test",
        r#"[{"name": "gcr.io/test/a"}, {"name": "gcr.io/test/b"}]"#,
    );
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/test/a",
        "[]",
    );
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/test/b",
        "[]",
    );
    cli.respond(
        "gcloud --quiet container images list-tags --format=json gcr.io/test/a",
        r#"[{"digest": "sha256:11", "tags": []}]"#,
    );
    cli.respond(
        "gcloud --quiet container images list-tags --format=json gcr.io/test/b",
        r#"[{"digest": "sha256:22", "tags": ["t2"]}]"#,
    );

    let config = RunConfig::new(
        None,
        None,
        Some("gcr.io/test".to_string()),
        None,
        false,
        4,
        true,
        false,
        Vec::new(),
        None,
        false,
        OutputFormat::Yaml,
        None,
    )
    .unwrap();

    let outcome = promoter::run(&config, Arc::new(cli), cancel_flag())
        .await
        .unwrap();
    let RunOutcome::Snapshot(text) = outcome else {
        panic!("expected snapshot outcome");
    };
    assert_eq!(
        text,
        "- name: a\n  dmap:\n    \"sha256:11\": []\n- name: b\n  dmap:\n    \"sha256:22\":\n    - t2\n"
    );
}

#[tokio::test]
async fn test_minimal_snapshot_prunes_manifest_list_children() {
    let mut cli = FakeRegistryCli::default();
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/test",
        r#"[{"name": "gcr.io/test/multi"}]"#,
    );
    cli.respond(
        "gcloud --quiet container images list --format=json --repository=gcr.io/test/multi",
        "[]",
    );
    cli.respond(
        "gcloud --quiet container images list-tags --format=json gcr.io/test/multi",
        &format!(
            r#"[
  {{"digest": "{}", "tags": ["v1"], "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json"}},
  {{"digest": "{}", "tags": []}}
]"#,
            digest('p'),
            digest('q')
        ),
    );
    cli.respond(
        &format!(
            "gcloud --quiet container images describe --format=json gcr.io/test/multi@{}",
            digest('p')
        ),
        &format!(r#"{{"manifests": [{{"digest": "{}"}}]}}"#, digest('q')),
    );

    let config = RunConfig::new(
        None,
        None,
        Some("gcr.io/test".to_string()),
        None,
        false,
        4,
        true,
        false,
        Vec::new(),
        None,
        true,
        OutputFormat::Yaml,
        None,
    )
    .unwrap();

    let outcome = promoter::run(&config, Arc::new(cli), cancel_flag())
        .await
        .unwrap();
    let RunOutcome::Snapshot(text) = outcome else {
        panic!("expected snapshot outcome");
    };
    // The tagless child digest is gone; the tagged parent stays.
    assert!(text.contains(&digest('p')));
    assert!(!text.contains(&digest('q')));
}

#[tokio::test]
async fn test_manifest_based_snapshot_needs_no_registry_reads() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), r#"["v1"]"#, 'a');

    let config = RunConfig::new(
        Some(manifest),
        None,
        None,
        Some("gcr.io/prod".to_string()),
        false,
        4,
        true,
        false,
        Vec::new(),
        None,
        false,
        OutputFormat::Csv,
        None,
    )
    .unwrap();

    let outcome = promoter::run(&config, Arc::new(NoCommandsRunner), cancel_flag())
        .await
        .unwrap();
    let RunOutcome::Snapshot(text) = outcome else {
        panic!("expected snapshot outcome");
    };
    assert_eq!(text, format!("image,digest,tag\napp,{},v1\n", digest('a')));
}
