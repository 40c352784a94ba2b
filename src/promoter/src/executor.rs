//! Worker-pool execution of promotion edges.
//!
//! A dispatcher feeds the filtered edge set into a work channel; N workers
//! drain it, render the write command for each edge, and report a per-edge
//! outcome. Completed writes are never rolled back.

use crate::edges::{PromotionEdge, TagOp};
use crate::registry::client;
use crate::registry::command::{run_with_retry, CommandRunner, Invocation, WRITE_TIMEOUT};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

/// Outcome of one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeStatus {
    /// The write command ran and exited zero.
    Ok,
    /// The write command failed (after retries, if transient).
    Failed(String),
    /// Dry-run: the command was computed and logged, not spawned.
    SkippedDryRun,
    /// Destination already matches the intent; nothing was spawned.
    SkippedNoOp,
}

/// Per-edge report entry. `command` is the invocation that ran or, under
/// dry-run, would have run; NoOp edges carry no command.
#[derive(Debug, Clone)]
pub struct EdgeResult {
    pub edge: PromotionEdge,
    pub status: EdgeStatus,
    pub command: Option<Invocation>,
}

impl EdgeResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, EdgeStatus::Failed(_))
    }
}

type DestKey = (String, String);
type KeyLocks = StdMutex<HashMap<DestKey, Arc<Mutex<()>>>>;

/// Fixed-parallelism promotion executor.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    threads: usize,
    dry_run: bool,
    use_service_account: bool,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        threads: usize,
        dry_run: bool,
        use_service_account: bool,
    ) -> Self {
        Self {
            runner,
            threads: threads.max(1),
            dry_run,
            use_service_account,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use an externally owned cancellation flag (the binary wires Ctrl-C to
    /// this).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shared flag that stops the dispatcher and lets workers wind down after
    /// their current command.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Execute the filtered edge set and report one result per edge.
    ///
    /// Edges on distinct (destination registry, destination image) keys run in
    /// any order; edges sharing a key serialize on a per-key mutex held across
    /// the write so tag moves cannot race.
    pub async fn promote(&self, edges: &BTreeSet<PromotionEdge>) -> Vec<EdgeResult> {
        let (work_tx, work_rx) = mpsc::channel::<PromotionEdge>(self.threads);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<EdgeResult>();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let key_locks: Arc<KeyLocks> = Arc::new(StdMutex::new(HashMap::new()));

        let dispatcher = {
            let cancel = self.cancel.clone();
            let edges: Vec<PromotionEdge> = edges.iter().cloned().collect();
            tokio::spawn(async move {
                for edge in edges {
                    if cancel.load(Ordering::SeqCst) {
                        tracing::warn!("Cancellation requested; dispatcher stopping");
                        break;
                    }
                    if work_tx.send(edge).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(self.threads);
        for _ in 0..self.threads {
            let runner = self.runner.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let key_locks = key_locks.clone();
            let dry_run = self.dry_run;
            let use_service_account = self.use_service_account;

            workers.push(tokio::spawn(async move {
                loop {
                    let edge = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(edge) = edge else {
                        break;
                    };
                    let result = execute_edge(
                        runner.as_ref(),
                        edge,
                        dry_run,
                        use_service_account,
                        &key_locks,
                    )
                    .await;
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let _ = dispatcher.await;
        for worker in workers {
            let _ = worker.await;
        }

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        // Workers finish in arbitrary order; sort for a stable report.
        results.sort_by(|a, b| a.edge.cmp(&b.edge));
        results
    }
}

fn key_lock_for(key_locks: &KeyLocks, key: DestKey) -> Arc<Mutex<()>> {
    let mut locks = match key_locks.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    };
    locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

async fn execute_edge(
    runner: &dyn CommandRunner,
    edge: PromotionEdge,
    dry_run: bool,
    use_service_account: bool,
    key_locks: &KeyLocks,
) -> EdgeResult {
    if edge.op == TagOp::NoOp {
        tracing::info!("Already promoted: {}", edge);
        return EdgeResult {
            edge,
            status: EdgeStatus::SkippedNoOp,
            command: None,
        };
    }

    let invocation = client::write_cmd(&edge, use_service_account);

    if dry_run {
        tracing::info!("[DRY RUN] Would run: {}", invocation);
        return EdgeResult {
            edge,
            status: EdgeStatus::SkippedDryRun,
            command: Some(invocation),
        };
    }

    let key = (edge.dst_registry.name.clone(), edge.dst_image.clone());
    let lock = key_lock_for(key_locks, key);
    // Held across the write: conflicting tag operations on one destination
    // image must observe each other.
    let _guard = lock.lock().await;

    tracing::info!("Promoting: {}", edge);
    let status = match run_with_retry(runner, &invocation, WRITE_TIMEOUT).await {
        Ok(output) if output.success() => EdgeStatus::Ok,
        Ok(output) => {
            let reason = output.stderr.trim().to_string();
            tracing::error!("Edge failed: {}: {}", edge, reason);
            EdgeStatus::Failed(reason)
        }
        Err(e) => {
            tracing::error!("Edge failed: {}: {}", edge, e);
            EdgeStatus::Failed(e.to_string())
        }
    };

    EdgeResult {
        edge,
        status,
        command: Some(invocation),
    }
}
