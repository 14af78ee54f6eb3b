use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::grpc::convert::target_from_proto;
use crate::proto::{scan_report::Outcome, ScanReport};
use crate::scan::{ScanCategory, ScanRecord, ScanType};
use crate::store::ScanStore;

/// Counters reported once a pipeline has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Reports handed to a category worker
    pub routed: usize,
    /// Reports discarded before reaching a worker
    pub dropped: usize,
    /// Store calls that succeeded
    pub stored: usize,
    /// Store calls that returned an error
    pub store_errors: usize,
}

impl IngestStats {
    /// Number of persistence calls issued, successful or not
    pub fn persistence_calls(&self) -> usize {
        self.stored + self.store_errors
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    stored: usize,
    store_errors: usize,
}

/// Context shared by the dispatcher and every worker of one job.
#[derive(Clone)]
struct IngestContext {
    job_id: Uuid,
    agent_id: u64,
    store: Arc<dyn ScanStore>,
    token: CancellationToken,
}

/// Fan-out of one job's report stream into per-category persistence workers.
///
/// Reports go in through [`Pipeline::send`]; [`Pipeline::join`] closes the
/// input and resolves once every routed report has been persisted or has
/// failed to persist. Cancelling the token stops all tasks early.
pub struct Pipeline {
    tx: mpsc::Sender<ScanReport>,
    handle: JoinHandle<IngestStats>,
}

impl Pipeline {
    pub fn spawn(
        job_id: Uuid,
        agent_id: u64,
        store: Arc<dyn ScanStore>,
        buffer: usize,
        token: CancellationToken,
    ) -> Self {
        let buffer = buffer.max(1);
        let ctx = IngestContext {
            job_id,
            agent_id,
            store,
            token,
        };

        let mut routes = HashMap::with_capacity(ScanCategory::ALL.len());
        let mut workers = Vec::with_capacity(ScanCategory::ALL.len());
        for category in ScanCategory::ALL {
            let (worker_tx, worker_rx) = mpsc::channel(buffer);
            routes.insert(category, worker_tx);
            workers.push(tokio::spawn(run_worker(category, worker_rx, ctx.clone())));
        }

        let (tx, rx) = mpsc::channel(buffer);
        let handle = tokio::spawn(dispatch(rx, routes, workers, ctx));
        Self { tx, handle }
    }

    /// Forward a report to the dispatcher. Gives the report back if the
    /// pipeline has already shut down.
    pub async fn send(&self, report: ScanReport) -> Result<(), ScanReport> {
        self.tx.send(report).await.map_err(|e| e.0)
    }

    /// Close the input and wait for all workers to drain.
    pub async fn join(self) -> IngestStats {
        let Self { tx, handle } = self;
        drop(tx);
        match handle.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Ingestion dispatcher failed");
                IngestStats::default()
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<ScanReport>,
    routes: HashMap<ScanCategory, mpsc::Sender<(ScanType, ScanReport)>>,
    workers: Vec<JoinHandle<WorkerStats>>,
    ctx: IngestContext,
) -> IngestStats {
    let mut stats = IngestStats::default();

    loop {
        let report = tokio::select! {
            _ = ctx.token.cancelled() => break,
            report = rx.recv() => match report {
                Some(report) => report,
                None => break,
            },
        };

        let Some(scan_type) = ScanType::from_code(report.scan_type) else {
            tracing::warn!(
                job_id = %ctx.job_id,
                agent_id = ctx.agent_id,
                scan_type = report.scan_type,
                "Unknown scan type, report dropped"
            );
            stats.dropped += 1;
            continue;
        };

        let category = scan_type.category();
        let delivered = match routes.get(&category) {
            Some(worker) => worker.send((scan_type, report)).await.is_ok(),
            None => false,
        };
        if delivered {
            stats.routed += 1;
        } else {
            tracing::warn!(
                job_id = %ctx.job_id,
                agent_id = ctx.agent_id,
                %category,
                "Worker unavailable, report dropped"
            );
            stats.dropped += 1;
        }
    }

    // Closing the routes lets each worker finish its backlog and exit.
    drop(routes);
    for worker in workers {
        match worker.await {
            Ok(worker_stats) => {
                stats.stored += worker_stats.stored;
                stats.store_errors += worker_stats.store_errors;
            }
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Ingestion worker failed");
            }
        }
    }

    tracing::debug!(
        job_id = %ctx.job_id,
        routed = stats.routed,
        dropped = stats.dropped,
        stored = stats.stored,
        store_errors = stats.store_errors,
        "Ingestion pipeline drained"
    );
    stats
}

async fn run_worker(
    category: ScanCategory,
    mut rx: mpsc::Receiver<(ScanType, ScanReport)>,
    ctx: IngestContext,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    loop {
        let (scan_type, report) = tokio::select! {
            _ = ctx.token.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if persist(category, scan_type, report, &ctx).await {
            stats.stored += 1;
        } else {
            stats.store_errors += 1;
        }
    }

    stats
}

/// Build the record for one report and hand it to the store. Returns whether
/// the store accepted it.
async fn persist(
    category: ScanCategory,
    scan_type: ScanType,
    report: ScanReport,
    ctx: &IngestContext,
) -> bool {
    let target = target_from_proto(&report.target.unwrap_or_default());

    let record = match report.outcome {
        Some(Outcome::Data(bytes)) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(data) => ScanRecord::success(ctx.job_id, ctx.agent_id, scan_type, data),
            Err(e) => {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    %category,
                    host = %target.host,
                    error = %e,
                    "Undecodable scan payload"
                );
                ScanRecord::failure(
                    ctx.job_id,
                    ctx.agent_id,
                    scan_type,
                    format!("undecodable {} payload: {}", category, e),
                )
            }
        },
        Some(Outcome::Error(error)) => {
            ScanRecord::failure(ctx.job_id, ctx.agent_id, scan_type, error)
        }
        None => ScanRecord::failure(
            ctx.job_id,
            ctx.agent_id,
            scan_type,
            "report carried no outcome",
        ),
    };

    match ctx
        .store
        .create_or_update_target_with_scan(&target, record)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                job_id = %ctx.job_id,
                agent_id = ctx.agent_id,
                %category,
                host = %target.host,
                error = %e,
                "Failed to persist scan result"
            );
            false
        }
    }
}
