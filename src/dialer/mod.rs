//! Per-agent execution of dispatched jobs.
//!
//! A [`Dialer`] owns one agent's RPC client and runs at most one job at a
//! time against it:
//!
//! 1. [`Dialer::start_job`] claims the dialer, records the job as running and
//!    opens the `RunJob` stream within the open timeout, then starts a result
//!    [`Pipeline`](ingest::Pipeline)
//! 2. A supervised task pulls reports off the stream and forwards them to the
//!    pipeline, stopping on end of stream, on an empty report, or when the
//!    job is cancelled
//! 3. Once the pipeline has drained the job is finalised and persisted, and
//!    the dialer is released, even if the receive task panicked
//!
//! The busy flag is only set and cleared by the dialer itself; the scheduler
//! only reads it.

pub mod ingest;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::{DispatchError, Result};
use crate::grpc::{convert, AgentClient, ReportStream};
use crate::scheduler::{Job, JobStatus, Priority};
use crate::store::{JobStore, ScanStore};

pub use ingest::{IngestStats, Pipeline};

/// A job being executed, shared between the dialer and its tasks.
pub type SharedJob = Arc<RwLock<Job>>;

/// Point-in-time view of a dialer for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentState {
    pub agent_id: u64,
    pub host: String,
    pub min_priority: Priority,
    pub busy: bool,
    pub current_job: Option<Uuid>,
}

/// A job the dialer refused, handed back so the caller can re-queue it.
#[derive(Debug)]
pub struct Rejected {
    pub job: Job,
    pub error: DispatchError,
}

struct RunningJob {
    job_id: Uuid,
    job: SharedJob,
    cancel: CancellationToken,
}

/// Owner of one agent's RPC session.
pub struct Dialer {
    agent: Agent,
    client: Arc<dyn AgentClient>,
    job_store: Arc<dyn JobStore>,
    scan_store: Arc<dyn ScanStore>,
    pipeline_buffer: usize,
    open_timeout: Duration,
    busy: AtomicBool,
    current: Mutex<Option<RunningJob>>,
}

impl Dialer {
    pub fn new(
        agent: Agent,
        client: Arc<dyn AgentClient>,
        job_store: Arc<dyn JobStore>,
        scan_store: Arc<dyn ScanStore>,
        pipeline_buffer: usize,
        open_timeout: Duration,
    ) -> Result<Self> {
        Self::check_agent(&agent)?;
        Ok(Self {
            agent,
            client,
            job_store,
            scan_store,
            pipeline_buffer,
            open_timeout,
            busy: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    /// Reject agents that cannot be dialed
    pub fn check_agent(agent: &Agent) -> Result<()> {
        if !agent.active {
            return Err(DispatchError::AgentUnavailable {
                agent_id: agent.id,
                reason: "agent is inactive".to_string(),
            });
        }
        if agent.host.trim().is_empty() {
            return Err(DispatchError::AgentUnavailable {
                agent_id: agent.id,
                reason: "agent has no host".to_string(),
            });
        }
        Ok(())
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_id(&self) -> u64 {
        self.agent.id
    }

    pub fn min_priority(&self) -> Priority {
        self.agent.min_priority
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether this dialer could take a job of the given priority right now
    pub fn can_accept(&self, priority: Priority) -> bool {
        !self.is_busy() && self.agent.accepts(priority)
    }

    pub async fn state(&self) -> AgentState {
        let current_job = self.current.lock().await.as_ref().map(|r| r.job_id);
        AgentState {
            agent_id: self.agent.id,
            host: self.agent.host.clone(),
            min_priority: self.agent.min_priority,
            busy: self.is_busy(),
            current_job,
        }
    }

    /// Copy of the job currently executing, if any
    pub async fn current_job(&self) -> Option<Job> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(running) => Some(running.job.read().await.clone()),
            None => None,
        }
    }

    /// Start executing a job on this agent under a fresh cancellation token.
    pub async fn handle_job(
        self: &Arc<Self>,
        job: Job,
    ) -> std::result::Result<JoinHandle<JobStatus>, Rejected> {
        self.start_job(job, CancellationToken::new()).await
    }

    /// Start executing a job on this agent.
    ///
    /// Returns once the agent has accepted the job stream, or once `cancel`
    /// fires before it did. The returned handle resolves to the job's final
    /// status. A job the agent refuses, or does not answer within the open
    /// timeout, is handed back untouched in [`Rejected`].
    pub async fn start_job(
        self: &Arc<Self>,
        job: Job,
        cancel: CancellationToken,
    ) -> std::result::Result<JoinHandle<JobStatus>, Rejected> {
        if !self.agent.accepts(job.priority()) {
            let error = DispatchError::PriorityBelowFloor {
                agent_id: self.agent.id,
                priority: job.priority(),
                floor: self.agent.min_priority,
            };
            return Err(Rejected { job, error });
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let error = DispatchError::HandlerBusy(self.agent.id);
            return Err(Rejected { job, error });
        }

        // Recorded before the stream opens so a cancel can always find the job.
        let job_id = job.id();
        let request = convert::job_to_request(&job);
        let shared: SharedJob = Arc::new(RwLock::new(job));
        *self.current.lock().await = Some(RunningJob {
            job_id,
            job: shared.clone(),
            cancel: cancel.clone(),
        });

        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            opened = tokio::time::timeout(self.open_timeout, self.client.run_job(request)) => Some(opened),
        };
        let stream = match opened {
            Some(Ok(Ok(stream))) => stream,
            Some(Ok(Err(status))) => {
                return self
                    .hand_back(shared, &cancel, DispatchError::Grpc(status))
                    .await;
            }
            Some(Err(_)) => {
                let error = DispatchError::AgentUnavailable {
                    agent_id: self.agent.id,
                    reason: format!("no answer to RunJob within {:?}", self.open_timeout),
                };
                return self.hand_back(shared, &cancel, error).await;
            }
            None => return Ok(self.close_cancelled(shared).await),
        };
        if cancel.is_cancelled() {
            drop(stream);
            return Ok(self.close_cancelled(shared).await);
        }

        let run_token = CancellationToken::new();
        let pipeline = Pipeline::spawn(
            job_id,
            self.agent.id,
            self.scan_store.clone(),
            self.pipeline_buffer,
            run_token.clone(),
        );

        let working = {
            let mut job = shared.write().await;
            job.advance();
            job.advance();
            job.clone()
        };
        if let Err(e) = self.job_store.save_job(&working).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to persist job status");
        }

        tracing::info!(
            job_id = %job_id,
            agent_id = self.agent.id,
            priority = %working.priority(),
            targets = working.payload.targets.len(),
            "Job started on agent"
        );

        let dialer = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let run = tokio::spawn(receive_reports(
                shared.clone(),
                stream,
                pipeline,
                cancel,
                dialer.agent.id,
            ));
            let outcome = run.await;
            dialer.finish(shared, outcome, run_token).await
        }))
    }

    /// Undo a start that never got a stream. The job goes back to the caller
    /// unless it was cancelled in the meantime.
    async fn hand_back(
        &self,
        shared: SharedJob,
        cancel: &CancellationToken,
        error: DispatchError,
    ) -> std::result::Result<JoinHandle<JobStatus>, Rejected> {
        *self.current.lock().await = None;
        let job = shared.read().await.clone();
        if cancel.is_cancelled() || job.status() == JobStatus::Cancelled {
            return Ok(self.close_cancelled(shared).await);
        }
        self.busy.store(false, Ordering::Release);
        Err(Rejected { job, error })
    }

    /// Persist a job cancelled before its stream was open and release the
    /// dialer. The returned handle is already resolved.
    async fn close_cancelled(&self, shared: SharedJob) -> JoinHandle<JobStatus> {
        let job = {
            let mut job = shared.write().await;
            job.cancel();
            job.clone()
        };
        tracing::info!(
            job_id = %job.id(),
            agent_id = self.agent.id,
            "Job cancelled before the agent accepted it"
        );
        if let Err(e) = self.job_store.save_job(&job).await {
            tracing::warn!(job_id = %job.id(), error = %e, "Failed to persist job status");
        }

        *self.current.lock().await = None;
        self.busy.store(false, Ordering::Release);
        let status = job.status();
        tokio::spawn(async move { status })
    }

    /// Mark the running job as cancelled. A job whose stream is still opening
    /// never starts; otherwise the receive loop stops at once and reports
    /// already handed to the pipeline are still persisted. Returns false if
    /// the job is not running here.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let current = self.current.lock().await;
        let Some(running) = current.as_ref().filter(|r| r.job_id == job_id) else {
            return false;
        };

        if running.job.write().await.cancel() {
            tracing::info!(job_id = %job_id, agent_id = self.agent.id, "Job cancelled");
        }
        running.cancel.cancel();
        true
    }

    async fn finish(
        &self,
        job: SharedJob,
        outcome: std::result::Result<IngestStats, JoinError>,
        run_token: CancellationToken,
    ) -> JobStatus {
        let finished = {
            let mut job = job.write().await;
            match outcome {
                Ok(stats) => {
                    job.advance();
                    tracing::info!(
                        job_id = %job.id(),
                        agent_id = self.agent.id,
                        status = %job.status(),
                        stored = stats.stored,
                        store_errors = stats.store_errors,
                        dropped = stats.dropped,
                        "Job finished"
                    );
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e);
                    tracing::error!(
                        job_id = %job.id(),
                        agent_id = self.agent.id,
                        panic = %message,
                        "Job execution panicked"
                    );
                    job.panicked(message);
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id(),
                        agent_id = self.agent.id,
                        error = %e,
                        "Job execution aborted"
                    );
                    job.done_with_error(format!("execution aborted: {}", e));
                }
            }
            job.clone()
        };

        run_token.cancel();
        if let Err(e) = self.job_store.save_job(&finished).await {
            tracing::warn!(job_id = %finished.id(), error = %e, "Failed to persist job status");
        }

        *self.current.lock().await = None;
        self.busy.store(false, Ordering::Release);
        finished.status()
    }
}

/// Pull reports off the agent stream until it ends, the job is cancelled, or
/// the agent violates the protocol. Returns once every forwarded report has
/// been handled by the pipeline.
async fn receive_reports(
    job: SharedJob,
    mut stream: ReportStream,
    pipeline: Pipeline,
    cancel: CancellationToken,
    agent_id: u64,
) -> IngestStats {
    let job_id = job.read().await.id();
    let mut forwarded = 0usize;

    loop {
        if job.read().await.status() == JobStatus::Cancelled {
            tracing::info!(job_id = %job_id, agent_id, "Job cancelled, closing stream");
            break;
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => {
                job.write().await.cancel();
                tracing::info!(job_id = %job_id, agent_id, "Job cancelled while waiting for reports");
                break;
            }
            next = stream.next() => next,
        };

        match next {
            None => {
                tracing::debug!(job_id = %job_id, agent_id, forwarded, "Report stream ended");
                break;
            }
            Some(Err(status)) => {
                tracing::warn!(job_id = %job_id, agent_id, error = %status, "Report error");
            }
            Some(Ok(report)) if report.is_empty() => {
                tracing::error!(job_id = %job_id, agent_id, "Agent sent an empty report");
                job.write().await.done_with_error("agent sent an empty report");
                break;
            }
            Some(Ok(report)) => {
                job.write().await.set_tasks_left(report.tasks_left);
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        job.write().await.cancel();
                        tracing::info!(job_id = %job_id, agent_id, "Job cancelled while the pipeline was full");
                        break;
                    }
                    sent = pipeline.send(report) => sent,
                };
                if sent.is_err() {
                    tracing::warn!(job_id = %job_id, agent_id, "Ingestion pipeline closed early");
                    break;
                }
                forwarded += 1;
            }
        }
    }

    // Dropping the stream resets the RPC, which tells the agent to stop.
    drop(stream);
    pipeline.join().await
}

fn panic_message(e: JoinError) -> String {
    let payload = e.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
