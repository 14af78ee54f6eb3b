use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::SchedulerConfig;
use crate::dialer::{AgentState, Dialer, Rejected};
use crate::error::{DispatchError, Result};
use crate::grpc::AgentConnector;
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobQueue;
use crate::store::{JobStore, ScanStore};

/// The job queue as shared between producers and the scheduler loop
pub type SharedQueue = Arc<Mutex<JobQueue>>;

/// Matches queued jobs to idle dialers.
///
/// Every tick takes at most one job off the head of the queue and offers it
/// to the first registered dialer that is idle and whose priority floor the
/// job clears. A job that is not assigned goes straight back into the queue
/// at the position its priority and weight dictate. There is no aging, so a
/// job below every dialer's floor waits until a suitable agent registers.
///
/// Ticks run as independent tasks, so an agent that is slow to accept a job
/// only holds up the tick that picked it.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: SharedQueue,
    dialers: RwLock<Vec<Arc<Dialer>>>,
    /// Jobs taken off the queue and not yet running on a dialer. Always
    /// locked after the queue.
    assigning: Mutex<HashMap<Uuid, CancellationToken>>,
    connector: Arc<dyn AgentConnector>,
    job_store: Arc<dyn JobStore>,
    scan_store: Arc<dyn ScanStore>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        queue: SharedQueue,
        connector: Arc<dyn AgentConnector>,
        job_store: Arc<dyn JobStore>,
        scan_store: Arc<dyn ScanStore>,
    ) -> Self {
        Self {
            config,
            queue,
            dialers: RwLock::new(Vec::new()),
            assigning: Mutex::new(HashMap::new()),
            connector,
            job_store,
            scan_store,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the polling loop. It runs until [`Scheduler::stop`] is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Signal the loop to exit. Never waits on an in-progress tick.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Scheduler started"
        );

        // Each tick runs in its own task so a panic cannot end the loop.
        let mut ticks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(in_flight = ticks.len(), "Scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    ticks.spawn(async move { scheduler.run_once().await });
                }
                Some(tick) = ticks.join_next() => match tick {
                    Ok(Ok(Some(job_id))) => {
                        tracing::debug!(job_id = %job_id, "Tick dispatched job");
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "Tick did not dispatch");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Scheduler tick panicked");
                    }
                },
            }
        }

        // Ticks still waiting on an agent finish on their own and either
        // start their job or put it back in the queue.
        ticks.detach_all();
    }

    /// Perform one scheduling step: dequeue the head job, if any, and try to
    /// assign it. Returns the id of the job that was dispatched.
    pub async fn run_once(&self) -> Result<Option<Uuid>> {
        let (job, cancel) = {
            let mut queue = self.queue.lock().await;
            let Some(job) = queue.dequeue() else {
                return Ok(None);
            };
            let cancel = CancellationToken::new();
            self.assigning.lock().await.insert(job.id(), cancel.clone());
            (job, cancel)
        };
        let job_id = job.id();
        self.assign(job, cancel).await?;
        Ok(Some(job_id))
    }

    /// Hand a job to the first idle dialer that accepts its priority.
    ///
    /// Whenever the job is not assigned it is put back in the queue before
    /// the error is returned. On success returns the chosen agent's id.
    pub async fn assign_job_handler(&self, job: Job) -> Result<u64> {
        let cancel = CancellationToken::new();
        self.assigning.lock().await.insert(job.id(), cancel.clone());
        self.assign(job, cancel).await
    }

    async fn assign(&self, job: Job, cancel: CancellationToken) -> Result<u64> {
        let job_id = job.id();
        let dialers = self.dialers.read().await.clone();

        if dialers.is_empty() {
            tracing::warn!(job_id = %job_id, "No handlers available");
            return Err(self
                .requeue(job, &cancel, DispatchError::NoHandlersAvailable)
                .await);
        }

        let priority = job.priority();
        let Some(dialer) = dialers.iter().find(|d| d.can_accept(priority)) else {
            tracing::debug!(
                job_id = %job_id,
                priority = %priority,
                "No idle handler accepts job, re-queued"
            );
            return Err(self
                .requeue(job, &cancel, DispatchError::NoEligibleHandler { priority })
                .await);
        };

        let agent_id = dialer.agent_id();
        let outcome = dialer.start_job(job, cancel.clone()).await;
        match outcome {
            Ok(_) => {
                self.assigning.lock().await.remove(&job_id);
                tracing::info!(job_id = %job_id, agent_id, priority = %priority, "Job assigned");
                Ok(agent_id)
            }
            Err(Rejected { job, error }) => {
                tracing::error!(
                    job_id = %job_id,
                    agent_id,
                    error = %error,
                    "Job assignment failed"
                );
                Err(self.requeue(job, &cancel, error).await)
            }
        }
    }

    /// Put a job that could not be assigned back in the queue and return the
    /// error to report. A job cancelled meanwhile is persisted as cancelled,
    /// and one that no longer fits in the queue is failed and persisted.
    async fn requeue(
        &self,
        mut job: Job,
        cancel: &CancellationToken,
        error: DispatchError,
    ) -> DispatchError {
        let job_id = job.id();
        {
            let mut queue = self.queue.lock().await;
            let mut assigning = self.assigning.lock().await;
            assigning.remove(&job_id);
            if !cancel.is_cancelled() && !queue.is_full() {
                if let Err(e) = queue.enqueue(job) {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to re-queue job");
                }
                return error;
            }
        }

        let error = if cancel.is_cancelled() {
            job.cancel();
            tracing::info!(job_id = %job_id, "Job cancelled before dispatch");
            DispatchError::JobCancelled(job_id)
        } else {
            tracing::error!(job_id = %job_id, "Queue full, job could not be re-queued");
            job.done_with_error("queue full while re-queuing after failed assignment");
            error
        };
        if let Err(e) = self.job_store.save_job(&job).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist dropped job");
        }
        error
    }

    /// Cancel a job that has left the queue but is not yet running on a
    /// dialer. Returns false if no such job is being assigned.
    pub async fn cancel_assigning(&self, job_id: Uuid) -> bool {
        match self.assigning.lock().await.get(&job_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Dial an agent and register a dialer for it. Replaces an idle dialer
    /// already registered under the same agent id.
    pub async fn add_handler(&self, agent: Agent) -> Result<()> {
        Dialer::check_agent(&agent)?;
        let client = self.connector.connect(&agent)?;
        let dialer = Arc::new(Dialer::new(
            agent,
            client,
            self.job_store.clone(),
            self.scan_store.clone(),
            self.config.pipeline_buffer,
            self.config.open_timeout(),
        )?);
        self.register(dialer).await
    }

    /// Register an already constructed dialer
    pub async fn register(&self, dialer: Arc<Dialer>) -> Result<()> {
        let agent_id = dialer.agent_id();
        let mut dialers = self.dialers.write().await;
        match dialers.iter().position(|d| d.agent_id() == agent_id) {
            Some(index) if dialers[index].is_busy() => {
                return Err(DispatchError::HandlerBusy(agent_id));
            }
            Some(index) => {
                dialers[index] = dialer;
                tracing::info!(agent_id, "Handler replaced");
            }
            None => {
                tracing::info!(
                    agent_id,
                    host = %dialer.agent().host,
                    min_priority = %dialer.min_priority(),
                    "Handler registered"
                );
                dialers.push(dialer);
            }
        }
        Ok(())
    }

    /// Unregister an idle dialer
    pub async fn remove_handler(&self, agent_id: u64) -> Result<()> {
        let mut dialers = self.dialers.write().await;
        let index = dialers
            .iter()
            .position(|d| d.agent_id() == agent_id)
            .ok_or_else(|| DispatchError::AgentUnavailable {
                agent_id,
                reason: "not registered".to_string(),
            })?;
        if dialers[index].is_busy() {
            return Err(DispatchError::HandlerBusy(agent_id));
        }
        dialers.remove(index);
        tracing::info!(agent_id, "Handler removed");
        Ok(())
    }

    /// Registered dialers in registration order
    pub async fn handlers(&self) -> Vec<Arc<Dialer>> {
        self.dialers.read().await.clone()
    }

    pub async fn agent_states(&self) -> Vec<AgentState> {
        let mut states = Vec::new();
        for dialer in self.handlers().await {
            states.push(dialer.state().await);
        }
        states
    }

    /// Cancel a job that is already running on one of the dialers
    pub async fn cancel_running(&self, job_id: Uuid) -> bool {
        for dialer in self.handlers().await {
            if dialer.cancel(job_id).await {
                return true;
            }
        }
        false
    }

    /// Copy of a job that is currently running on one of the dialers
    pub async fn running_job(&self, job_id: Uuid) -> Option<Job> {
        for dialer in self.handlers().await {
            if let Some(job) = dialer.current_job().await {
                if job.id() == job_id {
                    return Some(job);
                }
            }
        }
        None
    }
}
