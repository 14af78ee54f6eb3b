use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::config::NodeConfig;
use crate::dialer::AgentState;
use crate::error::{DispatchError, Result};
use crate::grpc::AgentConnector;
use crate::scheduler::{Job, JobQueue, JobStatus, Scheduler, SharedQueue};
use crate::store::{JobStore, ScanStore};

/// Main entry point that wires the queue, the scheduler and its dialers
/// together with the persistence collaborators.
pub struct Node {
    pub config: NodeConfig,
    queue: SharedQueue,
    scheduler: Arc<Scheduler>,
    job_store: Arc<dyn JobStore>,
    registry: Arc<dyn AgentRegistry>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        registry: Arc<dyn AgentRegistry>,
        connector: Arc<dyn AgentConnector>,
        job_store: Arc<dyn JobStore>,
        scan_store: Arc<dyn ScanStore>,
    ) -> Self {
        let queue: SharedQueue = Arc::new(Mutex::new(JobQueue::with_capacity(
            config.scheduler.queue_capacity,
        )));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            queue.clone(),
            connector,
            job_store.clone(),
            scan_store,
        ));

        Self {
            config,
            queue,
            scheduler,
            job_store,
            registry,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register every agent the registry knows about, then start the
    /// scheduler loop. Agents that cannot be registered are logged and
    /// skipped. Returns the number of registered agents and the loop handle.
    pub async fn start(&self) -> Result<(usize, JoinHandle<()>)> {
        let agents = self.registry.list_agents().await?;
        let mut registered = 0;
        for agent in agents {
            let agent_id = agent.id;
            match self.scheduler.add_handler(agent).await {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::warn!(agent_id, error = %e, "Failed to register agent");
                }
            }
        }
        if registered == 0 {
            tracing::warn!("No agents registered, jobs will wait in the queue");
        }

        let handle = self.scheduler.start();
        Ok((registered, handle))
    }

    /// Validate a job, persist it in `pending` state and queue it.
    ///
    /// The queue lock is held across the save, so the scheduler never sees a
    /// job the store does not know about and a job that cannot be persisted
    /// is never queued.
    pub async fn enqueue_job(&self, job: Job) -> Result<Uuid> {
        job.validate()?;
        if job.status() != JobStatus::Pending {
            return Err(DispatchError::InvalidJob(format!(
                "only pending jobs can be queued, got {}",
                job.status()
            )));
        }

        let job_id = job.id();
        let mut queue = self.queue.lock().await;
        if queue.is_full() {
            return Err(DispatchError::QueueFull {
                capacity: queue.capacity(),
            });
        }
        if let Err(e) = self.job_store.save_job(&job).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job, not queued");
            return Err(e);
        }

        tracing::info!(
            job_id = %job_id,
            kind = %job.meta.kind,
            priority = %job.priority(),
            weight = job.weight(),
            "Job queued"
        );
        queue.enqueue(job)?;
        Ok(job_id)
    }

    /// Queued jobs in dispatch order
    pub async fn queue_snapshot(&self) -> Vec<Job> {
        self.queue.lock().await.snapshot()
    }

    pub async fn agent_states(&self) -> Vec<AgentState> {
        self.scheduler.agent_states().await
    }

    /// Cancel a job whether it is still queued, being handed to an agent, or
    /// already running.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let queued = {
            // The scheduler moves jobs from the queue to its in-flight set
            // under the queue lock, so one of the two sees the job.
            let mut queue = self.queue.lock().await;
            match queue.remove_by_id(&job_id) {
                Some(job) => Some(job),
                None => {
                    if self.scheduler.cancel_assigning(job_id).await {
                        tracing::info!(job_id = %job_id, "Job cancelled during assignment");
                        return Ok(());
                    }
                    None
                }
            }
        };
        if let Some(mut job) = queued {
            job.cancel();
            tracing::info!(job_id = %job_id, "Queued job cancelled");
            return self.job_store.save_job(&job).await;
        }

        if self.scheduler.cancel_running(job_id).await {
            return Ok(());
        }

        Err(DispatchError::JobNotFound(job_id))
    }

    /// Latest known copy of a job: queued, running, or as last persisted.
    pub async fn job_status(&self, job_id: Uuid) -> Result<Job> {
        if let Some(job) = self.queue.lock().await.get_job(&job_id) {
            return Ok(job.clone());
        }
        if let Some(job) = self.scheduler.running_job(job_id).await {
            return Ok(job);
        }
        self.job_store
            .select_job_by_id(job_id)
            .await?
            .ok_or(DispatchError::JobNotFound(job_id))
    }

    /// Stop the scheduler loop. Running jobs are left to finish.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}
