//! Tests for matching queued jobs to dialers.
//!
//! Verifies that:
//! - Unassignable jobs always go back into the queue
//! - A busy dialer never receives a second job
//! - Priority floors steer jobs to suitable agents
//! - An agent slow to accept a job does not hold up the others
//! - The polling loop starts and stops cleanly


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use recon_dispatch::agent::Agent;
use recon_dispatch::config::SchedulerConfig;
use recon_dispatch::error::DispatchError;
use recon_dispatch::scan::ScanType;
use recon_dispatch::scheduler::{Job, JobQueue, JobStatus, Priority, Scheduler, SharedQueue};
use recon_dispatch::store::{JobStore, MemoryStore};
use test_harness::{
    assert_eventually, report, test_scheduler_config, whois_job, AgentBehavior, MockAgentClient,
    MockConnector,
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    scheduler: Arc<Scheduler>,
    queue: SharedQueue,
    store: Arc<MemoryStore>,
    connector: Arc<MockConnector>,
}

fn fixture(connector: Arc<MockConnector>, capacity: usize) -> Fixture {
    fixture_with(test_scheduler_config(), connector, capacity)
}

fn fixture_with(
    config: SchedulerConfig,
    connector: Arc<MockConnector>,
    capacity: usize,
) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let queue: SharedQueue = Arc::new(Mutex::new(JobQueue::with_capacity(capacity)));
    let scheduler = Arc::new(Scheduler::new(
        config,
        queue.clone(),
        connector.clone(),
        store.clone(),
        store.clone(),
    ));
    Fixture {
        scheduler,
        queue,
        store,
        connector,
    }
}

fn agent(id: u64, floor: Priority) -> Agent {
    Agent::new(id, format!("10.0.0.{}:50051", id), floor)
}

async fn enqueue(queue: &SharedQueue, job: Job) -> uuid::Uuid {
    let id = job.id();
    queue.lock().await.enqueue(job).unwrap();
    id
}

async fn queued_ids(queue: &SharedQueue) -> Vec<uuid::Uuid> {
    queue.lock().await.snapshot().iter().map(|j| j.id()).collect()
}

#[tokio::test]
async fn test_no_handlers_requeues_job() {
    let f = fixture(MockConnector::new(), 16);
    let id = enqueue(&f.queue, whois_job(Priority::High, 0)).await;

    let err = f.scheduler.run_once().await.unwrap_err();
    assert!(matches!(err, DispatchError::NoHandlersAvailable));
    assert_eq!(queued_ids(&f.queue).await, vec![id]);
    assert_eq!(
        f.queue.lock().await.peek().unwrap().status(),
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_empty_queue_is_a_no_op() {
    let f = fixture(MockConnector::new(), 16);
    assert_eq!(f.scheduler.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn test_priority_floor_requeues_low_jobs() {
    let client = MockAgentClient::hanging();
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::High)).await.unwrap();

    let low = enqueue(&f.queue, whois_job(Priority::Low, 50)).await;
    let err = f.scheduler.run_once().await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NoEligibleHandler {
            priority: Priority::Low
        }
    ));
    assert_eq!(queued_ids(&f.queue).await, vec![low]);
    assert_eq!(client.calls(), 0);

    let high = enqueue(&f.queue, whois_job(Priority::High, 0)).await;
    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(high));
    assert_eq!(queued_ids(&f.queue).await, vec![low]);
    assert!(f.scheduler.cancel_running(high).await);
}

#[tokio::test]
async fn test_busy_dialer_gets_no_second_job() {
    let client = MockAgentClient::hanging();
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    let first = enqueue(&f.queue, whois_job(Priority::Medium, 0)).await;
    let second = enqueue(&f.queue, whois_job(Priority::Medium, 0)).await;

    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(first));
    for _ in 0..3 {
        assert!(f.scheduler.run_once().await.is_err());
    }
    assert_eq!(client.calls(), 1);
    assert_eq!(queued_ids(&f.queue).await, vec![second]);

    let states = f.scheduler.agent_states().await;
    assert_eq!(states.len(), 1);
    assert!(states[0].busy);
    assert_eq!(states[0].current_job, Some(first));

    assert!(f.scheduler.cancel_running(first).await);
    let scheduler = f.scheduler.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move { scheduler.agent_states().await.iter().all(|s| !s.busy) }
        },
        WAIT,
        "dialer was not released after cancel",
    )
    .await;

    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(second));
    assert_eq!(client.calls(), 2);
    assert!(f.scheduler.cancel_running(second).await);
}

#[tokio::test]
async fn test_highest_priority_is_dispatched_first() {
    let one = MockAgentClient::hanging();
    let two = MockAgentClient::hanging();
    let connector = MockConnector::new()
        .with_client(1, one.clone())
        .with_client(2, two.clone());
    let f = fixture(connector, 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();
    f.scheduler.add_handler(agent(2, Priority::Low)).await.unwrap();

    let low = enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    let medium = enqueue(&f.queue, whois_job(Priority::Medium, 0)).await;
    let high = enqueue(&f.queue, whois_job(Priority::High, 0)).await;

    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(high));
    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(medium));
    assert!(matches!(
        f.scheduler.run_once().await.unwrap_err(),
        DispatchError::NoEligibleHandler { .. }
    ));

    assert_eq!(one.requests()[0].job_id, high.to_string());
    assert_eq!(two.requests()[0].job_id, medium.to_string());
    assert_eq!(queued_ids(&f.queue).await, vec![low]);

    assert_eq!(
        f.scheduler.running_job(high).await.unwrap().status(),
        JobStatus::Working
    );
    assert!(f.scheduler.cancel_running(high).await);
    assert!(f.scheduler.cancel_running(medium).await);
}

#[tokio::test]
async fn test_one_tick_dispatches_high_and_leaves_the_rest() {
    let client = MockAgentClient::hanging();
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Medium)).await.unwrap();

    let low = enqueue(&f.queue, whois_job(Priority::Low, 10)).await;
    let medium = enqueue(&f.queue, whois_job(Priority::Medium, 10)).await;
    let high = enqueue(&f.queue, whois_job(Priority::High, 10)).await;
    assert_eq!(queued_ids(&f.queue).await, vec![high, medium, low]);

    assert_eq!(f.scheduler.run_once().await.unwrap(), Some(high));

    assert_eq!(client.calls(), 1);
    assert_eq!(client.requests()[0].job_id, high.to_string());
    assert_eq!(queued_ids(&f.queue).await, vec![medium, low]);
    let untouched = f.queue.lock().await.get_job(&low).unwrap().clone();
    assert_eq!(untouched.status(), JobStatus::Pending);
    assert!(untouched.meta.started_at.is_none());

    assert!(f.scheduler.cancel_running(high).await);
}

#[tokio::test]
async fn test_rejected_assignment_requeues_job() {
    let client = MockAgentClient::new(AgentBehavior::Refuse);
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    let id = enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    let err = f.scheduler.run_once().await.unwrap_err();

    assert!(matches!(err, DispatchError::Grpc(_)));
    assert_eq!(queued_ids(&f.queue).await, vec![id]);
    assert_eq!(client.calls(), 1);
    assert!(!f.scheduler.agent_states().await[0].busy);
}

#[tokio::test]
async fn test_full_queue_on_requeue_fails_the_job() {
    let f = fixture(MockConnector::new(), 1);
    let first = whois_job(Priority::Low, 0);
    let first_id = first.id();

    // Another producer fills the only slot while the job is out for assignment.
    enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    let err = f.scheduler.assign_job_handler(first).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoHandlersAvailable));

    assert!(!f.queue.lock().await.contains(&first_id));
    let stored = f.store.select_job_by_id(first_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Error);
    assert!(stored.meta.error.is_some());
}

#[tokio::test]
async fn test_add_handler_validates_and_replaces() {
    let client = MockAgentClient::hanging();
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);

    let mut inactive = agent(1, Priority::Low);
    inactive.active = false;
    assert!(f.scheduler.add_handler(inactive).await.is_err());
    assert_eq!(f.connector.connects(), 0);

    assert!(matches!(
        f.scheduler.add_handler(agent(9, Priority::Low)).await,
        Err(DispatchError::AgentUnavailable { agent_id: 9, .. })
    ));

    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();
    f.scheduler.add_handler(agent(1, Priority::High)).await.unwrap();
    let states = f.scheduler.agent_states().await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].min_priority, Priority::High);

    let id = enqueue(&f.queue, whois_job(Priority::Critical, 0)).await;
    f.scheduler.run_once().await.unwrap();
    assert!(matches!(
        f.scheduler.add_handler(agent(1, Priority::Low)).await,
        Err(DispatchError::HandlerBusy(1))
    ));
    assert!(matches!(
        f.scheduler.remove_handler(1).await,
        Err(DispatchError::HandlerBusy(1))
    ));

    assert!(f.scheduler.cancel_running(id).await);
    let scheduler = f.scheduler.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move { scheduler.remove_handler(1).await.is_ok() }
        },
        WAIT,
        "idle handler could not be removed",
    )
    .await;
    assert!(f.scheduler.handlers().await.is_empty());
}

#[tokio::test]
async fn test_loop_dispatches_until_stopped() {
    let client = MockAgentClient::new(AgentBehavior::Reports(vec![report(
        ScanType::Whois,
        "example.com",
        0,
    )]));
    let f = fixture(MockConnector::new().with_client(1, client.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    let handle = f.scheduler.start();
    let first = enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    let second = enqueue(&f.queue, whois_job(Priority::Low, 0)).await;

    let store = f.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                let mut done = true;
                for id in [first, second] {
                    done &= matches!(
                        store.select_job_by_id(id).await,
                        Ok(Some(job)) if job.status() == JobStatus::Finishing
                    );
                }
                done
            }
        },
        WAIT,
        "jobs did not finish",
    )
    .await;
    assert_eq!(f.store.scan_count().await, 2);
    assert!(f.queue.lock().await.is_empty());

    f.scheduler.stop();
    assert!(f.scheduler.is_stopped());
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    // Nothing is dispatched once the loop has exited.
    let late = enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queued_ids(&f.queue).await, vec![late]);
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn test_stop_before_any_tick() {
    let f = fixture(MockConnector::new(), 16);
    f.scheduler.stop();
    let handle = f.scheduler.start();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unresponsive_agent_does_not_block_the_others() {
    let stalled = MockAgentClient::unresponsive();
    let healthy = MockAgentClient::hanging();
    let connector = MockConnector::new()
        .with_client(1, stalled.clone())
        .with_client(2, healthy.clone());
    let f = fixture(connector, 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();
    f.scheduler.add_handler(agent(2, Priority::Low)).await.unwrap();

    let first = enqueue(&f.queue, whois_job(Priority::High, 0)).await;
    let second = enqueue(&f.queue, whois_job(Priority::High, 0)).await;
    let handle = f.scheduler.start();

    let scheduler = f.scheduler.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move {
                matches!(
                    scheduler.running_job(second).await,
                    Some(job) if job.status() == JobStatus::Working
                )
            }
        },
        WAIT,
        "healthy agent never received a job",
    )
    .await;
    assert_eq!(healthy.calls(), 1);
    assert!(stalled.calls() >= 1);
    assert_eq!(stalled.requests()[0].job_id, first.to_string());

    f.scheduler.stop();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(f.scheduler.cancel_running(second).await);
}

#[tokio::test]
async fn test_unanswered_job_goes_back_to_the_queue() {
    let stalled = MockAgentClient::unresponsive();
    let f = fixture(MockConnector::new().with_client(1, stalled.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    let id = enqueue(&f.queue, whois_job(Priority::Medium, 0)).await;
    let err = tokio::time::timeout(WAIT, f.scheduler.run_once())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, DispatchError::AgentUnavailable { agent_id: 1, .. }));
    assert_eq!(queued_ids(&f.queue).await, vec![id]);
    assert!(!f.scheduler.agent_states().await[0].busy);
}

#[tokio::test]
async fn test_stop_while_a_tick_waits_on_an_agent() {
    let stalled = MockAgentClient::unresponsive();
    let config = SchedulerConfig {
        open_timeout_ms: 60_000,
        ..test_scheduler_config()
    };
    let f = fixture_with(config, MockConnector::new().with_client(1, stalled.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    enqueue(&f.queue, whois_job(Priority::Low, 0)).await;
    let handle = f.scheduler.start();

    let client = stalled.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move { client.calls() == 1 }
        },
        WAIT,
        "job never reached the agent",
    )
    .await;

    f.scheduler.stop();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_during_assignment() {
    let slow = MockAgentClient::slow(
        Duration::from_millis(300),
        AgentBehavior::ReportsThenHang(Vec::new()),
    );
    let f = fixture(MockConnector::new().with_client(1, slow.clone()), 16);
    f.scheduler.add_handler(agent(1, Priority::Low)).await.unwrap();

    let id = enqueue(&f.queue, whois_job(Priority::High, 0)).await;
    let tick = {
        let scheduler = f.scheduler.clone();
        tokio::spawn(async move { scheduler.run_once().await })
    };

    let client = slow.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move { client.calls() == 1 }
        },
        WAIT,
        "job never reached the agent",
    )
    .await;
    assert!(f.scheduler.cancel_assigning(id).await);

    tokio::time::timeout(WAIT, tick).await.unwrap().unwrap().unwrap();
    let store = f.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                matches!(
                    store.select_job_by_id(id).await,
                    Ok(Some(job)) if job.status() == JobStatus::Cancelled
                )
            }
        },
        WAIT,
        "job was not persisted as cancelled",
    )
    .await;
    assert!(f.queue.lock().await.is_empty());
    assert!(!f.scheduler.agent_states().await[0].busy);
    assert!(!f.scheduler.cancel_assigning(id).await);
    assert_eq!(slow.open_streams(), 0);
}
