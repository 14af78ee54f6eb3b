//! Persistence collaborators consumed by the scheduler core.
//!
//! The core never assumes a storage schema: it saves jobs when they are
//! accepted and when they change state, and hands each scan report to a
//! [`ScanStore`] that attaches it to the target's identity record.
//! [`MemoryStore`] is the in-process implementation used by the daemon and
//! the tests.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::scan::ScanRecord;
use crate::scheduler::{Job, Target};

pub use memory::{MemoryStore, TargetRecord};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite the stored copy of a job
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn select_job_by_id(&self, id: Uuid) -> Result<Option<Job>>;
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Create the target's identity record if needed and attach the scan to it
    async fn create_or_update_target_with_scan(
        &self,
        target: &Target,
        record: ScanRecord,
    ) -> Result<()>;
}
