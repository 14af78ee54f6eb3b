use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::scan::ScanRecord;
use crate::scheduler::{Job, Target};
use crate::store::{JobStore, ScanStore};

/// Identity record for a scanned host with every scan attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct TargetRecord {
    pub target: Target,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub scans: Vec<ScanRecord>,
}

/// In-memory [`JobStore`] and [`ScanStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    targets: RwLock<HashMap<String, TargetRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn target(&self, host: &str) -> Option<TargetRecord> {
        self.targets.read().await.get(host).cloned()
    }

    pub async fn targets(&self) -> Vec<TargetRecord> {
        let mut records: Vec<TargetRecord> = self.targets.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.first_seen);
        records
    }

    /// Total number of scan records across all targets
    pub async fn scan_count(&self) -> usize {
        self.targets
            .read()
            .await
            .values()
            .map(|r| r.scans.len())
            .sum()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id(), job.clone());
        Ok(())
    }

    async fn select_job_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_or_update_target_with_scan(
        &self,
        target: &Target,
        record: ScanRecord,
    ) -> Result<()> {
        let mut targets = self.targets.write().await;
        let now = Utc::now();
        let entry = targets
            .entry(target.host.clone())
            .or_insert_with(|| TargetRecord {
                target: target.clone(),
                first_seen: now,
                last_seen: now,
                scans: Vec::new(),
            });
        entry.last_seen = now;
        entry.scans.push(record);
        Ok(())
    }
}
