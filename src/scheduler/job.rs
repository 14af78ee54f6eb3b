use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::directive::Directive;
use crate::scheduler::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Oss,
    Nmap,
    Whois,
    Dns,
    Discovery,
    Spider,
}

impl JobType {
    pub fn code(self) -> i32 {
        match self {
            JobType::Oss => 0,
            JobType::Nmap => 1,
            JobType::Whois => 2,
            JobType::Dns => 3,
            JobType::Discovery => 4,
            JobType::Spider => 5,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Oss => write!(f, "oss"),
            JobType::Nmap => write!(f, "nmap"),
            JobType::Whois => write!(f, "whois"),
            JobType::Dns => write!(f, "dns"),
            JobType::Discovery => write!(f, "discovery"),
            JobType::Spider => write!(f, "spider"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Starting,
    Working,
    Finishing,
    Error,
    Panic,
    Cancelled,
}

impl JobStatus {
    /// `Finishing` counts as terminal: it is only entered once the result
    /// stream has been drained.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finishing | JobStatus::Error | JobStatus::Panic | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::Working => write!(f, "working"),
            JobStatus::Finishing => write!(f, "finishing"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Panic => write!(f, "panic"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Coarse scheduling class. Variant order is the ordering used by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn code(self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
            Priority::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(DispatchError::Config(format!("unknown priority {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: Uuid,
    pub kind: JobType,
    pub status: JobStatus,
    pub priority: Priority,
    pub weight: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks_left: i64,
    pub error: Option<String>,
}

impl JobMeta {
    pub fn new(kind: JobType, priority: Priority, weight: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            priority,
            weight,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            tasks_left: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub targets: Vec<Target>,
    #[serde(default)]
    pub exceptions: Vec<Target>,
}

impl Payload {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            exceptions: Vec::new(),
        }
    }

    pub fn with_exceptions(mut self, exceptions: Vec<Target>) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Classify raw host strings into targets and exceptions.
    pub fn parse<S: AsRef<str>>(targets: &[S], exceptions: &[S]) -> Result<Self> {
        let targets = targets
            .iter()
            .map(|t| Target::parse(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let exceptions = exceptions
            .iter()
            .map(|t| Target::parse(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            targets,
            exceptions,
        })
    }
}

/// One scan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub meta: JobMeta,
    pub payload: Payload,
    pub directive: Directive,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn status(&self) -> JobStatus {
        self.meta.status
    }

    pub fn priority(&self) -> Priority {
        self.meta.priority
    }

    pub fn weight(&self) -> i64 {
        self.meta.weight
    }

    /// Ordering key used by the queue, highest first.
    pub fn rank(&self) -> (Priority, i64) {
        (self.meta.priority, self.meta.weight)
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload.targets.is_empty() {
            return Err(DispatchError::InvalidJob("payload has no targets".into()));
        }
        for target in self.payload.targets.iter().chain(&self.payload.exceptions) {
            target
                .check()
                .map_err(|e| DispatchError::InvalidJob(e.to_string()))?;
        }
        if self.directive.job_type() != self.meta.kind {
            return Err(DispatchError::InvalidJob(format!(
                "{} job carries a {} directive",
                self.meta.kind,
                self.directive.job_type()
            )));
        }
        self.directive.check().map_err(DispatchError::InvalidJob)
    }

    /// Step forward through `pending -> starting -> working -> finishing`.
    /// Returns false when the job is already past `working` or in an error state.
    pub fn advance(&mut self) -> bool {
        let next = match self.meta.status {
            JobStatus::Pending => JobStatus::Starting,
            JobStatus::Starting => JobStatus::Working,
            JobStatus::Working => JobStatus::Finishing,
            _ => return false,
        };
        let now = Utc::now();
        self.meta.status = next;
        self.meta.updated_at = now;
        match next {
            JobStatus::Starting => self.meta.started_at = Some(now),
            JobStatus::Finishing => self.meta.finished_at = Some(now),
            _ => {}
        }
        true
    }

    pub fn done_with_error(&mut self, error: impl Into<String>) {
        self.finish(JobStatus::Error, error.into());
    }

    pub fn panicked(&mut self, message: impl Into<String>) {
        self.finish(JobStatus::Panic, message.into());
    }

    /// Cancel from any non-terminal state.
    pub fn cancel(&mut self) -> bool {
        if self.meta.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.meta.status = JobStatus::Cancelled;
        self.meta.updated_at = now;
        self.meta.finished_at = Some(now);
        true
    }

    pub fn set_tasks_left(&mut self, tasks_left: i64) {
        self.meta.tasks_left = tasks_left;
        self.meta.updated_at = Utc::now();
    }

    fn finish(&mut self, status: JobStatus, error: String) {
        let now = Utc::now();
        self.meta.status = status;
        self.meta.error = Some(error);
        self.meta.updated_at = now;
        self.meta.finished_at = Some(now);
    }
}

/// Builder for [`Job`]: metadata, then payload, then directive.
#[derive(Debug, Default)]
pub struct JobBuilder {
    meta: Option<JobMeta>,
    payload: Option<Payload>,
    directive: Option<Directive>,
}

impl JobBuilder {
    pub fn meta(mut self, meta: JobMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.directive = Some(directive);
        self
    }

    pub fn build(self) -> Result<Job> {
        let meta = self
            .meta
            .ok_or_else(|| DispatchError::InvalidJob("missing metadata".into()))?;
        let payload = self
            .payload
            .ok_or_else(|| DispatchError::InvalidJob("missing payload".into()))?;
        let directive = self
            .directive
            .ok_or_else(|| DispatchError::InvalidJob("no directive set".into()))?;

        let job = Job {
            meta,
            payload,
            directive,
        };
        job.validate()?;
        Ok(job)
    }
}

/// Operator-facing job description, as found in a jobs file.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub priority: Priority,
    #[serde(default)]
    pub weight: i64,
    pub targets: Vec<String>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    pub directive: Directive,
}

impl JobSpec {
    pub fn into_job(self) -> Result<Job> {
        let kind = self.directive.job_type();
        Job::builder()
            .meta(JobMeta::new(kind, self.priority, self.weight))
            .payload(Payload::parse(&self.targets, &self.exceptions)?)
            .directive(self.directive)
            .build()
    }
}

/// Read a JSON array of [`JobSpec`]s and build the jobs it describes.
/// Fails on the first entry that does not validate.
pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<Job>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| DispatchError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let specs: Vec<JobSpec> = serde_json::from_str(&raw)
        .map_err(|e| DispatchError::Config(format!("invalid jobs file {}: {}", path.display(), e)))?;
    specs.into_iter().map(JobSpec::into_job).collect()
}
