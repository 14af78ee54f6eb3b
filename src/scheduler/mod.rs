pub mod assigner;
pub mod directive;
pub mod job;
pub mod queue;
pub mod target;

pub use assigner::{Scheduler, SharedQueue};
pub use directive::{
    DiscoveryDirective, Directive, DnsDirective, NmapDirective, OssDirective, OssProvider,
    SpiderDirective, TimingPolicy, WhoisDirective,
};
pub use job::{load_jobs, Job, JobBuilder, JobMeta, JobSpec, JobStatus, JobType, Payload, Priority};
pub use queue::JobQueue;
pub use target::{Target, TargetKind};
