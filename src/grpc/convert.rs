use crate::proto::{self, job_request};
use crate::scheduler::directive::{Directive, TimingPolicy};
use crate::scheduler::{Job, Target, TargetKind};

/// Translate a job into the descriptor sent to the agent
pub fn job_to_request(job: &Job) -> proto::JobRequest {
    proto::JobRequest {
        job_id: job.id().to_string(),
        job_type: job.meta.kind.code(),
        priority: job.priority().code(),
        targets: job.payload.targets.iter().map(target_to_proto).collect(),
        exceptions: job.payload.exceptions.iter().map(target_to_proto).collect(),
        directive: Some(directive_to_proto(&job.directive)),
    }
}

pub fn target_to_proto(target: &Target) -> proto::Target {
    proto::Target {
        host: target.host.clone(),
        kind: target.kind.code(),
    }
}

/// Targets echoed back by agents. An unknown kind code falls back to
/// classifying the host string again, and to a domain if that fails too.
pub fn target_from_proto(target: &proto::Target) -> Target {
    match TargetKind::from_code(target.kind) {
        Some(kind) => Target::new(target.host.clone(), kind),
        None => Target::parse(&target.host)
            .unwrap_or_else(|_| Target::new(target.host.clone(), TargetKind::Domain)),
    }
}

fn timing_to_proto(timing: &TimingPolicy) -> Option<proto::TimingPolicy> {
    Some(proto::TimingPolicy {
        timeout_ms: timing.timeout_ms,
        delay_ms: timing.delay_ms,
        retries: timing.retries,
    })
}

fn directive_to_proto(directive: &Directive) -> job_request::Directive {
    match directive {
        Directive::Oss(d) => job_request::Directive::Oss(proto::OssDirective {
            providers: d.providers.iter().map(|p| p.as_str().to_string()).collect(),
            timing: timing_to_proto(&d.timing),
        }),
        Directive::Nmap(d) => job_request::Directive::Nmap(proto::NmapDirective {
            ports: d.ports.iter().map(|&p| u32::from(p)).collect(),
            service_detection: d.service_detection,
            os_detection: d.os_detection,
            timing: timing_to_proto(&d.timing),
        }),
        Directive::Whois(d) => job_request::Directive::Whois(proto::WhoisDirective {
            timing: timing_to_proto(&d.timing),
        }),
        Directive::Dns(d) => job_request::Directive::Dns(proto::DnsDirective {
            record_types: d.record_types.clone(),
            timing: timing_to_proto(&d.timing),
        }),
        Directive::Discovery(d) => job_request::Directive::Discovery(proto::DiscoveryDirective {
            ping_sweep: d.ping_sweep,
            timing: timing_to_proto(&d.timing),
        }),
        Directive::Spider(d) => job_request::Directive::Spider(proto::SpiderDirective {
            max_depth: d.max_depth,
            follow_external: d.follow_external,
            timing: timing_to_proto(&d.timing),
        }),
    }
}
