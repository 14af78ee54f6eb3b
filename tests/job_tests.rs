
use std::io::Write;

use recon_dispatch::error::DispatchError;
use recon_dispatch::scheduler::{
    load_jobs, Directive, DnsDirective, Job, JobMeta, JobSpec, JobStatus, JobType, NmapDirective,
    OssDirective, OssProvider, Payload, Priority, SpiderDirective, Target, TargetKind,
    TimingPolicy, WhoisDirective,
};
use test_harness::{job_with, whois_job};

fn whois_meta() -> JobMeta {
    JobMeta::new(JobType::Whois, Priority::Medium, 0)
}

fn one_target() -> Payload {
    Payload::new(vec![Target::parse("example.com").unwrap()])
}

#[test]
fn test_builder_produces_pending_job() {
    let job = Job::builder()
        .meta(whois_meta())
        .payload(one_target())
        .directive(Directive::Whois(WhoisDirective::default()))
        .build()
        .unwrap();

    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.meta.kind, JobType::Whois);
    assert!(job.meta.started_at.is_none());
    assert!(job.meta.finished_at.is_none());
    assert!(job.meta.error.is_none());
}

#[test]
fn test_builder_reports_missing_parts() {
    let err = Job::builder()
        .payload(one_target())
        .directive(Directive::Whois(WhoisDirective::default()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("missing metadata"));

    let err = Job::builder()
        .meta(whois_meta())
        .directive(Directive::Whois(WhoisDirective::default()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("missing payload"));

    let err = Job::builder()
        .meta(whois_meta())
        .payload(one_target())
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("no directive set"));
}

#[test]
fn test_directive_must_match_kind() {
    let err = Job::builder()
        .meta(whois_meta())
        .payload(one_target())
        .directive(Directive::Dns(DnsDirective {
            record_types: vec!["A".into()],
            timing: TimingPolicy::default(),
        }))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidJob(_)));
}

#[test]
fn test_empty_payload_is_invalid() {
    let err = Job::builder()
        .meta(whois_meta())
        .payload(Payload::new(Vec::new()))
        .directive(Directive::Whois(WhoisDirective::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidJob(_)));
}

#[test]
fn test_malformed_targets_are_invalid() {
    let job_for = |payload: Payload| Job {
        meta: whois_meta(),
        payload,
        directive: Directive::Whois(WhoisDirective::default()),
    };

    let garbage = job_for(Payload::new(vec![Target::new("not a network", TargetKind::Cidr)]));
    assert!(matches!(garbage.validate(), Err(DispatchError::InvalidJob(_))));

    let mislabelled = job_for(Payload::new(vec![Target::new("example.com", TargetKind::Email)]));
    let err = mislabelled.validate().unwrap_err();
    assert!(err.to_string().contains("looks like domain"));

    let bad_exception = job_for(
        one_target().with_exceptions(vec![Target::new("", TargetKind::Domain)]),
    );
    assert!(bad_exception.validate().is_err());

    let parsed = job_for(
        Payload::parse(&["10.0.0.0/30", "//example.com/admin"], &["10.0.0.2"]).unwrap(),
    );
    assert!(parsed.validate().is_ok());
}

#[test]
fn test_directive_checks() {
    let oss = Directive::Oss(OssDirective {
        providers: Vec::new(),
        timing: TimingPolicy::default(),
    });
    assert!(oss.check().is_err());

    let nmap = Directive::Nmap(NmapDirective {
        ports: vec![22, 0],
        service_detection: true,
        os_detection: false,
        timing: TimingPolicy::default(),
    });
    assert!(nmap.check().is_err());

    let spider = Directive::Spider(SpiderDirective {
        max_depth: 0,
        follow_external: false,
        timing: TimingPolicy::default(),
    });
    assert!(spider.check().is_err());

    let oss = Directive::Oss(OssDirective {
        providers: vec![OssProvider::Shodan, OssProvider::GreyNoise],
        timing: TimingPolicy::default(),
    });
    assert!(oss.check().is_ok());
    assert_eq!(oss.job_type(), JobType::Oss);
    assert_eq!(oss.timing().timeout_ms, 30_000);
}

#[test]
fn test_lifecycle_advances_in_order() {
    let mut job = whois_job(Priority::High, 0);

    assert!(job.advance());
    assert_eq!(job.status(), JobStatus::Starting);
    assert!(job.meta.started_at.is_some());

    assert!(job.advance());
    assert_eq!(job.status(), JobStatus::Working);

    assert!(job.advance());
    assert_eq!(job.status(), JobStatus::Finishing);
    assert!(job.meta.finished_at.is_some());
    assert!(job.status().is_terminal());

    assert!(!job.advance());
    assert_eq!(job.status(), JobStatus::Finishing);
}

#[test]
fn test_error_and_panic_are_terminal() {
    let mut job = whois_job(Priority::Low, 0);
    job.advance();
    job.done_with_error("agent went away");
    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(job.meta.error.as_deref(), Some("agent went away"));
    assert!(!job.advance());
    assert!(!job.cancel());

    let mut job = whois_job(Priority::Low, 0);
    job.panicked("boom");
    assert_eq!(job.status(), JobStatus::Panic);
    assert!(job.meta.finished_at.is_some());
    assert!(!job.advance());
}

#[test]
fn test_cancel_from_non_terminal_states() {
    let mut job = whois_job(Priority::Low, 0);
    assert!(job.cancel());
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(!job.advance());

    let mut job = whois_job(Priority::Low, 0);
    job.advance();
    job.advance();
    assert!(job.cancel());
    assert_eq!(job.status(), JobStatus::Cancelled);

    let mut job = whois_job(Priority::Low, 0);
    job.advance();
    job.advance();
    job.advance();
    assert!(!job.cancel());
    assert_eq!(job.status(), JobStatus::Finishing);
}

#[test]
fn test_rank_orders_priority_before_weight() {
    let heavy_low = whois_job(Priority::Low, 1_000);
    let light_medium = whois_job(Priority::Medium, -5);
    assert!(light_medium.rank() > heavy_low.rank());
}

#[test]
fn test_priority_parse_and_display() {
    assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
    assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
    assert!("urgent".parse::<Priority>().is_err());
    assert_eq!(Priority::Medium.to_string(), "MEDIUM");
    assert!(Priority::Low < Priority::Medium);
    assert!(Priority::High < Priority::Critical);
}

#[test]
fn test_job_spec_from_json() {
    let spec: JobSpec = serde_json::from_str(
        r#"{
            "priority": "high",
            "weight": 7,
            "targets": ["10.1.0.0/16", "Example.org"],
            "exceptions": ["10.1.2.3"],
            "directive": {"technique": "nmap", "ports": [22, 443], "service_detection": true}
        }"#,
    )
    .unwrap();

    let job = spec.into_job().unwrap();
    assert_eq!(job.meta.kind, JobType::Nmap);
    assert_eq!(job.priority(), Priority::High);
    assert_eq!(job.weight(), 7);
    assert_eq!(job.payload.targets.len(), 2);
    assert_eq!(job.payload.targets[1].host, "example.org");
    assert_eq!(job.payload.exceptions[0].host, "10.1.2.3/32");
    match &job.directive {
        Directive::Nmap(nmap) => {
            assert_eq!(nmap.ports, vec![22, 443]);
            assert!(nmap.service_detection);
            assert_eq!(nmap.timing, TimingPolicy::default());
        }
        other => panic!("unexpected directive {:?}", other),
    }
}

#[test]
fn test_job_spec_with_bad_target_is_rejected() {
    let spec: JobSpec = serde_json::from_str(
        r#"{"priority": "low", "targets": ["not a host"], "directive": {"technique": "whois"}}"#,
    )
    .unwrap();
    assert!(matches!(
        spec.into_job().unwrap_err(),
        DispatchError::InvalidTarget { .. }
    ));
}

#[test]
fn test_load_jobs_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[
            {{"priority": "low", "targets": ["example.com"], "directive": {{"technique": "whois"}}}},
            {{"priority": "critical", "weight": 2, "targets": ["https://example.com/login"],
              "directive": {{"technique": "spider", "max_depth": 3}}}}
        ]"#
    )
    .unwrap();

    let jobs = load_jobs(file.path()).unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].meta.kind, JobType::Whois);
    assert_eq!(jobs[1].meta.kind, JobType::Spider);
    assert_eq!(jobs[1].priority(), Priority::Critical);
    assert!(jobs.iter().all(|j| j.status() == JobStatus::Pending));
}

#[test]
fn test_load_jobs_rejects_invalid_entries() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"priority": "low", "targets": [], "directive": {{"technique": "whois"}}}}]"#
    )
    .unwrap();
    assert!(load_jobs(file.path()).is_err());

    assert!(matches!(
        load_jobs("/nonexistent/jobs.json").unwrap_err(),
        DispatchError::Config(_)
    ));
}

#[test]
fn test_set_tasks_left() {
    let mut job = job_with(
        Priority::Medium,
        0,
        Directive::Whois(WhoisDirective::default()),
        &["example.com", "example.net"],
    );
    job.set_tasks_left(4);
    assert_eq!(job.meta.tasks_left, 4);
}
