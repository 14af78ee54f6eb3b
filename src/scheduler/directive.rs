use serde::{Deserialize, Serialize};

use crate::scheduler::job::JobType;

/// Timing knobs forwarded to the agent. The scheduler never enforces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    pub timeout_ms: u64,
    pub delay_ms: u64,
    pub retries: u32,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            delay_ms: 0,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OssProvider {
    Shodan,
    Censys,
    VirusTotal,
    AbuseIpDb,
    AlienVault,
    GreyNoise,
}

impl OssProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            OssProvider::Shodan => "shodan",
            OssProvider::Censys => "censys",
            OssProvider::VirusTotal => "virustotal",
            OssProvider::AbuseIpDb => "abuseipdb",
            OssProvider::AlienVault => "alienvault",
            OssProvider::GreyNoise => "greynoise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OssDirective {
    pub providers: Vec<OssProvider>,
    #[serde(default)]
    pub timing: TimingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NmapDirective {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub service_detection: bool,
    #[serde(default)]
    pub os_detection: bool,
    #[serde(default)]
    pub timing: TimingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WhoisDirective {
    #[serde(default)]
    pub timing: TimingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsDirective {
    #[serde(default)]
    pub record_types: Vec<String>,
    #[serde(default)]
    pub timing: TimingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryDirective {
    #[serde(default)]
    pub ping_sweep: bool,
    #[serde(default)]
    pub timing: TimingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderDirective {
    pub max_depth: u32,
    #[serde(default)]
    pub follow_external: bool,
    #[serde(default)]
    pub timing: TimingPolicy,
}

/// Technique-specific instructions for a job. Exactly one per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "lowercase")]
pub enum Directive {
    Oss(OssDirective),
    Nmap(NmapDirective),
    Whois(WhoisDirective),
    Dns(DnsDirective),
    Discovery(DiscoveryDirective),
    Spider(SpiderDirective),
}

impl Directive {
    pub fn job_type(&self) -> JobType {
        match self {
            Directive::Oss(_) => JobType::Oss,
            Directive::Nmap(_) => JobType::Nmap,
            Directive::Whois(_) => JobType::Whois,
            Directive::Dns(_) => JobType::Dns,
            Directive::Discovery(_) => JobType::Discovery,
            Directive::Spider(_) => JobType::Spider,
        }
    }

    pub fn timing(&self) -> &TimingPolicy {
        match self {
            Directive::Oss(d) => &d.timing,
            Directive::Nmap(d) => &d.timing,
            Directive::Whois(d) => &d.timing,
            Directive::Dns(d) => &d.timing,
            Directive::Discovery(d) => &d.timing,
            Directive::Spider(d) => &d.timing,
        }
    }

    /// Checks the knobs that would make the agent reject the job outright.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Directive::Oss(d) if d.providers.is_empty() => {
                Err("oss directive has no providers".to_string())
            }
            Directive::Nmap(d) if d.ports.contains(&0) => {
                Err("nmap directive contains port 0".to_string())
            }
            Directive::Spider(d) if d.max_depth == 0 => {
                Err("spider directive needs max_depth > 0".to_string())
            }
            _ => Ok(()),
        }
    }
}
