//! Scan report classification and the records persisted for each report.
//!
//! Agents tag every streamed report with a numeric scan type. The scheduler
//! maps that code onto a [`ScanType`] and each type onto exactly one
//! [`ScanCategory`]; the ingestion pipeline runs one worker per category.
//! Unknown codes are rejected rather than guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Shodan,
    Censys,
    VirusTotal,
    AbuseIpDb,
    AlienVault,
    GreyNoise,
    NmapTcp,
    NmapUdp,
    Whois,
    Dns,
    HostDiscovery,
    SpiderCrawl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanCategory {
    Oss,
    Nmap,
    Whois,
    Dns,
    Discovery,
}

impl ScanCategory {
    pub const ALL: [ScanCategory; 5] = [
        ScanCategory::Oss,
        ScanCategory::Nmap,
        ScanCategory::Whois,
        ScanCategory::Dns,
        ScanCategory::Discovery,
    ];
}

impl std::fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanCategory::Oss => write!(f, "oss"),
            ScanCategory::Nmap => write!(f, "nmap"),
            ScanCategory::Whois => write!(f, "whois"),
            ScanCategory::Dns => write!(f, "dns"),
            ScanCategory::Discovery => write!(f, "discovery"),
        }
    }
}

impl ScanType {
    pub fn from_code(code: i32) -> Option<Self> {
        let scan_type = match code {
            100 => ScanType::Shodan,
            101 => ScanType::Censys,
            102 => ScanType::VirusTotal,
            103 => ScanType::AbuseIpDb,
            104 => ScanType::AlienVault,
            105 => ScanType::GreyNoise,
            200 => ScanType::NmapTcp,
            201 => ScanType::NmapUdp,
            300 => ScanType::Whois,
            400 => ScanType::Dns,
            500 => ScanType::HostDiscovery,
            501 => ScanType::SpiderCrawl,
            _ => return None,
        };
        Some(scan_type)
    }

    pub fn code(self) -> i32 {
        match self {
            ScanType::Shodan => 100,
            ScanType::Censys => 101,
            ScanType::VirusTotal => 102,
            ScanType::AbuseIpDb => 103,
            ScanType::AlienVault => 104,
            ScanType::GreyNoise => 105,
            ScanType::NmapTcp => 200,
            ScanType::NmapUdp => 201,
            ScanType::Whois => 300,
            ScanType::Dns => 400,
            ScanType::HostDiscovery => 500,
            ScanType::SpiderCrawl => 501,
        }
    }

    pub fn category(self) -> ScanCategory {
        match self {
            ScanType::Shodan
            | ScanType::Censys
            | ScanType::VirusTotal
            | ScanType::AbuseIpDb
            | ScanType::AlienVault
            | ScanType::GreyNoise => ScanCategory::Oss,
            ScanType::NmapTcp | ScanType::NmapUdp => ScanCategory::Nmap,
            ScanType::Whois => ScanCategory::Whois,
            ScanType::Dns => ScanCategory::Dns,
            ScanType::HostDiscovery | ScanType::SpiderCrawl => ScanCategory::Discovery,
        }
    }
}

/// Result of one technique against one target, as handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub job_id: Uuid,
    pub agent_id: u64,
    pub scan_type: ScanType,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScanRecord {
    pub fn success(
        job_id: Uuid,
        agent_id: u64,
        scan_type: ScanType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            job_id,
            agent_id,
            scan_type,
            data: Some(data),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        job_id: Uuid,
        agent_id: u64,
        scan_type: ScanType,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            agent_id,
            scan_type,
            data: None,
            error: Some(error.into()),
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
