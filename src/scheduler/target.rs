use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Cidr,
    Domain,
    Url,
    Email,
}

impl TargetKind {
    pub fn code(self) -> i32 {
        match self {
            TargetKind::Cidr => 0,
            TargetKind::Domain => 1,
            TargetKind::Url => 2,
            TargetKind::Email => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TargetKind::Cidr),
            1 => Some(TargetKind::Domain),
            2 => Some(TargetKind::Url),
            3 => Some(TargetKind::Email),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Cidr => write!(f, "cidr"),
            TargetKind::Domain => write!(f, "domain"),
            TargetKind::Url => write!(f, "url"),
            TargetKind::Email => write!(f, "email"),
        }
    }
}

/// A single host to scan (or to skip, when listed as an exception).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub kind: TargetKind,
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
            .expect("email pattern is valid")
    })
}

impl Target {
    pub fn new(host: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            host: host.into(),
            kind,
        }
    }

    /// Confirm the host still classifies as the kind it is labelled with.
    pub fn check(&self) -> Result<()> {
        let parsed = Self::parse(&self.host)?;
        if parsed.kind != self.kind {
            return Err(DispatchError::invalid_target(
                &self.host,
                format!("labelled {} but looks like {}", self.kind, parsed.kind),
            ));
        }
        Ok(())
    }

    /// Classify a raw operator-supplied string.
    ///
    /// Bare addresses become single-host networks (`/32` or `/128`), networks
    /// keep the notation they were given, and host names are split into
    /// domains and URLs depending on whether they carry a scheme or a path.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(DispatchError::invalid_target(input, "empty target"));
        }

        if raw.contains('@') {
            return Self::parse_email(raw);
        }

        if let Ok(ip) = IpAddr::from_str(raw) {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            return Ok(Self::new(format!("{}/{}", ip, prefix), TargetKind::Cidr));
        }

        if let Some((addr, _mask)) = raw.split_once('/') {
            if IpAddr::from_str(addr).is_ok() {
                let net = IpNet::from_str(raw)
                    .map_err(|e| DispatchError::invalid_target(input, e.to_string()))?;
                return Ok(Self::new(net.to_string(), TargetKind::Cidr));
            }
        }

        if let Some(rest) = raw.strip_prefix("//") {
            if !rest.contains('/') {
                return Self::parse_domain(rest, input);
            }
            return Self::parse_url(&format!("http:{}", raw), raw, input);
        }

        if raw.contains("://") {
            return Self::parse_url(raw, raw, input);
        }

        if raw.contains('/') {
            return Self::parse_url(&format!("http://{}", raw), raw, input);
        }

        Self::parse_domain(raw, input)
    }

    fn parse_email(raw: &str) -> Result<Self> {
        if email_regex().is_match(raw) {
            Ok(Self::new(raw.to_lowercase(), TargetKind::Email))
        } else {
            Err(DispatchError::invalid_target(raw, "malformed email address"))
        }
    }

    fn parse_url(candidate: &str, keep: &str, input: &str) -> Result<Self> {
        let url = url::Url::parse(candidate)
            .map_err(|e| DispatchError::invalid_target(input, e.to_string()))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(DispatchError::invalid_target(input, "url has no host"));
        }
        Ok(Self::new(keep, TargetKind::Url))
    }

    fn parse_domain(raw: &str, input: &str) -> Result<Self> {
        let domain = raw.trim_end_matches('.').to_lowercase();
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 {
            return Err(DispatchError::invalid_target(input, "domain has no suffix"));
        }
        let valid = labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
        if !valid {
            return Err(DispatchError::invalid_target(input, "malformed domain"));
        }
        Ok(Self::new(domain, TargetKind::Domain))
    }
}

impl FromStr for Target {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.host, self.kind)
    }
}
