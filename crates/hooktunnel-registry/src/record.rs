//! Persisted tunnel records

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Created, liveness not checked since
    Active,
    Running,
    Dead,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Active => write!(f, "active"),
            TunnelStatus::Running => write!(f, "running"),
            TunnelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// External service used to publish a tunnel on the internet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicProvider {
    Localtunnel,
}

impl fmt::Display for PublicProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicProvider::Localtunnel => write!(f, "{}", hooktunnel_runtime::LOCALTUNNEL),
        }
    }
}

impl std::str::FromStr for PublicProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "localtunnel" | "lt" => Ok(PublicProvider::Localtunnel),
            other => Err(format!("unknown public provider '{}'", other)),
        }
    }
}

/// Resource usage sampled during `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub name: String,
    pub local_port: u16,
    pub public_port: u16,
    pub subdomain: String,
    pub domain: String,
    pub public_url: String,
    pub local_url: String,
    pub public_host: String,
    pub curl_resolve_example: String,
    #[serde(deserialize_with = "deserialize_created_at")]
    pub created_at: DateTime<Local>,
    pub status: TunnelStatus,
    pub pid: Option<u32>,
    #[serde(default)]
    pub public_provider: Option<PublicProvider>,
    #[serde(default)]
    pub public_url_external: Option<String>,
    #[serde(default)]
    pub public_pid: Option<u32>,
    /// Not updated by the proxy yet
    #[serde(default)]
    pub requests_count: u64,
    #[serde(default)]
    pub last_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_info: Option<ProcessInfo>,
}

impl TunnelRecord {
    /// Build a fresh record with all derived URLs filled in
    pub fn new(name: &str, local_port: u16, public_port: u16, subdomain: &str, domain: &str) -> Self {
        let public_host = public_host(subdomain, domain);
        let public_url = format!("http://{}:{}", public_host, public_port);
        let curl_resolve_example = format!(
            "curl --resolve {}:{}:127.0.0.1 {}",
            public_host, public_port, public_url
        );

        Self {
            name: name.to_string(),
            local_port,
            public_port,
            subdomain: subdomain.to_string(),
            domain: domain.to_string(),
            local_url: format!("http://127.0.0.1:{}", public_port),
            public_url,
            public_host,
            curl_resolve_example,
            created_at: Local::now(),
            status: TunnelStatus::Active,
            pid: None,
            public_provider: None,
            public_url_external: None,
            public_pid: None,
            requests_count: 0,
            last_request: None,
            process_info: None,
        }
    }

    pub fn clear_public_runtime(&mut self) {
        self.public_url_external = None;
        self.public_pid = None;
    }
}

/// RFC 3339, or a naive ISO timestamp taken as local time
fn deserialize_created_at<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid created_at timestamp '{}'", raw))
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Local>> {
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(stamp.with_timezone(&Local));
    }
    let naive: NaiveDateTime = raw.parse().ok()?;
    // Times skipped by a DST jump have no local mapping
    Some(
        Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| Local.from_utc_datetime(&naive)),
    )
}

/// `sub.domain`, or just `sub` when no domain is configured
pub fn public_host(subdomain: &str, domain: &str) -> String {
    if domain.is_empty() {
        subdomain.to_string()
    } else {
        format!("{}.{}", subdomain, domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_urls() {
        let record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        assert_eq!(record.public_host, "api.localhost");
        assert_eq!(record.public_url, "http://api.localhost:8000");
        assert_eq!(record.local_url, "http://127.0.0.1:8000");
        assert_eq!(
            record.curl_resolve_example,
            "curl --resolve api.localhost:8000:127.0.0.1 http://api.localhost:8000"
        );
        assert_eq!(record.status, TunnelStatus::Active);
        assert_eq!(record.requests_count, 0);
    }

    #[test]
    fn test_empty_domain() {
        let record = TunnelRecord::new("web", 5173, 8001, "frontend", "");
        assert_eq!(record.public_host, "frontend");
        assert_eq!(record.public_url, "http://frontend:8001");
    }

    #[test]
    fn test_json_field_names() {
        let mut record = TunnelRecord::new("api", 3000, 8000, "api", "localhost");
        record.public_provider = Some(PublicProvider::Localtunnel);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "active");
        assert_eq!(json["public_provider"], "localtunnel");
        assert!(json["pid"].is_null());
        assert!(json.get("process_info").is_none());
    }

    #[test]
    fn test_older_records_without_public_fields() {
        let json = r#"{
            "name": "api", "local_port": 3000, "public_port": 8000,
            "subdomain": "api", "domain": "localhost",
            "public_url": "http://api.localhost:8000",
            "local_url": "http://127.0.0.1:8000",
            "public_host": "api.localhost",
            "curl_resolve_example": "curl --resolve api.localhost:8000:127.0.0.1 http://api.localhost:8000",
            "created_at": "2024-01-01T12:00:00+00:00",
            "status": "running", "pid": 4242
        }"#;
        let record: TunnelRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.pid, Some(4242));
        assert_eq!(record.public_provider, None);
        assert_eq!(record.requests_count, 0);
    }

    #[test]
    fn test_naive_created_at_is_local_time() {
        let json = r#"{
            "name": "legacy", "local_port": 3001, "public_port": 8001,
            "subdomain": "legacy", "domain": "localhost",
            "public_url": "http://legacy.localhost:8001",
            "local_url": "http://127.0.0.1:8001",
            "public_host": "legacy.localhost",
            "curl_resolve_example": "curl --resolve legacy.localhost:8001:127.0.0.1 http://legacy.localhost:8001",
            "created_at": "2024-01-01T12:00:00.123456",
            "status": "active", "pid": null
        }"#;
        let record: TunnelRecord = serde_json::from_str(json).unwrap();
        assert_eq!(
            record.created_at.naive_local().to_string(),
            "2024-01-01 12:00:00.123456"
        );

        // Saved back with an offset
        let saved = serde_json::to_value(&record).unwrap();
        let reloaded: TunnelRecord = serde_json::from_value(saved).unwrap();
        assert_eq!(reloaded.created_at, record.created_at);
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-01-01T12:00:00").is_some());
        assert!(parse_timestamp("2024-01-01T12:00:00Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("localtunnel".parse::<PublicProvider>(), Ok(PublicProvider::Localtunnel));
        assert!("ngrok".parse::<PublicProvider>().is_err());
    }
}
