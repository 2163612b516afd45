use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::connection::RetryPolicy;
use crate::error::{Result, StoreError};

/// Connection knobs of the relational backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationalSettings {
    /// Full connection URL. When set, host/port/credentials are ignored.
    pub database_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database_name: Option<String>,
    pub max_open_connections: Option<u32>,
    pub max_idle_connections: Option<u32>,
    /// Duration string such as `30m`, `1h30m` or `500ms`.
    pub conn_max_lifetime: Option<String>,
    pub max_connect_attempts: Option<i64>,
    /// Seconds between reconnect attempts.
    pub connection_retry_delay: Option<i64>,
    pub tls_enable: bool,
    pub tls_mode: Option<String>,
    /// File path or inline PEM.
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

const DEFAULT_MAX_OPEN: u32 = 10;
const DEFAULT_MAX_IDLE: u32 = 2;

/// Pool sizing resolved from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
}

impl RelationalSettings {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            database_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn is_sqlite(&self) -> bool {
        self.database_url
            .as_deref()
            .is_some_and(|u| u.starts_with("sqlite:"))
    }

    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = self.database_url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }

        let host = required("host", &self.host)?;
        let port = self
            .port
            .ok_or_else(|| StoreError::validation("Required parameter port is missing"))?;
        let db = required("databaseName", &self.database_name)?;
        let user = required("user", &self.user)?;
        let password = required("password", &self.password)?;

        let mut url = format!(
            "postgres://{}:{}@{}:{}/{}",
            encode_component(user),
            encode_component(password),
            host,
            port,
            encode_component(db)
        );

        if !self.tls_enable {
            url.push_str("?sslmode=disable");
            return Ok(url);
        }

        let mode = match self.tls_mode.as_deref() {
            Some("VerifyCA") => "verify-ca",
            Some("VerifyFull") => "verify-full",
            _ => "require",
        };
        url.push_str(&format!("?sslmode={}", mode));
        for (param, name, material) in [
            ("sslrootcert", "ca", &self.ca_cert),
            ("sslcert", "cert", &self.client_cert),
            ("sslkey", "key", &self.client_key),
        ] {
            if let Some(material) = material.as_deref().filter(|m| !m.is_empty()) {
                let path = pem_path(name, material)?;
                url.push_str(&format!("&{}={}", param, path.display()));
            }
        }
        Ok(url)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let attempts = self.max_connect_attempts.unwrap_or(0);
        if attempts < 0 {
            return Err(StoreError::validation("maxConnectAttempts cannot be negative"));
        }
        let delay = self.connection_retry_delay.unwrap_or(0);
        if delay < 0 {
            return Err(StoreError::validation("connectionRetryDelay cannot be negative"));
        }
        Ok(RetryPolicy {
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            delay: Duration::from_secs(delay as u64),
        })
    }

    pub fn pool_limits(&self) -> Result<PoolLimits> {
        let max_open = self.max_open_connections.unwrap_or(DEFAULT_MAX_OPEN).max(1);
        let max_idle = self.max_idle_connections.unwrap_or(DEFAULT_MAX_IDLE).min(max_open);
        let max_lifetime = match self.conn_max_lifetime.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(parse_duration(raw)?),
            _ => None,
        };
        Ok(PoolLimits {
            max_open,
            max_idle,
            max_lifetime,
        })
    }
}

fn required<'a>(name: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StoreError::validation(format!("Required parameter {} is missing", name)))
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inline PEM material is written to a file the driver can read.
fn pem_path(name: &str, material: &str) -> Result<PathBuf> {
    if !material.trim_start().starts_with("-----BEGIN") {
        return Ok(PathBuf::from(material));
    }
    let failed =
        |e: std::io::Error| StoreError::validation(format!("cannot write {} certificate: {}", name, e));
    // Owner-only file with a random name; kept for the lifetime of the pool.
    let mut file = tempfile::Builder::new()
        .prefix(&format!("flowstate-{}-", name))
        .suffix(".pem")
        .tempfile()
        .map_err(failed)?;
    file.write_all(material.as_bytes()).map_err(failed)?;
    let (_, path) = file.keep().map_err(|e| failed(e.error))?;
    Ok(path)
}

/// Parse a duration string made of `<number><unit>` pairs, e.g. `1h30m` or `1.5s`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let invalid = || StoreError::validation(format!("invalid duration: {}", raw));
    let s = raw.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let secs_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * secs_per_unit;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}
