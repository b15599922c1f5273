use anyhow::{anyhow, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Name of the table every fresh process starts with.
pub const DEFAULT_TABLE: &str = "store";

/// Interval between periodic snapshots when none is configured.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// How the command scheduler admits reads while other commands are in flight.
///
/// ## Policies
/// - **Serial**: every command holds the exclusive gate for its whole
///   lifetime, so commands execute strictly one at a time in arrival order.
/// - **ConcurrentReads**: writes hold the exclusive gate; reads share it and
///   may complete in any order relative to each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdmissionPolicy {
    #[default]
    Serial,
    ConcurrentReads,
}

impl FromStr for AdmissionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(AdmissionPolicy::Serial),
            "concurrent-reads" | "concurrent_reads" => Ok(AdmissionPolicy::ConcurrentReads),
            other => Err(anyhow!("unknown admission policy '{}'", other)),
        }
    }
}

/// Runtime configuration for the listener and the persistence scheduler.
///
/// Built once in `main` from command-line flags (with environment fallbacks)
/// and handed to the engine and the server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0`
    pub host: String,
    /// TCP port to bind
    pub port: u16,
    /// CA bundle used to verify client certificates
    pub ca_path: PathBuf,
    /// Server certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Server private key (PEM)
    pub key_path: PathBuf,
    /// Durable snapshot file, loaded at startup and rewritten on every export
    pub dump_path: PathBuf,
    /// Period of the snapshot timer
    pub sync_interval: Duration,
    /// Upper bound on the final export during shutdown
    pub shutdown_grace: Duration,
    /// Read admission policy of the command scheduler
    pub policy: AdmissionPolicy,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            ca_path: PathBuf::from("ca.crt"),
            cert_path: PathBuf::from("server.crt"),
            key_path: PathBuf::from("server.key"),
            dump_path: PathBuf::from("data.sqlite"),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            shutdown_grace: Duration::from_secs(5),
            policy: AdmissionPolicy::Serial,
        }
    }
}

/// Parses a snapshot interval such as `90`, `45s`, `10m` or `1h30m`.
///
/// A bare integer is a number of seconds. Otherwise the input must be a
/// sequence of `<digits><unit>` groups where the unit is `h`, `m` or `s`;
/// the groups are summed. Zero-length intervals are rejected because the
/// timer would spin.
///
/// ## Example
/// ```rust
/// use std::time::Duration;
/// use tlite::config::parse_interval;
///
/// assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
/// ```
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(anyhow!("empty interval"));
    }

    let secs = if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse::<u64>()?
    } else {
        let mut total: u64 = 0;
        let mut digits = String::new();
        for ch in s.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            let scale = match ch {
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return Err(anyhow!("invalid interval '{}': unexpected '{}'", raw, ch)),
            };
            if digits.is_empty() {
                return Err(anyhow!("invalid interval '{}': unit without a number", raw));
            }
            let n: u64 = digits.parse()?;
            digits.clear();
            total = n
                .checked_mul(scale)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| anyhow!("interval '{}' overflows", raw))?;
        }
        if !digits.is_empty() {
            return Err(anyhow!("invalid interval '{}': trailing number without unit", raw));
        }
        total
    };

    if secs == 0 {
        return Err(anyhow!("interval '{}' must be greater than zero", raw));
    }
    Ok(Duration::from_secs(secs))
}
