use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use crate::auth::Credentials;

/// Server settings, read once at start-up from `VANBOOK_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub webhook_port: u16,
    pub metrics_port: Option<u16>,
    pub data_dir: PathBuf,
    pub credentials: Credentials,
    pub staff_email: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: u64,
    pub min_lead_days: u32,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let num = |key: &str| get(key).and_then(|s| s.trim().parse().ok());

        let tls_cert = get("VANBOOK_TLS_CERT");
        let tls_key = get("VANBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "both VANBOOK_TLS_CERT and VANBOOK_TLS_KEY must be set, or neither",
            ));
        }

        Ok(Self {
            bind: text("VANBOOK_BIND", "0.0.0.0"),
            port: parse_or(&get, "VANBOOK_PORT", 5433),
            webhook_port: parse_or(&get, "VANBOOK_WEBHOOK_PORT", 8080),
            metrics_port: num("VANBOOK_METRICS_PORT"),
            data_dir: PathBuf::from(text("VANBOOK_DATA_DIR", "./data")),
            credentials: Credentials {
                app_password: text("VANBOOK_PASSWORD", "vanbook"),
                staff_user: text("VANBOOK_STAFF_USER", "staff"),
                staff_password: text("VANBOOK_STAFF_PASSWORD", "vanbook-staff"),
            },
            staff_email: text("VANBOOK_STAFF_EMAIL", "bookings@localhost"),
            webhook_secret: text("VANBOOK_WEBHOOK_SECRET", ""),
            webhook_tolerance_secs: parse_or(&get, "VANBOOK_WEBHOOK_TOLERANCE_SECS", 300),
            min_lead_days: parse_or(&get, "VANBOOK_MIN_LEAD_DAYS", 0),
            max_connections: parse_or(&get, "VANBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: parse_or(&get, "VANBOOK_COMPACT_THRESHOLD", 1000),
            tls_cert,
            tls_key,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("vanbook.wal")
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
