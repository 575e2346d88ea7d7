//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or malformed.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub broker: BrokerConfig,
    pub stream: StreamConfig,
    pub http_bind: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Connection settings for the STOMP broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// STOMP `host` header. Defaults to the broker host.
    pub vhost: String,
    pub user: String,
    pub password: SecretString,
    /// Inbound topic; announcements are broadcast back onto it.
    pub topic: String,
    pub client_id: String,
    pub tls: Option<TlsConfig>,
    pub reconnect_delay: Duration,
    /// (client send interval, expected server interval) in milliseconds.
    pub heartbeat: (u64, u64),
    pub connect_timeout: Duration,
}

/// PEM material for a TLS broker session.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_certs: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Live-stream tuning for dashboard subscribers.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl BrokerConfig {
    /// Plain-TCP settings for a local broker. Used by tests.
    pub fn local(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            vhost: host.clone(),
            host,
            port,
            user: "admin".to_string(),
            password: SecretString::from("admin"),
            topic: "epictopic".to_string(),
            client_id: "swf-monitor".to_string(),
            tls: None,
            reconnect_delay: Duration::from_secs(10),
            heartbeat: (5000, 10000),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let host = vars.string("BROKER_HOST", "localhost");
        let tls = if vars.parse("BROKER_USE_TLS", false)? {
            let ca_certs = vars.required("BROKER_CA_CERTS").map_err(|_| {
                Error::Config("BROKER_USE_TLS is set but BROKER_CA_CERTS is missing".to_string())
            })?;
            let cert_file = vars.optional("BROKER_CERT_FILE").map(PathBuf::from);
            let key_file = vars.optional("BROKER_KEY_FILE").map(PathBuf::from);
            if cert_file.is_some() != key_file.is_some() {
                return Err(Error::Config(
                    "BROKER_CERT_FILE and BROKER_KEY_FILE must be set together".to_string(),
                ));
            }
            Some(TlsConfig {
                ca_certs: PathBuf::from(ca_certs),
                cert_file,
                key_file,
            })
        } else {
            None
        };

        let broker = BrokerConfig {
            vhost: vars.optional("BROKER_VHOST").unwrap_or_else(|| host.clone()),
            host,
            port: vars.parse("BROKER_PORT", 61612)?,
            user: vars.string("BROKER_USER", "admin"),
            password: SecretString::from(vars.string("BROKER_PASSWORD", "admin")),
            topic: vars.string("BROKER_TOPIC", "epictopic"),
            client_id: vars.string("BROKER_CLIENT_ID", "swf-monitor"),
            tls,
            reconnect_delay: Duration::from_secs(vars.parse("BROKER_RECONNECT_DELAY_SECS", 10)?),
            heartbeat: parse_heartbeat(&vars.string("BROKER_HEARTBEAT_MS", "5000,10000"))?,
            connect_timeout: Duration::from_secs(vars.positive("BROKER_CONNECT_TIMEOUT_SECS", 10)?),
        };

        let stream = StreamConfig {
            queue_capacity: vars.parse("SSE_QUEUE_CAPACITY", 100usize)?.max(1),
            heartbeat_interval: Duration::from_secs(vars.positive("SSE_HEARTBEAT_SECS", 30)?),
            poll_interval: Duration::from_millis(vars.positive("SSE_POLL_MS", 1000)?),
        };

        Ok(Self {
            database_url: SecretString::from(vars.required("DATABASE_URL")?),
            broker,
            stream,
            http_bind: vars.parse("HTTP_BIND", SocketAddr::from(([0, 0, 0, 0], 8002)))?,
            otel_endpoint: vars.optional("OTEL_ENDPOINT"),
            log_level: vars.string("LOG_LEVEL", "info"),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
            None => Ok(default),
        }
    }

    /// A count or duration where zero is meaningless.
    fn positive(&self, name: &str, default: u64) -> Result<u64> {
        match self.parse(name, default)? {
            0 => Err(Error::Config(format!("{name} must be greater than zero"))),
            n => Ok(n),
        }
    }
}

fn parse_heartbeat(raw: &str) -> Result<(u64, u64)> {
    let bad = || Error::Config(format!("invalid BROKER_HEARTBEAT_MS: {raw:?}"));
    let (send, recv) = raw.split_once(',').ok_or_else(bad)?;
    Ok((
        send.trim().parse().map_err(|_| bad())?,
        recv.trim().parse().map_err(|_| bad())?,
    ))
}
