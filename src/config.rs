//! Process configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `LISTEN_ADDR` | `0.0.0.0:5000` |
//! | `RUN_MODE` | `all` (`server`, `worker`) |
//! | `SHARED_DIR` | `/app/shared` |
//! | `FONTS_DIR` | `/usr/share/fonts/truetype/custom` |
//! | `QUEUE_BACKEND` | `redis` (`memory`) |
//! | `REDIS_URL` | `redis://127.0.0.1/` |
//! | `QUEUE_NAME` | `pdf_jobs` |
//! | `QUEUE_USER`, `QUEUE_PASS` | unset |
//! | `AUTH_USER`, `AUTH_PASS` | `admin`, `password` |
//! | `WORKER_CONCURRENCY` | `4` |
//! | `CONVERSION_TIMEOUT_SECS` | `60` |
//! | `MAX_ATTEMPTS` | `3` |
//! | `ENGINE_PROGRAM`, `ENGINE_ARGS` | `soffice`, empty |
//! | `FONT_CACHE_PROGRAM` | `fc-cache` |
//! | `RETAIN_SCRATCH` | `false` |
//! | `RECOVER_IN_FLIGHT` | `true` |
//! | `MAX_UPLOAD_MB` | `50` |
//! | `LOG_JSON` | `false` |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset (exporter disabled) |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::converter::DEFAULT_TIMEOUT;
use crate::job::DEFAULT_MAX_ATTEMPTS;
use crate::queue::DEFAULT_QUEUE_NAME;

const DEFAULT_AUTH_USER: &str = "admin";
const DEFAULT_AUTH_PASS: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    Server,
    Worker,
}

impl RunMode {
    pub fn runs_server(self) -> bool {
        matches!(self, RunMode::All | RunMode::Server)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, RunMode::All | RunMode::Worker)
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(RunMode::All),
            "server" => Ok(RunMode::Server),
            "worker" => Ok(RunMode::Worker),
            other => bail!("unknown RUN_MODE '{other}' (expected all, server or worker)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" => Ok(QueueBackend::Memory),
            other => bail!("unknown QUEUE_BACKEND '{other}' (expected redis or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub run_mode: RunMode,
    pub shared_dir: PathBuf,
    pub fonts_dir: PathBuf,
    pub queue_backend: QueueBackend,
    pub redis_url: String,
    pub queue_name: String,
    pub queue_credentials: Option<Credentials>,
    pub auth: Credentials,
    pub worker_concurrency: usize,
    pub conversion_timeout: Duration,
    pub max_attempts: u32,
    pub engine_program: String,
    pub engine_args: Vec<String>,
    pub font_cache_program: String,
    pub retain_scratch: bool,
    pub recover_in_flight: bool,
    pub max_upload_bytes: usize,
    pub log_json: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let queue_credentials = match (get("QUEUE_USER"), get("QUEUE_PASS")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => bail!("QUEUE_USER and QUEUE_PASS must be set together"),
        };

        let config = Self {
            listen_addr: parse(&get, "LISTEN_ADDR", "0.0.0.0:5000")?,
            run_mode: parse(&get, "RUN_MODE", "all")?,
            shared_dir: PathBuf::from(or("SHARED_DIR", "/app/shared")),
            fonts_dir: PathBuf::from(or("FONTS_DIR", "/usr/share/fonts/truetype/custom")),
            queue_backend: parse(&get, "QUEUE_BACKEND", "redis")?,
            redis_url: or("REDIS_URL", "redis://127.0.0.1/"),
            queue_name: or("QUEUE_NAME", DEFAULT_QUEUE_NAME),
            queue_credentials,
            auth: Credentials {
                username: or("AUTH_USER", DEFAULT_AUTH_USER),
                password: or("AUTH_PASS", DEFAULT_AUTH_PASS),
            },
            worker_concurrency: parse(&get, "WORKER_CONCURRENCY", "4")?,
            conversion_timeout: Duration::from_secs(parse(
                &get,
                "CONVERSION_TIMEOUT_SECS",
                &DEFAULT_TIMEOUT.as_secs().to_string(),
            )?),
            max_attempts: parse(&get, "MAX_ATTEMPTS", &DEFAULT_MAX_ATTEMPTS.to_string())?,
            engine_program: or("ENGINE_PROGRAM", "soffice"),
            engine_args: get("ENGINE_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            font_cache_program: or("FONT_CACHE_PROGRAM", "fc-cache"),
            retain_scratch: parse_flag(&get, "RETAIN_SCRATCH", false)?,
            recover_in_flight: parse_flag(&get, "RECOVER_IN_FLIGHT", true)?,
            max_upload_bytes: parse::<usize, _>(&get, "MAX_UPLOAD_MB", "50")?.saturating_mul(1024 * 1024),
            log_json: parse_flag(&get, "LOG_JSON", false)?,
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.conversion_timeout.is_zero() {
            bail!("CONVERSION_TIMEOUT_SECS must be greater than zero");
        }
        if self.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.run_mode.runs_workers() && self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1 when workers run");
        }
        if self.queue_backend == QueueBackend::Memory && self.run_mode != RunMode::All {
            bail!("QUEUE_BACKEND=memory requires RUN_MODE=all");
        }
        Ok(())
    }

    /// Whether the built-in basic-auth credentials are still in use.
    pub fn uses_default_auth(&self) -> bool {
        self.auth.username == DEFAULT_AUTH_USER && self.auth.password == DEFAULT_AUTH_PASS
    }
}

fn parse<T, G>(get: &G, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid value for {key}: '{raw}'"))
}

fn parse_flag<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse_bool(&raw).with_context(|| format!("invalid value for {key}: '{raw}'")),
    }
}

/// Accepts the spellings clients actually send: `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("not a boolean: '{other}'"),
    }
}
