use std::env;
use std::path::PathBuf;
use std::time::Duration;

use russ_wire::DecodeOptions;
use russ_wire::MAX_REQUEST_BYTES;

const DEFAULT_SERVICES_DIR: &str = "/srv/russ";
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ANSWER_TICK_MS: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WORKERS: usize = 4;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration =
    Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);

#[derive(Debug, Clone)]
pub struct RussConfig {
    /// Directory that `+` prefixed service addresses expand into.
    pub services_dir: PathBuf,
    pub strict_attributes: bool,
    pub max_request_bytes: usize,
    pub dial_timeout: Duration,
    /// Time an accepted dialer has to deliver its request frame.
    pub request_timeout: Duration,
    /// Worker threads for the service loop; `0` dispatches on the loop thread.
    pub workers: usize,
    /// How long a single service-loop `answer` waits before rechecking shutdown.
    pub answer_tick: Duration,
}

impl Default for RussConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RussConfig {
    pub fn from_env() -> Self {
        Self {
            services_dir: env::var("RUSS_SERVICES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SERVICES_DIR)),
            strict_attributes: env::var("RUSS_STRICT_ATTRS")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            max_request_bytes: env_parse("RUSS_MAX_REQUEST").unwrap_or(MAX_REQUEST_BYTES),
            dial_timeout: Duration::from_millis(
                env_parse("RUSS_DIAL_TIMEOUT_MS").unwrap_or(DEFAULT_DIAL_TIMEOUT_MS),
            ),
            request_timeout: Duration::from_millis(
                env_parse("RUSS_REQUEST_TIMEOUT_MS").unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            workers: env_parse("RUSS_WORKERS").unwrap_or(DEFAULT_WORKERS),
            answer_tick: Duration::from_millis(
                env_parse("RUSS_ANSWER_TICK_MS").unwrap_or(DEFAULT_ANSWER_TICK_MS),
            ),
        }
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            strict_attributes: self.strict_attributes,
            max_request_bytes: self.max_request_bytes,
            ..DecodeOptions::default()
        }
    }

    pub fn with_services_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.services_dir = dir.into();
        self
    }

    pub fn with_strict_attributes(mut self, strict: bool) -> Self {
        self.strict_attributes = strict;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_answer_tick(mut self, tick: Duration) -> Self {
        self.answer_tick = tick;
        self
    }
}
