//! Environment-driven configuration.
//!
//! Every key has a development default. Unset connection URLs select the
//! in-memory adapters.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::reaper::ReaperConfig;
use crate::retry::RetryPolicy;
use crate::service::DEFAULT_BUCKET;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(
        "PROCESSING_TIMEOUT_SECS ({timeout_secs}s) must exceed the worst-case processing time ({worst_case_secs}s)"
    )]
    TimeoutTooShort {
        timeout_secs: u64,
        worst_case_secs: u64,
    },
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub prompt_file: PathBuf,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub document_root: PathBuf,
    pub document_bucket: String,
    pub llm: LlmConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
    /// Run a worker and a reaper inside the API process.
    pub embedded_worker: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let api_key = env.string("LLM_API_KEY");
        if api_key.is_none() {
            warn!("LLM_API_KEY not set; analysis calls will fail");
        }

        let retry = RetryPolicy {
            max_attempts: env.parse("LLM_MAX_ATTEMPTS", 5u32)?,
            base_delay: Duration::from_millis(env.parse("LLM_BASE_DELAY_MS", 1_000u64)?),
            growth_factor: env.parse("LLM_BACKOFF_FACTOR", 2.0f64)?,
            jitter: env.parse("LLM_JITTER", true)?,
            max_delay: Some(Duration::from_millis(env.parse("LLM_MAX_DELAY_MS", 30_000u64)?)),
        };

        let worker = WorkerConfig {
            dequeue_timeout: Duration::from_secs(env.parse("WORKER_DEQUEUE_TIMEOUT_SECS", 10u64)?),
            error_backoff: Duration::from_secs(env.parse("WORKER_ERROR_BACKOFF_SECS", 3u64)?),
            upload_poll_interval: Duration::from_millis(
                env.parse("UPLOAD_POLL_INTERVAL_MS", 2_000u64)?,
            ),
            upload_poll_attempts: env.parse("UPLOAD_POLL_ATTEMPTS", 15u32)?,
            ..WorkerConfig::default()
        };

        let reaper = ReaperConfig {
            interval: Duration::from_secs(env.parse("REAPER_INTERVAL_SECS", 30u64)?),
            processing_timeout: Duration::from_secs(env.parse("PROCESSING_TIMEOUT_SECS", 600u64)?),
            max_reclaims: env.parse("MAX_RECLAIMS", 3u32)?,
            ..ReaperConfig::default()
        };

        let config = Self {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            document_root: env
                .string("DOCUMENT_ROOT")
                .map_or_else(|| PathBuf::from("./data/documents"), PathBuf::from),
            document_bucket: env
                .string("DOCUMENT_BUCKET")
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            llm: LlmConfig {
                endpoint: env.string("LLM_ENDPOINT").unwrap_or_else(|| {
                    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
                }),
                api_key,
                model: env.string("LLM_MODEL").unwrap_or_else(|| "qwen-plus".to_string()),
                prompt_file: env
                    .string("PROMPT_FILE")
                    .map_or_else(|| PathBuf::from("prompts/doc-check-latest.md"), PathBuf::from),
                retry,
            },
            worker,
            reaper,
            embedded_worker: env.parse("EMBEDDED_WORKER", true)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Worst case a healthy worker can hold a claim: the full upload wait
    /// plus every analysis attempt's sleep.
    pub fn worst_case_processing(&self) -> Duration {
        let retry = &self.llm.retry;
        let sleeps = (1..retry.max_attempts)
            .map(|attempt| {
                let nominal = retry.nominal_delay(attempt);
                // Jitter can stretch a sleep by 20%.
                let longest = if retry.jitter {
                    nominal.saturating_add(nominal / 5)
                } else {
                    nominal
                };
                retry.max_delay.map_or(longest, |cap| longest.min(cap))
            })
            .fold(Duration::ZERO, Duration::saturating_add);
        self.worker.max_upload_wait().saturating_add(sleeps)
    }

    /// Reject zero waits and a visibility timeout that would reclaim
    /// healthy work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A zero blocking pop waits forever on Redis; a zero interval spins.
        for (key, value) in [
            ("WORKER_DEQUEUE_TIMEOUT_SECS", self.worker.dequeue_timeout),
            ("REAPER_INTERVAL_SECS", self.reaper.interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let worst_case = self.worst_case_processing();
        if self.reaper.processing_timeout <= worst_case {
            return Err(ConfigError::TimeoutTooShort {
                timeout_secs: self.reaper.processing_timeout.as_secs(),
                worst_case_secs: worst_case.as_secs(),
            });
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
