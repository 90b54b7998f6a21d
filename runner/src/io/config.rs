//! Runner configuration stored as TOML (e.g. `step-runner.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::correction::RetryPolicy;

/// Runner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Correction bound per step index.
    pub max_attempts: u32,

    /// Upper bound on one step executor call.
    pub executor_timeout_secs: u64,

    /// Upper bound on one semantic judge call.
    pub judge_timeout_secs: u64,

    /// Run lease expiry; renewed at every step boundary.
    pub lease_ttl_secs: u64,

    /// Confidence reported when only the semantic judge decided a match.
    pub semantic_match_confidence: f64,

    /// Per-session progress channel capacity.
    pub broadcast_capacity: usize,

    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            executor_timeout_secs: 30,
            judge_timeout_secs: 30,
            lease_ttl_secs: 300,
            semantic_match_confidence: 0.7,
            broadcast_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.executor_timeout_secs == 0 {
            return Err(anyhow!("executor_timeout_secs must be > 0"));
        }
        if self.judge_timeout_secs == 0 {
            return Err(anyhow!("judge_timeout_secs must be > 0"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(anyhow!("lease_ttl_secs must be > 0"));
        }
        let confidence = self.semantic_match_confidence;
        if confidence.is_nan() || confidence <= 0.0 || confidence >= 1.0 {
            return Err(anyhow!(
                "semantic_match_confidence must be within (0, 1), got {}",
                confidence
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(anyhow!("broadcast_capacity must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(anyhow!("retry.backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RunnerConfig {
            max_attempts: 5,
            semantic_match_confidence: 0.8,
            retry: RetryPolicy {
                base_delay_ms: 250,
                max_delay_ms: 4000,
                backoff_multiplier: 1.5,
            },
            ..RunnerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_attempts = 2\n\n[retry]\nbase_delay_ms = 500\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.judge_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let cases = [
            RunnerConfig {
                max_attempts: 0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                executor_timeout_secs: 0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                semantic_match_confidence: 1.0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                broadcast_capacity: 0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                retry: RetryPolicy {
                    base_delay_ms: 5000,
                    max_delay_ms: 1000,
                    backoff_multiplier: 2.0,
                },
                ..RunnerConfig::default()
            },
        ];
        for cfg in cases {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }
}
