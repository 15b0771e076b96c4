use std::collections::BTreeMap;
use std::str::FromStr;

use crate::scheduler::retry::RetryConfig;
use crate::stage::StageKind;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub artifact_dir: String,
    pub journal_path: String,
    pub retry: RetryConfig,
    /// 0 disables approval deadlines.
    pub approval_timeout_secs: u64,
    pub anomaly_threshold: f64,
    pub tick_ms: u64,
    /// 0 disables monitor windows.
    pub monitor_interval_secs: u64,
    pub stage_caps: BTreeMap<StageKind, usize>,
    pub approval_stages: Vec<StageKind>,
    /// Lower bounds per metric for the reference scorer.
    pub score_min: BTreeMap<String, f64>,
    /// Upper bounds per metric for the reference scorer.
    pub score_max: BTreeMap<String, f64>,
    /// Source patterns the reference sanitizer refuses.
    pub sanitize_forbidden: Vec<String>,
    /// Capital fraction the reference selector grants; the budget policy
    /// itself lives outside the pipeline.
    pub select_allocation: f64,
    pub stage_commands: BTreeMap<StageKind, String>,
    /// Budget for a bound Deploy command's halt hook.
    pub halt_timeout_secs: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_suffixed_f64(prefix: &str) -> BTreeMap<String, f64> {
    std::env::vars()
        .filter_map(|(k, v)| {
            let metric = k.strip_prefix(prefix)?.to_ascii_lowercase();
            let bound = v.trim().parse::<f64>().ok()?;
            Some((metric, bound))
        })
        .collect()
}

fn default_caps() -> BTreeMap<StageKind, usize> {
    StageKind::ORDER
        .iter()
        .map(|&stage| {
            let cap = if stage == StageKind::Backtest { num_cpus::get().max(1) } else { 4 };
            (stage, cap)
        })
        .collect()
}

fn default_forbidden() -> Vec<String> {
    ["import os", "subprocess", "socket", "eval(", "exec(", "__import__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Parse a comma-separated stage list, skipping names that are not stages.
pub fn parse_stage_list(raw: &str) -> Vec<StageKind> {
    let mut stages: Vec<StageKind> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    stages.sort();
    stages.dedup();
    stages
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./pipeline.sqlite".to_string(),
            artifact_dir: "./artifacts".to_string(),
            journal_path: "./results.jsonl".to_string(),
            retry: RetryConfig::default(),
            approval_timeout_secs: 86_400,
            anomaly_threshold: 0.5,
            tick_ms: 1000,
            monitor_interval_secs: 300,
            stage_caps: default_caps(),
            approval_stages: vec![StageKind::Deploy],
            score_min: BTreeMap::new(),
            score_max: BTreeMap::new(),
            sanitize_forbidden: default_forbidden(),
            select_allocation: 0.1,
            stage_commands: BTreeMap::new(),
            halt_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut stage_caps = defaults.stage_caps.clone();
        let mut stage_commands = BTreeMap::new();
        for stage in StageKind::ORDER {
            let suffix = stage.as_str().to_ascii_uppercase();
            if let Some(cap) = std::env::var(format!("CAP_{suffix}")).ok().and_then(|v| v.trim().parse().ok()) {
                stage_caps.insert(stage, cap);
            }
            if let Ok(cmd) = std::env::var(format!("STAGE_CMD_{suffix}")) {
                if !cmd.trim().is_empty() {
                    stage_commands.insert(stage, cmd);
                }
            }
        }

        Self {
            db_path: std::env::var("PIPELINE_DB").unwrap_or(defaults.db_path),
            artifact_dir: std::env::var("ARTIFACT_DIR").unwrap_or(defaults.artifact_dir),
            journal_path: std::env::var("JOURNAL_PATH").unwrap_or(defaults.journal_path),
            retry: RetryConfig {
                max_attempts: env_parse("MAX_ATTEMPTS", defaults.retry.max_attempts),
                base_delay_ms: env_parse("RETRY_BASE_MS", defaults.retry.base_delay_ms),
                max_delay_ms: env_parse("RETRY_MAX_MS", defaults.retry.max_delay_ms),
                jitter_factor: env_parse("RETRY_JITTER", defaults.retry.jitter_factor),
            },
            approval_timeout_secs: env_parse("APPROVAL_TIMEOUT_SECS", defaults.approval_timeout_secs),
            anomaly_threshold: env_parse("ANOMALY_THRESHOLD", defaults.anomaly_threshold),
            tick_ms: env_parse("TICK_MS", defaults.tick_ms).max(1),
            monitor_interval_secs: env_parse("MONITOR_INTERVAL_SECS", defaults.monitor_interval_secs),
            stage_caps,
            approval_stages: std::env::var("APPROVAL_STAGES")
                .map(|v| parse_stage_list(&v))
                .unwrap_or(defaults.approval_stages),
            score_min: env_suffixed_f64("SCORE_MIN_"),
            score_max: env_suffixed_f64("SCORE_MAX_"),
            sanitize_forbidden: std::env::var("SANITIZE_FORBIDDEN")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or(defaults.sanitize_forbidden),
            select_allocation: env_parse("SELECT_ALLOCATION", defaults.select_allocation).clamp(0.0, 1.0),
            stage_commands,
            halt_timeout_secs: env_parse("HALT_TIMEOUT_SECS", defaults.halt_timeout_secs).max(1),
        }
    }

    /// Deploy is always gated; `APPROVAL_STAGES` can add others.
    pub fn requires_approval(&self, stage: StageKind) -> bool {
        stage == StageKind::Deploy || self.approval_stages.contains(&stage)
    }

    pub fn cap_for(&self, stage: StageKind) -> usize {
        self.stage_caps.get(&stage).copied().unwrap_or(1).max(1)
    }

    /// Deadline for an invocation gated at `now_ms`, if deadlines are on.
    pub fn approval_deadline(&self, now_ms: u64) -> Option<u64> {
        match self.approval_timeout_secs {
            0 => None,
            secs => Some(now_ms.saturating_add(secs.saturating_mul(1000))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.requires_approval(StageKind::Deploy));
        assert!(!cfg.requires_approval(StageKind::Select));
        assert_eq!(cfg.cap_for(StageKind::Backtest), num_cpus::get().max(1));
        assert_eq!(cfg.cap_for(StageKind::Score), 4);
        assert_eq!(cfg.approval_deadline(1_000), Some(1_000 + 86_400_000));
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let cfg = Config { approval_timeout_secs: 0, ..Default::default() };
        assert_eq!(cfg.approval_deadline(5), None);
    }

    #[test]
    fn test_stage_list_parsing() {
        assert_eq!(
            parse_stage_list("deploy, select,bogus,,deploy"),
            vec![StageKind::Select, StageKind::Deploy]
        );
        assert!(parse_stage_list("").is_empty());
    }

    #[test]
    fn test_cap_never_zero() {
        let mut cfg = Config::default();
        cfg.stage_caps.insert(StageKind::Monitor, 0);
        assert_eq!(cfg.cap_for(StageKind::Monitor), 1);
    }
}
