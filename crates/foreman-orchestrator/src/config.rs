//! Runtime configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `FOREMAN_*` environment variables, each layer overriding the previous one.

use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "FOREMAN_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub orchestrator: LoopConfig,
    /// Directory holding the SQLite database and the event log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            health: HealthConfig::default(),
            orchestrator: LoopConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Tunables of the priority scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_w_p")]
    pub w_p: f64,
    #[serde(default = "default_w_a")]
    pub w_a: f64,
    #[serde(default = "default_w_d")]
    pub w_d: f64,
    #[serde(default = "default_w_b")]
    pub w_b: f64,
    #[serde(default = "default_w_r")]
    pub w_r: f64,
    #[serde(default = "default_age_ceiling")]
    pub age_ceiling_seconds: f64,
    #[serde(default = "default_sla_window")]
    pub sla_urgency_window_seconds: f64,
    #[serde(default = "default_starvation_limit")]
    pub starvation_limit_seconds: f64,
    #[serde(default = "default_blocker_ceiling")]
    pub blocker_ceiling: f64,
    #[serde(default = "default_sla_boost")]
    pub sla_boost_multiplier: f64,
    #[serde(default = "default_starvation_floor")]
    pub starvation_floor_score: f64,
    /// Cached scores older than this are recomputed during selection.
    #[serde(default = "default_score_ttl")]
    pub score_ttl_seconds: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            w_p: default_w_p(),
            w_a: default_w_a(),
            w_d: default_w_d(),
            w_b: default_w_b(),
            w_r: default_w_r(),
            age_ceiling_seconds: default_age_ceiling(),
            sla_urgency_window_seconds: default_sla_window(),
            starvation_limit_seconds: default_starvation_limit(),
            blocker_ceiling: default_blocker_ceiling(),
            sla_boost_multiplier: default_sla_boost(),
            starvation_floor_score: default_starvation_floor(),
            score_ttl_seconds: default_score_ttl(),
        }
    }
}

/// Heartbeat and reclaim thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    /// Expected heartbeat interval of an agent without work.
    #[serde(default = "default_idle_ttl")]
    pub idle_heartbeat_ttl_seconds: u64,
    /// Expected heartbeat interval of an agent holding a task.
    #[serde(default = "default_busy_ttl")]
    pub busy_heartbeat_ttl_seconds: u64,
    /// Consecutive missed intervals after which an agent is DEGRADED.
    #[serde(default = "default_degraded_after_missed")]
    pub degraded_after_missed: u32,
    /// Consecutive missed intervals after which an agent is unresponsive.
    #[serde(default = "default_unresponsive_after_missed")]
    pub unresponsive_after_missed: u32,
    /// ASSIGNED tasks not started within this window are reclaimed.
    #[serde(default = "default_assignment_timeout")]
    pub assignment_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            idle_heartbeat_ttl_seconds: default_idle_ttl(),
            busy_heartbeat_ttl_seconds: default_busy_ttl(),
            degraded_after_missed: default_degraded_after_missed(),
            unresponsive_after_missed: default_unresponsive_after_missed(),
            assignment_timeout_seconds: default_assignment_timeout(),
        }
    }
}

impl HealthConfig {
    /// Heartbeat interval expected from an agent, tighter while it holds work.
    pub fn heartbeat_ttl_seconds(&self, holds_task: bool) -> u64 {
        if holds_task {
            self.busy_heartbeat_ttl_seconds
        } else {
            self.idle_heartbeat_ttl_seconds
        }
    }
}

/// Orchestrator loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Phases dispatched even before any agent registers for them.
    #[serde(default)]
    pub phases: Vec<String>,
    #[serde(default = "default_score_refresh")]
    pub score_refresh_every_ticks: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Bound on re-selections after assignment conflicts, per agent per tick.
    #[serde(default = "default_max_conflicts")]
    pub max_conflicts_per_agent: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            phases: Vec::new(),
            score_refresh_every_ticks: default_score_refresh(),
            max_backoff_seconds: default_max_backoff(),
            max_conflicts_per_agent: default_max_conflicts(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_w_p() -> f64 {
    0.45
}
fn default_w_a() -> f64 {
    0.20
}
fn default_w_d() -> f64 {
    0.15
}
fn default_w_b() -> f64 {
    0.15
}
fn default_w_r() -> f64 {
    0.05
}
fn default_age_ceiling() -> f64 {
    3600.0
}
fn default_sla_window() -> f64 {
    900.0
}
fn default_starvation_limit() -> f64 {
    7200.0
}
fn default_blocker_ceiling() -> f64 {
    10.0
}
fn default_sla_boost() -> f64 {
    1.25
}
fn default_starvation_floor() -> f64 {
    0.6
}
fn default_score_ttl() -> u64 {
    60
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_idle_ttl() -> u64 {
    30
}
fn default_busy_ttl() -> u64 {
    15
}
fn default_degraded_after_missed() -> u32 {
    2
}
fn default_unresponsive_after_missed() -> u32 {
    3
}
fn default_assignment_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    10
}
fn default_score_refresh() -> u64 {
    6
}
fn default_max_backoff() -> u64 {
    300
}
fn default_max_conflicts() -> u32 {
    16
}

impl ForemanConfig {
    /// Parses a TOML document. Missing sections and keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> ForemanResult<Self> {
        toml::from_str(s).map_err(|e| ForemanError::Config(format!("Invalid config: {e}")))
    }

    /// Applies `FOREMAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> ForemanResult<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `FOREMAN_*` overrides from the given key/value pairs.
    ///
    /// Keys are the field names upper-cased (`FOREMAN_W_P`,
    /// `FOREMAN_HEARTBEAT_TIMEOUT_SECONDS`, ...). `FOREMAN_PHASES` is a
    /// comma-separated list. Unrecognised keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ForemanResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            let s = &mut self.scoring;
            let h = &mut self.health;
            let o = &mut self.orchestrator;
            match name {
                "W_P" => s.w_p = parse_env(name, value)?,
                "W_A" => s.w_a = parse_env(name, value)?,
                "W_D" => s.w_d = parse_env(name, value)?,
                "W_B" => s.w_b = parse_env(name, value)?,
                "W_R" => s.w_r = parse_env(name, value)?,
                "AGE_CEILING_SECONDS" => s.age_ceiling_seconds = parse_env(name, value)?,
                "SLA_URGENCY_WINDOW_SECONDS" => {
                    s.sla_urgency_window_seconds = parse_env(name, value)?;
                }
                "STARVATION_LIMIT_SECONDS" => s.starvation_limit_seconds = parse_env(name, value)?,
                "BLOCKER_CEILING" => s.blocker_ceiling = parse_env(name, value)?,
                "SLA_BOOST_MULTIPLIER" => s.sla_boost_multiplier = parse_env(name, value)?,
                "STARVATION_FLOOR_SCORE" => s.starvation_floor_score = parse_env(name, value)?,
                "SCORE_TTL_SECONDS" => s.score_ttl_seconds = parse_env(name, value)?,
                "HEARTBEAT_TIMEOUT_SECONDS" => h.heartbeat_timeout_seconds = parse_env(name, value)?,
                "IDLE_HEARTBEAT_TTL_SECONDS" => {
                    h.idle_heartbeat_ttl_seconds = parse_env(name, value)?;
                }
                "BUSY_HEARTBEAT_TTL_SECONDS" => {
                    h.busy_heartbeat_ttl_seconds = parse_env(name, value)?;
                }
                "DEGRADED_AFTER_MISSED" => h.degraded_after_missed = parse_env(name, value)?,
                "UNRESPONSIVE_AFTER_MISSED" => {
                    h.unresponsive_after_missed = parse_env(name, value)?;
                }
                "ASSIGNMENT_TIMEOUT_SECONDS" => {
                    h.assignment_timeout_seconds = parse_env(name, value)?;
                }
                "POLL_INTERVAL_SECONDS" => o.poll_interval_seconds = parse_env(name, value)?,
                "SCORE_REFRESH_EVERY_TICKS" => o.score_refresh_every_ticks = parse_env(name, value)?,
                "MAX_BACKOFF_SECONDS" => o.max_backoff_seconds = parse_env(name, value)?,
                "MAX_CONFLICTS_PER_AGENT" => o.max_conflicts_per_agent = parse_env(name, value)?,
                "PHASES" => {
                    o.phases = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "DATA_DIR" => self.data_dir = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Rejects values that would make scoring or the loop misbehave.
    pub fn validate(&self) -> ForemanResult<()> {
        let s = &self.scoring;
        for (name, weight) in [
            ("w_p", s.w_p),
            ("w_a", s.w_a),
            ("w_d", s.w_d),
            ("w_b", s.w_b),
            ("w_r", s.w_r),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ForemanError::Config(format!(
                    "scoring.{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        for (name, value) in [
            ("age_ceiling_seconds", s.age_ceiling_seconds),
            ("sla_urgency_window_seconds", s.sla_urgency_window_seconds),
            ("blocker_ceiling", s.blocker_ceiling),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ForemanError::Config(format!(
                    "scoring.{name} must be positive, got {value}"
                )));
            }
        }
        if !s.starvation_limit_seconds.is_finite() || s.starvation_limit_seconds < 0.0 {
            return Err(ForemanError::Config(
                "scoring.starvation_limit_seconds must be non-negative".into(),
            ));
        }
        if !s.sla_boost_multiplier.is_finite() || s.sla_boost_multiplier < 1.0 {
            return Err(ForemanError::Config(format!(
                "scoring.sla_boost_multiplier must be >= 1.0, got {}",
                s.sla_boost_multiplier
            )));
        }
        if !s.starvation_floor_score.is_finite() || s.starvation_floor_score < 0.0 {
            return Err(ForemanError::Config(
                "scoring.starvation_floor_score must be non-negative".into(),
            ));
        }

        let h = &self.health;
        if h.heartbeat_timeout_seconds == 0 {
            return Err(ForemanError::Config(
                "health.heartbeat_timeout_seconds must be positive".into(),
            ));
        }
        for (name, ttl) in [
            ("idle_heartbeat_ttl_seconds", h.idle_heartbeat_ttl_seconds),
            ("busy_heartbeat_ttl_seconds", h.busy_heartbeat_ttl_seconds),
        ] {
            if ttl == 0 || ttl >= h.heartbeat_timeout_seconds {
                return Err(ForemanError::Config(format!(
                    "health.{name} ({ttl}) must be positive and below heartbeat_timeout_seconds ({})",
                    h.heartbeat_timeout_seconds
                )));
            }
        }
        if h.degraded_after_missed == 0 || h.degraded_after_missed > h.unresponsive_after_missed {
            return Err(ForemanError::Config(format!(
                "health.degraded_after_missed ({}) must be positive and at most unresponsive_after_missed ({})",
                h.degraded_after_missed, h.unresponsive_after_missed
            )));
        }

        let o = &self.orchestrator;
        if o.poll_interval_seconds == 0 {
            return Err(ForemanError::Config(
                "orchestrator.poll_interval_seconds must be positive".into(),
            ));
        }
        if o.max_backoff_seconds < o.poll_interval_seconds {
            return Err(ForemanError::Config(
                "orchestrator.max_backoff_seconds must be >= poll_interval_seconds".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> ForemanResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ForemanError::Config(format!("{ENV_PREFIX}{name}='{value}': {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ForemanConfig::default();
        assert_eq!(config.scoring.w_p, 0.45);
        assert_eq!(config.scoring.w_r, 0.05);
        assert_eq!(config.scoring.age_ceiling_seconds, 3600.0);
        assert_eq!(config.scoring.sla_urgency_window_seconds, 900.0);
        assert_eq!(config.scoring.starvation_limit_seconds, 7200.0);
        assert_eq!(config.scoring.blocker_ceiling, 10.0);
        assert_eq!(config.scoring.sla_boost_multiplier, 1.25);
        assert_eq!(config.scoring.starvation_floor_score, 0.6);
        assert_eq!(config.health.heartbeat_timeout_seconds, 90);
        assert_eq!(config.health.heartbeat_ttl_seconds(false), 30);
        assert_eq!(config.health.heartbeat_ttl_seconds(true), 15);
        assert_eq!(config.health.degraded_after_missed, 2);
        assert_eq!(config.health.unresponsive_after_missed, 3);
        assert_eq!(config.orchestrator.poll_interval_seconds, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ForemanConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/foreman"

            [scoring]
            w_p = 0.6

            [orchestrator]
            phases = ["implementation", "testing"]
            "#,
        )
        .unwrap();
        assert_eq!(config.scoring.w_p, 0.6);
        assert_eq!(config.scoring.w_a, 0.20);
        assert_eq!(config.health.heartbeat_timeout_seconds, 90);
        assert_eq!(config.orchestrator.phases.len(), 2);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/foreman"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ForemanConfig::from_toml_str("[scoring\nw_p = ").unwrap_err();
        assert!(matches!(err, ForemanError::Config(_)));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = ForemanConfig::default();
        config
            .apply_overrides([
                ("FOREMAN_W_P", "0.5"),
                ("FOREMAN_HEARTBEAT_TIMEOUT_SECONDS", "120"),
                ("FOREMAN_BUSY_HEARTBEAT_TTL_SECONDS", "20"),
                ("FOREMAN_PHASES", "implementation, review ,"),
                ("UNRELATED", "x"),
                ("FOREMAN_UNKNOWN_KEY", "ignored"),
            ])
            .unwrap();
        assert_eq!(config.scoring.w_p, 0.5);
        assert_eq!(config.health.heartbeat_timeout_seconds, 120);
        assert_eq!(config.health.busy_heartbeat_ttl_seconds, 20);
        assert_eq!(config.orchestrator.phases, vec!["implementation", "review"]);
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = ForemanConfig::default();
        let err = config
            .apply_overrides([("FOREMAN_POLL_INTERVAL_SECONDS", "soon")])
            .unwrap_err();
        assert!(err.to_string().contains("FOREMAN_POLL_INTERVAL_SECONDS"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ForemanConfig::default();
        config.scoring.w_b = -0.1;
        assert!(config.validate().is_err());

        let mut config = ForemanConfig::default();
        config.scoring.sla_boost_multiplier = 0.9;
        assert!(config.validate().is_err());

        let mut config = ForemanConfig::default();
        config.health.busy_heartbeat_ttl_seconds = 90;
        assert!(config.validate().is_err());

        let mut config = ForemanConfig::default();
        config.health.degraded_after_missed = 4;
        assert!(config.validate().is_err());

        let mut config = ForemanConfig::default();
        config.orchestrator.poll_interval_seconds = 0;
        assert!(config.validate().is_err());
    }
}
