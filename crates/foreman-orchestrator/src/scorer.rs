use crate::config::ScoringConfig;
use crate::types::{seconds_between, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Computes dispatch urgency for a task. Pure: no I/O, no clock reads.
///
/// ```text
/// base = w_p*P + w_a*A + w_d*D + w_b*B + w_r*R
/// ```
///
/// followed by two post-hoc corrections: the SLA boost (multiplicative, only
/// while the deadline is inside the urgency window) and the starvation floor
/// (once a task has waited `starvation_limit_seconds`).
#[derive(Debug, Clone, Default)]
pub struct PriorityScorer {
    config: ScoringConfig,
}

/// Every intermediate term of a score computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub priority_score: f64,
    pub age_norm: f64,
    pub deadline_norm: f64,
    pub blocker_norm: f64,
    pub retry_penalty: f64,
    /// Weighted sum before corrections.
    pub base_score: f64,
    pub sla_boost_applied: bool,
    pub starvation_floor_applied: bool,
    /// Final score.
    pub score: f64,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Final score of `task` at `now`, given how many pending tasks it blocks.
    pub fn compute_score(&self, task: &Task, blocker_count: usize, now: DateTime<Utc>) -> f64 {
        self.breakdown(task, blocker_count, now).score
    }

    /// Same as [`PriorityScorer::compute_score`] but keeps every term.
    pub fn breakdown(&self, task: &Task, blocker_count: usize, now: DateTime<Utc>) -> ScoreBreakdown {
        let c = &self.config;

        let priority_score = task.priority.weight();

        let age_seconds = task.age_seconds(now).max(0.0);
        let age_norm = (age_seconds / c.age_ceiling_seconds).min(1.0);

        let slack_seconds = task.deadline_at.map(|deadline| seconds_between(now, deadline));
        let deadline_norm = match slack_seconds {
            None => 0.0,
            Some(slack) if slack <= 0.0 => 1.0,
            Some(slack) => (1.0 - slack / c.sla_urgency_window_seconds).clamp(0.0, 1.0),
        };

        let blocker_norm = (blocker_count as f64 / c.blocker_ceiling).min(1.0);

        let retry_ratio = f64::from(task.retry_count) / f64::from(task.max_retries.max(1));
        let retry_penalty = (1.0 - retry_ratio).max(0.0);

        let base_score = c.w_p * priority_score
            + c.w_a * age_norm
            + c.w_d * deadline_norm
            + c.w_b * blocker_norm
            + c.w_r * retry_penalty;

        let mut score = base_score;

        let sla_boost_applied = matches!(
            slack_seconds,
            Some(slack) if (0.0..=c.sla_urgency_window_seconds).contains(&slack)
        );
        if sla_boost_applied {
            score *= c.sla_boost_multiplier;
        }

        let starvation_floor_applied = age_seconds >= c.starvation_limit_seconds
            && score < c.starvation_floor_score;
        if age_seconds >= c.starvation_limit_seconds {
            score = score.max(c.starvation_floor_score);
        }

        ScoreBreakdown {
            priority_score,
            age_norm,
            deadline_norm,
            blocker_norm,
            retry_penalty,
            base_score,
            sla_boost_applied,
            starvation_floor_applied,
            score,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use chrono::Duration;

    const EPS: f64 = 1e-9;

    fn scorer() -> PriorityScorer {
        PriorityScorer::new(ScoringConfig::default())
    }

    fn fresh_task(now: DateTime<Utc>) -> Task {
        Task::new("implementation", "t")
            .with_priority(Priority::Medium)
            .with_created_at(now)
            .with_max_retries(3)
    }

    #[test]
    fn test_worked_example_no_deadline() {
        let now = Utc::now();
        let score = scorer().compute_score(&fresh_task(now), 0, now);
        assert!((score - 0.275).abs() < EPS, "got {score}");
    }

    #[test]
    fn test_worked_example_deadline_in_window() {
        let now = Utc::now();
        let task = fresh_task(now).with_deadline(now + Duration::seconds(600));
        let breakdown = scorer().breakdown(&task, 0, now);
        assert!((breakdown.deadline_norm - 1.0 / 3.0).abs() < EPS);
        assert!(breakdown.sla_boost_applied);
        let expected = (0.225 + 0.15 / 3.0 + 0.05) * 1.25;
        assert!((breakdown.score - expected).abs() < EPS);
        assert!((breakdown.score - 0.40625).abs() < 1e-6);
    }

    #[test]
    fn test_age_is_monotonic_until_ceiling() {
        let created = Utc::now();
        let task = fresh_task(created);
        let s = scorer();
        let mut previous = s.compute_score(&task, 0, created);
        for minutes in [5, 15, 30, 45, 60] {
            let now = created + Duration::minutes(minutes);
            let current = s.compute_score(&task, 0, now);
            assert!(current >= previous, "score dropped at {minutes}m");
            previous = current;
        }
    }

    #[test]
    fn test_age_caps_at_ceiling() {
        let created = Utc::now();
        let task = fresh_task(created);
        let b = scorer().breakdown(&task, 0, created + Duration::seconds(5000));
        assert_eq!(b.age_norm, 1.0);
    }

    #[test]
    fn test_deadline_saturates_when_past_due() {
        let now = Utc::now();
        let s = scorer();
        for overdue in [0, 1, 60, 86_400] {
            let task = fresh_task(now).with_deadline(now - Duration::seconds(overdue));
            assert_eq!(s.breakdown(&task, 0, now).deadline_norm, 1.0);
        }
    }

    #[test]
    fn test_sla_boost_scoped_to_window() {
        let now = Utc::now();
        let s = scorer();

        let far = fresh_task(now).with_deadline(now + Duration::seconds(901));
        let b = s.breakdown(&far, 0, now);
        assert!(!b.sla_boost_applied);
        assert_eq!(b.score, b.base_score);

        let edge = fresh_task(now).with_deadline(now + Duration::seconds(900));
        let b = s.breakdown(&edge, 0, now);
        assert!(b.sla_boost_applied);
        assert!((b.score - b.base_score * 1.25).abs() < EPS);

        let overdue = fresh_task(now).with_deadline(now - Duration::seconds(1));
        let b = s.breakdown(&overdue, 0, now);
        assert!(!b.sla_boost_applied);
        assert_eq!(b.score, b.base_score);
    }

    #[test]
    fn test_starvation_floor() {
        let now = Utc::now();
        let task = Task::new("implementation", "old")
            .with_priority(Priority::Low)
            .with_created_at(now - Duration::seconds(7200));
        let b = scorer().breakdown(&task, 0, now);
        assert!(b.base_score < 0.6);
        assert!(b.starvation_floor_applied);
        assert!(b.score >= 0.6);

        let younger = task.clone().with_created_at(now - Duration::seconds(7199));
        assert!(scorer().compute_score(&younger, 0, now) < 0.6);
    }

    #[test]
    fn test_floor_never_lowers_a_high_score() {
        let now = Utc::now();
        let task = Task::new("implementation", "old critical")
            .with_priority(Priority::Critical)
            .with_created_at(now - Duration::hours(3));
        let b = scorer().breakdown(&task, 10, now);
        assert!(!b.starvation_floor_applied);
        assert!(b.score > 0.6);
    }

    #[test]
    fn test_blockers_and_retries() {
        let now = Utc::now();
        let s = scorer();
        let task = fresh_task(now);
        let unblocking = s.breakdown(&task, 25, now);
        assert_eq!(unblocking.blocker_norm, 1.0);

        let mut retried = fresh_task(now);
        retried.retry_count = 2;
        let b = s.breakdown(&retried, 0, now);
        assert!((b.retry_penalty - 1.0 / 3.0).abs() < EPS);

        let mut zero_budget = fresh_task(now).with_max_retries(0);
        zero_budget.retry_count = 4;
        assert_eq!(s.breakdown(&zero_budget, 0, now).retry_penalty, 0.0);
    }

    #[test]
    fn test_future_created_at_does_not_go_negative() {
        let now = Utc::now();
        let task = fresh_task(now + Duration::seconds(30));
        let b = scorer().breakdown(&task, 0, now);
        assert_eq!(b.age_norm, 0.0);
        assert!(b.score >= 0.0);
    }
}
