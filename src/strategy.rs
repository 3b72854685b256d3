//! Run Controller load strategies.
//!
//! `ramp_rps_at` generalizes the teacher's `LoadModel::calculate_ramp_rps`
//! staged-rate idea from a fixed one-third/one-third/one-third shape into an
//! arbitrary ordered list of `{duration, targetRps}` stages; each stage holds
//! its own target for its whole window rather than ramping toward the next.

use crate::error::EngineError;
use crate::model::{RunMode, RunSpec, Stage};

#[derive(Debug, Clone)]
pub enum LoadStrategy {
    /// Fixed concurrency, no rate limit: requests are issued as fast as the
    /// worker pool and remote can sustain.
    ConstantConcurrency { concurrency: u64, duration_secs: Option<f64> },
    /// Fixed target rate, held for `duration_secs`.
    ConstantRps { target_rps: f64, concurrency: u64, duration_secs: f64 },
    /// Runs exactly `iterations` requests at `concurrency`, no rate limit.
    Iterations { iterations: u64, concurrency: u64 },
    /// Stepwise rate across `stages`: each stage holds constant at its own
    /// `target_rps` for its whole duration before the next stage takes over.
    RampUp { stages: Vec<Stage>, concurrency: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("mode requires 'targetRps'")]
    MissingTargetRps,
    #[error("mode requires 'duration'")]
    MissingDuration,
    #[error("mode requires 'iterations'")]
    MissingIterations,
    #[error("mode requires a non-empty 'stages' array")]
    MissingStages,
    #[error("'concurrency' must be at least 1")]
    InvalidConcurrency,
    #[error("'iterations' must be at least 1")]
    InvalidIterations,
    #[error("'duration' must be greater than 0")]
    InvalidDuration,
}

impl From<StrategyError> for EngineError {
    fn from(e: StrategyError) -> Self {
        EngineError::InvalidRequest(e.to_string())
    }
}

const DEFAULT_CONCURRENCY: u64 = 10;

impl LoadStrategy {
    pub fn from_spec(spec: &RunSpec) -> Result<Self, StrategyError> {
        let concurrency = spec.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(StrategyError::InvalidConcurrency);
        }
        match spec.mode.unwrap_or(RunMode::Constant) {
            RunMode::Constant => match spec.target_rps {
                Some(target_rps) => {
                    let duration_secs = spec
                        .duration
                        .ok_or(StrategyError::MissingDuration)?
                        .0
                        .as_secs_f64();
                    if duration_secs <= 0.0 {
                        return Err(StrategyError::InvalidDuration);
                    }
                    Ok(LoadStrategy::ConstantRps { target_rps, concurrency, duration_secs })
                }
                None => {
                    let duration_secs = spec.duration.map(|d| d.0.as_secs_f64());
                    if duration_secs == Some(0.0) {
                        return Err(StrategyError::InvalidDuration);
                    }
                    Ok(LoadStrategy::ConstantConcurrency { concurrency, duration_secs })
                }
            },
            RunMode::Iterations => {
                let iterations = spec.iterations.ok_or(StrategyError::MissingIterations)?;
                if iterations == 0 {
                    return Err(StrategyError::InvalidIterations);
                }
                Ok(LoadStrategy::Iterations { iterations, concurrency })
            }
            RunMode::RampUp => {
                let stages = spec.stages.clone().ok_or(StrategyError::MissingStages)?;
                if stages.is_empty() {
                    return Err(StrategyError::MissingStages);
                }
                Ok(LoadStrategy::RampUp { stages, concurrency })
            }
        }
    }

    pub fn concurrency(&self) -> u64 {
        match self {
            LoadStrategy::ConstantConcurrency { concurrency, .. }
            | LoadStrategy::ConstantRps { concurrency, .. }
            | LoadStrategy::Iterations { concurrency, .. }
            | LoadStrategy::RampUp { concurrency, .. } => *concurrency,
        }
    }

    /// `None` means unlimited (no rate limiter pacing applied).
    pub fn target_rps_at(&self, elapsed_secs: f64) -> Option<f64> {
        match self {
            LoadStrategy::ConstantConcurrency { .. } => None,
            LoadStrategy::Iterations { .. } => None,
            LoadStrategy::ConstantRps { target_rps, .. } => Some(*target_rps),
            LoadStrategy::RampUp { stages, .. } => Some(ramp_rps_at(stages, elapsed_secs)),
        }
    }

    /// Upfront estimate of total requests the run will issue, used to seed
    /// `requests_expected` before the first submission. Ramp-up sums each
    /// stage's own `target_rps * duration`; constant concurrency with no
    /// fixed duration has no meaningful estimate and reports 0.
    pub fn expected_requests(&self) -> u64 {
        match self {
            LoadStrategy::ConstantConcurrency { .. } => 0,
            LoadStrategy::ConstantRps { target_rps, duration_secs, .. } => {
                (target_rps * duration_secs).round().max(0.0) as u64
            }
            LoadStrategy::Iterations { iterations, .. } => *iterations,
            LoadStrategy::RampUp { stages, .. } => stages
                .iter()
                .map(|s| (s.target_rps * s.duration as f64).round().max(0.0) as u64)
                .sum(),
        }
    }

    /// Whether the run has reached its natural completion given elapsed
    /// time and (for iteration-bounded strategies) requests issued so far.
    pub fn is_complete(&self, elapsed_secs: f64, requests_issued: u64) -> bool {
        match self {
            LoadStrategy::ConstantConcurrency { duration_secs, .. } => {
                duration_secs.map(|d| elapsed_secs >= d).unwrap_or(false)
            }
            LoadStrategy::ConstantRps { duration_secs, .. } => elapsed_secs >= *duration_secs,
            LoadStrategy::Iterations { iterations, .. } => requests_issued >= *iterations,
            LoadStrategy::RampUp { stages, .. } => {
                let total: f64 = stages.iter().map(|s| s.duration as f64).sum();
                elapsed_secs >= total
            }
        }
    }
}

/// Stepwise lookup across ordered stages: each stage holds constant at its
/// own `target_rps` for its whole duration window; past the last stage's
/// end, the last stage's target holds.
fn ramp_rps_at(stages: &[Stage], elapsed_secs: f64) -> f64 {
    let mut cursor = 0.0_f64;
    for stage in stages {
        let stage_end = cursor + stage.duration as f64;
        if elapsed_secs < stage_end || stage.duration == 0 {
            return stage.target_rps;
        }
        cursor = stage_end;
    }
    stages.last().map(|s| s.target_rps).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_mode(mode: RunMode) -> RunSpec {
        RunSpec {
            method: crate::model::HttpMethod::Get,
            url: "http://localhost/".into(),
            headers: Default::default(),
            params: Default::default(),
            body: None,
            auth: None,
            pre_request_script: None,
            post_request_script: None,
            request_id: None,
            environment_id: None,
            comment: None,
            mode: Some(mode),
            duration: None,
            iterations: None,
            concurrency: None,
            target_rps: None,
            start_concurrency: None,
            ramp_up_duration: None,
            stages: None,
            success_sample_rate: None,
            slow_threshold_ms: None,
            save_timing_breakdown: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn constant_rps_requires_duration() {
        let mut spec = spec_with_mode(RunMode::Constant);
        spec.target_rps = Some(50.0);
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::MissingDuration)));
    }

    #[test]
    fn iterations_requires_iterations_field() {
        let spec = spec_with_mode(RunMode::Iterations);
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::MissingIterations)));
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut spec = spec_with_mode(RunMode::Iterations);
        spec.iterations = Some(0);
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::InvalidIterations)));
    }

    #[test]
    fn zero_duration_rejected() {
        let mut spec = spec_with_mode(RunMode::Constant);
        spec.target_rps = Some(50.0);
        spec.duration = Some(crate::model::DurationField(std::time::Duration::from_secs(0)));
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::InvalidDuration)));

        let mut spec = spec_with_mode(RunMode::Constant);
        spec.duration = Some(crate::model::DurationField(std::time::Duration::from_secs(0)));
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::InvalidDuration)));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut spec = spec_with_mode(RunMode::Constant);
        spec.concurrency = Some(0);
        assert!(matches!(LoadStrategy::from_spec(&spec), Err(StrategyError::InvalidConcurrency)));
    }

    #[test]
    fn ramp_holds_each_stage_constant() {
        let stages = vec![
            Stage { duration: 10, target_rps: 100.0 },
            Stage { duration: 10, target_rps: 200.0 },
        ];
        assert_eq!(ramp_rps_at(&stages, 0.0), 100.0);
        assert_eq!(ramp_rps_at(&stages, 9.9), 100.0);
        assert_eq!(ramp_rps_at(&stages, 10.0), 200.0);
        assert_eq!(ramp_rps_at(&stages, 15.0), 200.0);
        assert_eq!(ramp_rps_at(&stages, 1000.0), 200.0);
    }

    #[test]
    fn iterations_complete_when_count_reached() {
        let strategy = LoadStrategy::Iterations { iterations: 5, concurrency: 2 };
        assert!(!strategy.is_complete(0.0, 4));
        assert!(strategy.is_complete(0.0, 5));
    }

    #[test]
    fn constant_concurrency_with_no_duration_never_completes() {
        let strategy = LoadStrategy::ConstantConcurrency { concurrency: 5, duration_secs: None };
        assert!(!strategy.is_complete(1_000_000.0, 0));
    }

    #[test]
    fn expected_requests_matches_constant_rps_product() {
        let strategy = LoadStrategy::ConstantRps { target_rps: 50.0, concurrency: 10, duration_secs: 10.0 };
        assert_eq!(strategy.expected_requests(), 500);
    }

    #[test]
    fn expected_requests_sums_each_stage_held_constant() {
        let strategy = LoadStrategy::RampUp {
            stages: vec![
                Stage { duration: 3, target_rps: 10.0 },
                Stage { duration: 3, target_rps: 100.0 },
            ],
            concurrency: 10,
        };
        // 10 rps * 3s + 100 rps * 3s, each stage held at its own target.
        assert_eq!(strategy.expected_requests(), 330);
    }
}
