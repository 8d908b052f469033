//! Adaptive confidence thresholds
//!
//! A hill-climbing controller fed with execution outcomes. It keeps a
//! bounded history and, every `adjustment_interval` records, analyzes the
//! most recent `analysis_window` of them:
//!
//! - speculative executions that failed raise the explicit threshold
//! - accepted suggestions whose confidence was already above the suggestion
//!   threshold lower the suggestion threshold
//!
//! Both thresholds are clamped to `[min_threshold, max_threshold]` after
//! every adjustment. The cadence and the clamp are the only dampening.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::core::config::ThresholdConfig;

/// How a task came to be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Confidence below the explicit threshold, needed explicit approval
    Explicit,
    /// Confidence between the thresholds, confirmed at a decision gate
    Suggestion,
    /// Ran without confirmation
    Speculative,
}

/// Outcome of one confidence-gated decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub confidence: f64,
    pub mode: ExecutionMode,
    pub success: bool,
    pub user_accepted: Option<bool>,
    pub execution_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(confidence: f64, mode: ExecutionMode, success: bool) -> Self {
        Self {
            confidence,
            mode,
            success,
            user_accepted: None,
            execution_time_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user_accepted(mut self, accepted: bool) -> Self {
        self.user_accepted = Some(accepted);
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }
}

/// Current threshold pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdState {
    pub explicit_threshold: f64,
    pub suggestion_threshold: f64,
}

impl ThresholdState {
    /// Picks the execution mode for a task with the given confidence.
    pub fn mode_for(&self, confidence: f64) -> ExecutionMode {
        if confidence >= self.suggestion_threshold {
            ExecutionMode::Speculative
        } else if confidence >= self.explicit_threshold {
            ExecutionMode::Suggestion
        } else {
            ExecutionMode::Explicit
        }
    }
}

/// A threshold change produced by an analysis cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAdjustment {
    pub before: ThresholdState,
    pub after: ThresholdState,
    pub false_positive_rate: f64,
    pub false_negative_rate: f64,
}

/// Observability snapshot of the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMetrics {
    pub thresholds: ThresholdState,
    pub history_len: usize,
    pub total_recorded: u64,
    pub adjustments: u64,
    pub last_false_positive_rate: Option<f64>,
    pub last_false_negative_rate: Option<f64>,
    pub last_adjusted_at: Option<DateTime<Utc>>,
}

struct HistoryEntry {
    record: ExecutionRecord,
    /// Suggestion threshold in force when the record arrived
    suggestion_threshold: f64,
}

struct ControllerState {
    history: VecDeque<HistoryEntry>,
    thresholds: ThresholdState,
    total_recorded: u64,
    adjustments: u64,
    last_rates: Option<(f64, f64)>,
    last_adjusted_at: Option<DateTime<Utc>>,
}

/// Process-wide threshold controller. Share it behind an `Arc`; every
/// mutation happens under one lock so concurrent workflows cannot
/// interleave an adjustment.
pub struct AdaptiveThresholdController {
    config: ThresholdConfig,
    state: Mutex<ControllerState>,
}

impl AdaptiveThresholdController {
    pub fn new(config: ThresholdConfig) -> Self {
        let state = Self::initial_state(&config);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn initial_state(config: &ThresholdConfig) -> ControllerState {
        ControllerState {
            history: VecDeque::with_capacity(config.history_size),
            thresholds: ThresholdState {
                explicit_threshold: config.initial_explicit_threshold,
                suggestion_threshold: config.initial_suggestion_threshold,
            },
            total_recorded: 0,
            adjustments: 0,
            last_rates: None,
            last_adjusted_at: None,
        }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    pub fn get_thresholds(&self) -> ThresholdState {
        self.state.lock().thresholds
    }

    /// Appends a record and runs an analysis cycle when one is due.
    /// Returns the adjustment made, if any.
    pub fn record_execution(&self, record: ExecutionRecord) -> Option<ThresholdAdjustment> {
        let mut state = self.state.lock();

        let suggestion_threshold = state.thresholds.suggestion_threshold;
        state.history.push_back(HistoryEntry {
            record,
            suggestion_threshold,
        });
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
        state.total_recorded += 1;

        let due = state.total_recorded % self.config.adjustment_interval as u64 == 0;
        if !due || state.history.len() < self.config.analysis_window {
            return None;
        }

        self.adjust(&mut state)
    }

    fn adjust(&self, state: &mut ControllerState) -> Option<ThresholdAdjustment> {
        let window_start = state.history.len() - self.config.analysis_window;
        let window = state.history.iter().skip(window_start);

        let mut speculative = 0usize;
        let mut speculative_failed = 0usize;
        let mut suggestions = 0usize;
        let mut suggestions_too_conservative = 0usize;

        for entry in window {
            match entry.record.mode {
                ExecutionMode::Speculative => {
                    speculative += 1;
                    if !entry.record.success {
                        speculative_failed += 1;
                    }
                }
                ExecutionMode::Suggestion => {
                    suggestions += 1;
                    if entry.record.user_accepted == Some(true)
                        && entry.record.confidence > entry.suggestion_threshold
                    {
                        suggestions_too_conservative += 1;
                    }
                }
                ExecutionMode::Explicit => {}
            }
        }

        let rate = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        let false_positive_rate = rate(speculative_failed, speculative);
        let false_negative_rate = rate(suggestions_too_conservative, suggestions);
        state.last_rates = Some((false_positive_rate, false_negative_rate));

        debug!(
            false_positive_rate,
            false_negative_rate, "Analyzed threshold window"
        );

        let before = state.thresholds;
        let mut after = before;

        if false_positive_rate > self.config.false_positive_trigger {
            after.explicit_threshold += self.config.learning_rate * false_positive_rate;
        }
        if false_negative_rate > self.config.false_negative_trigger {
            after.suggestion_threshold -= self.config.learning_rate * false_negative_rate;
        }
        after.explicit_threshold = self.clamp(after.explicit_threshold);
        after.suggestion_threshold = self.clamp(after.suggestion_threshold);

        if after == before {
            return None;
        }

        state.thresholds = after;
        state.adjustments += 1;
        state.last_adjusted_at = Some(Utc::now());

        info!(
            explicit_before = before.explicit_threshold,
            explicit_after = after.explicit_threshold,
            suggestion_before = before.suggestion_threshold,
            suggestion_after = after.suggestion_threshold,
            "Adjusted confidence thresholds"
        );

        Some(ThresholdAdjustment {
            before,
            after,
            false_positive_rate,
            false_negative_rate,
        })
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.config.min_threshold, self.config.max_threshold)
    }

    /// Clears history and restores the initial thresholds
    pub fn reset(&self) {
        *self.state.lock() = Self::initial_state(&self.config);
    }

    /// Current thresholds, suitable for persisting
    pub fn snapshot(&self) -> ThresholdState {
        self.get_thresholds()
    }

    /// Restores previously persisted thresholds, clamped to the bounds
    pub fn restore(&self, thresholds: ThresholdState) {
        let mut state = self.state.lock();
        state.thresholds = ThresholdState {
            explicit_threshold: self.clamp(thresholds.explicit_threshold),
            suggestion_threshold: self.clamp(thresholds.suggestion_threshold),
        };
    }

    pub fn metrics(&self) -> ThresholdMetrics {
        let state = self.state.lock();
        ThresholdMetrics {
            thresholds: state.thresholds,
            history_len: state.history.len(),
            total_recorded: state.total_recorded,
            adjustments: state.adjustments,
            last_false_positive_rate: state.last_rates.map(|(fp, _)| fp),
            last_false_negative_rate: state.last_rates.map(|(_, fneg)| fneg),
            last_adjusted_at: state.last_adjusted_at,
        }
    }
}

impl Default for AdaptiveThresholdController {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn speculative(success: bool) -> ExecutionRecord {
        ExecutionRecord::new(0.8, ExecutionMode::Speculative, success)
    }

    #[test]
    fn test_mode_selection() {
        let state = ThresholdState {
            explicit_threshold: 0.50,
            suggestion_threshold: 0.70,
        };
        assert_eq!(state.mode_for(0.55), ExecutionMode::Suggestion);
        assert_eq!(state.mode_for(0.50), ExecutionMode::Suggestion);
        assert_eq!(state.mode_for(0.70), ExecutionMode::Speculative);
        assert_eq!(state.mode_for(0.95), ExecutionMode::Speculative);
        assert_eq!(state.mode_for(0.49), ExecutionMode::Explicit);
    }

    #[test]
    fn test_no_adjustment_below_analysis_minimum() {
        let controller = AdaptiveThresholdController::default();
        let before = controller.get_thresholds();

        for _ in 0..15 {
            assert!(controller.record_execution(speculative(false)).is_none());
        }
        assert_eq!(controller.get_thresholds(), before);
        // The 10th record was a due cycle but below 20 entries
        assert!(controller.metrics().last_false_positive_rate.is_none());
    }

    #[test]
    fn test_false_positives_raise_explicit_threshold() {
        let controller = AdaptiveThresholdController::default();
        let before = controller.get_thresholds();

        let mut adjustment = None;
        for i in 0..20 {
            // 10 of 20 speculative executions fail
            adjustment = controller.record_execution(speculative(i % 2 == 0));
        }

        let adjustment = adjustment.expect("adjusted on the 20th record");
        assert!((adjustment.false_positive_rate - 0.5).abs() < 1e-9);
        let after = controller.get_thresholds();
        assert!(after.explicit_threshold > before.explicit_threshold);
        assert!((after.explicit_threshold - (0.50 + 0.05 * 0.5)).abs() < 1e-9);
        assert_eq!(after.suggestion_threshold, before.suggestion_threshold);
    }

    #[test]
    fn test_adjustment_only_on_cadence() {
        let controller = AdaptiveThresholdController::default();
        for _ in 0..20 {
            controller.record_execution(speculative(false));
        }
        let after_first = controller.get_thresholds();

        for i in 0..9 {
            assert!(controller.record_execution(speculative(false)).is_none(), "{}", i);
        }
        assert_eq!(controller.get_thresholds(), after_first);
        assert!(controller.record_execution(speculative(false)).is_some());
    }

    #[test]
    fn test_low_false_positive_rate_leaves_thresholds() {
        let controller = AdaptiveThresholdController::default();
        let before = controller.get_thresholds();
        for i in 0..20 {
            // 2 failures out of 20 = 0.10
            controller.record_execution(speculative(i >= 2));
        }
        assert_eq!(controller.get_thresholds(), before);
        assert_eq!(controller.metrics().last_false_positive_rate, Some(0.1));
    }

    #[test]
    fn test_false_negatives_lower_suggestion_threshold() {
        let controller = AdaptiveThresholdController::default();
        for _ in 0..20 {
            controller.record_execution(
                ExecutionRecord::new(0.85, ExecutionMode::Suggestion, true).with_user_accepted(true),
            );
        }
        let after = controller.get_thresholds();
        assert!((after.suggestion_threshold - (0.70 - 0.05)).abs() < 1e-9);
        assert_eq!(after.explicit_threshold, 0.50);
    }

    #[test]
    fn test_false_negative_uses_threshold_at_record_time() {
        let controller = AdaptiveThresholdController::default();
        // Accepted suggestions below the threshold in force are not counted
        for _ in 0..20 {
            controller.record_execution(
                ExecutionRecord::new(0.65, ExecutionMode::Suggestion, true).with_user_accepted(true),
            );
        }
        assert_eq!(controller.get_thresholds().suggestion_threshold, 0.70);
        assert_eq!(controller.metrics().last_false_negative_rate, Some(0.0));
    }

    #[test]
    fn test_thresholds_clamped() {
        let controller = AdaptiveThresholdController::default();
        for _ in 0..2000 {
            controller.record_execution(speculative(false));
            controller.record_execution(
                ExecutionRecord::new(0.99, ExecutionMode::Suggestion, true).with_user_accepted(true),
            );
        }
        let state = controller.get_thresholds();
        assert_eq!(state.explicit_threshold, 0.90);
        assert_eq!(state.suggestion_threshold, 0.40);
        assert_eq!(controller.metrics().history_len, 50);
    }

    #[test]
    fn test_reset_and_restore() {
        let controller = AdaptiveThresholdController::default();
        for _ in 0..20 {
            controller.record_execution(speculative(false));
        }
        assert_ne!(controller.get_thresholds().explicit_threshold, 0.50);

        controller.reset();
        assert_eq!(controller.get_thresholds().explicit_threshold, 0.50);
        assert_eq!(controller.metrics().total_recorded, 0);

        controller.restore(ThresholdState {
            explicit_threshold: 0.1,
            suggestion_threshold: 0.75,
        });
        let state = controller.get_thresholds();
        assert_eq!(state.explicit_threshold, 0.40);
        assert_eq!(state.suggestion_threshold, 0.75);
    }

    #[test]
    fn test_concurrent_recording_is_atomic() {
        let controller = Arc::new(AdaptiveThresholdController::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        controller.record_execution(speculative(false));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let metrics = controller.metrics();
        assert_eq!(metrics.total_recorded, 200);
        assert_eq!(metrics.history_len, 50);
        // 200 records, one analysis every 10 from the 20th on: 19 cycles,
        // each raising explicit by 0.05 until the clamp
        assert_eq!(metrics.thresholds.explicit_threshold, 0.90);
    }
}
