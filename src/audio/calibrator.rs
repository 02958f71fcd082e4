//! Codec gain/routing calibration.
//!
//! Applies a fixed list of absolute register writes before any stream is
//! opened. Each step is independent: a failing write is logged and recorded,
//! the remaining steps still run. Every value is absolute, so running the
//! calibration twice leaves the codec in the same state as running it once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::mixer::MixerControl;

/// One mixer register write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationStep {
    /// Zero-based control index on the card
    pub control: u32,
    pub value: i64,
    /// Human-readable name used in logs
    pub label: String,
}

impl CalibrationStep {
    pub fn new(control: u32, value: i64, label: &str) -> Self {
        Self {
            control,
            value,
            label: label.to_string(),
        }
    }
}

impl fmt::Display for CalibrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "control {} = {}", self.control, self.value)
        } else {
            write!(f, "{} (control {}) = {}", self.label, self.control, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub card: u32,
    pub outcomes: Vec<(CalibrationStep, StepOutcome)>,
}

impl CalibrationReport {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == StepOutcome::Applied)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&CalibrationStep, &str)> {
        self.outcomes.iter().filter_map(|(step, outcome)| match outcome {
            StepOutcome::Failed(reason) => Some((step, reason.as_str())),
            StepOutcome::Applied => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.applied() == self.outcomes.len()
    }
}

pub struct MixerCalibrator {
    mixer: Arc<dyn MixerControl>,
    steps: Vec<CalibrationStep>,
    step_timeout: Duration,
}

impl MixerCalibrator {
    pub fn new(mixer: Arc<dyn MixerControl>, steps: Vec<CalibrationStep>, step_timeout: Duration) -> Self {
        Self {
            mixer,
            steps,
            step_timeout,
        }
    }

    pub fn steps(&self) -> &[CalibrationStep] {
        &self.steps
    }

    /// Apply every step to `card` in order. Never fails.
    pub async fn calibrate(&self, card: u32) -> CalibrationReport {
        log::info!(
            "Calibrating card {} via {} ({} steps)",
            card,
            self.mixer.name(),
            self.steps.len()
        );

        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let write = self.mixer.set_control(card, step.control, step.value);
            let outcome = match timeout(self.step_timeout, write).await {
                Ok(Ok(())) => {
                    log::debug!("Applied {}", step);
                    StepOutcome::Applied
                }
                Ok(Err(e)) => {
                    log::warn!("Calibration step {} failed: {}", step, e);
                    StepOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    log::warn!("Calibration step {} timed out after {:?}", step, self.step_timeout);
                    StepOutcome::Failed(format!("timed out after {:?}", self.step_timeout))
                }
            };
            outcomes.push((step.clone(), outcome));
        }

        let report = CalibrationReport { card, outcomes };
        if report.is_complete() {
            log::info!("Calibration of card {} complete", card);
        } else {
            // 部分失败时继续运行，编解码器可能处于部分校准状态
            log::warn!(
                "Calibration of card {} partial: {}/{} steps applied",
                card,
                report.applied(),
                report.outcomes.len()
            );
        }
        report
    }
}
