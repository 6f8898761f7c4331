//! Structured reports attached to phase advances and completion.
//!
//! Each phase a node leaves has exactly one report shape, so the state
//! machine can check the required fields before recording the transition.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

use super::{Phase, Specialization};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploreReport {
    pub summary: String,
    pub confidence: f32,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub relevant_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub summary: String,
    pub confidence: f32,
    pub steps: Vec<String>,
    #[serde(default)]
    pub planned_children: Vec<Specialization>,
}

/// Root-only: what the shared foundation laid down before children start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundationReport {
    pub summary: String,
    pub confidence: f32,
    pub commit: Option<String>,
    #[serde(default)]
    pub shared_artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummonReport {
    pub summary: String,
    pub confidence: f32,
    pub children_spawned: u32,
}

/// Final report handed to `complete()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub commit: Option<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
}

impl CompletionReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            files_changed: Vec::new(),
            commit: None,
            follow_ups: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), TransitionError> {
        if self.summary.trim().is_empty() {
            return Err(TransitionError::InvalidReport(
                "completion summary is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Report accompanying `advance()`, tagged by the phase being left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseReport {
    Explore(ExploreReport),
    Plan(PlanReport),
    Foundation(FoundationReport),
    Summon(SummonReport),
}

impl PhaseReport {
    pub fn kind(&self) -> &'static str {
        match self {
            PhaseReport::Explore(_) => "explore",
            PhaseReport::Plan(_) => "plan",
            PhaseReport::Foundation(_) => "foundation",
            PhaseReport::Summon(_) => "summon",
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            PhaseReport::Explore(r) => &r.summary,
            PhaseReport::Plan(r) => &r.summary,
            PhaseReport::Foundation(r) => &r.summary,
            PhaseReport::Summon(r) => &r.summary,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            PhaseReport::Explore(r) => r.confidence,
            PhaseReport::Plan(r) => r.confidence,
            PhaseReport::Foundation(r) => r.confidence,
            PhaseReport::Summon(r) => r.confidence,
        }
    }

    fn expected_kind(leaving: Phase) -> Option<&'static str> {
        match leaving {
            Phase::Explore => Some("explore"),
            Phase::Plan => Some("plan"),
            Phase::Found => Some("foundation"),
            Phase::Summon => Some("summon"),
            Phase::Complete => None,
        }
    }

    /// Check this report is the right shape for leaving `leaving` and that
    /// its required fields are filled in.
    pub fn validate_for(&self, leaving: Phase) -> Result<(), TransitionError> {
        let expected = Self::expected_kind(leaving).ok_or(TransitionError::InvalidTransition {
            from: leaving,
            to: leaving,
        })?;
        if expected != self.kind() {
            return Err(TransitionError::ReportMismatch {
                phase: leaving,
                expected,
                actual: self.kind(),
            });
        }
        if self.summary().trim().is_empty() {
            return Err(TransitionError::InvalidReport(format!(
                "{} report summary is empty",
                self.kind()
            )));
        }
        let confidence = self.confidence();
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(TransitionError::InvalidReport(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
        if let PhaseReport::Plan(plan) = self {
            if plan.steps.is_empty() {
                return Err(TransitionError::InvalidReport(
                    "plan report lists no steps".to_string(),
                ));
            }
        }
        Ok(())
    }
}
