//! Camera/ML classification capability.
//!
//! The two classification models (UV authenticity and denomination) are
//! black boxes behind [`ClassifierPort`]; the pipeline only sees labels
//! with confidence scores.

#![allow(async_fn_in_trait)]

use std::collections::VecDeque;

use thiserror::Error;

/// Minimum confidence for a classification to count as a positive result.
pub const CONFIDENCE_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    #[must_use]
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Classification {
            label: label.into(),
            confidence,
        }
    }

    /// UV authenticity gate: the model must say "genuine" with confidence
    /// at or above the threshold.
    #[must_use]
    pub fn is_genuine(&self) -> bool {
        self.confidence >= CONFIDENCE_THRESHOLD && self.label == "genuine"
    }

    /// Denomination gate: below-threshold results are treated as unknown,
    /// otherwise the label parses as an integer with a digits-only
    /// fallback for labels like "100php".
    #[must_use]
    pub fn denomination(&self) -> Option<u32> {
        if self.confidence < CONFIDENCE_THRESHOLD {
            return None;
        }
        if let Ok(value) = self.label.trim().parse::<u32>() {
            return Some(value);
        }
        let digits: String = self.label.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            None
        } else {
            digits.parse().ok()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    #[error("camera capture failed")]
    Capture,
    #[error("inference failed: {0}")]
    Inference(String),
}

/// The two model invocations the acceptance pipeline needs.
pub trait ClassifierPort: Send {
    async fn authenticate(&mut self) -> Result<Classification, ClassifierError>;
    async fn classify_denomination(&mut self) -> Result<Classification, ClassifierError>;
}

/// Scripted classifier for tests and the degraded boot mode.
///
/// Scripted results are consumed front to back; when a script runs dry the
/// configured fallback answers instead, and with no fallback the call
/// reports a capture failure.
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    auth_script: VecDeque<Classification>,
    denom_script: VecDeque<Classification>,
    auth_fallback: Option<Classification>,
    denom_fallback: Option<Classification>,
}

impl ScriptedClassifier {
    /// A classifier that authenticates everything and always reads `denom`.
    #[must_use]
    pub fn passing(denom: u32) -> Self {
        ScriptedClassifier {
            auth_fallback: Some(Classification::new("genuine", 1.0)),
            denom_fallback: Some(Classification::new(denom.to_string(), 1.0)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_auth(mut self, result: Classification) -> Self {
        self.auth_script.push_back(result);
        self
    }

    #[must_use]
    pub fn with_denom(mut self, result: Classification) -> Self {
        self.denom_script.push_back(result);
        self
    }
}

impl ClassifierPort for ScriptedClassifier {
    async fn authenticate(&mut self) -> Result<Classification, ClassifierError> {
        self.auth_script
            .pop_front()
            .or_else(|| self.auth_fallback.clone())
            .ok_or(ClassifierError::Capture)
    }

    async fn classify_denomination(&mut self) -> Result<Classification, ClassifierError> {
        self.denom_script
            .pop_front()
            .or_else(|| self.denom_fallback.clone())
            .ok_or(ClassifierError::Capture)
    }
}
