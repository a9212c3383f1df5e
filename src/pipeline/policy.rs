use std::time::{Duration, Instant};

use crate::{config::ConfigVerification, events::VerificationSummary, verify::Verdict};

/// Minimum spacing between two occurrences of an action
#[derive(Debug, Clone)]
pub struct Cooldown {
    period: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Cooldown {
        Cooldown { period, last: None }
    }
    pub fn from_secs(secs: u64) -> Cooldown {
        Cooldown::new(Duration::from_secs(secs))
    }
    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
    /// Marks and returns true if the cooldown has passed
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.ready(now) {
            self.mark(now);
            true
        } else {
            false
        }
    }
}

/// What verification can contribute for a given candidate
#[derive(Debug, PartialEq, Clone)]
pub enum VerificationOutcome {
    /// Verification switched off by configuration
    Disabled,
    /// Service failed its startup check
    Unavailable,
    Done(Verdict),
}

#[derive(Debug, PartialEq, Clone)]
pub enum Decision {
    Confirm(VerificationSummary),
    Discard { reason: String },
}

/// Decides whether a candidate becomes an alert.
///
/// Without a usable verification result the detector confidence alone must clear the fallback threshold.
pub fn decide(confidence: f32, outcome: &VerificationOutcome, cfg: &ConfigVerification) -> Decision {
    let fallback = |reason: String| {
        if confidence >= cfg.fallback_confidence {
            Decision::Confirm(VerificationSummary {
                verified: false,
                score: None,
                reason: Some(reason),
                fallback: true,
            })
        } else {
            Decision::Discard {
                reason: format!(
                    "{} and confidence {:.2} below fallback threshold {:.2}",
                    reason, confidence, cfg.fallback_confidence
                ),
            }
        }
    };
    match outcome {
        VerificationOutcome::Disabled => Decision::Confirm(VerificationSummary::default()),
        VerificationOutcome::Unavailable => fallback("verification unavailable".into()),
        VerificationOutcome::Done(Verdict::Verified { score, reason }) => {
            Decision::Confirm(VerificationSummary {
                verified: true,
                score: Some(*score),
                reason: Some(reason.clone()),
                fallback: false,
            })
        }
        VerificationOutcome::Done(Verdict::Rejected { score, reason }) => Decision::Discard {
            reason: format!("verification rejected ({:.2}): {}", score, reason),
        },
        VerificationOutcome::Done(v @ Verdict::QuotaExceeded)
        | VerificationOutcome::Done(v @ Verdict::Failed { .. }) => fallback(v.reason()),
    }
}
