//! End-to-end verification run: one document, then liveness attempts until
//! one passes or the attempt budget is spent.
//!
//! ```text
//!   Idle ──document──▶ Capturing ──begin──▶ Verifying ──pass──▶ Success
//!                         ▲                    │
//!                         └──fail (budget)─────┤
//!                         └──aborted───────────┤
//!                                              └──fail (spent)──▶ Locked
//! ```
//!
//! `Success` and `Locked` are terminal and carry a [`VerificationSummary`];
//! only [`VerificationStateMachine::restart`] leaves them. A session the
//! provider never created (`aborted`) does not use up an attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::liveness::{LivenessSession, ReferenceImageRef, SessionStatus};
use crate::object::ObjectLocation;

/// Default minimum liveness confidence (0..=100) for a pass.
pub const DEFAULT_ACCEPTANCE_THRESHOLD: f32 = 80.0;
/// Default number of liveness attempts before lockout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    /// Document accepted; waiting for a liveness attempt to start.
    Capturing,
    /// A liveness attempt is in flight.
    Verifying,
    Success,
    Locked,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VerificationState::Success | VerificationState::Locked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub score: f32,
    pub status: AttemptStatus,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub session_status: SessionStatus,
    pub reference_image: ReferenceImageRef,
}

/// The uploaded identity document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// ISO 3166-1 alpha-2.
    pub country: String,
    pub kind: String,
    pub url: String,
    pub location: ObjectLocation,
    pub content_type: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub document: DocumentRecord,
    pub attempts: Vec<VerificationAttempt>,
    pub final_status: AttemptStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub acceptance_threshold: f32,
    pub max_attempts: u32,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {event} while {from:?}")]
    Invalid {
        from: VerificationState,
        event: &'static str,
    },
    #[error("liveness session {0} has not finished")]
    SessionNotTerminal(String),
    #[error("no document attached to this run")]
    MissingDocument,
}

/// What a resolved attempt led to.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Passed(VerificationSummary),
    Retry { attempts_used: u32, remaining: u32 },
    Locked(VerificationSummary),
}

impl AttemptOutcome {
    pub fn summary(&self) -> Option<&VerificationSummary> {
        match self {
            AttemptOutcome::Passed(s) | AttemptOutcome::Locked(s) => Some(s),
            AttemptOutcome::Retry { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationStateMachine {
    policy: VerificationPolicy,
    state: VerificationState,
    document: Option<DocumentRecord>,
    attempts: Vec<VerificationAttempt>,
    summary: Option<VerificationSummary>,
}

impl VerificationStateMachine {
    pub fn new(policy: VerificationPolicy) -> Self {
        Self {
            policy,
            state: VerificationState::Idle,
            document: None,
            attempts: Vec::new(),
            summary: None,
        }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn document(&self) -> Option<&DocumentRecord> {
        self.document.as_ref()
    }

    pub fn attempts(&self) -> &[VerificationAttempt] {
        &self.attempts
    }

    pub fn summary(&self) -> Option<&VerificationSummary> {
        self.summary.as_ref()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.policy
            .max_attempts
            .saturating_sub(self.attempts.len() as u32)
    }

    /// `Idle → Capturing` with the uploaded document attached.
    pub fn document_captured(&mut self, document: DocumentRecord) -> Result<(), TransitionError> {
        self.expect(VerificationState::Idle, "attach a document")?;
        tracing::info!(kind = %document.kind, location = %document.location, "document attached");
        self.document = Some(document);
        self.state = VerificationState::Capturing;
        Ok(())
    }

    /// `Capturing → Verifying`.
    pub fn begin_attempt(&mut self) -> Result<(), TransitionError> {
        self.expect(VerificationState::Capturing, "start a liveness attempt")?;
        self.state = VerificationState::Verifying;
        tracing::debug!(
            attempt = self.attempts.len() + 1,
            max = self.policy.max_attempts,
            "liveness attempt started"
        );
        Ok(())
    }

    /// `Verifying → Capturing` without recording an attempt: the session never
    /// got going (provider refused to create it, or the caller abandoned it).
    pub fn abort_attempt(&mut self) -> Result<(), TransitionError> {
        self.expect(VerificationState::Verifying, "abort an attempt")?;
        self.state = VerificationState::Capturing;
        tracing::debug!("liveness attempt aborted without consuming a slot");
        Ok(())
    }

    /// Record a finished session and move to `Success`, back to `Capturing`,
    /// or to `Locked`.
    pub fn resolve_attempt(
        &mut self,
        session: &LivenessSession,
    ) -> Result<AttemptOutcome, TransitionError> {
        self.expect(VerificationState::Verifying, "resolve an attempt")?;
        if !session.is_terminal() {
            return Err(TransitionError::SessionNotTerminal(
                session.session_id().to_string(),
            ));
        }
        let document = self
            .document
            .clone()
            .ok_or(TransitionError::MissingDocument)?;

        let passed = session.status() == SessionStatus::Succeeded
            && session.confidence() >= self.policy.acceptance_threshold;
        let status = if passed {
            AttemptStatus::Success
        } else {
            AttemptStatus::Fail
        };

        self.attempts.push(VerificationAttempt {
            score: session.confidence(),
            status,
            timestamp: Utc::now(),
            session_id: session.session_id().to_string(),
            session_status: session.status(),
            reference_image: session
                .reference_image()
                .cloned()
                .unwrap_or(ReferenceImageRef::None),
        });

        let used = self.attempts.len() as u32;
        tracing::info!(
            session_id = session.session_id(),
            status = %session.status(),
            confidence = session.confidence(),
            threshold = self.policy.acceptance_threshold,
            passed,
            attempt = used,
            "liveness attempt resolved"
        );

        if passed {
            self.state = VerificationState::Success;
            return Ok(AttemptOutcome::Passed(
                self.seal(document, AttemptStatus::Success),
            ));
        }

        if used < self.policy.max_attempts {
            self.state = VerificationState::Capturing;
            Ok(AttemptOutcome::Retry {
                attempts_used: used,
                remaining: self.policy.max_attempts - used,
            })
        } else {
            self.state = VerificationState::Locked;
            tracing::warn!(attempts = used, "attempt budget spent, run locked");
            Ok(AttemptOutcome::Locked(
                self.seal(document, AttemptStatus::Fail),
            ))
        }
    }

    /// Back to `Idle`, dropping the document, attempts and summary.
    pub fn restart(&mut self) {
        tracing::debug!(from = ?self.state, "verification run restarted");
        self.state = VerificationState::Idle;
        self.document = None;
        self.attempts.clear();
        self.summary = None;
    }

    fn expect(&self, state: VerificationState, event: &'static str) -> Result<(), TransitionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.state,
                event,
            })
        }
    }

    fn seal(&mut self, document: DocumentRecord, final_status: AttemptStatus) -> VerificationSummary {
        let summary = VerificationSummary {
            document,
            attempts: self.attempts.clone(),
            final_status,
        };
        self.summary = Some(summary.clone());
        summary
    }
}
