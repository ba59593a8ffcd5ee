//! Membership Tracker
//!
//! Mirrors the consensus store's member list and drives a learner through
//! promotion. Every decision re-reads membership from the store; nothing is
//! cached across a promote or remove call.
//!
//! Promotion requires a [`Ready`] value, which only
//! [`MembershipTracker::await_learner_progress`] can produce and which
//! [`MembershipTracker::promote`] consumes. A learner therefore cannot be
//! promoted without a fresh sync confirmation for that exact member.

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MembershipConfig;
use crate::control::{ConsensusStore, LearnerProgress, PromoteOutcome, RejectReason};
use crate::error::{Result, StackjoinError};
use crate::poll::{self, Attempt, Backoff, PollSpec, Probe, RetryBudget, RetryFailure};
use crate::types::{MemberId, MemberRecord};

/// Proof that a learner was caught up at the last check
#[derive(Debug, PartialEq, Eq)]
pub struct Ready {
    member_id: MemberId,
    progress: LearnerProgress,
    waited: Duration,
}

impl Ready {
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn progress(&self) -> LearnerProgress {
        self.progress
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("learner {member_id} not in sync after {elapsed:?} (last progress: {last_progress:?})")]
pub struct LearnerTimedOut {
    pub member_id: MemberId,
    pub elapsed: Duration,
    pub last_progress: Option<LearnerProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promoted {
    pub member_id: MemberId,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("promotion of {member_id} rejected after {attempts} attempt(s): {reason}")]
pub struct Rejected {
    pub member_id: MemberId,
    pub reason: RejectReason,
    pub attempts: u32,
}

pub struct MembershipTracker {
    store: Arc<dyn ConsensusStore>,
    poll_interval: Duration,
    promote_budget: RetryBudget,
}

impl MembershipTracker {
    pub fn new(store: Arc<dyn ConsensusStore>, poll_interval: Duration, promote_budget: RetryBudget) -> Self {
        Self {
            store,
            poll_interval,
            promote_budget,
        }
    }

    pub fn from_config(store: Arc<dyn ConsensusStore>, config: &MembershipConfig) -> Self {
        Self::new(
            store,
            config.learner_poll_interval(),
            RetryBudget::new(config.promote_attempts, Backoff::Linear(config.promote_backoff())),
        )
    }

    pub fn promote_budget(&self) -> RetryBudget {
        self.promote_budget
    }

    pub async fn current_members(&self) -> Result<Vec<MemberRecord>> {
        self.store.list_members().await
    }

    pub async fn member(&self, member_id: MemberId) -> Result<Option<MemberRecord>> {
        Ok(self
            .current_members()
            .await?
            .into_iter()
            .find(|m| m.member_id == member_id))
    }

    /// Poll the learner's replication progress until it matches the leader or
    /// `timeout` elapses.
    pub async fn await_learner_progress(
        &self,
        member_id: MemberId,
        timeout: Duration,
    ) -> std::result::Result<Ready, LearnerTimedOut> {
        let spec = PollSpec::new(self.poll_interval, timeout);
        let start = tokio::time::Instant::now();
        let store = self.store.clone();
        let description = format!("learner {} sync", member_id);

        let result = poll::poll_until(&description, spec, || {
            let store = store.clone();
            async move {
                let progress = store.replication_progress(member_id).await?;
                debug!(member_id = %member_id, learner_index = progress.learner_index, lag = ?progress.lag(), "Learner progress");
                let probe = if progress.caught_up() {
                    Probe::Ready(progress)
                } else {
                    Probe::Pending(progress)
                };
                Ok::<_, StackjoinError>(probe)
            }
        })
        .await;

        match result {
            Ok(progress) => {
                let waited = start.elapsed();
                info!(member_id = %member_id, waited_ms = waited.as_millis() as u64, "Learner in sync with leader");
                Ok(Ready {
                    member_id,
                    progress,
                    waited,
                })
            }
            Err(timeout) => Err(LearnerTimedOut {
                member_id,
                elapsed: timeout.elapsed,
                last_progress: timeout.last,
            }),
        }
    }

    /// One promotion attempt for a learner confirmed ready.
    ///
    /// Re-reads membership before and after the call; a member that is
    /// already voting counts as promoted.
    pub async fn promote(&self, ready: Ready) -> std::result::Result<Promoted, Rejected> {
        let member_id = ready.member_id;
        let rejected = |reason| Rejected {
            member_id,
            reason,
            attempts: 1,
        };

        match self.member(member_id).await {
            Ok(Some(record)) if !record.is_learner => {
                debug!(member_id = %member_id, "Member already voting");
                return Ok(Promoted { member_id, attempts: 1 });
            }
            Ok(Some(_)) => {}
            Ok(None) => return Err(rejected(RejectReason::MemberNotFound)),
            Err(e) => return Err(rejected(RejectReason::Other(e.to_string()))),
        }

        match self.store.promote(member_id).await {
            Ok(PromoteOutcome::Promoted) => {}
            Ok(PromoteOutcome::Rejected(reason)) => return Err(rejected(reason)),
            Err(e) => return Err(rejected(RejectReason::Other(e.to_string()))),
        }

        match self.member(member_id).await {
            Ok(Some(record)) if !record.is_learner => Ok(Promoted { member_id, attempts: 1 }),
            Ok(Some(_)) => Err(rejected(RejectReason::Other(
                "promotion accepted but member still listed as learner".to_string(),
            ))),
            Ok(None) => Err(rejected(RejectReason::MemberNotFound)),
            Err(e) => Err(rejected(RejectReason::Other(e.to_string()))),
        }
    }

    /// Promote `ready`, and on retryable rejections wait for sync again and
    /// retry, up to the promotion budget. Never removes the member.
    pub async fn promote_with_retry(
        &self,
        ready: Ready,
        learner_timeout: Duration,
    ) -> std::result::Result<Promoted, Rejected> {
        let member_id = ready.member_id;
        let mut first = Some(ready);
        let description = format!("promote member {}", member_id);

        let result = poll::retry_bounded(&description, self.promote_budget, |attempt| {
            let pending = first.take();
            async move {
                let ready = match pending {
                    Some(ready) => ready,
                    None => match self.await_learner_progress(member_id, learner_timeout).await {
                        Ok(ready) => ready,
                        Err(timed_out) => {
                            warn!(member_id = %member_id, attempt, error = %timed_out, "Learner fell behind before retry");
                            return Attempt::Retry(RejectReason::LearnerNotReady);
                        }
                    },
                };

                match self.promote(ready).await {
                    Ok(promoted) => Attempt::Done(Promoted {
                        attempts: attempt,
                        ..promoted
                    }),
                    Err(rejected) if rejected.reason.is_retryable() => Attempt::Retry(rejected.reason),
                    Err(rejected) => Attempt::Abort(rejected.reason),
                }
            }
        })
        .await;

        result.map_err(|RetryFailure { attempts, error, .. }| Rejected {
            member_id,
            reason: error,
            attempts,
        })
    }

    /// Explicit cleanup of an abandoned join. Never called on a failure path.
    pub async fn remove(&self, member_id: MemberId) -> Result<()> {
        warn!(member_id = %member_id, "Removing member from consensus store");
        self.store.remove_member(member_id).await
    }
}
