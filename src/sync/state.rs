//! Sync state machine
//!
//! A pure, side-effect-free description of one sync round. The engine feeds
//! it events (a pull finished, a push failed, a backoff timer fired) and gets
//! back the next state plus the one action to perform. All retry and backoff
//! decisions live here so they can be tested without a remote.
//!
//! ```text
//! Idle -> Pulling -> Merging -> Pushing -> Idle
//!            |                     |
//!            +------> Failed <-----+
//! ```

use std::fmt;
use std::time::Duration;

use crate::storage::SyncConfig;

use super::api::ErrorClass;

/// Stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pull,
    Push,
}

/// Where a sync round currently is
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No round running
    #[default]
    Idle,

    /// Fetching the delta
    Pulling { attempt: u32 },

    /// Applying the delta to the working set
    Merging,

    /// Pushing pending mutations; `attempt` counts tries of the current one
    Pushing { attempt: u32 },

    /// A call failed; retryable failures wait for the backoff timer
    Failed {
        class: ErrorClass,
        stage: Stage,
        attempt: u32,
        reason: String,
    },
}

impl SyncState {
    /// Processes an event and returns the new state plus the action to execute
    ///
    /// Pure: the caller performs the action and reports back with the next event.
    pub fn on_event(self, event: SyncEvent, policy: &RetryPolicy) -> (Self, Action) {
        match (self, event) {
            (Self::Idle, SyncEvent::Start) => (Self::Pulling { attempt: 1 }, Action::Pull),

            (Self::Pulling { .. }, SyncEvent::PullSucceeded) => (Self::Merging, Action::Merge),
            (Self::Pulling { attempt }, SyncEvent::PullFailed(failure)) => {
                fail(Stage::Pull, attempt, failure, policy)
            }

            (Self::Merging, SyncEvent::MergeCompleted) => {
                (Self::Pushing { attempt: 1 }, Action::PushNext)
            }

            (Self::Pushing { .. }, SyncEvent::PushAcked | SyncEvent::PushRejected) => {
                (Self::Pushing { attempt: 1 }, Action::PushNext)
            }
            (Self::Pushing { attempt }, SyncEvent::PushFailed(failure)) => {
                fail(Stage::Push, attempt, failure, policy)
            }
            (Self::Pushing { .. }, SyncEvent::PushDrained) => (Self::Idle, Action::Commit),

            (
                Self::Failed {
                    class: ErrorClass::Retryable,
                    stage,
                    attempt,
                    ..
                },
                SyncEvent::RetryTimer,
            ) => match stage {
                Stage::Pull => (
                    Self::Pulling {
                        attempt: attempt + 1,
                    },
                    Action::Pull,
                ),
                Stage::Push => (
                    Self::Pushing {
                        attempt: attempt + 1,
                    },
                    Action::PushNext,
                ),
            },

            (state, SyncEvent::Cancelled) => {
                let stage = state.stage().unwrap_or(Stage::Pull);
                (
                    Self::Failed {
                        class: ErrorClass::Fatal,
                        stage,
                        attempt: state.attempt(),
                        reason: "cancelled".to_string(),
                    },
                    Action::Abort {
                        reason: AbortReason::Cancelled,
                        commit: false,
                    },
                )
            }

            (state, SyncEvent::StorageFailed(reason)) => (
                Self::Failed {
                    class: ErrorClass::Fatal,
                    stage: state.stage().unwrap_or(Stage::Pull),
                    attempt: state.attempt(),
                    reason,
                },
                Action::Abort {
                    reason: AbortReason::Fatal,
                    commit: false,
                },
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, Action::None),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Pulling { .. } | Self::Merging | Self::Pushing { .. }
        ) || matches!(
            self,
            Self::Failed {
                class: ErrorClass::Retryable,
                ..
            }
        )
    }

    fn stage(&self) -> Option<Stage> {
        match self {
            Self::Pulling { .. } | Self::Merging => Some(Stage::Pull),
            Self::Pushing { .. } => Some(Stage::Push),
            Self::Failed { stage, .. } => Some(*stage),
            Self::Idle => None,
        }
    }

    fn attempt(&self) -> u32 {
        match self {
            Self::Pulling { attempt } | Self::Pushing { attempt } => *attempt,
            Self::Failed { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pulling { attempt } => write!(f, "pulling (attempt {})", attempt),
            Self::Merging => write!(f, "merging"),
            Self::Pushing { attempt } => write!(f, "pushing (attempt {})", attempt),
            Self::Failed { class, reason, .. } => write!(f, "failed ({}): {}", class, reason),
        }
    }
}

/// A failed remote call as seen by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub class: ErrorClass,
    pub reason: String,
    /// Server-provided wait hint
    pub retry_after: Option<Duration>,
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Start,
    PullSucceeded,
    PullFailed(Failure),
    MergeCompleted,
    PushAcked,
    /// The remote refused the mutation for good; it is dropped and pushing continues
    PushRejected,
    PushFailed(Failure),
    /// No pending mutations left to push
    PushDrained,
    /// Backoff delay elapsed
    RetryTimer,
    Cancelled,
    StorageFailed(String),
}

/// Why a round stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A non-retryable error
    Fatal,
    /// Retryable errors used up the attempt budget
    Exhausted { attempts: u32 },
    Cancelled,
}

/// What the engine must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Pull,
    Merge,
    /// Push the next pending mutation (or report `PushDrained`)
    PushNext,
    /// Sleep, then report `RetryTimer`
    Backoff { delay: Duration },
    /// Commit the round
    Commit,
    /// Stop the round; `commit` says whether the merged delta and the
    /// acknowledged mutations are still committed first
    Abort { reason: AbortReason, commit: bool },
    None,
}

fn fail(stage: Stage, attempt: u32, failure: Failure, policy: &RetryPolicy) -> (SyncState, Action) {
    let commit = stage == Stage::Push;

    let action = match failure.class {
        ErrorClass::Fatal => Action::Abort {
            reason: AbortReason::Fatal,
            commit,
        },
        ErrorClass::Retryable if attempt >= policy.max_attempts => Action::Abort {
            reason: AbortReason::Exhausted { attempts: attempt },
            commit,
        },
        ErrorClass::Retryable => Action::Backoff {
            delay: policy.delay_with_hint(attempt, failure.retry_after),
        },
    };

    let class = match action {
        Action::Backoff { .. } => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    };

    (
        SyncState::Failed {
            class,
            stage,
            attempt,
            reason: failure.reason,
        },
        action,
    )
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt: `base * 2^(attempt-1)`, capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Like [`Self::delay`], but never shorter than a server hint (still capped)
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay(attempt);
        match hint {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1000))
    }

    fn retryable() -> Failure {
        Failure {
            class: ErrorClass::Retryable,
            reason: "connection reset".to_string(),
            retry_after: None,
        }
    }

    fn fatal() -> Failure {
        Failure {
            class: ErrorClass::Fatal,
            reason: "unauthorized".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn starts_idle() {
        assert!(SyncState::default().is_idle());
    }

    #[test]
    fn happy_path() {
        let p = policy();
        let (state, action) = SyncState::Idle.on_event(SyncEvent::Start, &p);
        assert_eq!(state, SyncState::Pulling { attempt: 1 });
        assert_eq!(action, Action::Pull);

        let (state, action) = state.on_event(SyncEvent::PullSucceeded, &p);
        assert_eq!(state, SyncState::Merging);
        assert_eq!(action, Action::Merge);

        let (state, action) = state.on_event(SyncEvent::MergeCompleted, &p);
        assert_eq!(state, SyncState::Pushing { attempt: 1 });
        assert_eq!(action, Action::PushNext);

        let (state, action) = state.on_event(SyncEvent::PushAcked, &p);
        assert_eq!(action, Action::PushNext);

        let (state, action) = state.on_event(SyncEvent::PushDrained, &p);
        assert_eq!(state, SyncState::Idle);
        assert_eq!(action, Action::Commit);
    }

    #[test]
    fn retryable_pull_failure_backs_off_then_retries() {
        let p = policy();
        let state = SyncState::Pulling { attempt: 1 };

        let (state, action) = state.on_event(SyncEvent::PullFailed(retryable()), &p);
        assert!(state.is_running());
        assert_eq!(
            action,
            Action::Backoff {
                delay: Duration::from_millis(100)
            }
        );

        let (state, action) = state.on_event(SyncEvent::RetryTimer, &p);
        assert_eq!(state, SyncState::Pulling { attempt: 2 });
        assert_eq!(action, Action::Pull);
    }

    #[test]
    fn exhausted_attempts_abort() {
        let p = policy();
        let state = SyncState::Pulling { attempt: 3 };

        let (state, action) = state.on_event(SyncEvent::PullFailed(retryable()), &p);
        assert!(matches!(
            state,
            SyncState::Failed {
                class: ErrorClass::Fatal,
                ..
            }
        ));
        assert_eq!(
            action,
            Action::Abort {
                reason: AbortReason::Exhausted { attempts: 3 },
                commit: false
            }
        );
    }

    #[test]
    fn fatal_pull_failure_aborts_immediately() {
        let p = policy();
        let (_, action) =
            SyncState::Pulling { attempt: 1 }.on_event(SyncEvent::PullFailed(fatal()), &p);
        assert_eq!(
            action,
            Action::Abort {
                reason: AbortReason::Fatal,
                commit: false
            }
        );
    }

    #[test]
    fn push_failure_still_commits() {
        let p = policy();
        let (_, action) =
            SyncState::Pushing { attempt: 1 }.on_event(SyncEvent::PushFailed(fatal()), &p);
        assert_eq!(
            action,
            Action::Abort {
                reason: AbortReason::Fatal,
                commit: true
            }
        );
    }

    #[test]
    fn push_retry_resumes_pushing() {
        let p = policy();
        let (state, _) =
            SyncState::Pushing { attempt: 1 }.on_event(SyncEvent::PushFailed(retryable()), &p);
        let (state, action) = state.on_event(SyncEvent::RetryTimer, &p);
        assert_eq!(state, SyncState::Pushing { attempt: 2 });
        assert_eq!(action, Action::PushNext);

        // An ack resets the attempt count for the next mutation
        let (state, _) = state.on_event(SyncEvent::PushAcked, &p);
        assert_eq!(state, SyncState::Pushing { attempt: 1 });
    }

    #[test]
    fn rejected_push_moves_to_next_mutation() {
        let p = policy();
        let (state, action) =
            SyncState::Pushing { attempt: 2 }.on_event(SyncEvent::PushRejected, &p);
        assert_eq!(state, SyncState::Pushing { attempt: 1 });
        assert_eq!(action, Action::PushNext);
    }

    #[test]
    fn cancel_from_any_state() {
        let p = policy();
        for state in [
            SyncState::Pulling { attempt: 1 },
            SyncState::Merging,
            SyncState::Pushing { attempt: 2 },
        ] {
            let (state, action) = state.on_event(SyncEvent::Cancelled, &p);
            assert!(matches!(state, SyncState::Failed { .. }));
            assert_eq!(
                action,
                Action::Abort {
                    reason: AbortReason::Cancelled,
                    commit: false
                }
            );
        }
    }

    #[test]
    fn invalid_transition_is_ignored() {
        let p = policy();
        let (state, action) = SyncState::Idle.on_event(SyncEvent::PushAcked, &p);
        assert_eq!(state, SyncState::Idle);
        assert_eq!(action, Action::None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(5), Duration::from_millis(1000));
        assert_eq!(p.delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn server_hint_extends_delay() {
        let p = policy();
        assert_eq!(
            p.delay_with_hint(1, Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        assert_eq!(
            p.delay_with_hint(1, Some(Duration::from_secs(60))),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn policy_from_config() {
        let p = RetryPolicy::from(&SyncConfig::default());
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay, Duration::from_millis(200));
        assert_eq!(p.max_delay, Duration::from_secs(10));
    }
}
