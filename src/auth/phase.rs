//! Generic Phase Engine
//!
//! Drives an ordered queue of authentication phases, one at a time, and
//! reports a single overall completion once the queue drains or a phase
//! fails. The engine is generic over the per-family phase type; each family
//! (connection, verification, login, beacon) instantiates it with its own
//! sum type of phase variants.
//!
//! Only the authenticating server ever starts a queue or drives it to
//! completion. A client-side queue exists purely so inbound phase messages
//! can be routed to the phase that owns them.

use std::collections::VecDeque;

use crate::auth::code::PhaseResult;
use crate::config::{AuthCapabilities, AuthSettings};
use crate::network::connection::Connection;
use crate::services::Services;

/// Everything a phase may touch while it runs.
pub struct AuthEnv<'a> {
    /// The connection being authenticated.
    pub conn: &'a mut Connection,
    /// External service collaborators.
    pub services: &'a mut Services,
    /// Authentication settings.
    pub settings: &'a AuthSettings,
    /// Resolved capability set.
    pub caps: &'a AuthCapabilities,
}

/// What a phase's `start` reports back to the engine.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// The phase is waiting for a message or an external callback.
    Pending,
    /// The phase finished synchronously.
    Finished(PhaseResult),
}

/// One authentication step with a start/finish contract.
pub trait PhaseStep<E> {
    /// Stable phase name, for logs.
    fn name(&self) -> &'static str;

    /// Begin the phase. Must eventually lead to exactly one finish, either by
    /// returning `Finished` here or by a later message/callback handler
    /// feeding a result into [`PhaseQueue::advance`].
    fn start(&mut self, env: &mut E) -> PhaseOutcome;
}

/// Queue run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    /// Not started.
    Idle,
    /// A phase is active or pending.
    Running,
    /// The run completed; no further transitions.
    Done,
}

/// What the engine's owner observes after driving the queue.
#[derive(Debug)]
pub enum QueueProgress {
    /// A phase is suspended, waiting to be resumed.
    Running,
    /// The whole run finished with this overall result.
    Complete(PhaseResult),
}

impl QueueProgress {
    /// Whether the run is still in flight.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Ordered phase queue for one authentication attempt.
pub struct PhaseQueue<P> {
    state: QueueState,
    pending: VecDeque<P>,
    starts: usize,
}

impl<P> PhaseQueue<P> {
    /// A queue that has not started.
    pub fn new() -> Self {
        Self {
            state: QueueState::Idle,
            pending: VecDeque::new(),
            starts: 0,
        }
    }

    /// Server-only: store the phase list and start the first phase. An empty
    /// list completes immediately with success and starts nothing.
    ///
    /// Panics if the queue was already started: one run per queue.
    pub fn start<E>(&mut self, phases: Vec<P>, env: &mut E) -> QueueProgress
    where
        P: PhaseStep<E>,
    {
        assert_eq!(
            self.state,
            QueueState::Idle,
            "phase queue started twice"
        );
        self.state = QueueState::Running;
        self.pending = phases.into();
        self.run(env)
    }

    /// Feed a finish result for the active phase and continue the run.
    ///
    /// May also be called with no phase active (an empty queue that was never
    /// started), which completes the run with the given result. Calling this
    /// after the run completed is a programming error.
    pub fn advance<E>(&mut self, result: PhaseResult, env: &mut E) -> QueueProgress
    where
        P: PhaseStep<E>,
    {
        assert_ne!(self.state, QueueState::Done, "phase queue finished twice");
        self.state = QueueState::Running;
        self.pending.pop_front();

        if let Err(failure) = result {
            self.state = QueueState::Done;
            return QueueProgress::Complete(Err(failure));
        }
        self.run(env)
    }

    /// Client-only: store phases for message routing without running them.
    /// The queue never drives completion on this path.
    pub fn register_for_routing(&mut self, phases: Vec<P>) {
        debug_assert_eq!(self.state, QueueState::Idle);
        self.pending = phases.into();
    }

    /// The phase currently at the head of the queue.
    pub fn active_mut(&mut self) -> Option<&mut P> {
        self.pending.front_mut()
    }

    /// Typed lookup across the stored phases (client-side routing).
    pub fn find_mut<T>(&mut self, select: impl Fn(&mut P) -> Option<&mut T>) -> Option<&mut T> {
        self.pending.iter_mut().find_map(select)
    }

    /// Whether the run has completed.
    pub fn is_done(&self) -> bool {
        self.state == QueueState::Done
    }

    /// Whether a phase is active or pending.
    pub fn is_running(&self) -> bool {
        self.state == QueueState::Running
    }

    /// Number of phases started so far in this run.
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Start head phases until one suspends, one fails, or the queue drains.
    fn run<E>(&mut self, env: &mut E) -> QueueProgress
    where
        P: PhaseStep<E>,
    {
        loop {
            let Some(front) = self.pending.front_mut() else {
                self.state = QueueState::Done;
                return QueueProgress::Complete(Ok(()));
            };

            self.starts += 1;
            match front.start(env) {
                PhaseOutcome::Pending => return QueueProgress::Running,
                PhaseOutcome::Finished(Ok(())) => {
                    self.pending.pop_front();
                }
                PhaseOutcome::Finished(Err(failure)) => {
                    self.state = QueueState::Done;
                    return QueueProgress::Complete(Err(failure));
                }
            }
        }
    }
}

impl<P> Default for PhaseQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::code::AuthFailure;

    struct Counter {
        started: usize,
    }

    enum ToyPhase {
        /// Finishes immediately with success.
        Instant,
        /// Suspends, waiting for an external `advance`.
        Waits,
        /// Fails immediately.
        FailsNow,
    }

    impl PhaseStep<Counter> for ToyPhase {
        fn name(&self) -> &'static str {
            match self {
                ToyPhase::Instant => "instant",
                ToyPhase::Waits => "waits",
                ToyPhase::FailsNow => "fails_now",
            }
        }

        fn start(&mut self, env: &mut Counter) -> PhaseOutcome {
            env.started += 1;
            match self {
                ToyPhase::Instant => PhaseOutcome::Finished(Ok(())),
                ToyPhase::Waits => PhaseOutcome::Pending,
                ToyPhase::FailsNow => {
                    PhaseOutcome::Finished(Err(AuthFailure::UnexpectedMessage))
                }
            }
        }
    }

    #[test]
    fn test_empty_queue_completes_immediately() {
        let mut env = Counter { started: 0 };
        let mut queue: PhaseQueue<ToyPhase> = PhaseQueue::new();
        let progress = queue.start(vec![], &mut env);
        assert!(matches!(progress, QueueProgress::Complete(Ok(()))));
        assert_eq!(env.started, 0);
        assert!(queue.is_done());
    }

    #[test]
    fn test_phases_run_sequentially_with_no_skips() {
        let mut env = Counter { started: 0 };
        let mut queue = PhaseQueue::new();
        let progress = queue.start(
            vec![ToyPhase::Instant, ToyPhase::Instant, ToyPhase::Instant],
            &mut env,
        );
        assert!(matches!(progress, QueueProgress::Complete(Ok(()))));
        assert_eq!(env.started, 3);
        assert_eq!(queue.starts(), 3);
    }

    #[test]
    fn test_failure_stops_later_phases() {
        let mut env = Counter { started: 0 };
        let mut queue = PhaseQueue::new();
        let progress = queue.start(
            vec![ToyPhase::Instant, ToyPhase::FailsNow, ToyPhase::Instant],
            &mut env,
        );
        assert!(matches!(
            progress,
            QueueProgress::Complete(Err(AuthFailure::UnexpectedMessage))
        ));
        // The third phase never started.
        assert_eq!(env.started, 2);
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut env = Counter { started: 0 };
        let mut queue = PhaseQueue::new();
        let progress = queue.start(vec![ToyPhase::Waits, ToyPhase::Instant], &mut env);
        assert!(progress.is_running());
        assert_eq!(env.started, 1);

        let progress = queue.advance(Ok(()), &mut env);
        assert!(matches!(progress, QueueProgress::Complete(Ok(()))));
        assert_eq!(env.started, 2);
    }

    #[test]
    fn test_resume_with_failure_terminates() {
        let mut env = Counter { started: 0 };
        let mut queue = PhaseQueue::new();
        queue.start(vec![ToyPhase::Waits, ToyPhase::Instant], &mut env);

        let progress = queue.advance(Err(AuthFailure::PhaseTimeout), &mut env);
        assert!(matches!(
            progress,
            QueueProgress::Complete(Err(AuthFailure::PhaseTimeout))
        ));
        assert_eq!(env.started, 1);
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn test_double_start_panics() {
        let mut env = Counter { started: 0 };
        let mut queue: PhaseQueue<ToyPhase> = PhaseQueue::new();
        queue.start(vec![], &mut env);
        queue.start(vec![], &mut env);
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn test_finish_after_done_panics() {
        let mut env = Counter { started: 0 };
        let mut queue: PhaseQueue<ToyPhase> = PhaseQueue::new();
        queue.start(vec![], &mut env);
        queue.advance(Ok(()), &mut env);
    }

    #[test]
    fn test_finish_without_start_completes() {
        // A queue that never ran any phase may still be finished directly.
        let mut env = Counter { started: 0 };
        let mut queue: PhaseQueue<ToyPhase> = PhaseQueue::new();
        let progress = queue.advance(Ok(()), &mut env);
        assert!(matches!(progress, QueueProgress::Complete(Ok(()))));
        assert_eq!(env.started, 0);
    }

    #[test]
    fn test_client_routing_never_runs() {
        let mut queue = PhaseQueue::new();
        queue.register_for_routing(vec![ToyPhase::Waits]);
        assert!(!queue.is_done());
        assert!(!queue.is_running());
        assert_eq!(queue.starts(), 0);
        assert!(queue.active_mut().is_some());
    }
}
