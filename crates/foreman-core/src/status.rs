//! The thread status state machine: a pure transition function with no side
//! effects. Guard flags from run state ride in on the event so the reduction
//! itself stays deterministic and testable in isolation.
//!
//! `idle → pending → running ⇄ waiting → {completed, failed, stopped,
//! interrupted}` — the four terminals end the run; running/waiting recur on a
//! later start.

use foreman_types::{ThreadStatus, WaitingReason};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A new prompt was submitted for the thread.
    Start,
    /// Explicit user/API stop request.
    Stop,
    /// A live unresolved run's worker is being superseded by a replacing
    /// start.
    Interrupt,
    /// Terminal result message for the current run. The caller consults the
    /// `result_received` guard before reducing — the reducer sees at most one
    /// result per run.
    Result {
        is_error: bool,
        pending_input: Option<WaitingReason>,
    },
    /// The worker process exited.
    WorkerExit {
        result_received: bool,
        manually_stopped: bool,
    },
    /// Process-level failure (I/O on the stream, unexpected death).
    WorkerError {
        result_received: bool,
        manually_stopped: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Transition {
        next: ThreadStatus,
        waiting_reason: Option<WaitingReason>,
    },
    /// Late or duplicate signal; the current status must not change.
    Ignored,
}

pub fn reduce(current: ThreadStatus, event: &StatusEvent) -> StatusOutcome {
    match event {
        StatusEvent::Start => StatusOutcome::Transition {
            next: ThreadStatus::Running,
            waiting_reason: None,
        },
        // Stop wins unconditionally, worker or no worker, and is idempotent.
        StatusEvent::Stop => StatusOutcome::Transition {
            next: ThreadStatus::Stopped,
            waiting_reason: None,
        },
        StatusEvent::Interrupt => {
            if current.is_terminal() {
                StatusOutcome::Ignored
            } else {
                StatusOutcome::Transition {
                    next: ThreadStatus::Interrupted,
                    waiting_reason: None,
                }
            }
        }
        StatusEvent::Result {
            is_error,
            pending_input,
        } => {
            if let Some(reason) = pending_input {
                StatusOutcome::Transition {
                    next: ThreadStatus::Waiting,
                    waiting_reason: Some(*reason),
                }
            } else {
                StatusOutcome::Transition {
                    next: if *is_error {
                        ThreadStatus::Failed
                    } else {
                        ThreadStatus::Completed
                    },
                    waiting_reason: None,
                }
            }
        }
        StatusEvent::WorkerExit {
            result_received,
            manually_stopped,
        }
        | StatusEvent::WorkerError {
            result_received,
            manually_stopped,
        } => {
            // A result already resolved the run, a manual stop claimed the
            // status, or the run is otherwise terminal: the late process
            // signal must not regress it.
            if *result_received || *manually_stopped || current.is_terminal() {
                StatusOutcome::Ignored
            } else {
                StatusOutcome::Transition {
                    next: ThreadStatus::Failed,
                    waiting_reason: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(outcome: StatusOutcome) -> (ThreadStatus, Option<WaitingReason>) {
        match outcome {
            StatusOutcome::Transition {
                next,
                waiting_reason,
            } => (next, waiting_reason),
            StatusOutcome::Ignored => panic!("expected a transition"),
        }
    }

    #[test]
    fn start_moves_any_state_to_running() {
        for current in [
            ThreadStatus::Idle,
            ThreadStatus::Pending,
            ThreadStatus::Running,
            ThreadStatus::Waiting,
            ThreadStatus::Completed,
            ThreadStatus::Failed,
            ThreadStatus::Stopped,
            ThreadStatus::Interrupted,
        ] {
            let (next, reason) = transition(reduce(current, &StatusEvent::Start));
            assert_eq!(next, ThreadStatus::Running);
            assert!(reason.is_none());
        }
    }

    #[test]
    fn successful_result_completes() {
        let (next, reason) = transition(reduce(
            ThreadStatus::Running,
            &StatusEvent::Result {
                is_error: false,
                pending_input: None,
            },
        ));
        assert_eq!(next, ThreadStatus::Completed);
        assert!(reason.is_none());
    }

    #[test]
    fn error_result_fails() {
        let (next, _) = transition(reduce(
            ThreadStatus::Running,
            &StatusEvent::Result {
                is_error: true,
                pending_input: None,
            },
        ));
        assert_eq!(next, ThreadStatus::Failed);
    }

    #[test]
    fn pending_input_beats_completion() {
        let (next, reason) = transition(reduce(
            ThreadStatus::Running,
            &StatusEvent::Result {
                is_error: false,
                pending_input: Some(WaitingReason::Question),
            },
        ));
        assert_eq!(next, ThreadStatus::Waiting);
        assert_eq!(reason, Some(WaitingReason::Question));
    }

    #[test]
    fn pending_input_beats_failure_too() {
        let (next, reason) = transition(reduce(
            ThreadStatus::Running,
            &StatusEvent::Result {
                is_error: true,
                pending_input: Some(WaitingReason::Permission),
            },
        ));
        assert_eq!(next, ThreadStatus::Waiting);
        assert_eq!(reason, Some(WaitingReason::Permission));
    }

    #[test]
    fn stop_is_unconditional_and_idempotent() {
        for current in [
            ThreadStatus::Idle,
            ThreadStatus::Running,
            ThreadStatus::Waiting,
            ThreadStatus::Stopped,
            ThreadStatus::Completed,
        ] {
            let (next, _) = transition(reduce(current, &StatusEvent::Stop));
            assert_eq!(next, ThreadStatus::Stopped);
        }
    }

    #[test]
    fn exit_without_result_fails_the_run() {
        let (next, _) = transition(reduce(
            ThreadStatus::Running,
            &StatusEvent::WorkerExit {
                result_received: false,
                manually_stopped: false,
            },
        ));
        assert_eq!(next, ThreadStatus::Failed);
    }

    #[test]
    fn exit_after_result_is_ignored() {
        let outcome = reduce(
            ThreadStatus::Completed,
            &StatusEvent::WorkerExit {
                result_received: true,
                manually_stopped: false,
            },
        );
        assert_eq!(outcome, StatusOutcome::Ignored);
    }

    #[test]
    fn exit_after_manual_stop_is_ignored() {
        let outcome = reduce(
            ThreadStatus::Stopped,
            &StatusEvent::WorkerExit {
                result_received: false,
                manually_stopped: true,
            },
        );
        assert_eq!(outcome, StatusOutcome::Ignored);
    }

    #[test]
    fn error_after_manual_stop_is_ignored() {
        let outcome = reduce(
            ThreadStatus::Stopped,
            &StatusEvent::WorkerError {
                result_received: false,
                manually_stopped: true,
            },
        );
        assert_eq!(outcome, StatusOutcome::Ignored);
    }

    #[test]
    fn error_without_result_fails_the_run() {
        let (next, _) = transition(reduce(
            ThreadStatus::Waiting,
            &StatusEvent::WorkerError {
                result_received: false,
                manually_stopped: false,
            },
        ));
        assert_eq!(next, ThreadStatus::Failed);
    }

    #[test]
    fn interrupt_only_touches_live_runs() {
        let (next, _) = transition(reduce(ThreadStatus::Running, &StatusEvent::Interrupt));
        assert_eq!(next, ThreadStatus::Interrupted);
        assert_eq!(
            reduce(ThreadStatus::Completed, &StatusEvent::Interrupt),
            StatusOutcome::Ignored
        );
        assert_eq!(
            reduce(ThreadStatus::Stopped, &StatusEvent::Interrupt),
            StatusOutcome::Ignored
        );
    }
}
