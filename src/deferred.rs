//! Memoization cell backing deferred operations.
//!
//! A deferred operation wraps a factory that has not run yet. The cell
//! guarantees the factory runs at most once even when several threads force
//! the same cell concurrently: one winner evaluates while losers wait on a
//! condvar, and every later forcing returns the cached outcome.
//!
//! The state transition is `Unevaluated -> Evaluating -> Done` and is never
//! reversed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::error::{codes, OperationError};

/// The deferred computation: runs once, on whichever thread forces first.
pub(crate) type Factory<T> = Box<dyn FnOnce() -> Result<T, OperationError> + Send>;

/// Rollback action invoked when the computation it guards fails.
pub(crate) type Compensation = Box<dyn FnOnce() -> Result<(), OperationError> + Send>;

enum CellState<T> {
    Unevaluated {
        factory: Factory<T>,
        compensation: Option<Compensation>,
    },
    Evaluating,
    Done(Result<T, OperationError>),
}

/// One-shot thread-safe memoization cell.
pub(crate) struct DeferredCell<T> {
    state: Mutex<CellState<T>>,
    completed: Condvar,
}

impl<T> DeferredCell<T> {
    pub(crate) fn new(factory: Factory<T>, compensation: Option<Compensation>) -> Self {
        Self {
            state: Mutex::new(CellState::Unevaluated {
                factory,
                compensation,
            }),
            completed: Condvar::new(),
        }
    }

    /// Forces evaluation and maps a view of the memoized outcome.
    ///
    /// The first caller runs the factory (and, on failure, the compensation
    /// action) on its own thread; concurrent callers block until the outcome
    /// is published. The factory is invoked at most once for the lifetime of
    /// the cell.
    pub(crate) fn force_map<R>(&self, map: impl FnOnce(&Result<T, OperationError>) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*guard {
                CellState::Done(outcome) => return map(outcome),
                CellState::Evaluating => {
                    guard = self
                        .completed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                CellState::Unevaluated { .. } => {
                    let taken = std::mem::replace(&mut *guard, CellState::Evaluating);
                    drop(guard);
                    let CellState::Unevaluated {
                        factory,
                        compensation,
                    } = taken
                    else {
                        unreachable!("state changed while lock was held");
                    };

                    let outcome = evaluate(factory, compensation);
                    let mapped = map(&outcome);

                    let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    *guard = CellState::Done(outcome);
                    self.completed.notify_all();
                    return mapped;
                }
            }
        }
    }

    /// Consumes a uniquely-owned cell, evaluating it if it never ran.
    ///
    /// Used when a continuation takes ownership of its upstream: no other
    /// observer exists, so the outcome moves out without cloning.
    pub(crate) fn into_outcome(self) -> Result<T, OperationError> {
        match self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            CellState::Done(outcome) => outcome,
            CellState::Unevaluated {
                factory,
                compensation,
            } => evaluate(factory, compensation),
            // Only reachable if a forcing thread died between taking the
            // factory and publishing the outcome.
            CellState::Evaluating => Err(OperationError::new(
                "deferred evaluation was interrupted before completing",
            )
            .with_code(codes::INTERRUPTED)),
        }
    }
}

fn evaluate<T>(factory: Factory<T>, compensation: Option<Compensation>) -> Result<T, OperationError> {
    tracing::debug!("evaluating deferred operation");
    let result = catch_unwind(AssertUnwindSafe(factory))
        .unwrap_or_else(|payload| Err(OperationError::from_panic(payload)));
    match result {
        Ok(value) => Ok(value),
        Err(error) => Err(run_compensation(error, compensation)),
    }
}

/// Runs a compensation action in response to `original` and returns the
/// failure to surface: the original error when compensation succeeds (or is
/// absent), or an aggregate of both when compensation itself fails.
///
/// Runs to completion before returning, so the failure is never observable
/// ahead of its compensation. Shared with the scheduled variant's
/// supervisor.
pub(crate) fn run_compensation(
    original: OperationError,
    compensation: Option<Compensation>,
) -> OperationError {
    let Some(compensation) = compensation else {
        return original;
    };
    tracing::debug!(error = %original, "running compensation action");
    let result = catch_unwind(AssertUnwindSafe(compensation))
        .unwrap_or_else(|payload| Err(OperationError::from_panic(payload)));
    match result {
        Ok(()) => original,
        Err(compensation_error) => {
            tracing::warn!(
                error = %original,
                compensation_error = %compensation_error,
                "compensation action failed; aggregating both failures"
            );
            OperationError::aggregate(original, compensation_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cell_from(
        factory: impl FnOnce() -> Result<i32, OperationError> + Send + 'static,
    ) -> DeferredCell<i32> {
        DeferredCell::new(Box::new(factory), None)
    }

    #[test]
    fn test_factory_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = cell_from(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });

        assert_eq!(cell.force_map(|o| o.clone()), Ok(42));
        assert_eq!(cell.force_map(|o| o.clone()), Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_memoized_without_rerunning() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = cell_from(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OperationError::new("boom"))
        });

        let first = cell.force_map(|o| o.clone());
        let second = cell.force_map(|o| o.clone());
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_force_has_single_winner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = DeferredCell::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(7)
            }),
            None,
        );

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    assert_eq!(cell.force_map(|o| o.clone()), Ok(7));
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_captured_as_error() {
        let cell = cell_from(|| panic!("exploded"));
        let outcome = cell.force_map(|o| o.clone());
        let error = outcome.unwrap_err();
        assert_eq!(error.code(), Some(codes::PANIC));
        assert_eq!(error.message(), Some("exploded"));
    }

    #[test]
    fn test_compensation_runs_only_on_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let marker = ran.clone();
        let cell = DeferredCell::new(
            Box::new(|| Ok(1)),
            Some(Box::new(move || {
                marker.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        assert_eq!(cell.force_map(|o| o.clone()), Ok(1));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_compensation_runs_once_before_failure_surfaces() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let trail = order.clone();
        let cell: DeferredCell<i32> = DeferredCell::new(
            Box::new(|| Err(OperationError::new("boom"))),
            Some(Box::new(move || {
                trail
                    .lock()
                    .unwrap()
                    .push("compensation");
                Ok(())
            })),
        );

        let error = cell.force_map(|o| o.clone()).unwrap_err();
        order.lock().unwrap().push("observed");
        assert_eq!(error, OperationError::new("boom"));
        assert_eq!(*order.lock().unwrap(), vec!["compensation", "observed"]);

        // Second force returns the cached failure without re-compensating.
        let _ = cell.force_map(|o| o.clone());
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_compensation_failure_aggregates_both() {
        let cell: DeferredCell<i32> = DeferredCell::new(
            Box::new(|| Err(OperationError::new("original"))),
            Some(Box::new(|| Err(OperationError::new("rollback failed")))),
        );
        let error = cell.force_map(|o| o.clone()).unwrap_err();
        assert!(error.is_aggregate());
        assert_eq!(error.cause(), Some(&OperationError::new("original")));
    }

    #[test]
    fn test_compensation_panic_aggregates_both() {
        let cell: DeferredCell<i32> = DeferredCell::new(
            Box::new(|| Err(OperationError::new("original"))),
            Some(Box::new(|| panic!("rollback exploded"))),
        );
        let error = cell.force_map(|o| o.clone()).unwrap_err();
        assert!(error.is_aggregate());
        assert_eq!(error.cause(), Some(&OperationError::new("original")));
    }

    #[test]
    fn test_into_outcome_evaluates_unforced_cell() {
        let cell = cell_from(|| Ok(9));
        assert_eq!(cell.into_outcome(), Ok(9));
    }

    #[test]
    fn test_into_outcome_reuses_memoized_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = cell_from(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });
        cell.force_map(|_| ());
        assert_eq!(cell.into_outcome(), Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
