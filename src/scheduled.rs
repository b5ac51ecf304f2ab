//! Shared outcome slot and supervisor task backing scheduled operations.
//!
//! A scheduled operation wraps work that is already in flight on a tokio
//! runtime. A supervisor task awaits the underlying join handle, runs the
//! compensation action if the work failed or was cancelled, and only then
//! publishes the outcome. Publication wakes both kinds of observer: futures
//! polling the slot and threads blocked in a pull-based resolve.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::task::JoinHandle;

use crate::deferred::{run_compensation, Compensation};
use crate::dispatch::DispatchPolicy;
use crate::error::OperationError;

enum SlotState<T> {
    Pending { wakers: Vec<Waker> },
    Done(Result<T, OperationError>),
}

/// Write-once outcome slot shared between the supervisor task and observers.
pub(crate) struct OutcomeSlot<T> {
    state: Mutex<SlotState<T>>,
    completed: Condvar,
}

impl<T> OutcomeSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending { wakers: Vec::new() }),
            completed: Condvar::new(),
        }
    }

    /// Publishes the terminal outcome and wakes every registered observer.
    /// The slot never leaves the terminal state afterwards.
    fn complete(&self, outcome: Result<T, OperationError>) {
        let wakers = {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *guard {
                SlotState::Pending { wakers } => {
                    let wakers = std::mem::take(wakers);
                    *guard = SlotState::Done(outcome);
                    self.completed.notify_all();
                    wakers
                }
                // A slot completes exactly once; the supervisor is its only
                // writer.
                SlotState::Done(_) => Vec::new(),
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Blocks the calling thread until the outcome is published.
    ///
    /// Must not be called from a runtime worker thread that the supervisor
    /// needs in order to make progress; the facade documents this on
    /// `resolve`.
    pub(crate) fn wait(&self) -> Result<T, OperationError>
    where
        T: Clone,
    {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*guard {
                SlotState::Done(outcome) => return outcome.clone(),
                SlotState::Pending { .. } => {
                    guard = self
                        .completed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Polls the slot, registering the task's waker while pending.
    pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<T, OperationError>>
    where
        T: Clone,
    {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            SlotState::Done(outcome) => Poll::Ready(outcome.clone()),
            SlotState::Pending { wakers } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }

    /// Non-blocking view of the outcome; `None` while the work is in flight.
    pub(crate) fn peek_map<R>(
        &self,
        map: impl FnOnce(&Result<T, OperationError>) -> R,
    ) -> Option<R> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            SlotState::Done(outcome) => Some(map(outcome)),
            SlotState::Pending { .. } => None,
        }
    }

    /// Suspends until the outcome is published, without blocking a thread.
    pub(crate) async fn resolved(self: &Arc<Self>) -> Result<T, OperationError>
    where
        T: Clone,
    {
        std::future::poll_fn(|cx| self.poll_outcome(cx)).await
    }
}

/// Handle to concurrently-executing work plus the dispatch policy used to
/// attach further continuations to it.
pub(crate) struct ScheduledHandle<T> {
    slot: Arc<OutcomeSlot<T>>,
    policy: DispatchPolicy,
}

impl<T: Send + 'static> ScheduledHandle<T> {
    /// Wraps an already-running join handle.
    ///
    /// The supervisor task is spawned through `policy` immediately. When the
    /// underlying work faults, panics, or is cancelled, the compensation
    /// action runs to completion inside the supervisor before the failure
    /// becomes observable.
    pub(crate) fn from_join_handle(
        handle: JoinHandle<Result<T, OperationError>>,
        compensation: Option<Compensation>,
        policy: DispatchPolicy,
    ) -> Self {
        let slot = Arc::new(OutcomeSlot::new());
        let published = slot.clone();
        policy.spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "scheduled work did not run to completion");
                    Err(OperationError::from(join_error))
                }
            };
            let outcome = match outcome {
                Ok(value) => Ok(value),
                Err(error) => Err(run_compensation(error, compensation)),
            };
            tracing::debug!(
                succeeded = outcome.is_ok(),
                "scheduled operation reached terminal state"
            );
            published.complete(outcome);
        });
        Self { slot, policy }
    }

    /// Spawns the future through `policy` and wraps the resulting handle.
    /// The work is in flight from the moment this returns.
    pub(crate) fn spawn<Fut>(
        future: Fut,
        compensation: Option<Compensation>,
        policy: DispatchPolicy,
    ) -> Self
    where
        Fut: std::future::Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let handle = policy.spawn(future);
        Self::from_join_handle(handle, compensation, policy)
    }

    /// Chains a new scheduled stage that consumes this handle's outcome.
    ///
    /// The stage inherits this handle's dispatch policy, so a whole chain
    /// stays pinned to the runtime its head was given.
    pub(crate) fn chain<U, Fut>(
        self,
        stage: impl FnOnce(Result<T, OperationError>) -> Fut + Send + 'static,
    ) -> ScheduledHandle<U>
    where
        T: Clone,
        U: Send + 'static,
        Fut: std::future::Future<Output = Result<U, OperationError>> + Send + 'static,
    {
        let policy = self.policy.clone();
        let upstream = self.slot;
        ScheduledHandle::spawn(
            async move {
                let outcome = upstream.resolved().await;
                stage(outcome).await
            },
            None,
            policy,
        )
    }

}

impl<T> ScheduledHandle<T> {
    pub(crate) fn slot(&self) -> &Arc<OutcomeSlot<T>> {
        &self.slot
    }

    /// True once the backing work reached a terminal state.
    pub(crate) fn is_completed(&self) -> bool {
        self.slot.peek_map(|_| ()).is_some()
    }
}
