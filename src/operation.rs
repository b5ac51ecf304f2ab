//! The unified deferred-computation facade.
//!
//! An [`Operation`] represents a computation that eventually yields a value
//! or a structured [`OperationError`]. Exactly one of three backing variants
//! is chosen at construction and fixed for the operation's lifetime:
//!
//! - **Resolved** — the outcome was known at construction time.
//! - **Deferred** — a factory runs on first observation and is memoized
//!   exactly once, even under concurrent first access.
//! - **Scheduled** — the work is already in flight on a tokio runtime.
//!
//! Continuations ([`Operation::then`], [`Operation::map_error`]) compose
//! uniformly over all three variants, short-circuiting on failure. Outcomes
//! can be pulled ([`Operation::resolve`], [`Operation::try_resolve`]) or
//! awaited (`op.await`, [`Operation::outcome`]).

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::deferred::{Compensation, DeferredCell, Factory};
use crate::dispatch::DispatchPolicy;
use crate::error::OperationError;
use crate::scheduled::{OutcomeSlot, ScheduledHandle};

/// The observable state of an operation.
///
/// `Pending` is only reachable on a scheduled operation whose backing work
/// has not finished; resolved and deferred operations are terminal by the
/// time any observer sees them. A terminal status never reverts to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Backing work is still running.
    Pending,
    /// The operation produced a value.
    Succeeded,
    /// The operation failed (including cancellation of the backing work).
    Failed,
}

impl OperationStatus {
    /// Returns true if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

enum Variant<T> {
    Resolved(Result<T, OperationError>),
    Deferred(DeferredCell<T>),
    Scheduled(ScheduledHandle<T>),
}

/// A computation that eventually yields a value or a structured error.
///
/// See the [module docs](self) for the three backing variants. All
/// observation methods are idempotent: a memoized outcome is returned as a
/// clone and the underlying factory, work, and compensation action never
/// re-run.
pub struct Operation<T> {
    variant: Variant<T>,
}

impl<T> Operation<T> {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Wraps an already-known value. The operation is succeeded from the
    /// instant of construction.
    pub fn from_value(value: T) -> Self {
        Self {
            variant: Variant::Resolved(Ok(value)),
        }
    }

    /// Wraps an already-known failure. The operation is failed from the
    /// instant of construction.
    pub fn from_error(error: impl Into<OperationError>) -> Self {
        Self {
            variant: Variant::Resolved(Err(error.into())),
        }
    }

    /// Defers a computation until first observation.
    ///
    /// The factory runs at most once, on whichever thread first forces the
    /// operation; the outcome (value, error, or captured panic) is memoized.
    pub fn from_factory<F, E>(factory: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<OperationError>,
    {
        Self::deferred(
            Box::new(move || factory().map_err(Into::into)),
            None,
        )
    }

    /// Defers a computation with a compensation action.
    ///
    /// If evaluation fails (error or panic), the compensation runs
    /// synchronously on the forcing thread before the failure surfaces. A
    /// compensation failure is aggregated with the triggering failure.
    pub fn from_factory_with<F, E, C, CE>(factory: F, compensation: C) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<OperationError>,
        C: FnOnce() -> Result<(), CE> + Send + 'static,
        CE: Into<OperationError>,
    {
        Self::deferred(
            Box::new(move || factory().map_err(Into::into)),
            Some(Box::new(move || compensation().map_err(Into::into))),
        )
    }

    fn deferred(factory: Factory<T>, compensation: Option<Compensation>) -> Self {
        Self {
            variant: Variant::Deferred(DeferredCell::new(factory, compensation)),
        }
    }

    fn scheduled(handle: ScheduledHandle<T>) -> Self {
        Self {
            variant: Variant::Scheduled(handle),
        }
    }
}

impl<T: Send + 'static> Operation<T> {
    /// Spawns the future on the ambient runtime and wraps it. The work is in
    /// flight from the moment this returns.
    ///
    /// Must be called within a tokio runtime context; use
    /// [`Operation::spawn_with`] and [`DispatchPolicy::on`] to construct from
    /// a non-runtime thread.
    pub fn spawn<Fut, E>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<OperationError> + Send + 'static,
    {
        Self::scheduled(ScheduledHandle::spawn(
            async move { future.await.map_err(Into::into) },
            None,
            DispatchPolicy::default(),
        ))
    }

    /// Spawns the future through the given dispatch policy, with an optional
    /// compensation action.
    ///
    /// The compensation is attached as a continuation of the work itself:
    /// when the work fails, panics, or is cancelled, it runs to completion
    /// inside the supervisor task before any observer sees the failure.
    pub fn spawn_with<Fut, E, C, CE>(
        future: Fut,
        compensation: Option<C>,
        policy: DispatchPolicy,
    ) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<OperationError> + Send + 'static,
        C: FnOnce() -> Result<(), CE> + Send + 'static,
        CE: Into<OperationError>,
    {
        Self::scheduled(ScheduledHandle::spawn(
            async move { future.await.map_err(Into::into) },
            compensation.map(|c| -> Compensation { Box::new(move || c().map_err(Into::into)) }),
            policy,
        ))
    }

    /// Wraps a join handle for work that is already running.
    pub fn from_handle(handle: JoinHandle<Result<T, OperationError>>) -> Self {
        Self::scheduled(ScheduledHandle::from_join_handle(
            handle,
            None,
            DispatchPolicy::default(),
        ))
    }

    /// Wraps a running join handle with an optional compensation action and
    /// an explicit dispatch policy.
    pub fn from_handle_with<C, CE>(
        handle: JoinHandle<Result<T, OperationError>>,
        compensation: Option<C>,
        policy: DispatchPolicy,
    ) -> Self
    where
        C: FnOnce() -> Result<(), CE> + Send + 'static,
        CE: Into<OperationError>,
    {
        Self::scheduled(ScheduledHandle::from_join_handle(
            handle,
            compensation.map(|c| -> Compensation { Box::new(move || c().map_err(Into::into)) }),
            policy,
        ))
    }
}

impl<T> Operation<T> {
    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Returns the observable state of this operation.
    ///
    /// Forces a deferred operation synchronously, so resolved and deferred
    /// operations always report a terminal status. Only a scheduled
    /// operation whose work is still running reports
    /// [`OperationStatus::Pending`].
    pub fn status(&self) -> OperationStatus {
        match &self.variant {
            Variant::Resolved(Ok(_)) => OperationStatus::Succeeded,
            Variant::Resolved(Err(_)) => OperationStatus::Failed,
            Variant::Deferred(cell) => cell.force_map(|outcome| match outcome {
                Ok(_) => OperationStatus::Succeeded,
                Err(_) => OperationStatus::Failed,
            }),
            Variant::Scheduled(handle) => handle
                .slot()
                .peek_map(|outcome| match outcome {
                    Ok(_) => OperationStatus::Succeeded,
                    Err(_) => OperationStatus::Failed,
                })
                .unwrap_or(OperationStatus::Pending),
        }
    }

    /// Tri-state success flag: `Some(true)` / `Some(false)` once terminal,
    /// `None` while a scheduled operation is still pending.
    pub fn succeeded(&self) -> Option<bool> {
        match self.status() {
            OperationStatus::Pending => None,
            OperationStatus::Succeeded => Some(true),
            OperationStatus::Failed => Some(false),
        }
    }

    /// The captured error; `Some` exactly when `succeeded() == Some(false)`.
    /// Forces a deferred operation synchronously.
    pub fn error(&self) -> Option<OperationError> {
        match &self.variant {
            Variant::Resolved(outcome) => outcome.as_ref().err().cloned(),
            Variant::Deferred(cell) => cell.force_map(|o| o.as_ref().err().cloned()),
            Variant::Scheduled(handle) => handle
                .slot()
                .peek_map(|o| o.as_ref().err().cloned())
                .flatten(),
        }
    }

    /// True once the outcome is known. Forces a deferred operation, so this
    /// only reports `false` for a scheduled operation still in flight.
    pub fn is_completed(&self) -> bool {
        match &self.variant {
            Variant::Resolved(_) => true,
            Variant::Deferred(cell) => cell.force_map(|_| true),
            Variant::Scheduled(handle) => handle.is_completed(),
        }
    }
}

impl<T: Clone> Operation<T> {
    // ------------------------------------------------------------------
    // Pull resolution
    // ------------------------------------------------------------------

    /// Resolves the operation, returning its value or the captured error.
    ///
    /// Forces a deferred operation on the calling thread and blocks until a
    /// scheduled operation completes. Repeated calls are idempotent: the
    /// memoized outcome is cloned and nothing re-runs.
    ///
    /// Do not call on a runtime worker thread for a still-pending scheduled
    /// operation; await the operation (or [`Operation::outcome`]) instead.
    pub fn resolve(&self) -> Result<T, OperationError> {
        match &self.variant {
            Variant::Resolved(outcome) => outcome.clone(),
            Variant::Deferred(cell) => cell.force_map(Clone::clone),
            Variant::Scheduled(handle) => handle.slot().wait(),
        }
    }

    /// Non-blocking resolution probe.
    ///
    /// Forces a deferred operation synchronously (a deferred operation is
    /// never observably pending); returns `None` only while a scheduled
    /// operation's work is still in flight.
    pub fn try_resolve(&self) -> Option<Result<T, OperationError>> {
        match &self.variant {
            Variant::Resolved(outcome) => Some(outcome.clone()),
            Variant::Deferred(cell) => Some(cell.force_map(Clone::clone)),
            Variant::Scheduled(handle) => handle.slot().peek_map(Clone::clone),
        }
    }

    /// Resolves the operation without consuming it, suspending instead of
    /// blocking while a scheduled operation is in flight.
    ///
    /// Equivalent to awaiting the operation itself; this form borrows, so
    /// the operation can still be observed afterwards.
    pub async fn outcome(&self) -> Result<T, OperationError> {
        match &self.variant {
            Variant::Resolved(outcome) => outcome.clone(),
            Variant::Deferred(cell) => cell.force_map(Clone::clone),
            Variant::Scheduled(handle) => handle.slot().resolved().await,
        }
    }
}

impl<T: Clone + Send + 'static> Operation<T> {
    // ------------------------------------------------------------------
    // Continuation composition
    // ------------------------------------------------------------------

    /// Chains a plain-value continuation.
    ///
    /// If this operation fails, the continuation is never invoked and the
    /// new operation carries the same error. On success the continuation's
    /// result becomes the new operation's value. The composition stays lazy
    /// over a deferred upstream and concurrent over a scheduled upstream;
    /// a continuation returning `()` yields a zero-result operation.
    pub fn then<U, F>(self, continuation: F) -> Operation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self.variant {
            Variant::Resolved(Err(error)) => Operation::from_error(error),
            Variant::Resolved(Ok(value)) => {
                Operation::deferred(Box::new(move || Ok(continuation(value))), None)
            }
            Variant::Deferred(cell) => Operation::deferred(
                Box::new(move || {
                    let value = cell.into_outcome()?;
                    Ok(continuation(value))
                }),
                None,
            ),
            Variant::Scheduled(handle) => Operation::scheduled(
                handle.chain(move |outcome| async move { outcome.map(continuation) }),
            ),
        }
    }

    /// Chains a continuation that returns a nested operation.
    ///
    /// On failure the continuation is never invoked and the same error
    /// carries through. On success the nested operation's outcome becomes
    /// the new operation's outcome. The new operation is scheduled: the
    /// chain runs on the dispatch policy's runtime, so an ambient (or
    /// pinned) tokio runtime is required at composition time.
    pub fn then_op<U, F>(self, continuation: F) -> Operation<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Operation<U> + Send + 'static,
    {
        self.then_future(move |value| continuation(value).into_future())
    }

    /// Chains a continuation that produces its value concurrently.
    ///
    /// Same short-circuiting as [`Operation::then`]; the returned future is
    /// awaited on the dispatch policy's runtime, so the new operation is
    /// scheduled and an ambient (or pinned) tokio runtime is required at
    /// composition time.
    pub fn then_future<U, E, Fut, F>(self, continuation: F) -> Operation<U>
    where
        U: Clone + Send + 'static,
        E: Into<OperationError>,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
    {
        match self.variant {
            Variant::Resolved(Err(error)) => Operation::from_error(error),
            Variant::Scheduled(handle) => {
                Operation::scheduled(handle.chain(move |outcome| async move {
                    let value = outcome?;
                    continuation(value).await.map_err(Into::into)
                }))
            }
            // Resolved success or deferred upstream: the upstream outcome is
            // computed inside the spawned stage, keeping composition itself
            // non-forcing.
            other => {
                let upstream = Operation { variant: other };
                Operation::scheduled(ScheduledHandle::spawn(
                    async move {
                        let value = upstream.into_future().await?;
                        continuation(value).await.map_err(Into::into)
                    },
                    None,
                    DispatchPolicy::default(),
                ))
            }
        }
    }

    /// Chains a failure handler producing a fallback value.
    ///
    /// The mirror image of [`Operation::then`]: on success the handler is
    /// never invoked and the value passes through unchanged; on failure the
    /// handler's result becomes the new operation's value. If the handler
    /// panics, the new operation fails with the handler's error instead of
    /// the original.
    pub fn map_error<F>(self, handler: F) -> Operation<T>
    where
        F: FnOnce(OperationError) -> T + Send + 'static,
    {
        match self.variant {
            Variant::Resolved(Ok(value)) => Operation::from_value(value),
            Variant::Resolved(Err(error)) => {
                Operation::deferred(Box::new(move || Ok(handler(error))), None)
            }
            Variant::Deferred(cell) => Operation::deferred(
                Box::new(move || match cell.into_outcome() {
                    Ok(value) => Ok(value),
                    Err(error) => Ok(handler(error)),
                }),
                None,
            ),
            Variant::Scheduled(handle) => {
                Operation::scheduled(handle.chain(move |outcome| async move {
                    match outcome {
                        Ok(value) => Ok(value),
                        Err(error) => Ok(handler(error)),
                    }
                }))
            }
        }
    }

    /// Chains a failure handler that returns a nested operation.
    pub fn map_error_op<F>(self, handler: F) -> Operation<T>
    where
        F: FnOnce(OperationError) -> Operation<T> + Send + 'static,
    {
        self.map_error_future(move |error| handler(error).into_future())
    }

    /// Chains a failure handler that produces its fallback concurrently.
    ///
    /// A handler returning an error (or panicking) leaves the new operation
    /// failed with the handler's error, not the original. Requires a tokio
    /// runtime at composition time, as with [`Operation::then_future`].
    pub fn map_error_future<E, Fut, F>(self, handler: F) -> Operation<T>
    where
        E: Into<OperationError>,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        F: FnOnce(OperationError) -> Fut + Send + 'static,
    {
        match self.variant {
            Variant::Resolved(Ok(value)) => Operation::from_value(value),
            Variant::Scheduled(handle) => {
                Operation::scheduled(handle.chain(move |outcome| async move {
                    match outcome {
                        Ok(value) => Ok(value),
                        Err(error) => handler(error).await.map_err(Into::into),
                    }
                }))
            }
            other => {
                let upstream = Operation { variant: other };
                Operation::scheduled(ScheduledHandle::spawn(
                    async move {
                        match upstream.into_future().await {
                            Ok(value) => Ok(value),
                            Err(error) => handler(error).await.map_err(Into::into),
                        }
                    },
                    None,
                    DispatchPolicy::default(),
                ))
            }
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.variant {
            Variant::Resolved(_) => "Resolved",
            Variant::Deferred(_) => "Deferred",
            Variant::Scheduled(_) => "Scheduled",
        };
        // Peek without forcing: a deferred operation reports unevaluated
        // state as not-completed here.
        let completed = match &self.variant {
            Variant::Resolved(_) => true,
            Variant::Deferred(_) => false,
            Variant::Scheduled(handle) => handle.is_completed(),
        };
        f.debug_struct("Operation")
            .field("variant", &variant)
            .field("completed", &completed)
            .finish()
    }
}

/// Future returned by awaiting an [`Operation`].
///
/// Resolved and deferred operations complete on first poll (a deferred
/// factory runs on the awaiting task); a scheduled operation registers its
/// waker with the backing work and completes when the supervisor publishes
/// the outcome.
pub struct OperationFuture<T> {
    state: FutureState<T>,
}

enum FutureState<T> {
    Ready(Option<Result<T, OperationError>>),
    Lazy(Option<DeferredCell<T>>),
    Waiting(Arc<OutcomeSlot<T>>),
}

impl<T> Unpin for OperationFuture<T> {}

impl<T: Clone> Future for OperationFuture<T> {
    type Output = Result<T, OperationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            FutureState::Ready(outcome) => Poll::Ready(
                outcome
                    .take()
                    .expect("OperationFuture polled after completion"),
            ),
            FutureState::Lazy(cell) => {
                let cell = cell
                    .take()
                    .expect("OperationFuture polled after completion");
                Poll::Ready(cell.into_outcome())
            }
            FutureState::Waiting(slot) => slot.poll_outcome(cx),
        }
    }
}

impl<T: Clone> IntoFuture for Operation<T> {
    type Output = Result<T, OperationError>;
    type IntoFuture = OperationFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let state = match self.variant {
            Variant::Resolved(outcome) => FutureState::Ready(Some(outcome)),
            Variant::Deferred(cell) => FutureState::Lazy(Some(cell)),
            Variant::Scheduled(handle) => FutureState::Waiting(handle.slot().clone()),
        };
        OperationFuture { state }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A chain of plain-value continuations behaves like function
        /// composition over the seed value.
        #[test]
        fn prop_then_chain_composes_like_fold(
            seed in -1000i64..1000,
            increments in prop::collection::vec(-100i64..100, 0..8),
        ) {
            let mut op = Operation::from_value(seed);
            for inc in &increments {
                let inc = *inc;
                op = op.then(move |v| v + inc);
            }
            let expected: i64 = seed + increments.iter().sum::<i64>();
            prop_assert_eq!(op.resolve(), Ok(expected));
        }

        /// An upstream error survives a then-chain of any length by
        /// structural equality, and no continuation ever runs.
        #[test]
        fn prop_error_propagates_unchanged_through_then_chain(
            message in "[a-z]{1,12}",
            code in "[A-Z][0-9]{1,3}",
            chain_len in 0usize..8,
        ) {
            let error = OperationError::new(message).with_code(code);
            let invoked = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

            let mut op: Operation<i32> = Operation::from_error(error.clone());
            for _ in 0..chain_len {
                let marker = invoked.clone();
                op = op.then(move |v| {
                    marker.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    v
                });
            }
            prop_assert_eq!(op.resolve(), Err(error.clone()));
            prop_assert_eq!(op.error(), Some(error));
            prop_assert_eq!(invoked.load(std::sync::atomic::Ordering::SeqCst), 0);
        }

        /// map_error on success is the identity; on failure it replaces the
        /// outcome with the handler's value.
        #[test]
        fn prop_map_error_identity_on_success(value in -1000i32..1000) {
            let op = Operation::from_value(value).map_error(|_| 0);
            prop_assert_eq!(op.resolve(), Ok(value));
        }
    }
}
