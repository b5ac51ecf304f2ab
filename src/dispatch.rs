//! Dispatch policy for scheduled operations.
//!
//! Scheduled operations run supervisor and continuation tasks on a tokio
//! runtime. Instead of an implicit thread-local scheduling context, the
//! runtime choice is an explicit [`DispatchPolicy`] value threaded through
//! construction and continuation attachment. Continuations always resume on
//! the policy's runtime, never on the thread that constructed or resolved
//! the operation, so resolving from that thread cannot deadlock against the
//! operation's own completion.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Chooses the runtime that executes a scheduled operation's supervisor and
/// continuation tasks.
///
/// The default policy spawns onto the ambient tokio runtime, which requires
/// the construction or chaining call to happen within a runtime context.
/// [`DispatchPolicy::on`] pins spawns to an explicit runtime handle instead,
/// allowing construction from non-runtime threads.
#[derive(Clone, Debug, Default)]
pub struct DispatchPolicy {
    handle: Option<Handle>,
}

impl DispatchPolicy {
    /// Policy that spawns onto the ambient runtime of the calling context.
    pub fn ambient() -> Self {
        Self { handle: None }
    }

    /// Policy that spawns onto the given runtime handle.
    pub fn on(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Returns the explicit runtime handle, if one was pinned.
    pub fn runtime(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    /// Spawns a task according to this policy.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.handle {
            Some(handle) => handle.spawn(future),
            None => tokio::spawn(future),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_pinned_runtime() {
        assert!(DispatchPolicy::default().runtime().is_none());
        assert!(DispatchPolicy::ambient().runtime().is_none());
    }

    #[test]
    fn test_pinned_policy_spawns_on_that_runtime() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let policy = DispatchPolicy::on(rt.handle().clone());
        assert!(policy.runtime().is_some());

        // Spawning from a thread with no ambient runtime must still work.
        let handle = policy.spawn(async { 7 });
        assert_eq!(rt.block_on(handle).unwrap(), 7);
    }
}
