//! # Deferred Operation
//!
//! A unified deferred-computation abstraction: an [`Operation`] represents
//! a computation that eventually yields a value or a structured
//! [`OperationError`], backed interchangeably by three execution strategies.
//!
//! ## Overview
//!
//! Every operation owns exactly one backing variant, chosen at construction
//! and fixed for its lifetime:
//!
//! - **Resolved**: the outcome (value or error) is known at construction.
//! - **Deferred**: a factory runs on first observation and is memoized
//!   exactly once, even when several threads race to force it first.
//! - **Scheduled**: the work is already executing on a tokio runtime; the
//!   operation tracks its live status (pending, succeeded, failed).
//!
//! The same composition and resolution surface works uniformly across all
//! three: failures short-circuit continuation chains, errors carry a full
//! cause chain back to the original failure point, and an optional
//! compensation ("rollback") action is guaranteed to finish before the
//! failure it compensates becomes observable.
//!
//! ### Key Features
//!
//! - **At-most-once execution**: deferred factories run exactly once; every
//!   later observation returns the memoized outcome.
//! - **Continuation chaining**: [`Operation::then`] composes success
//!   continuations (plain values, nested operations, or futures);
//!   [`Operation::map_error`] composes failure handlers symmetrically.
//! - **Compensation actions**: attach a rollback that runs only on failure
//!   or cancellation, with both failures preserved if the rollback itself
//!   fails.
//! - **Two resolution protocols**: pull ([`Operation::resolve`],
//!   [`Operation::try_resolve`]) or push (`op.await`,
//!   [`Operation::outcome`]).
//! - **Explicit dispatch**: scheduled work and its continuations run on a
//!   [`DispatchPolicy`]-selected runtime, never on the observing thread.
//! - **Structured errors**: [`OperationError`] carries message, code,
//!   key/value data, and a cause chain, and serializes with serde.
//!
//! ## Getting Started
//!
//! ```toml
//! [dependencies]
//! deferred-operation = "0.1"
//! tokio = { version = "1.0", features = ["full"] }
//! ```
//!
//! ### Chaining deferred work
//!
//! ```rust
//! use deferred_operation::{Operation, OperationError};
//!
//! let op = Operation::from_factory(|| Ok::<_, OperationError>(21)).then(|v| v * 2);
//! assert_eq!(op.resolve(), Ok(42));
//! assert_eq!(op.succeeded(), Some(true));
//! ```
//!
//! ### Recovering from failure
//!
//! ```rust
//! use deferred_operation::{Operation, OperationError};
//!
//! let op: Operation<String> = Operation::from_error(OperationError::new("boom"));
//! let recovered = op.map_error(|_| "fallback".to_string());
//! assert_eq!(recovered.resolve(), Ok("fallback".to_string()));
//! ```
//!
//! ### Scheduled work with a compensation action
//!
//! ```rust
//! use deferred_operation::{DispatchPolicy, Operation, OperationError};
//!
//! # #[tokio::main(flavor = "multi_thread", worker_threads = 2)]
//! # async fn main() {
//! let op = Operation::spawn_with(
//!     async { Err::<i32, _>(OperationError::new("write failed")) },
//!     Some(|| {
//!         // Undo the partial write; runs before the failure surfaces.
//!         Ok::<_, OperationError>(())
//!     }),
//!     DispatchPolicy::default(),
//! );
//! assert!(op.outcome().await.is_err());
//! assert_eq!(op.succeeded(), Some(false));
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! Resolved operations involve no synchronization. Deferred operations
//! synchronize only on the memoization cell: concurrent first access elects
//! exactly one evaluator and everyone else observes its outcome. Scheduled
//! operations run independently of the wrapper; observers either block
//! ([`Operation::resolve`]) or suspend (`.await`) until the supervisor task
//! publishes the terminal outcome, and the compensation action always
//! completes before that publication. Cancellation of the backing work is a
//! terminal failure and triggers compensation like any other.

#![warn(missing_docs)]

mod deferred;
mod dispatch;
mod operation;
mod scheduled;

pub mod error;

pub use dispatch::DispatchPolicy;
pub use error::OperationError;
pub use operation::{Operation, OperationFuture, OperationStatus};
