//! Cool-off strategies and a retry driver for fallible async operations.
//!
//! A strategy is any `Iterator<Item = Duration>`: each yielded duration is the
//! cool-off period before the next attempt, and iterator exhaustion ends the
//! retries. [`strategy::fixed::Interval`] and
//! [`strategy::exponential::Exponential`] are the built-in strategies;
//! [`retry::retry`] drives an [`Operation`] under a strategy and a
//! [`Condition`] that decides which errors are worth another attempt.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// A fallible operation that can be started afresh for every attempt.
///
/// Implemented for any `FnMut() -> Future<Output = Result<T, E>>` closure, so
/// call sites can pass a closure that captures whatever state the attempt
/// needs.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    /// Starts one attempt.
    fn run(&mut self) -> Self::Future;
}

impl<F, Fut, T, E> Operation for F
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Item = T;
    type Error = E;
    type Future = Fut;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error should be retried.
///
/// Implemented for any `FnMut(&E) -> bool` predicate.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<F, E> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
