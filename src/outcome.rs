//! Combinators that glue pipeline stages together.
//!
//! A stage returns [`Result`]: `map` and `and_then` from the standard library
//! cover transforming and chaining, the extension trait adds the two shapes
//! the engines use on top of that. Stage bodies run inside [`guarded`] (or
//! [`guarded_async`]) so a panic turns into
//! [`Error::ExceptionWasThrown`] instead of unwinding through the caller.

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use futures_util::FutureExt;

use crate::error::{Error, Result};

pub trait OutcomeExt<T> {
    /// Runs a side effect on either branch and hands the value back untouched.
    fn either(self, on_success: impl FnOnce(&T), on_failure: impl FnOnce(&Error)) -> Self;

    /// Like [`OutcomeExt::either`], threading one piece of mutable state
    /// (usually the operation report) through whichever branch runs.
    fn either_with<C: ?Sized>(
        self,
        state: &mut C,
        on_success: impl FnOnce(&mut C, &T),
        on_failure: impl FnOnce(&mut C, &Error),
    ) -> Self;

    /// Collapses both branches into one value.
    fn fold<U>(self, on_failure: impl FnOnce(Error) -> U, on_success: impl FnOnce(T) -> U) -> U;
}

impl<T> OutcomeExt<T> for Result<T> {
    fn either(self, on_success: impl FnOnce(&T), on_failure: impl FnOnce(&Error)) -> Self {
        match &self {
            Ok(value) => on_success(value),
            Err(err) => on_failure(err),
        }
        self
    }

    fn either_with<C: ?Sized>(
        self,
        state: &mut C,
        on_success: impl FnOnce(&mut C, &T),
        on_failure: impl FnOnce(&mut C, &Error),
    ) -> Self {
        match &self {
            Ok(value) => on_success(state, value),
            Err(err) => on_failure(state, err),
        }
        self
    }

    fn fold<U>(self, on_failure: impl FnOnce(Error) -> U, on_success: impl FnOnce(T) -> U) -> U {
        match self {
            Ok(value) => on_success(value),
            Err(err) => on_failure(err),
        }
    }
}

/// Converts raw `io::Result`s into stage failures.
pub trait FaultExt<T> {
    fn or_fault(self, origin: &'static str) -> Result<T>;
}

impl<T> FaultExt<T> for io::Result<T> {
    fn or_fault(self, origin: &'static str) -> Result<T> {
        self.map_err(|e| Error::exception(origin, e))
    }
}

/// Runs one pipeline stage, converting a panic into a failure.
pub fn guarded<T>(origin: &'static str, stage: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(stage)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(panicked(origin, payload)),
    }
}

/// Async counterpart of [`guarded`].
pub async fn guarded_async<T, F>(origin: &'static str, stage: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(panicked(origin, payload)),
    }
}

fn panicked(origin: &'static str, payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    Error::exception(origin, crate::error::Fault::Panic(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::RefCell;

    fn halve(n: u32) -> Result<u32> {
        if n % 2 == 0 {
            Ok(n / 2)
        } else {
            Err(Error::OutputEmpty {
                target: format!("odd {n}"),
            })
        }
    }

    #[test]
    fn first_failure_short_circuits_the_chain() {
        let mut calls = 0;
        let outcome = halve(12)
            .and_then(halve)
            .and_then(halve)
            .and_then(|n| {
                calls += 1;
                halve(n)
            });
        assert_eq!(calls, 0);
        let err = outcome.unwrap_err();
        assert_eq!(err.to_string(), "output 'odd 3' is empty");
    }

    #[test]
    fn either_runs_side_effect_and_keeps_value() {
        let seen = RefCell::new(Vec::new());
        let value = halve(8)
            .either(
                |v| seen.borrow_mut().push(format!("ok {v}")),
                |e| seen.borrow_mut().push(e.to_string()),
            )
            .map(|v| v + 1);
        assert_eq!(value.unwrap(), 5);
        assert_eq!(*seen.borrow(), vec!["ok 4".to_string()]);

        let failed = halve(7).either(
            |_| seen.borrow_mut().push("never".into()),
            |_| seen.borrow_mut().push("failed".into()),
        );
        assert!(failed.is_err());
        assert_eq!(seen.borrow().last().map(String::as_str), Some("failed"));
    }

    #[test]
    fn either_with_threads_state() {
        let mut lines: Vec<String> = Vec::new();
        let outcome = halve(6)
            .and_then(halve)
            .either_with(&mut lines, |l, v| l.push(format!("ok {v}")), |l, e| l.push(e.to_string()));
        assert!(outcome.is_err());
        assert_eq!(lines, vec!["output 'odd 3' is empty".to_string()]);
    }

    #[test]
    fn fold_forces_both_branches() {
        let text = halve(5).fold(|e| format!("error: {:?}", e.kind()), |v| v.to_string());
        assert!(text.starts_with("error"));
        assert_eq!(halve(10).fold(|_| 0, |v| v * 10), 50);
    }

    #[test]
    fn guarded_turns_panics_into_failures() {
        let outcome: Result<()> = guarded("exploding stage", || panic!("boom"));
        let err = outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExceptionWasThrown);
        assert!(err.to_string().contains("exploding stage"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn io_errors_become_faults() {
        let raw: io::Result<()> = Err(io::Error::other("disk on fire"));
        let err = raw.or_fault("writer").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExceptionWasThrown);
    }

    #[tokio::test]
    async fn guarded_async_catches_panics() {
        fn explode() -> Result<u8> {
            panic!("late boom")
        }
        let outcome = guarded_async("async stage", async { explode() }).await;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ExceptionWasThrown);

        let fine = guarded_async("async stage", async { Ok::<u8, Error>(3) }).await;
        assert_eq!(fine.unwrap(), 3);
    }
}
