//! Cooperative cancellation.
//!
//! A single [`CancellationToken`] is shared by a job and everything it spawns.
//! Blocking waits go through [`race`] so a cancelled job never starts another
//! upstream call.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Normal unwind signal. Never surfaced to users as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Run `fut` until it completes or `cancel` fires, whichever happens first.
///
/// Cancellation is checked first, so an already-cancelled token never polls `fut`.
pub async fn race<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

/// Sleep for `ms`, or return early with [`Cancelled`].
pub async fn sleep(cancel: &CancellationToken, ms: u64) -> Result<(), Cancelled> {
    race(cancel, tokio::time::sleep(std::time::Duration::from_millis(ms))).await
}
