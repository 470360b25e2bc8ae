//! Reconnect supervision: dial, run until disconnect, sleep, repeat.
//!
//! Backoff starts at one second, doubles on every disconnect, caps at two
//! minutes, and snaps back to one second once a connection reaches the 001
//! welcome. The stop signal interrupts dialing, the running connection, and
//! the backoff sleep alike.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::client::Shared;
use crate::error::Result;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Runs `run_once` (one dial-and-serve cycle) in a loop until the stop
/// signal fires. `shared` reports whether the last cycle reached welcome.
pub(crate) async fn supervise<F, Fut>(
    mut stop: watch::Receiver<bool>,
    shared: Arc<Shared>,
    mut run_once: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            result = run_once() => {
                if let Err(err) = result {
                    log::warn!("connection attempt failed: {}", err);
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        if shared.take_ready() {
            backoff = INITIAL_BACKOFF;
        }
        log::info!("reconnecting in {:?}", backoff);
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    log::debug!("supervisor stopped");
}
