mod acknowledged_message;
pub(crate) mod stream;
mod worker_handle;

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::Result;

/// Spawns `fut` onto the current tokio runtime. Panics if called outside of one.
pub(crate) fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::runtime::Handle::current().spawn(fut)
}

/// Spawns `fut` as a detached background task.
pub(crate) fn execute<F>(fut: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    drop(spawn(fut));
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Runs `future` for at most `timeout`. Running out of time is reported as an I/O timeout, which
/// the topology treats like any other network timeout.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}

/// A ticker for periodic maintenance. Ticks missed while the owner was busy are delayed, not
/// replayed in a burst.
pub(crate) fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
