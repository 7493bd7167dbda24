//! The timer collaborator of the node.

use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use tracing_futures::Instrument;

/// A handle to a scheduled timer. Dropping the handle cancels the timer.
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Cancel the underlying timer.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Schedules the election timeout and the leader's replication ticker.
///
/// Callbacks must not block: the node hands over closures which post a
/// message to its inbox and return.
pub trait Scheduler: Send + Sync + 'static {
    /// Schedule a one-shot election timeout after `timeout`.
    fn schedule_election_timeout(&self, timeout: Duration, callback: Box<dyn Fn() + Send + 'static>) -> TimerHandle;

    /// Schedule a periodic log replication task firing every `interval`.
    fn schedule_log_replication(&self, interval: Duration, callback: Box<dyn Fn() + Send + 'static>) -> TimerHandle;

    /// Stop the scheduler. Timers still outstanding have been cancelled by
    /// their owning role before this is called.
    fn stop(&self);
}

/// The default scheduler, backed by the tokio runtime's timer wheel.
#[derive(Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_election_timeout(&self, timeout: Duration, callback: Box<dyn Fn() + Send + 'static>) -> TimerHandle {
        let (abort, registration) = AbortHandle::new_pair();
        let task = async move {
            tokio::time::sleep(timeout).await;
            callback();
        };
        tokio::spawn(Abortable::new(task, registration).instrument(tracing::debug_span!("election_timeout")));
        TimerHandle::new(abort)
    }

    fn schedule_log_replication(&self, interval: Duration, callback: Box<dyn Fn() + Send + 'static>) -> TimerHandle {
        let (abort, registration) = AbortHandle::new_pair();
        let task = async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately; the node
            // already replicates when it becomes leader.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback();
            }
        };
        tokio::spawn(Abortable::new(task, registration).instrument(tracing::debug_span!("replication_ticker")));
        TimerHandle::new(abort)
    }

    fn stop(&self) {}
}
