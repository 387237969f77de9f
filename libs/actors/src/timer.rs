//! Stage-scoped timers
//!
//! A timer is a tokio task that only posts `TimerFired` commands. The callback
//! itself runs as a job in the owning stage's mailbox, so it never overlaps a
//! hook of the same stage.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type TimerId = u64;

/// Callback run on every tick
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`TimerCallback`]
pub fn timer_callback<F, Fut>(f: F) -> TimerCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires every `period` until cancelled
    Repeat { initial_delay: Duration, period: Duration },
    /// Fires `count` times, then removes itself
    Count {
        initial_delay: Duration,
        period: Duration,
        count: u32,
    },
}

impl TimerKind {
    pub fn once(delay: Duration) -> Self {
        TimerKind::Count {
            initial_delay: delay,
            period: delay,
            count: 1,
        }
    }

    pub(crate) fn initial_delay(&self) -> Duration {
        match self {
            TimerKind::Repeat { initial_delay, .. } | TimerKind::Count { initial_delay, .. } => *initial_delay,
        }
    }

    pub(crate) fn period(&self) -> Duration {
        let period = match self {
            TimerKind::Repeat { period, .. } | TimerKind::Count { period, .. } => *period,
        };
        // tokio intervals panic on a zero period
        period.max(Duration::from_millis(1))
    }

    /// Number of ticks, `None` for repeating timers
    pub(crate) fn ticks(&self) -> Option<u32> {
        match self {
            TimerKind::Repeat { .. } => None,
            TimerKind::Count { count, .. } => Some(*count),
        }
    }
}
