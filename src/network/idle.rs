//! Idle watchdog shared by the WebSocket and SSE runtimes
//!
//! Activity posts a reset through a [`Notify`], which holds at most one
//! pending permit: resets arriving while one is already pending coalesce
//! into it. The timer restarts when the watchdog consumes the permit, which
//! is never earlier than the activity itself, so the watchdog can fire
//! slightly late under load but never early.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::stream::StreamContext;

/// Cheap handle used by I/O tasks to report activity
#[derive(Clone, Debug)]
pub struct IdleToucher {
    notify: Arc<Notify>,
}

impl IdleToucher {
    /// Non-blocking, best-effort timer reset
    pub fn touch(&self) {
        self.notify.notify_one();
    }
}

/// Fires once after `timeout` without activity, unless the context ends first.
#[derive(Debug)]
pub struct IdleWatchdog {
    toucher: IdleToucher,
    fired: CancellationToken,
    task: JoinHandle<()>,
}

impl IdleWatchdog {
    pub fn spawn(timeout: Duration, ctx: StreamContext) -> Self {
        let notify = Arc::new(Notify::new());
        let fired = CancellationToken::new();
        let task = tokio::spawn(watch(timeout, notify.clone(), fired.clone(), ctx));
        IdleWatchdog {
            toucher: IdleToucher { notify },
            fired,
            task,
        }
    }

    pub fn toucher(&self) -> IdleToucher {
        self.toucher.clone()
    }

    pub fn touch(&self) {
        self.toucher.touch();
    }

    pub fn has_fired(&self) -> bool {
        self.fired.is_cancelled()
    }

    /// Resolves when the idle timeout elapsed
    pub fn expired(&self) -> WaitForCancellationFutureOwned {
        self.fired.clone().cancelled_owned()
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch(timeout: Duration, notify: Arc<Notify>, fired: CancellationToken, ctx: StreamContext) {
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => return,
            _ = notify.notified() => sleep.as_mut().reset(Instant::now() + timeout),
            _ = &mut sleep => {
                fired.cancel();
                return;
            }
        }
    }
}
