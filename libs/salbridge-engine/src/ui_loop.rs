use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use salbridge_api::UiWaker;

use crate::remote::RemoteHandle;

/// [`UiWaker`] backed by a [`Notify`]. A wake with nobody waiting is kept
/// as a permit, so a drain is never lost.
#[derive(Debug)]
pub struct NotifyWaker {
    notify: Notify,
    open: AtomicBool,
}

impl NotifyWaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            open: AtomicBool::new(true),
        })
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Refuse further wakes; ingress queues close on their next push.
    pub fn shut(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl UiWaker for NotifyWaker {
    fn wake(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.notify.notify_one();
        true
    }
}

/// Drives the remotes of one UI context: drains on every wake, ticks
/// liveness and command deadlines on a fixed period.
///
/// Runs on a current-thread runtime / `LocalSet`; the handles are `!Send`.
pub struct UiLoop {
    waker: Arc<NotifyWaker>,
    tick: Duration,
    remotes: Vec<Rc<RefCell<RemoteHandle>>>,
}

/// Shortest tick period accepted by [`UiLoop::new`].
pub const MIN_TICK: Duration = Duration::from_millis(1);

impl UiLoop {
    /// `tick` is clamped to at least [`MIN_TICK`].
    pub fn new(tick: Duration) -> Self {
        if tick < MIN_TICK {
            tracing::warn!(?tick, min = ?MIN_TICK, "UI loop tick too short, clamped");
        }
        Self {
            waker: NotifyWaker::new(),
            tick: tick.max(MIN_TICK),
            remotes: Vec::new(),
        }
    }

    /// Waker to build the remotes with.
    pub fn waker(&self) -> Arc<NotifyWaker> {
        self.waker.clone()
    }

    pub fn tick_period(&self) -> Duration {
        self.tick
    }

    pub fn add(&mut self, remote: Rc<RefCell<RemoteHandle>>) {
        self.remotes.push(remote);
    }

    pub fn remotes(&self) -> &[Rc<RefCell<RemoteHandle>>] {
        &self.remotes
    }

    /// Drain every remote once.
    pub fn drain_all(&self) -> usize {
        self.remotes.iter().map(|r| r.borrow_mut().drain()).sum()
    }

    pub fn tick_all(&self, now: Instant) {
        for remote in &self.remotes {
            remote.borrow_mut().tick(now);
        }
    }

    /// Run until `token` is cancelled, then shut every remote down.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(remotes = self.remotes.len(), tick = ?self.tick, "UI loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.waker.notified() => {
                    self.drain_all();
                }
                _ = ticker.tick() => {
                    self.drain_all();
                    self.tick_all(Instant::now());
                }
            }
        }

        self.waker.shut();
        for remote in &self.remotes {
            remote.borrow_mut().shutdown();
        }
        tracing::info!("UI loop stopped");
    }
}
