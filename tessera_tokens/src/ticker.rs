//! Periodic proactive refresh

use std::{
    error,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{coordinator::WeakCoordinator, RefreshCoordinator, SessionStatus};

/// The default period between proactive refresh checks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The shortest period between refresh checks; shorter intervals are raised
/// to this
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

struct Running {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Periodically refreshes the session credential before it expires
///
/// On every tick the ticker asks the coordinator whether the credential is
/// due for refresh and, if so, refreshes it. The background task ends when
/// [`stop()`][Self::stop()] is called or the ticker is dropped, when the
/// session becomes unauthenticated, or when every handle to the coordinator
/// is dropped.
pub struct RefreshTicker {
    coordinator: RefreshCoordinator,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for RefreshTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTicker")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RefreshTicker {
    /// Constructs a ticker that checks the coordinator every `interval`
    ///
    /// The ticker does nothing until [`start()`][Self::start()] is called.
    /// An `interval` below [`MIN_TICK_INTERVAL`] is raised to it.
    pub fn new(coordinator: RefreshCoordinator, interval: Duration) -> Self {
        if interval < MIN_TICK_INTERVAL {
            tracing::warn!(
                ?interval,
                min = ?MIN_TICK_INTERVAL,
                "tick interval too short, clamping"
            );
        }
        let interval = interval.max(MIN_TICK_INTERVAL);

        Self {
            coordinator,
            interval,
            running: Mutex::new(None),
        }
    }

    /// The period between refresh checks
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the background task is currently running
    pub fn is_running(&self) -> bool {
        matches!(&*self.lock_running(), Some(running) if !running.join.is_finished())
    }

    /// Spawns the background task onto the current tokio runtime
    ///
    /// Returns `false` without spawning anything if the task is already
    /// running.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if matches!(&*running, Some(r) if !r.join.is_finished()) {
            tracing::trace!("refresh ticker already running");
            return false;
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(tick_forever(
            self.coordinator.downgrade(),
            self.coordinator.subscribe(),
            self.interval,
            shutdown_rx,
        ));

        tracing::debug!(interval = ?self.interval, "refresh ticker started");
        *running = Some(Running { shutdown, join });
        true
    }

    /// Stops the background task and waits for it to exit
    ///
    /// A refresh that is already underway is allowed to complete.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(Running { shutdown, join }) = running else {
            return;
        };

        let _ = shutdown.send(());
        if let Err(error) = join.await {
            if error.is_panic() {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "refresh ticker panicked"
                );
            }
        }
    }
}

async fn tick_forever(
    coordinator: WeakCoordinator,
    mut status: watch::Receiver<SessionStatus>,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("refresh ticker stopped");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    tracing::debug!("coordinator dropped, refresh ticker exiting");
                    break;
                }

                let current = *status.borrow_and_update();
                if let SessionStatus::Unauthenticated(reason) = current {
                    tracing::debug!(%reason, "session ended, refresh ticker exiting");
                    break;
                }
            }
            _ = ticks.tick() => {
                let Some(coordinator) = coordinator.upgrade() else {
                    tracing::debug!("coordinator dropped, refresh ticker exiting");
                    break;
                };

                match coordinator.refresh_if_due().await {
                    Ok(Some(_)) => tracing::debug!("stale credential refreshed"),
                    Ok(None) => tracing::trace!("credential does not need refreshing"),
                    Err(error) => {
                        tracing::warn!(
                            error = (&error as &dyn error::Error),
                            "background refresh failed"
                        );
                    }
                }
            }
        }
    }
}
