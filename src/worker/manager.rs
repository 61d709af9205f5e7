use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::{
    select,
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// What the manager does when a task panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// The task simply stops. A clean return always ends the task.
    #[default]
    Never,
    /// Re-run the task after a panic, waiting `backoff` first,
    /// at most `max_restarts` times.
    OnPanic {
        backoff: Duration,
        max_restarts: u32,
    },
}

/// Supervises named background tasks bound to one shared cancellation token.
///
/// - `go(name, f)` spawns `f(token)` on its own task.
/// - A panic inside a task is caught and logged with the task name;
///   other tasks and the process keep running.
/// - `stop(deadline)` cancels the token and waits for every task, up to `deadline`.
///
/// Tasks are expected to watch the token:
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use chaseapp_core::worker::{Manager, run_interval};
/// # async fn demo() {
/// let manager = Manager::new();
/// manager.go("heartbeat", |token| async move {
///     run_interval(&token, Duration::from_secs(60), || async {
///         tracing::info!("still alive");
///     })
///     .await;
/// });
/// manager.stop(Duration::from_secs(30)).await.ok();
/// # }
/// ```
pub struct Manager {
    token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    active: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl Manager {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Create a manager whose token is a child of `parent`; cancelling the parent stops it.
    pub fn with_token(parent: CancellationToken) -> Self {
        Manager {
            token: parent.child_token(),
            tasks: Mutex::new(JoinSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Launch `f` as an independent task. The task is not restarted.
    pub fn go<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.refuse(name) {
            return;
        }
        let name: Arc<str> = Arc::from(name);
        let token = self.token.clone();
        let guard = ActiveGuard::new(self.active.clone());
        self.tasks.lock().spawn(async move {
            let _guard = guard;
            debug!(worker = %name, "worker started");
            if supervise(&name, f(token)).await.is_ok() {
                debug!(worker = %name, "worker finished");
            }
        });
    }

    /// Launch a task built by `factory`, re-running it after a panic per `policy`.
    pub fn go_with_policy<F, Fut>(&self, name: &str, policy: RestartPolicy, factory: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.refuse(name) {
            return;
        }
        let name: Arc<str> = Arc::from(name);
        let token = self.token.clone();
        let guard = ActiveGuard::new(self.active.clone());
        self.tasks.lock().spawn(async move {
            let _guard = guard;
            let mut restarts = 0u32;
            loop {
                if supervise(&name, factory(token.clone())).await.is_ok() {
                    return;
                }
                let RestartPolicy::OnPanic {
                    backoff,
                    max_restarts,
                } = policy
                else {
                    return;
                };
                if restarts >= max_restarts || token.is_cancelled() {
                    warn!(worker = %name, restarts, "worker not restarted");
                    return;
                }
                restarts += 1;
                info!(worker = %name, restarts, ?backoff, "restarting worker");
                select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        });
    }

    /// Cancel every task and wait until all have returned or `deadline` elapses.
    ///
    /// On timeout a warning is logged, the remaining tasks are aborted and
    /// [`Error::StopTimeout`] is returned. Calling `stop` again is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let drained = tokio::time::timeout(deadline, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "worker task failed to join");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("workers stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    remaining = tasks.len(),
                    ?deadline,
                    "timeout waiting for workers to stop"
                );
                tasks.abort_all();
                Err(Error::StopTimeout(deadline))
            }
        }
    }

    /// The shared token. Cancelled when `stop` is called.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Number of tasks that have not returned yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn refuse(&self, name: &str) -> bool {
        if self.is_stopped() {
            warn!(worker = name, "manager is stopped, worker not started");
            return true;
        }
        false
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut`, turning a panic into a logged error.
async fn supervise<Fut>(name: &str, fut: Fut) -> Result<()>
where
    Fut: Future<Output = ()> + Send,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => Ok(()),
        Err(panic) => {
            error!(worker = name, panic = panic_message(&*panic), "worker panic");
            Err(Error::WorkerPanicked(name.to_string()))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        ActiveGuard(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Call `f` immediately, then once per `period` until `token` is cancelled.
///
/// Ticks missed while `f` is running are skipped rather than bunched up.
pub async fn run_interval<F, Fut>(token: &CancellationToken, period: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => f().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[tokio::test]
    async fn test_stop_waits_for_workers() {
        let manager = Manager::new();
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        manager.go("waiter", move |token| async move {
            token.cancelled().await;
            f.store(true, Ordering::SeqCst);
        });
        assert_eq!(manager.active(), 1);

        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = Manager::new();
        manager.go("noop", |_| async {});
        manager.stop(Duration::from_secs(1)).await.unwrap();
        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert!(manager.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_times_out_on_stuck_worker() {
        let manager = Manager::new();
        manager.go("stuck", |_| async {
            std::future::pending::<()>().await;
        });
        let res = manager.stop(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::StopTimeout(_))));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let manager = Manager::new();
        let survivor = Arc::new(AtomicBool::new(false));
        manager.go("boom", |_| async { panic!("kaboom") });
        let s = survivor.clone();
        manager.go("survivor", move |token| async move {
            token.cancelled().await;
            s.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active(), 1);
        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert!(survivor.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_on_panic_policy() {
        let manager = Manager::new();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let policy = RestartPolicy::OnPanic {
            backoff: Duration::from_secs(1),
            max_restarts: 2,
        };
        manager.go_with_policy("flaky", policy, move |_| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                panic!("flaky");
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(manager.active(), 0);
        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_policy_does_not_restart() {
        let manager = Manager::new();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        manager.go_with_policy("once", RestartPolicy::Never, move |_| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                panic!("once");
            }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_go_after_stop_is_refused() {
        let manager = Manager::new();
        manager.stop(Duration::from_secs(1)).await.unwrap();
        manager.go("late", |_| async {});
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_interval_runs_immediately_then_per_tick() {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            run_interval(&task_token, Duration::from_secs(60), || {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_token_cancels_manager() {
        let parent = CancellationToken::new();
        let manager = Manager::with_token(parent.clone());
        parent.cancel();
        assert!(manager.token().is_cancelled());
        manager.stop(Duration::from_secs(1)).await.unwrap();
    }
}
