//! Task lifetime helpers
//!
//! Every long-lived task in this crate belongs to a client, session or
//! registrar and must stop when its owner closes. [`Shutdown`] is the owner's
//! lifetime scope, [`spawn_supervised`] keeps a panicking task from taking
//! the process down, and [`TaskGroup`] lets `close()` wait for stragglers.

use crate::observability::metrics::metrics;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

/// Cancellable lifetime scope that can be fired exactly once
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the scope. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`Shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once the scope has fired, even if it fired before this call.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            // Sender gone means the owner is gone too.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Runs a close action when the last clone of the owning handle drops.
///
/// User-facing handles hold an `Arc<CloseOnDrop>` next to their shared
/// state. Background tasks only hold the state, so dropping every handle
/// without calling `close()` still stops them.
pub struct CloseOnDrop {
    close: Box<dyn Fn() + Send + Sync>,
}

impl CloseOnDrop {
    pub fn new<F>(close: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            close: Box::new(close),
        })
    }
}

impl fmt::Debug for CloseOnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseOnDrop").finish_non_exhaustive()
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        (self.close)();
    }
}

/// Run `future` and swallow any panic it raises, logging it instead
pub async fn supervised<F>(name: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
        metrics().task_panicked();
        error!(
            task = name,
            panic = %panic_message(panic.as_ref()),
            "Task panic recovered (process not exiting)"
        );
    }
}

/// Spawn a task whose panics are caught and logged
pub fn spawn_supervised<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(supervised(name, future))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Set of supervised tasks that an owner can drain on close
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so a long-lived group does not accumulate them.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(supervised(name, future));
    }

    /// Number of tasks that have not been reaped yet
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every task in the group has finished, including tasks
    /// spawned by other group members while waiting.
    pub async fn wait(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                if let Err(e) = result {
                    debug!(error = %e, "Grouped task ended abnormally");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_fire_is_exactly_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_fired());
        assert!(shutdown.fire());
        assert!(!shutdown.fire());
        assert!(shutdown.is_fired());
    }

    #[tokio::test]
    async fn test_wait_after_fire_resolves() {
        let shutdown = Shutdown::new();
        shutdown.fire();

        let mut signal = shutdown.subscribe();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("signal fired before wait should resolve immediately");
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_fire() {
        let shutdown = Arc::new(Shutdown::new());
        let mut signal = shutdown.subscribe();

        let firing = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            firing.fire();
        });

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("waiter should wake when scope fires");
    }

    #[tokio::test]
    async fn test_concurrent_fire_single_winner() {
        let shutdown = Arc::new(Shutdown::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let shutdown = shutdown.clone();
            let winners = winners.clone();
            handles.push(tokio::spawn(async move {
                if shutdown.fire() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_on_drop_runs_once_after_last_clone() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let guard = CloseOnDrop::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let second = guard.clone();

        drop(guard);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervised_panic_does_not_propagate() {
        let handle = spawn_supervised("panicking-test-task", async {
            panic!("boom");
        });

        let result = handle.await;
        assert!(result.is_ok(), "panic should be caught inside the task");
    }

    #[test]
    fn test_panic_message_extraction() {
        let static_str: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(static_str.as_ref()), "static message");

        let owned: Box<dyn Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_task_group_waits_for_nested_spawns() {
        let group = Arc::new(TaskGroup::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let nested_group = group.clone();
        let nested_finished = finished.clone();
        group.spawn("outer", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let inner_finished = nested_finished.clone();
            nested_group.spawn("inner", async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                inner_finished.fetch_add(1, Ordering::SeqCst);
            });
            nested_finished.fetch_add(1, Ordering::SeqCst);
        });

        group.wait().await;

        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(group.is_empty());
    }
}
