use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

struct WorkItem<T> {
    item: T,
    attempt: u32,
}

/// Rate-limited retry queue for discrete per-object work. A failed
/// item is requeued with exponential backoff; a successful item is
/// forgotten.
pub struct WorkQueue<T> {
    tx: UnboundedSender<WorkItem<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct WorkReceiver<T> {
    rx: UnboundedReceiver<WorkItem<T>>,
}

pub fn work_queue<T>() -> (WorkQueue<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, WorkReceiver { rx })
}

impl<T> WorkQueue<T> {
    pub fn add(&self, item: T) {
        let _ = self.tx.send(WorkItem { item, attempt: 0 });
    }

    fn requeue(&self, item: T, attempt: u32) {
        let _ = self.tx.send(WorkItem { item, attempt });
    }
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_MAX)
}

/// Drains a queue with `handler` until cancelled. Errors requeue the
/// item after its backoff; the delay runs off-worker so a backlogged
/// retry never stalls fresh work.
pub async fn run_worker<T, F, Fut>(
    name: &'static str,
    mut rx: WorkReceiver<T>,
    queue: WorkQueue<T>,
    cancel: CancellationToken,
    handler: F,
) where
    T: Clone + Debug + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = crate::Result<()>>,
{
    info!(worker = name, "starting queue worker");
    loop {
        let work = tokio::select! {
            _ = cancel.cancelled() => break,
            work = rx.rx.recv() => work,
        };
        let Some(work) = work else {
            break;
        };
        match handler(work.item.clone()).await {
            Ok(()) => {}
            Err(e) => {
                let delay = backoff_delay(work.attempt);
                warn!(
                    worker = name,
                    %e,
                    item = ?work.item,
                    attempt = work.attempt,
                    ?delay,
                    "work item failed, requeueing"
                );
                let queue = queue.clone();
                let attempt = work.attempt + 1;
                let item = work.item;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(item, attempt);
                });
            }
        }
    }
    info!(worker = name, "queue worker exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::Error;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(20), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_retried_until_success() {
        let (queue, rx) = work_queue::<String>();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let handler_attempts = attempts.clone();
        let handler_cancel = cancel.clone();
        let worker = tokio::spawn(run_worker(
            "test",
            rx,
            queue.clone(),
            cancel.clone(),
            move |_item: String| {
                let attempts = handler_attempts.clone();
                let cancel = handler_cancel.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Task("transient".into()))
                    } else {
                        cancel.cancel();
                        Ok(())
                    }
                }
            },
        ));

        queue.add("eip-1".to_string());
        worker.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_item_forgotten() {
        let (queue, rx) = work_queue::<String>();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let handler_attempts = attempts.clone();
        let worker = tokio::spawn(run_worker(
            "test",
            rx,
            queue.clone(),
            cancel.clone(),
            move |_item: String| {
                let attempts = handler_attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        queue.add("eip-1".to_string());
        tokio::task::yield_now().await;
        cancel.cancel();
        worker.await.unwrap();
        assert!(attempts.load(Ordering::SeqCst) <= 1);
    }
}
