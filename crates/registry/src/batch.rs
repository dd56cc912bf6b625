//! Queue-plus-flusher that groups submitted items into batches.
//!
//! A batch is dispatched when either the wait-time since the first queued
//! item elapses or the batch reaches `max_batch_count`. Each submitted item
//! carries its own completion signal; a failing item never poisons the rest
//! of its batch. Dispatch concurrency is bounded by a semaphore.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::api::ApiCode;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct CtrlConfig {
    pub label: String,
    pub queue_size: usize,
    pub wait_time: Duration,
    pub max_batch_count: usize,
    pub concurrency: usize,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            label: "batch".to_string(),
            queue_size: 1024,
            wait_time: Duration::from_millis(32),
            max_batch_count: 64,
            concurrency: 8,
        }
    }
}

/// One queued item plus its reply channel.
pub struct BatchTask<T, R> {
    pub param: T,
    reply_tx: oneshot::Sender<ApiResult<R>>,
}

impl<T, R> BatchTask<T, R> {
    pub fn reply(self, result: ApiResult<R>) {
        let _ = self.reply_tx.send(result);
    }
}

/// Completion signal handed back to the submitter.
pub struct BatchFuture<R> {
    rx: oneshot::Receiver<ApiResult<R>>,
}

impl<R> BatchFuture<R> {
    /// Waits for the flush that carries this item. Futures are not
    /// individually cancellable; they resolve on the next flush.
    pub async fn wait(self) -> ApiResult<R> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ApiError::new(
                ApiCode::ExecuteException,
                "batch controller dropped the task",
            )),
        }
    }
}

/// Async handler invoked with each drained batch.
pub type BatchHandler<T, R> = Arc<
    dyn Fn(Vec<BatchTask<T, R>>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

pub struct BatchController<T, R> {
    tx: mpsc::Sender<BatchTask<T, R>>,
    label: String,
}

impl<T, R> BatchController<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: CtrlConfig, handler: BatchHandler<T, R>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let label = config.label.clone();
        tokio::spawn(run_flusher(config, rx, handler));
        Self { tx, label }
    }

    /// Queues one item and returns its completion signal.
    pub async fn submit(&self, param: T) -> ApiResult<BatchFuture<R>> {
        let (reply_tx, rx) = oneshot::channel();
        let task = BatchTask { param, reply_tx };
        self.tx.send(task).await.map_err(|_| {
            ApiError::new(
                ApiCode::ExecuteException,
                format!("batch controller {} stopped", self.label),
            )
        })?;
        Ok(BatchFuture { rx })
    }
}

async fn run_flusher<T, R>(
    config: CtrlConfig,
    mut rx: mpsc::Receiver<BatchTask<T, R>>,
    handler: BatchHandler<T, R>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let max_batch = config.max_batch_count.max(1);

    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);
        let deadline = tokio::time::Instant::now() + config.wait_time;

        while batch.len() < max_batch {
            tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => batch.push(task),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        debug!(label = %config.label, size = batch.len(), "dispatching batch");
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("batch semaphore closed");
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler(batch).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn echo_handler(batches: Arc<AtomicUsize>) -> BatchHandler<u32, u32> {
        Arc::new(move |tasks| {
            batches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                for task in tasks {
                    let value = task.param;
                    if value == 13 {
                        task.reply(Err(ApiError::code(ApiCode::InvalidParameter)));
                    } else {
                        task.reply(Ok(value * 2));
                    }
                }
            })
        })
    }

    #[tokio::test]
    async fn items_submitted_together_share_a_flush() {
        let batches = Arc::new(AtomicUsize::new(0));
        let controller = BatchController::new(
            CtrlConfig {
                wait_time: Duration::from_millis(40),
                max_batch_count: 16,
                ..CtrlConfig::default()
            },
            echo_handler(Arc::clone(&batches)),
        );

        let futs = vec![
            controller.submit(1).await.expect("submit"),
            controller.submit(2).await.expect("submit"),
            controller.submit(3).await.expect("submit"),
        ];
        let mut results = Vec::new();
        for fut in futs {
            results.push(fut.wait().await.expect("reply"));
        }
        assert_eq!(results, vec![2, 4, 6]);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_batch_flushes_before_wait_time() {
        let batches = Arc::new(AtomicUsize::new(0));
        let controller = BatchController::new(
            CtrlConfig {
                wait_time: Duration::from_secs(30),
                max_batch_count: 2,
                ..CtrlConfig::default()
            },
            echo_handler(Arc::clone(&batches)),
        );

        let a = controller.submit(4).await.expect("submit");
        let b = controller.submit(5).await.expect("submit");
        let a = timeout(Duration::from_secs(1), a.wait())
            .await
            .expect("flush should beat the wait-time");
        assert_eq!(a.expect("reply"), 8);
        assert_eq!(b.wait().await.expect("reply"), 10);
    }

    #[tokio::test]
    async fn failed_item_does_not_poison_the_batch() {
        let controller = BatchController::new(
            CtrlConfig {
                wait_time: Duration::from_millis(20),
                ..CtrlConfig::default()
            },
            echo_handler(Arc::new(AtomicUsize::new(0))),
        );

        let bad = controller.submit(13).await.expect("submit");
        let good = controller.submit(7).await.expect("submit");
        assert_eq!(
            bad.wait().await.unwrap_err().code,
            ApiCode::InvalidParameter
        );
        assert_eq!(good.wait().await.expect("reply"), 14);
    }
}
