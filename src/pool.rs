/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, sync::Arc};

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};

pub const CHUNK_SIZE: usize = 5;

/// A unit of work distributed by the pool. Returning `None` drops the
/// item from the result set.
pub trait Task: Sync + Send + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    fn exec(&self, item: Self::Item) -> impl Future<Output = Option<Self::Output>> + Send;
}

/// Distributes items to a fixed number of workers in chunks of
/// [`CHUNK_SIZE`]. Workers block on a shared chunk channel; the feeder
/// blocks on a bounded send, and dropping the sender is the close signal.
/// Items within a chunk run concurrently, so at most
/// `workers * CHUNK_SIZE` calls are in flight at once. Results are
/// concatenated in arrival order; order is only meaningful within a
/// single chunk's result list.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        WorkerPool {
            workers: workers.max(1),
        }
    }

    pub async fn run<T: Task>(&self, task: Arc<T>, items: Vec<T::Item>) -> Vec<T::Output> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<T::Item>>(1);
        let chunk_rx = Arc::new(Mutex::new(chunk_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Vec<T::Output>>(self.workers);

        for _ in 0..self.workers {
            let chunk_rx = chunk_rx.clone();
            let result_tx = result_tx.clone();
            let task = task.clone();
            tokio::spawn(async move {
                loop {
                    let chunk = { chunk_rx.lock().await.recv().await };
                    let Some(chunk) = chunk else {
                        break;
                    };
                    let size = chunk.len();
                    let task = task.clone();
                    // The chunk runs in its own task so that a panic is
                    // confined to the batch and the worker stays eligible.
                    let results = match tokio::spawn(async move {
                        join_all(chunk.into_iter().map(|item| task.exec(item)))
                            .await
                            .into_iter()
                            .flatten()
                            .collect::<Vec<_>>()
                    })
                    .await
                    {
                        Ok(results) => results,
                        Err(err) => {
                            tracing::error!(
                                context = "pool",
                                event = "chunk-failed",
                                items = size,
                                reason = %err,
                            );
                            Vec::new()
                        }
                    };
                    if result_tx.send(results).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        tokio::spawn(async move {
            let mut items = items.into_iter();
            loop {
                let chunk = items.by_ref().take(CHUNK_SIZE).collect::<Vec<_>>();
                if chunk.is_empty() {
                    break;
                }
                if chunk_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut results = Vec::new();
        while let Some(batch) = result_rx.recv().await {
            results.extend(batch);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::{Task, WorkerPool, CHUNK_SIZE};

    struct Doubler {
        calls: AtomicUsize,
    }

    impl Task for Doubler {
        type Item = usize;
        type Output = usize;

        fn exec(&self, item: usize) -> impl Future<Output = Option<usize>> + Send {
            self.calls.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::task::yield_now().await;
                Some(item * 2)
            }
        }
    }

    struct Poisoned;

    impl Task for Poisoned {
        type Item = usize;
        type Output = usize;

        fn exec(&self, item: usize) -> impl Future<Output = Option<usize>> + Send {
            async move {
                if item == 7 {
                    panic!("poisoned item");
                }
                Some(item)
            }
        }
    }

    #[tokio::test]
    async fn drains_every_item_exactly_once() {
        let task = Arc::new(Doubler {
            calls: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(3);
        let mut results = pool.run(task.clone(), (0..17).collect()).await;

        assert_eq!(task.calls.load(Ordering::Relaxed), 17);
        assert_eq!(results.len(), 17);
        results.sort_unstable();
        assert_eq!(results, (0..17).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_input_completes() {
        let pool = WorkerPool::new(2);
        let results = pool
            .run(
                Arc::new(Doubler {
                    calls: AtomicUsize::new(0),
                }),
                Vec::new(),
            )
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn panic_is_confined_to_one_chunk() {
        let pool = WorkerPool::new(3);
        let mut results = pool.run(Arc::new(Poisoned), (0..17).collect()).await;

        // Item 7 poisons its entire chunk (5..10), nothing else.
        assert_eq!(results.len(), 17 - CHUNK_SIZE);
        results.sort_unstable();
        assert_eq!(
            results,
            (0..17).filter(|i| !(5..10).contains(i)).collect::<Vec<_>>()
        );
    }
}
