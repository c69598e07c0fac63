use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// An unbounded FIFO whose consumer can wait for items asynchronously.
///
/// Intended for one producer and one consumer, but safe to share between any number of either.
#[derive(Debug)]
pub struct BlockingConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("wait for queue item was cancelled")]
pub struct Cancelled;

impl<T> BlockingConcurrentQueue<T> {
    pub fn new() -> Self {
        BlockingConcurrentQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Never blocks.
    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Wake the consumer without adding an item.
    ///
    /// If nobody is waiting, the next wait returns immediately.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for an item, ignoring [`signal()`][Self::signal]s.
    pub async fn dequeue(&self, token: &CancellationToken) -> Result<T, Cancelled> {
        loop {
            if let Some(item) = self.next(token).await? {
                return Ok(item);
            }
        }
    }

    /// Wait for an item or a [`signal()`][Self::signal].
    ///
    /// Returns `Ok(None)` when woken without an item to return. This may happen spuriously.
    pub async fn next(&self, token: &CancellationToken) -> Result<Option<T>, Cancelled> {
        if let Some(item) = self.pop() {
            return Ok(Some(item));
        }

        if token.is_cancelled() {
            return Err(Cancelled);
        }

        tokio::select! {
            _ = self.notify.notified() => (),
            _ = token.cancelled() => return Err(Cancelled),
        }

        Ok(self.pop())
    }

    fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for BlockingConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{BlockingConcurrentQueue, Cancelled};

    #[tokio::test]
    async fn fifo() {
        let queue = BlockingConcurrentQueue::new();
        let token = CancellationToken::new();

        for i in 0..5 {
            queue.enqueue(i);
        }

        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            assert_eq!(queue.dequeue(&token).await, Ok(i));
        }

        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_waits_for_producer() {
        let queue = Arc::new(BlockingConcurrentQueue::new());
        let token = CancellationToken::new();

        let producer = tokio::spawn({
            let queue = queue.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                queue.enqueue("response");
            }
        });

        assert_eq!(queue.dequeue(&token).await, Ok("response"));
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation() {
        let queue = BlockingConcurrentQueue::<()>::new();
        let token = CancellationToken::new();

        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            }
        });

        assert_eq!(queue.dequeue(&token).await, Err(Cancelled));
        assert_eq!(queue.next(&token).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn signal_wakes_without_item() {
        let queue = BlockingConcurrentQueue::<u32>::new();
        let token = CancellationToken::new();

        queue.signal();
        assert_eq!(queue.next(&token).await, Ok(None));

        queue.enqueue(7);
        assert_eq!(queue.next(&token).await, Ok(Some(7)));
    }
}
